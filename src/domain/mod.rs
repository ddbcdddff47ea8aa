//! Domain layer: ledger entries, the collaborator records the settlement core
//! mutates, and the ports that storage and the payment gateway implement.

pub mod dispute;
pub mod gateway;
pub mod ledger;
pub mod money;
pub mod order;
pub mod payout;
pub mod ports;
pub mod seller;
