//! Application layer containing the settlement orchestration.
//!
//! `SettlementEngine` is the facade. It composes the wallet, escrow and payout
//! services, which each hold shared handles to the store and the gateway.

pub mod audit;
pub mod engine;
pub mod escrow;
pub mod payout;
pub mod wallet;
