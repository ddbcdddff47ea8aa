use crate::domain::money::Currency;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub destination: String,
    pub amount: i64,
    pub currency: Currency,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub amount: i64,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    RequiresPayment,
    Processing,
    Succeeded,
    Canceled,
}

/// What the gateway reports about a payment intent, by webhook or by lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub intent_id: String,
    pub status: ConfirmationStatus,
    pub amount: i64,
    pub currency: Currency,
    pub metadata: BTreeMap<String, String>,
}

impl PaymentConfirmation {
    pub const BUYER_KEY: &'static str = "buyer_id";
    pub const PURPOSE_KEY: &'static str = "purpose";
    pub const WALLET_FUNDING: &'static str = "wallet_funding";
}
