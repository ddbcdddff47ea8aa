//! Ledger entries and the rules they must satisfy before they are persisted.
//!
//! Entries are immutable once written. Every correction is a new compensating
//! entry, so balances are always derived by summing the log.

use crate::domain::money::Currency;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner of a ledger entry. The platform is an ordinary subject with a
/// reserved id, stored alongside buyers and sellers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(String);

impl SubjectId {
    pub const PLATFORM: &'static str = "PLATFORM";

    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SettlementError::ValidationError(
                "Subject id must not be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    pub fn platform() -> Self {
        Self(Self::PLATFORM.to_string())
    }

    pub fn is_platform(&self) -> bool {
        self.0 == Self::PLATFORM
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Seller,
    Buyer,
    Platform,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Seller => "seller",
            Role::Buyer => "buyer",
            Role::Platform => "platform",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Locked,
    Available,
    Settled,
}

/// Direction an entry type moves money in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
    Marker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    PaymentCapture,
    EscrowLock,
    EscrowReleaseDebit,
    EscrowReleaseCredit,
    PayoutReservation,
    PayoutReservationRelease,
    PayoutDebit,
    WalletCreditDeposit,
    WalletCreditPlaceholder,
    WalletDebitPurchase,
    WalletCreditRefund,
    Refund,
    SellerReversal,
}

/// Types that make up a buyer's spendable wallet balance.
pub const BUYER_WALLET_TYPES: &[EntryType] = &[
    EntryType::WalletCreditDeposit,
    EntryType::WalletCreditPlaceholder,
    EntryType::WalletCreditRefund,
    EntryType::WalletDebitPurchase,
];

/// Types that make up a seller's escrow and payout position.
pub const SELLER_TYPES: &[EntryType] = &[
    EntryType::EscrowLock,
    EntryType::EscrowReleaseDebit,
    EntryType::EscrowReleaseCredit,
    EntryType::PayoutReservation,
    EntryType::PayoutReservationRelease,
    EntryType::PayoutDebit,
    EntryType::SellerReversal,
];

pub const PLATFORM_TYPES: &[EntryType] = &[EntryType::PaymentCapture, EntryType::Refund];

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::PaymentCapture => "payment_capture",
            EntryType::EscrowLock => "escrow_lock",
            EntryType::EscrowReleaseDebit => "escrow_release_debit",
            EntryType::EscrowReleaseCredit => "escrow_release_credit",
            EntryType::PayoutReservation => "payout_reservation",
            EntryType::PayoutReservationRelease => "payout_reservation_release",
            EntryType::PayoutDebit => "payout_debit",
            EntryType::WalletCreditDeposit => "wallet_credit_deposit",
            EntryType::WalletCreditPlaceholder => "wallet_credit_placeholder",
            EntryType::WalletDebitPurchase => "wallet_debit_purchase",
            EntryType::WalletCreditRefund => "wallet_credit_refund",
            EntryType::Refund => "refund",
            EntryType::SellerReversal => "seller_reversal",
        }
    }

    pub fn allowed_for(role: Role) -> &'static [EntryType] {
        match role {
            Role::Buyer => BUYER_WALLET_TYPES,
            Role::Seller => SELLER_TYPES,
            Role::Platform => PLATFORM_TYPES,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            EntryType::PaymentCapture | EntryType::Refund => Role::Platform,
            EntryType::WalletCreditDeposit
            | EntryType::WalletCreditPlaceholder
            | EntryType::WalletDebitPurchase
            | EntryType::WalletCreditRefund => Role::Buyer,
            _ => Role::Seller,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            EntryType::PaymentCapture
            | EntryType::EscrowLock
            | EntryType::EscrowReleaseCredit
            | EntryType::WalletCreditDeposit
            | EntryType::WalletCreditPlaceholder
            | EntryType::WalletCreditRefund => Direction::Credit,
            EntryType::EscrowReleaseDebit
            | EntryType::PayoutDebit
            | EntryType::WalletDebitPurchase
            | EntryType::Refund
            | EntryType::SellerReversal => Direction::Debit,
            EntryType::PayoutReservation | EntryType::PayoutReservationRelease => {
                Direction::Marker
            }
        }
    }

    pub fn allowed_statuses(&self) -> &'static [EntryStatus] {
        match self {
            EntryType::EscrowLock | EntryType::EscrowReleaseDebit | EntryType::PayoutReservation => {
                &[EntryStatus::Locked]
            }
            EntryType::PayoutReservationRelease | EntryType::PayoutDebit => &[EntryStatus::Settled],
            EntryType::SellerReversal => &[EntryStatus::Locked, EntryStatus::Available],
            _ => &[EntryStatus::Available],
        }
    }

    pub fn requires_order(&self) -> bool {
        !matches!(
            self,
            EntryType::WalletCreditDeposit
                | EntryType::WalletCreditPlaceholder
                | EntryType::WalletDebitPurchase
        )
    }

    pub fn requires_payment_intent(&self) -> bool {
        matches!(
            self,
            EntryType::PaymentCapture
                | EntryType::WalletCreditDeposit
                | EntryType::WalletCreditPlaceholder
        )
    }

    /// Metadata keys every entry of this type must carry (schema version 1).
    pub fn required_metadata(&self) -> &'static [&'static str] {
        match self {
            EntryType::EscrowReleaseDebit | EntryType::EscrowReleaseCredit => &["actor", "reason"],
            EntryType::PayoutReservation => &["payout_id"],
            EntryType::PayoutReservationRelease => &["payout_id", "outcome"],
            EntryType::PayoutDebit => &["payout_id", "transfer_id"],
            EntryType::WalletDebitPurchase => &["description"],
            EntryType::WalletCreditRefund => &["actor", "justification"],
            EntryType::Refund => &["actor", "reason", "refund_id"],
            _ => &[],
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Versioned audit context attached to an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u16,
    pub fields: BTreeMap<String, String>,
}

impl Metadata {
    pub const CURRENT_VERSION: u16 = 1;

    pub fn new() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    fn validate_for(&self, entry_type: EntryType) -> Result<()> {
        if self.version != Self::CURRENT_VERSION {
            return Err(SettlementError::ValidationError(format!(
                "Unsupported metadata version {} for {entry_type}",
                self.version
            )));
        }
        for key in entry_type.required_metadata() {
            match self.fields.get(*key) {
                Some(value) if !value.trim().is_empty() => {}
                _ => {
                    return Err(SettlementError::ValidationError(format!(
                        "{entry_type} entry requires metadata key '{key}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

/// A single signed money movement. Positive amounts are credits, negative
/// amounts are debits, zero marks a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub external_id: String,
    pub subject_id: SubjectId,
    pub role: Role,
    pub entry_type: EntryType,
    pub amount: i64,
    pub currency: Currency,
    pub status: EntryStatus,
    pub related_order_id: Option<Uuid>,
    pub related_payment_intent_id: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Starts an entry whose sign follows its type: `magnitude` is made
    /// negative for debit types and ignored for marker types.
    pub fn new(
        external_id: impl Into<String>,
        subject_id: SubjectId,
        entry_type: EntryType,
        magnitude: i64,
        currency: Currency,
        status: EntryStatus,
    ) -> Self {
        let amount = match entry_type.direction() {
            Direction::Credit => magnitude.abs(),
            Direction::Debit => -magnitude.abs(),
            Direction::Marker => 0,
        };
        Self {
            id: EntryId::new(),
            external_id: external_id.into(),
            subject_id,
            role: entry_type.role(),
            entry_type,
            amount,
            currency,
            status,
            related_order_id: None,
            related_payment_intent_id: None,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    pub fn for_order(mut self, order_id: Uuid) -> Self {
        self.related_order_id = Some(order_id);
        self
    }

    pub fn with_payment_intent(mut self, intent_id: impl Into<String>) -> Self {
        self.related_payment_intent_id = Some(intent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.metadata = self.metadata.with(key, value);
        self
    }

    /// Checks everything that can be checked without looking at other entries.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SettlementError::ValidationError(msg));
        let ty = self.entry_type;

        if self.external_id.trim().is_empty() {
            return invalid(format!("{ty} entry requires an external id"));
        }
        if ty.role() != self.role {
            return invalid(format!(
                "{ty} entries belong to role {}, got {}",
                ty.role().as_str(),
                self.role.as_str()
            ));
        }
        if self.subject_id.is_platform() != (self.role == Role::Platform) {
            return invalid(format!(
                "Subject {} cannot hold {} entries",
                self.subject_id,
                self.role.as_str()
            ));
        }
        let sign_ok = match ty.direction() {
            Direction::Credit => self.amount > 0,
            Direction::Debit => self.amount < 0,
            Direction::Marker => self.amount == 0,
        };
        if !sign_ok {
            return invalid(format!("Amount {} has the wrong sign for {ty}", self.amount));
        }
        if !ty.allowed_statuses().contains(&self.status) {
            return invalid(format!("{ty} entries cannot have status {:?}", self.status));
        }
        if ty.requires_order() && self.related_order_id.is_none() {
            return invalid(format!("{ty} entry requires a related order"));
        }
        if ty.requires_payment_intent()
            && self
                .related_payment_intent_id
                .as_deref()
                .is_none_or(|id| id.trim().is_empty())
        {
            return invalid(format!("{ty} entry requires a related payment intent"));
        }
        self.metadata.validate_for(ty)
    }
}

/// Per-status rollup of a subject's entries in one currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusRollup {
    pub locked: i64,
    pub available: i64,
    pub settled: i64,
    pub total: i64,
}

impl StatusRollup {
    fn add(&mut self, entry: &LedgerEntry) {
        match entry.status {
            EntryStatus::Locked => self.locked += entry.amount,
            EntryStatus::Available => self.available += entry.amount,
            EntryStatus::Settled => self.settled += entry.amount,
        }
        self.total += entry.amount;
    }
}

/// Sums available entries of the allowed types in `currency`.
pub fn sum_available<'a>(
    entries: impl IntoIterator<Item = &'a LedgerEntry>,
    currency: Currency,
    allowed: &[EntryType],
) -> i64 {
    entries
        .into_iter()
        .filter(|e| {
            e.status == EntryStatus::Available
                && e.currency == currency
                && allowed.contains(&e.entry_type)
        })
        .map(|e| e.amount)
        .sum()
}

pub fn rollup<'a>(
    entries: impl IntoIterator<Item = &'a LedgerEntry>,
) -> BTreeMap<Currency, StatusRollup> {
    let mut out: BTreeMap<Currency, StatusRollup> = BTreeMap::new();
    for entry in entries {
        out.entry(entry.currency).or_default().add(entry);
    }
    out
}
