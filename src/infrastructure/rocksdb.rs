use crate::domain::dispute::Dispute;
use crate::domain::ledger::{EntryId, EntryType, LedgerEntry, Role, SubjectId};
use crate::domain::order::Order;
use crate::domain::payout::Payout;
use crate::domain::ports::{AtomicUnit, LedgerStore, RecordStore};
use crate::domain::seller::SellerAccount;
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Ledger entries keyed by a big-endian append sequence, so iteration order
/// is append order.
pub const CF_ENTRIES: &str = "entries";
/// Entry id to append sequence.
pub const CF_ENTRY_INDEX: &str = "entry_index";
/// Entry external id to entry id.
pub const CF_EXTERNAL_IDS: &str = "external_ids";
pub const CF_ORDERS: &str = "orders";
/// Order external id to order id.
pub const CF_ORDER_REFS: &str = "order_refs";
pub const CF_PAYOUTS: &str = "payouts";
/// Order id followed by payout id, both raw uuid bytes. Values are empty.
pub const CF_PAYOUT_BY_ORDER: &str = "payout_by_order";
pub const CF_DISPUTES: &str = "disputes";
pub const CF_DISPUTE_BY_ORDER: &str = "dispute_by_order";
pub const CF_SELLERS: &str = "sellers";

const COLUMN_FAMILIES: [&str; 10] = [
    CF_ENTRIES,
    CF_ENTRY_INDEX,
    CF_EXTERNAL_IDS,
    CF_ORDERS,
    CF_ORDER_REFS,
    CF_PAYOUTS,
    CF_PAYOUT_BY_ORDER,
    CF_DISPUTES,
    CF_DISPUTE_BY_ORDER,
    CF_SELLERS,
];

/// A persistent settlement store backed by RocksDB.
///
/// Each entity lives in its own column family. A unit is written as a single
/// `WriteBatch`, so it lands completely or not at all. Commits are serialized
/// by the mutex guarding the next append sequence; the conflict checks run
/// under that same guard.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    next_seq: Arc<Mutex<u64>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path`, creating any missing
    /// column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let next_seq = {
            let cf = db
                .cf_handle(CF_ENTRIES)
                .ok_or_else(|| SettlementError::internal("Entries column family not found"))?;
            match db.iterator_cf(cf, IteratorMode::End).next() {
                Some(item) => {
                    let (key, _) = item?;
                    decode_seq(&key)? + 1
                }
                None => 0,
            }
        };

        Ok(Self {
            db: Arc::new(db),
            next_seq: Arc::new(Mutex::new(next_seq)),
        })
    }

    fn handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SettlementError::internal(format!("Column family {name} not found")))
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.handle(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Follows an index column family to a record keyed by uuid.
    fn get_indexed<T: DeserializeOwned>(
        &self,
        index_cf: &str,
        key: &[u8],
        record_cf: &str,
    ) -> Result<Option<T>> {
        match self.db.get_cf(self.handle(index_cf)?, key)? {
            Some(id) => self.get_json(record_cf, &id),
            None => Ok(None),
        }
    }

    fn entry_by_id(&self, id: &Uuid) -> Result<Option<LedgerEntry>> {
        self.get_indexed(CF_ENTRY_INDEX, id.as_bytes(), CF_ENTRIES)
    }

    fn scan_entries(&self, keep: impl Fn(&LedgerEntry) -> bool) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.handle(CF_ENTRIES)?, IteratorMode::Start) {
            let (_key, value) = item?;
            let entry: LedgerEntry = serde_json::from_slice(&value)?;
            if keep(&entry) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn check_conflicts(&self, unit: &AtomicUnit) -> Result<()> {
        let index = self.handle(CF_ENTRY_INDEX)?;
        let external = self.handle(CF_EXTERNAL_IDS)?;
        for entry in &unit.entries {
            if self.db.get_cf(index, entry.id.0.as_bytes())?.is_some() {
                return Err(SettlementError::ImmutableEntry(entry.id));
            }
            if self.db.get_cf(external, entry.external_id.as_bytes())?.is_some() {
                return Err(SettlementError::DuplicateExternalId(
                    entry.external_id.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Builds the batch for `unit`, numbering entries from `seq`. Returns the
    /// batch and the next free sequence.
    fn build_batch(&self, unit: &AtomicUnit, mut seq: u64) -> Result<(WriteBatch, u64)> {
        let mut batch = WriteBatch::default();

        let entries = self.handle(CF_ENTRIES)?;
        let index = self.handle(CF_ENTRY_INDEX)?;
        let external = self.handle(CF_EXTERNAL_IDS)?;
        for entry in &unit.entries {
            batch.put_cf(entries, seq.to_be_bytes(), serde_json::to_vec(entry)?);
            batch.put_cf(index, entry.id.0.as_bytes(), seq.to_be_bytes());
            batch.put_cf(external, entry.external_id.as_bytes(), entry.id.0.as_bytes());
            seq += 1;
        }

        let orders = self.handle(CF_ORDERS)?;
        let order_refs = self.handle(CF_ORDER_REFS)?;
        for order in &unit.orders {
            batch.put_cf(orders, order.id.as_bytes(), serde_json::to_vec(order)?);
            batch.put_cf(order_refs, order.external_id.as_bytes(), order.id.as_bytes());
        }

        let payouts = self.handle(CF_PAYOUTS)?;
        let payout_by_order = self.handle(CF_PAYOUT_BY_ORDER)?;
        for payout in &unit.payouts {
            batch.put_cf(payouts, payout.payout_id.as_bytes(), serde_json::to_vec(payout)?);
            batch.put_cf(payout_by_order, payout_index_key(payout), b"");
        }

        let disputes = self.handle(CF_DISPUTES)?;
        let dispute_by_order = self.handle(CF_DISPUTE_BY_ORDER)?;
        for dispute in &unit.disputes {
            batch.put_cf(disputes, dispute.id.as_bytes(), serde_json::to_vec(dispute)?);
            batch.put_cf(dispute_by_order, dispute.order_id.as_bytes(), dispute.id.as_bytes());
        }

        let sellers = self.handle(CF_SELLERS)?;
        for seller in &unit.sellers {
            batch.put_cf(sellers, seller.seller_id.as_str().as_bytes(), serde_json::to_vec(seller)?);
        }

        Ok((batch, seq))
    }
}

fn payout_index_key(payout: &Payout) -> Vec<u8> {
    let mut key = payout.order_id.as_bytes().to_vec();
    key.extend_from_slice(payout.payout_id.as_bytes());
    key
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| SettlementError::internal("Malformed entry sequence key"))?;
    Ok(u64::from_be_bytes(bytes))
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn commit(&self, unit: AtomicUnit) -> Result<Vec<EntryId>> {
        unit.validate()?;
        let ids = unit.entry_ids();
        let mut next_seq = self.next_seq.lock().await;
        self.check_conflicts(&unit)?;
        let (batch, seq) = self.build_batch(&unit, *next_seq)?;
        self.db.write(batch)?;
        *next_seq = seq;
        Ok(ids)
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<LedgerEntry>> {
        self.entry_by_id(&id.0)
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<LedgerEntry>> {
        match self
            .db
            .get_cf(self.handle(CF_EXTERNAL_IDS)?, external_id.as_bytes())?
        {
            Some(id) => {
                let id = Uuid::from_slice(&id).map_err(|e| SettlementError::InternalError(Box::new(e)))?;
                self.entry_by_id(&id)
            }
            None => Ok(None),
        }
    }

    async fn find_by_payment_intent(
        &self,
        intent_id: &str,
        entry_type: EntryType,
    ) -> Result<Option<LedgerEntry>> {
        let mut matches = self.scan_entries(|e| {
            e.entry_type == entry_type && e.related_payment_intent_id.as_deref() == Some(intent_id)
        })?;
        Ok(if matches.is_empty() {
            None
        } else {
            Some(matches.swap_remove(0))
        })
    }

    async fn entries_for_subject(&self, subject: &SubjectId, role: Role) -> Result<Vec<LedgerEntry>> {
        self.scan_entries(|e| &e.subject_id == subject && e.role == role)
    }

    async fn entries_for_order(&self, order_id: Uuid) -> Result<Vec<LedgerEntry>> {
        self.scan_entries(|e| e.related_order_id == Some(order_id))
    }
}

#[async_trait]
impl RecordStore for RocksDBStore {
    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        self.get_json(CF_ORDERS, id.as_bytes())
    }

    async fn find_order_by_external_id(&self, external_id: &str) -> Result<Option<Order>> {
        self.get_indexed(CF_ORDER_REFS, external_id.as_bytes(), CF_ORDERS)
    }

    async fn get_payout(&self, payout_id: Uuid) -> Result<Option<Payout>> {
        self.get_json(CF_PAYOUTS, payout_id.as_bytes())
    }

    async fn payouts_for_order(&self, order_id: Uuid) -> Result<Vec<Payout>> {
        let prefix = order_id.as_bytes();
        let mut payouts = Vec::new();
        let iter = self.db.iterator_cf(
            self.handle(CF_PAYOUT_BY_ORDER)?,
            IteratorMode::From(prefix, Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(payout) = self.get_json(CF_PAYOUTS, &key[prefix.len()..])? {
                payouts.push(payout);
            }
        }
        Ok(payouts)
    }

    async fn find_dispute_by_order(&self, order_id: Uuid) -> Result<Option<Dispute>> {
        self.get_indexed(CF_DISPUTE_BY_ORDER, order_id.as_bytes(), CF_DISPUTES)
    }

    async fn get_seller(&self, seller_id: &SubjectId) -> Result<Option<SellerAccount>> {
        self.get_json(CF_SELLERS, seller_id.as_str().as_bytes())
    }

    async fn subjects(&self) -> Result<Vec<(SubjectId, Role)>> {
        let subjects: BTreeSet<(SubjectId, Role)> = self
            .scan_entries(|_| true)?
            .into_iter()
            .map(|e| (e.subject_id, e.role))
            .collect();
        Ok(subjects.into_iter().collect())
    }
}
