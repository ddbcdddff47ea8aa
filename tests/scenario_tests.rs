mod common;

use common::{engine, seeded_card_order, subject};
use escrow_ledger::application::wallet::WalletService;
use escrow_ledger::config::SettlementConfig;
use escrow_ledger::domain::gateway::{ConfirmationStatus, PaymentConfirmation};
use escrow_ledger::domain::ledger::{EntryStatus, EntryType, Role};
use escrow_ledger::domain::money::{Currency, MinorUnits};
use escrow_ledger::domain::order::EligibilityStatus;
use escrow_ledger::domain::payout::PayoutStatus;
use escrow_ledger::domain::ports::{LedgerStore, RecordStore};
use escrow_ledger::error::SettlementError;
use escrow_ledger::infrastructure::gateway::SandboxGateway;
use escrow_ledger::infrastructure::in_memory::InMemoryStore;
use std::collections::BTreeMap;
use std::sync::Arc;

fn wallet(store: &InMemoryStore) -> WalletService {
    WalletService::new(
        Arc::new(store.clone()),
        Arc::new(SandboxGateway::default()),
        Arc::new(SettlementConfig::default()),
    )
}

#[tokio::test]
async fn test_funding_is_idempotent_per_payment_reference() {
    let store = InMemoryStore::new();
    let wallet = wallet(&store);
    let confirmation = PaymentConfirmation {
        intent_id: "pi_1".to_string(),
        status: ConfirmationStatus::Succeeded,
        amount: 2000,
        currency: Currency::Usd,
        metadata: BTreeMap::from([(
            PaymentConfirmation::BUYER_KEY.to_string(),
            "buyer_1".to_string(),
        )]),
    };

    let first = wallet.process_funding_success(&confirmation).await.unwrap();
    assert_eq!(first.balance, 2000);
    assert!(!first.already_processed);

    let replay = wallet.process_funding_success(&confirmation).await.unwrap();
    assert_eq!(replay.balance, 2000);
    assert!(replay.already_processed);

    let entries = store
        .entries_for_subject(&subject("buyer_1"), Role::Buyer)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry_type, EntryType::WalletCreditPlaceholder);
}

#[tokio::test]
async fn test_force_release_writes_balanced_pair() {
    let store = InMemoryStore::new();
    let gateway = SandboxGateway::default();
    let engine = engine(Arc::new(store.clone()), &gateway, None);
    let order = seeded_card_order(&engine, &gateway, 4200).await;
    assert_eq!(order.eligibility_status, EligibilityStatus::Pending);

    let outcome = engine
        .force_release("ord_1", "admin_1", "delivery confirmed by phone")
        .await
        .unwrap();
    assert!(outcome.success);
    let stored = store.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(stored.eligibility_status, EligibilityStatus::EligibleForPayout);
    let override_record = stored.eligibility_override.unwrap();
    assert_eq!(override_record.actor, "admin_1");
    assert_eq!(override_record.reason, "delivery confirmed by phone");

    let entries = store.entries_for_order(order.id).await.unwrap();
    let debits: Vec<_> = entries
        .iter()
        .filter(|e| e.entry_type == EntryType::EscrowReleaseDebit)
        .collect();
    let credits: Vec<_> = entries
        .iter()
        .filter(|e| e.entry_type == EntryType::EscrowReleaseCredit)
        .collect();
    assert_eq!(debits.len(), 1);
    assert_eq!(credits.len(), 1);
    assert_eq!(debits[0].status, EntryStatus::Locked);
    assert_eq!(credits[0].status, EntryStatus::Available);
    assert_eq!(debits[0].amount, -credits[0].amount);
    assert_eq!(credits[0].amount, 4200);
}

#[tokio::test]
async fn test_failed_transfer_records_only_reservation_release() {
    let store = InMemoryStore::new();
    let gateway = SandboxGateway::default();
    let engine = engine(Arc::new(store.clone()), &gateway, None);
    let order = seeded_card_order(&engine, &gateway, 3000).await;
    gateway.fail_next_transfers(1, "destination account closed").await;

    let outcome = engine
        .execute_manual_payout("ord_1", Currency::Usd)
        .await
        .unwrap();
    assert!(!outcome.success);
    let payout = &outcome.data.payouts[0];
    assert_eq!(payout.status, PayoutStatus::Failed);
    assert!(
        payout
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("destination account closed")
    );

    let payout_types: Vec<EntryType> = store
        .entries_for_order(order.id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.entry_type)
        .filter(|t| {
            matches!(
                t,
                EntryType::PayoutReservation
                    | EntryType::PayoutReservationRelease
                    | EntryType::PayoutDebit
            )
        })
        .collect();
    assert_eq!(
        payout_types,
        vec![EntryType::PayoutReservation, EntryType::PayoutReservationRelease]
    );
}

#[tokio::test]
async fn test_retry_after_failure_reuses_reservation() {
    let store = InMemoryStore::new();
    let gateway = SandboxGateway::default();
    let engine = engine(Arc::new(store.clone()), &gateway, None);
    let order = seeded_card_order(&engine, &gateway, 3000).await;
    gateway.fail_next_transfers(1, "timeout").await;

    engine
        .execute_manual_payout("ord_1", Currency::Usd)
        .await
        .unwrap();
    let failed = store.find_payout(order.id, &subject("seller_1")).await.unwrap().unwrap();
    assert_eq!(failed.status, PayoutStatus::Failed);

    let retried = engine
        .execute_manual_payout("ord_1", Currency::Usd)
        .await
        .unwrap();
    assert!(retried.success);
    let completed = store.find_payout(order.id, &subject("seller_1")).await.unwrap().unwrap();

    assert_eq!(completed.payout_id, failed.payout_id);
    assert_ne!(completed.idempotency_key, failed.idempotency_key);
    assert_eq!(completed.order_id, failed.order_id);
    assert_eq!(completed.amount, failed.amount);
    assert_eq!(completed.currency, failed.currency);
    assert_eq!(completed.ledger_reservation_id, failed.ledger_reservation_id);
    assert_eq!(completed.attempt, 2);

    let entries = store.entries_for_order(order.id).await.unwrap();
    let reservations = entries
        .iter()
        .filter(|e| e.entry_type == EntryType::PayoutReservation)
        .count();
    let debits = entries
        .iter()
        .filter(|e| e.entry_type == EntryType::PayoutDebit)
        .count();
    assert_eq!(reservations, 1);
    assert_eq!(debits, 1);
}

#[tokio::test]
async fn test_racing_charges_are_caught_by_invariant_check() {
    let store = InMemoryStore::new();
    let wallet = wallet(&store);
    let buyer = subject("buyer_1");
    wallet
        .process_funding_success(&PaymentConfirmation {
            intent_id: "pi_fund".to_string(),
            status: ConfirmationStatus::Succeeded,
            amount: 3000,
            currency: Currency::Usd,
            metadata: BTreeMap::from([(
                PaymentConfirmation::BUYER_KEY.to_string(),
                "buyer_1".to_string(),
            )]),
        })
        .await
        .unwrap();

    let amount = MinorUnits::new(3000).unwrap();
    let first = wallet
        .prepare_charge(&buyer, amount, Currency::Usd, "first")
        .await
        .unwrap();
    let second = wallet
        .prepare_charge(&buyer, amount, Currency::Usd, "second")
        .await
        .unwrap();

    assert_eq!(wallet.apply_charge(first).await.unwrap().balance, 0);
    assert!(matches!(
        wallet.apply_charge(second).await,
        Err(SettlementError::InvariantViolation(_))
    ));

    assert!(matches!(
        wallet.charge_buyer(&buyer, amount, Currency::Usd, "third").await,
        Err(SettlementError::InsufficientFunds { .. })
    ));
}

#[tokio::test]
async fn test_sequential_charges_second_is_insufficient() {
    let store = InMemoryStore::new();
    let gateway = SandboxGateway::default();
    let engine = engine(Arc::new(store), &gateway, None);
    let buyer = subject("buyer_1");
    let intent = engine
        .fund_wallet(&buyer, MinorUnits::new(3000).unwrap(), Currency::Usd)
        .await
        .unwrap();
    engine.confirm_funding(&intent.data.intent_id).await.unwrap();

    let amount = MinorUnits::new(3000).unwrap();
    engine
        .charge_buyer(&buyer, amount, Currency::Usd, "first")
        .await
        .unwrap();
    let err = engine
        .charge_buyer(&buyer, amount, Currency::Usd, "second")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SettlementError::InsufficientFunds {
            available: 0,
            required: 3000
        }
    ));
    assert_eq!(err.kind().http_status(), 402);
}
