use chrono::Utc;
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, Set};

use engine::{
    AttachCmd, CheckoutCmd, CreateValueCmd, CreditCmd, DebitCmd, Engine, EngineError,
    GenericCodeOptions, LightrailParty, LineItem, Party, PerContactOptions, Principal, StripeParty,
    TransactionListFilter, TransactionType, TransferCmd, UpdateValueCmd, codes::derived_value_id,
};
use migration::MigratorTrait;

const TENANT: &str = "tenant-1";

async fn engine_with_db() -> (Engine, DatabaseConnection) {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    migration::Migrator::up(&db, None).await.unwrap();

    engine::currency::ActiveModel {
        tenant_id: Set(TENANT.to_string()),
        code: Set("USD".to_string()),
        name: Set("US Dollar".to_string()),
        symbol: Set("$".to_string()),
        decimal_places: Set(2),
    }
    .insert(&db)
    .await
    .unwrap();
    for contact in ["alice", "bob"] {
        engine::contacts::ActiveModel {
            tenant_id: Set(TENANT.to_string()),
            id: Set(contact.to_string()),
            created_date: Set(Utc::now()),
        }
        .insert(&db)
        .await
        .unwrap();
    }

    let engine = Engine::builder()
        .database(db.clone())
        .code_secret("test-secret")
        .build()
        .await
        .unwrap();
    (engine, db)
}

fn admin() -> Principal {
    Principal::new(TENANT, "admin")
}

fn lightrail(value_id: &str) -> Party {
    Party::Lightrail(LightrailParty::value(value_id))
}

async fn balance(engine: &Engine, value_id: &str) -> Option<i64> {
    engine.get_value(&admin(), value_id).await.unwrap().balance
}

async fn gift_card(engine: &Engine, id: &str, amount: i64) {
    engine
        .create_value(&admin(), &CreateValueCmd::new(id, "usd").balance(amount))
        .await
        .unwrap();
}

#[tokio::test]
async fn create_value_records_initial_balance() {
    let (engine, _db) = engine_with_db().await;

    let value = engine
        .create_value(
            &admin(),
            &CreateValueCmd::new("gc-1", "USD")
                .balance(5000)
                .code("ABCD-1234-EFGH"),
        )
        .await
        .unwrap();
    assert_eq!(value.balance, Some(5000));
    assert_eq!(value.currency, "USD");
    assert_eq!(value.code_last_four.as_deref(), Some("EFGH"));

    let tx = engine.get_transaction(&admin(), "gc-1").await.unwrap();
    assert_eq!(tx.transaction_type, TransactionType::InitialBalance);
    let step = tx.steps_for_value("gc-1").next().unwrap();
    assert_eq!(step.balance_before, Some(0));
    assert_eq!(step.balance_after, Some(5000));

    let by_code = engine
        .get_value_by_code(&admin(), " ABCD-1234-EFGH ")
        .await
        .unwrap();
    assert_eq!(by_code.id, "gc-1");
}

#[tokio::test]
async fn create_value_is_idempotent() {
    let (engine, _db) = engine_with_db().await;
    let cmd = CreateValueCmd::new("gc-1", "USD").balance(5000);

    let first = engine.create_value(&admin(), &cmd).await.unwrap();
    let again = engine.create_value(&admin(), &cmd).await.unwrap();
    assert_eq!(first, again);

    let err = engine
        .create_value(&admin(), &CreateValueCmd::new("gc-1", "USD").balance(10))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValueIdExists(_)), "{err:?}");
    assert_eq!(balance(&engine, "gc-1").await, Some(5000));
}

#[tokio::test]
async fn duplicate_code_is_rejected() {
    let (engine, _db) = engine_with_db().await;
    engine
        .create_value(&admin(), &CreateValueCmd::new("a", "USD").balance(1).code("SAME-CODE"))
        .await
        .unwrap();

    let err = engine
        .create_value(&admin(), &CreateValueCmd::new("b", "USD").balance(1).code("SAME-CODE"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValueCodeExists), "{err:?}");
}

#[tokio::test]
async fn unknown_currency_and_contact_are_rejected() {
    let (engine, _db) = engine_with_db().await;

    let err = engine
        .create_value(&admin(), &CreateValueCmd::new("a", "EUR").balance(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CurrencyNotFound(_)), "{err:?}");

    let err = engine
        .create_value(
            &admin(),
            &CreateValueCmd::new("a", "USD").balance(1).contact_id("nobody"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ContactNotFound(_)), "{err:?}");
}

#[tokio::test]
async fn checkout_draws_from_gift_card() {
    let (engine, _db) = engine_with_db().await;
    gift_card(&engine, "gc-1", 5000).await;

    let tx = engine
        .checkout(
            &admin(),
            &CheckoutCmd::new("co-1", "USD")
                .line_item(LineItem::new(1000))
                .source(lightrail("gc-1")),
        )
        .await
        .unwrap();

    let totals = tx.totals.as_ref().unwrap();
    assert_eq!(totals.subtotal, Some(1000));
    assert_eq!(totals.paid_lightrail, Some(1000));
    assert_eq!(totals.remainder, Some(0));
    let step = tx.steps_for_value("gc-1").next().unwrap();
    assert_eq!(step.balance_change, Some(-1000));
    assert_eq!(balance(&engine, "gc-1").await, Some(4000));
}

#[tokio::test]
async fn checkout_splits_between_gift_card_and_card() {
    let (engine, _db) = engine_with_db().await;
    gift_card(&engine, "gc-1", 300).await;

    let tx = engine
        .checkout(
            &admin(),
            &CheckoutCmd::new("co-1", "USD")
                .line_item(LineItem::new(500).quantity(2))
                .source(Party::Stripe(StripeParty {
                    source: "tok_visa".to_string(),
                    max_amount: None,
                }))
                .source(lightrail("gc-1")),
        )
        .await
        .unwrap();

    let totals = tx.totals.as_ref().unwrap();
    assert_eq!(totals.paid_lightrail, Some(300));
    assert_eq!(totals.paid_stripe, Some(700));
    assert_eq!(totals.remainder, Some(0));
    assert_eq!(balance(&engine, "gc-1").await, Some(0));
}

#[tokio::test]
async fn insufficient_checkout_changes_nothing() {
    let (engine, _db) = engine_with_db().await;
    gift_card(&engine, "gc-1", 5000).await;

    let err = engine
        .checkout(
            &admin(),
            &CheckoutCmd::new("co-1", "USD")
                .line_item(LineItem::new(6000))
                .source(lightrail("gc-1")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance(_)), "{err:?}");
    assert_eq!(balance(&engine, "gc-1").await, Some(5000));

    let err = engine.get_transaction(&admin(), "co-1").await.unwrap_err();
    assert!(matches!(err, EngineError::TransactionNotFound(_)), "{err:?}");
}

#[tokio::test]
async fn simulated_checkout_is_not_persisted() {
    let (engine, _db) = engine_with_db().await;
    gift_card(&engine, "gc-1", 5000).await;

    let tx = engine
        .checkout(
            &admin(),
            &CheckoutCmd::new("co-1", "USD")
                .line_item(LineItem::new(1000))
                .source(lightrail("gc-1"))
                .simulate(),
        )
        .await
        .unwrap();
    assert!(tx.simulated);
    assert_eq!(balance(&engine, "gc-1").await, Some(5000));
    assert!(engine.get_transaction(&admin(), "co-1").await.is_err());
}

#[tokio::test]
async fn contact_and_explicit_value_are_charged_once() {
    let (engine, _db) = engine_with_db().await;
    engine
        .create_value(
            &admin(),
            &CreateValueCmd::new("own", "USD").balance(2000).contact_id("alice"),
        )
        .await
        .unwrap();

    let tx = engine
        .checkout(
            &admin(),
            &CheckoutCmd::new("co-1", "USD")
                .line_item(LineItem::new(500))
                .source(Party::Lightrail(LightrailParty::contact("alice")))
                .source(lightrail("own")),
        )
        .await
        .unwrap();

    assert_eq!(tx.steps_for_value("own").count(), 1);
    assert_eq!(balance(&engine, "own").await, Some(1500));
}

#[tokio::test]
async fn credit_replays_and_rejects_reused_id() {
    let (engine, _db) = engine_with_db().await;
    gift_card(&engine, "gc-1", 100).await;
    let cmd = CreditCmd::new("cr-1", LightrailParty::value("gc-1"), "USD").amount(50);

    let first = engine.credit(&admin(), &cmd).await.unwrap();
    let replay = engine.credit(&admin(), &cmd).await.unwrap();
    assert_eq!(first.id, replay.id);
    assert_eq!(first.steps, replay.steps);
    assert_eq!(balance(&engine, "gc-1").await, Some(150));

    let err = engine
        .credit(
            &admin(),
            &CreditCmd::new("cr-1", LightrailParty::value("gc-1"), "USD").amount(75),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TransactionIdExists(_)), "{err:?}");
    assert_eq!(balance(&engine, "gc-1").await, Some(150));
}

#[tokio::test]
async fn debit_respects_frozen_and_canceled() {
    let (engine, _db) = engine_with_db().await;
    gift_card(&engine, "gc-1", 1000).await;

    engine
        .update_value(&admin(), "gc-1", &UpdateValueCmd::default().frozen(true))
        .await
        .unwrap();
    let err = engine
        .debit(
            &admin(),
            &DebitCmd::new("db-1", LightrailParty::value("gc-1"), "USD").amount(10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValueFrozen(_)), "{err:?}");

    engine
        .update_value(
            &admin(),
            "gc-1",
            &UpdateValueCmd::default().frozen(false).canceled(true),
        )
        .await
        .unwrap();
    let err = engine
        .debit(
            &admin(),
            &DebitCmd::new("db-2", LightrailParty::value("gc-1"), "USD").amount(10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValueCanceled(_)), "{err:?}");

    let err = engine
        .update_value(&admin(), "gc-1", &UpdateValueCmd::default().canceled(false))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)), "{err:?}");
    assert_eq!(balance(&engine, "gc-1").await, Some(1000));
}

#[tokio::test]
async fn debit_with_remainder_drains_the_value() {
    let (engine, _db) = engine_with_db().await;
    gift_card(&engine, "gc-1", 300).await;

    let tx = engine
        .debit(
            &admin(),
            &DebitCmd::new("db-1", LightrailParty::value("gc-1"), "USD")
                .amount(500)
                .allow_remainder(),
        )
        .await
        .unwrap();
    assert_eq!(tx.totals.as_ref().unwrap().remainder, Some(200));
    assert_eq!(balance(&engine, "gc-1").await, Some(0));
}

#[tokio::test]
async fn transfer_conserves_balance() {
    let (engine, _db) = engine_with_db().await;
    gift_card(&engine, "a", 5000).await;
    gift_card(&engine, "b", 0).await;

    let tx = engine
        .transfer(
            &admin(),
            &TransferCmd::new("tr-1", lightrail("a"), LightrailParty::value("b"), "USD", 1500),
        )
        .await
        .unwrap();

    let moved: i64 = tx.steps.iter().map(|step| step.balance_change()).sum();
    assert_eq!(moved, 0);
    assert_eq!(balance(&engine, "a").await, Some(3500));
    assert_eq!(balance(&engine, "b").await, Some(1500));
}

#[tokio::test]
async fn claiming_a_generic_code_twice_fails() {
    let (engine, _db) = engine_with_db().await;
    let options = GenericCodeOptions {
        per_contact: PerContactOptions {
            balance: Some(500),
            uses_remaining: Some(2),
        },
    };
    engine
        .create_value(
            &admin(),
            &CreateValueCmd::new("promo", "USD")
                .balance(5000)
                .uses_remaining(10)
                .generic(Some(options)),
        )
        .await
        .unwrap();

    engine
        .attach(&admin(), &AttachCmd::new("alice", LightrailParty::value("promo")))
        .await
        .unwrap();

    let claimed = engine
        .get_value(&admin(), &derived_value_id("promo", "alice"))
        .await
        .unwrap();
    assert_eq!(claimed.contact_id.as_deref(), Some("alice"));
    assert_eq!(claimed.attached_from_value_id.as_deref(), Some("promo"));
    assert_eq!(claimed.balance, Some(500));
    assert_eq!(claimed.uses_remaining, Some(2));

    let err = engine
        .attach(&admin(), &AttachCmd::new("alice", LightrailParty::value("promo")))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValueAlreadyAttached(_)), "{err:?}");

    let pool = engine.get_value(&admin(), "promo").await.unwrap();
    assert_eq!(pool.balance, Some(4500));
    assert_eq!(pool.uses_remaining, Some(8));
}

#[tokio::test]
async fn shared_generic_code_is_spendable_by_linked_contacts() {
    let (engine, _db) = engine_with_db().await;
    engine
        .create_value(
            &admin(),
            &CreateValueCmd::new("shared", "USD").balance(1000).generic(None),
        )
        .await
        .unwrap();

    let alice = Principal::new(TENANT, "alice-user").contact("alice");
    engine
        .attach(&alice, &AttachCmd::new("alice", LightrailParty::value("shared")))
        .await
        .unwrap();
    let err = engine
        .attach(&alice, &AttachCmd::new("alice", LightrailParty::value("shared")))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValueAlreadyAttached(_)), "{err:?}");

    let values = engine.list_contact_values(&alice, "alice").await.unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].id, "shared");

    engine
        .checkout(
            &alice,
            &CheckoutCmd::new("co-1", "USD")
                .line_item(LineItem::new(400))
                .source(Party::Lightrail(LightrailParty::contact("alice"))),
        )
        .await
        .unwrap();
    assert_eq!(balance(&engine, "shared").await, Some(600));

    let err = engine.list_contact_values(&alice, "bob").await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)), "{err:?}");
}

#[tokio::test]
async fn value_shared_by_two_contacts_is_charged_once() {
    let (engine, _db) = engine_with_db().await;
    engine
        .create_value(
            &admin(),
            &CreateValueCmd::new("shared", "USD").balance(1000).generic(None),
        )
        .await
        .unwrap();
    for contact in ["alice", "bob"] {
        let principal = Principal::new(TENANT, format!("{contact}-user")).contact(contact);
        engine
            .attach(&principal, &AttachCmd::new(contact, LightrailParty::value("shared")))
            .await
            .unwrap();
    }

    let tx = engine
        .checkout(
            &admin(),
            &CheckoutCmd::new("co-1", "USD")
                .line_item(LineItem::new(400))
                .source(Party::Lightrail(LightrailParty::contact("alice")))
                .source(Party::Lightrail(LightrailParty::contact("bob"))),
        )
        .await
        .unwrap();
    assert_eq!(tx.steps_for_value("shared").count(), 1);
    assert_eq!(
        tx.steps_for_value("shared").next().unwrap().balance_change,
        Some(-400)
    );
    assert_eq!(balance(&engine, "shared").await, Some(600));
}

#[tokio::test]
async fn plain_value_attaches_once() {
    let (engine, _db) = engine_with_db().await;
    gift_card(&engine, "gc-1", 100).await;

    engine
        .attach(&admin(), &AttachCmd::new("alice", LightrailParty::value("gc-1")))
        .await
        .unwrap();
    let value = engine.get_value(&admin(), "gc-1").await.unwrap();
    assert_eq!(value.contact_id.as_deref(), Some("alice"));

    let err = engine
        .attach(&admin(), &AttachCmd::new("bob", LightrailParty::value("gc-1")))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ValueAlreadyAttached(_)), "{err:?}");
}

#[tokio::test]
async fn delete_value_only_when_untouched() {
    let (engine, _db) = engine_with_db().await;
    gift_card(&engine, "fresh", 100).await;
    gift_card(&engine, "used", 100).await;
    engine
        .debit(
            &admin(),
            &DebitCmd::new("db-1", LightrailParty::value("used"), "USD").amount(10),
        )
        .await
        .unwrap();

    engine.delete_value(&admin(), "fresh").await.unwrap();
    let err = engine.get_value(&admin(), "fresh").await.unwrap_err();
    assert!(matches!(err, EngineError::ValueNotFound(_)), "{err:?}");
    assert!(engine.get_transaction(&admin(), "fresh").await.is_err());

    let err = engine.delete_value(&admin(), "used").await.unwrap_err();
    assert!(matches!(err, EngineError::ValueInUse(_)), "{err:?}");
}

#[tokio::test]
async fn list_transactions_pages_with_cursor() {
    let (engine, _db) = engine_with_db().await;
    gift_card(&engine, "gc-1", 1000).await;
    for i in 0..3 {
        engine
            .debit(
                &admin(),
                &DebitCmd::new(format!("db-{i}"), LightrailParty::value("gc-1"), "USD").amount(10),
            )
            .await
            .unwrap();
    }

    let filter = TransactionListFilter {
        value_id: Some("gc-1".to_string()),
        ..TransactionListFilter::default()
    };
    let (first, cursor) = engine
        .list_transactions(&admin(), 2, None, &filter)
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    let cursor = cursor.unwrap();
    let (rest, next) = engine
        .list_transactions(&admin(), 2, Some(&cursor), &filter)
        .await
        .unwrap();
    assert_eq!(rest.len(), 2);
    assert!(next.is_none());

    let mut ids: Vec<_> = first.iter().chain(&rest).map(|tx| tx.id.clone()).collect();
    ids.sort();
    assert_eq!(ids, ["db-0", "db-1", "db-2", "gc-1"]);
}

#[tokio::test]
async fn contact_principal_cannot_see_other_values() {
    let (engine, _db) = engine_with_db().await;
    engine
        .create_value(
            &admin(),
            &CreateValueCmd::new("bobs", "USD").balance(100).contact_id("bob"),
        )
        .await
        .unwrap();

    let alice = Principal::new(TENANT, "alice-user").contact("alice");
    let err = engine.get_value(&alice, "bobs").await.unwrap_err();
    assert!(matches!(err, EngineError::ValueNotFound(_)), "{err:?}");
}
