mod common;

use std::sync::Arc;
use std::time::Duration;

use counterd::payment::{PaymentStatus, VerifiedPayment};
use counterd::types::{Attribution, BigCount, Delta, Operation, PaymentIntentId, UserId};
use counterd::{Error, InMemoryPaymentVerifier, ProcessorConfig};

fn multiply(user: &str, amount: u64, intent: &str) -> Operation {
    Operation::Multiply {
        attribution: Attribution::user(user),
        multiply_amount: amount,
        payment_intent_id: PaymentIntentId::new(intent),
    }
}

#[tokio::test]
async fn replayed_intent_never_multiplies_twice() {
    let (_dir, path) = common::create_temp_db_path("replay.db");
    let store = common::open_store(&path).await;
    let config = ProcessorConfig {
        rate_limit_window: Duration::from_millis(100),
        ..ProcessorConfig::default()
    };
    let test = common::processor_with(&store, Arc::new(InMemoryPaymentVerifier::new()), config);
    store.apply_delta(Delta::Add(10), Attribution::anonymous()).await.unwrap();
    test.verifier.confirm("pi_once", 3, "usd");

    test.processor.process(multiply("payer", 3, "pi_once")).await.unwrap();

    // Past the rate limit window, so only the payment check can stop it.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let err = test.processor.process(multiply("payer", 3, "pi_once")).await.unwrap_err();
    assert!(matches!(err, Error::DuplicatePayment { .. }));

    assert_eq!(store.get().await.unwrap().value, BigCount::from(30));

    store.shutdown().await;
}

#[tokio::test]
async fn intent_consumed_on_another_process_is_duplicate() {
    let (_dir, path) = common::create_temp_db_path("cross.db");
    let store_a = common::open_store(&path).await;
    let store_b = common::open_store(&path).await;
    store_a.apply_delta(Delta::Add(1), Attribution::anonymous()).await.unwrap();

    let a = common::store_processor(&store_a);
    let b = common::store_processor(&store_b);
    store_a.confirm_payment("pi_cross", 2, "usd").await.unwrap();

    a.process(multiply("alpha", 2, "pi_cross")).await.unwrap();
    let err = b.process(multiply("beta", 2, "pi_cross")).await.unwrap_err();
    assert!(matches!(err, Error::DuplicatePayment { .. }));

    assert_eq!(store_b.get().await.unwrap().value, BigCount::from(2));
    assert!(b.limiter().can_multiply(&UserId::new("beta")).await.unwrap());

    store_b.shutdown().await;
    store_a.shutdown().await;
}

#[tokio::test]
async fn payment_confirmed_on_one_process_multiplies_on_another() {
    let (_dir, path) = common::create_temp_db_path("confirm_elsewhere.db");
    let store_a = common::open_store(&path).await;
    let store_b = common::open_store(&path).await;
    store_a.apply_delta(Delta::Add(4), Attribution::anonymous()).await.unwrap();

    // The webhook landed on A; the client's multiply lands on B.
    store_a.confirm_payment("pi_elsewhere", 5, "USD").await.unwrap();
    let b = common::store_processor(&store_b);

    let applied = b.process(multiply("payer", 5, "pi_elsewhere")).await.unwrap();
    assert_eq!(applied.new_value(), &BigCount::from(20));

    let intent = PaymentIntentId::new("pi_elsewhere");
    assert!(store_a.is_payment_consumed(&intent).await.unwrap());
    let seen_by_a = store_a.payment(&intent).await.unwrap().unwrap();
    assert_eq!(seen_by_a.status, PaymentStatus::Succeeded);
    assert_eq!(seen_by_a.currency, "usd");
    assert!(seen_by_a.consumed);

    store_b.shutdown().await;
    store_a.shutdown().await;
}

#[tokio::test]
async fn payment_confirmation_survives_restart() {
    let (_dir, path) = common::create_temp_db_path("confirm_restart.db");
    let store = common::open_store(&path).await;
    store.apply_delta(Delta::Add(5), Attribution::anonymous()).await.unwrap();
    store.confirm_payment("pi_durable", 3, "usd").await.unwrap();
    store.shutdown().await;

    let store = common::open_store(&path).await;
    let processor = common::store_processor(&store);
    processor.process(multiply("patient", 3, "pi_durable")).await.unwrap();
    assert_eq!(store.get().await.unwrap().value, BigCount::from(15));

    // Spent now, for this process and any later one.
    let err = processor.process(multiply("other", 3, "pi_durable")).await.unwrap_err();
    assert!(matches!(err, Error::DuplicatePayment { .. }));

    store.shutdown().await;
}

#[tokio::test]
async fn unconfirmed_payment_is_rejected_by_store_verifier() {
    let (_dir, path) = common::create_temp_db_path("unconfirmed.db");
    let store = common::open_store(&path).await;
    store.apply_delta(Delta::Add(1), Attribution::anonymous()).await.unwrap();
    let processor = common::store_processor(&store);

    let err = processor.process(multiply("hopeful", 2, "pi_never_paid")).await.unwrap_err();
    assert!(matches!(err, Error::PaymentRejected(_)));
    assert_eq!(store.get().await.unwrap().value, BigCount::from(1));

    store.shutdown().await;
}

#[tokio::test]
async fn verification_timeout_mutates_nothing() {
    let (_dir, path) = common::create_temp_db_path("timeout.db");
    let store = common::open_store(&path).await;
    store.apply_delta(Delta::Add(7), Attribution::anonymous()).await.unwrap();

    let config = ProcessorConfig {
        payment_timeout: Duration::from_millis(50),
        ..ProcessorConfig::default()
    };
    let slow = Arc::new(InMemoryPaymentVerifier::with_delay(Duration::from_millis(500)));
    let mut test = common::processor_with(&store, slow, config);
    test.verifier.confirm("pi_slow", 2, "usd");

    let err = test.processor.process(multiply("sloth", 2, "pi_slow")).await.unwrap_err();
    assert!(matches!(err, Error::PaymentTimeout));

    assert_eq!(store.get().await.unwrap().value, BigCount::from(7));
    assert!(test.processor.limiter().can_multiply(&UserId::new("sloth")).await.unwrap());
    assert!(!store.is_payment_consumed(&PaymentIntentId::new("pi_slow")).await.unwrap());
    assert!(test.attribution.try_recv().is_err());

    store.shutdown().await;
}

#[tokio::test]
async fn mismatched_payments_are_rejected() {
    let (_dir, path) = common::create_temp_db_path("reject.db");
    let store = common::open_store(&path).await;
    store.apply_delta(Delta::Add(1), Attribution::anonymous()).await.unwrap();
    let test = common::processor(&store);

    test.verifier.confirm("pi_amount", 10, "usd");
    test.verifier.confirm("pi_euro", 5, "eur");
    test.verifier.insert(
        "pi_pending",
        VerifiedPayment {
            amount: 5,
            currency: "usd".to_string(),
            status: PaymentStatus::Processing,
            consumed: false,
        },
    );

    for (user, intent) in [
        ("u1", "pi_amount"),
        ("u2", "pi_euro"),
        ("u3", "pi_pending"),
        ("u4", "pi_unknown"),
    ] {
        let err = test.processor.process(multiply(user, 5, intent)).await.unwrap_err();
        assert!(matches!(err, Error::PaymentRejected(_)), "{intent}: {err:?}");
        assert!(test.processor.limiter().can_multiply(&UserId::new(user)).await.unwrap());
    }

    assert_eq!(store.get().await.unwrap().value, BigCount::from(1));

    store.shutdown().await;
}

#[tokio::test]
async fn multiply_without_user_is_unauthorized() {
    let (_dir, path) = common::create_temp_db_path("anon.db");
    let store = common::open_store(&path).await;
    let test = common::processor(&store);
    test.verifier.confirm("pi_anon", 2, "usd");

    let err = test
        .processor
        .process(Operation::Multiply {
            attribution: Attribution::anonymous(),
            multiply_amount: 2,
            payment_intent_id: PaymentIntentId::new("pi_anon"),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized));
    assert!(!store.is_payment_consumed(&PaymentIntentId::new("pi_anon")).await.unwrap());

    store.shutdown().await;
}
