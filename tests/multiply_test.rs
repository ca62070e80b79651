mod common;

use counterd::types::{Attribution, BigCount, Delta, LogPos, Operation, PaymentIntentId, UserId};
use counterd::{Error, StoreConfig};

fn multiply(user: &str, amount: u64, intent: &str) -> Operation {
    Operation::Multiply {
        attribution: Attribution::user(user),
        multiply_amount: amount,
        payment_intent_id: PaymentIntentId::new(intent),
    }
}

fn seeded(value: &str) -> StoreConfig {
    StoreConfig {
        initial_value: BigCount::parse(value).unwrap(),
        ..common::test_store_config()
    }
}

#[tokio::test]
async fn multiply_is_exact_beyond_u64() {
    let (_dir, path) = common::create_temp_db_path("exact.db");
    // 2^63
    let store = common::open_store_with(&path, seeded("9223372036854775808")).await;
    let mut test = common::processor(&store);
    test.verifier.confirm("pi_big", 3, "usd");

    let result = test.processor.process(multiply("alice", 3, "pi_big")).await.unwrap();
    assert_eq!(result.new_value().to_string(), "27670116110564327424");

    let record = test.attribution.recv().await.unwrap();
    assert_eq!(record.value_delta.to_string(), "18446744073709551616");

    // And again, far past u128.
    let result = store
        .apply_delta(Delta::Multiply(1_000_000_007), Attribution::anonymous())
        .await
        .unwrap();
    assert_eq!(
        result.new_value().to_string(),
        "27670116304255140197950291968"
    );

    store.shutdown().await;
}

#[tokio::test]
async fn second_multiply_same_day_is_rate_limited() {
    let (_dir, path) = common::create_temp_db_path("daily.db");
    let store = common::open_store_with(&path, seeded("100")).await;
    let test = common::processor(&store);
    test.verifier.confirm("pi_p1", 5, "usd");
    test.verifier.confirm("pi_p2", 5, "usd");

    let result = test.processor.process(multiply("u", 5, "pi_p1")).await.unwrap();
    assert_eq!(result.new_value(), &BigCount::from(500));

    let err = test.processor.process(multiply("u", 5, "pi_p2")).await.unwrap_err();
    assert!(matches!(err, Error::RateLimited { .. }));
    assert!(err.to_string().contains("you can only multiply once per day"));

    assert_eq!(store.get().await.unwrap().value, BigCount::from(500));
    // The rejected intent stays spendable.
    assert!(!store.is_payment_consumed(&PaymentIntentId::new("pi_p2")).await.unwrap());

    store.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_multiplies_by_two_users_serialize() {
    let (_dir, path) = common::create_temp_db_path("serial.db");
    let store_a = common::open_store_with(&path, seeded("100")).await;
    let store_b = common::open_store_with(&path, seeded("100")).await;
    let a = common::processor(&store_a);
    let b = common::processor(&store_b);
    a.verifier.confirm("pi_two", 2, "usd");
    b.verifier.confirm("pi_three", 3, "usd");

    let pa = a.processor.clone();
    let pb = b.processor.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { pa.process(multiply("ann", 2, "pi_two")).await }),
        tokio::spawn(async move { pb.process(multiply("ben", 3, "pi_three")).await }),
    );
    ra.unwrap().unwrap();
    rb.unwrap().unwrap();

    assert_eq!(store_a.get().await.unwrap().value, BigCount::from(600));

    // Exactly one ordering happened.
    let log = store_a.read_log(LogPos::from_raw(1), 10).await.unwrap();
    assert_eq!(log.len(), 2);
    let first = log[0].value.to_string();
    assert!(first == "200" || first == "300", "unexpected intermediate {first}");
    assert_eq!(log[1].value, BigCount::from(600));

    store_b.shutdown().await;
    store_a.shutdown().await;
}

#[tokio::test]
async fn multiply_on_zero_consumes_payment() {
    let (_dir, path) = common::create_temp_db_path("zero.db");
    let store = common::open_store(&path).await;
    let test = common::processor(&store);
    test.verifier.confirm("pi_zero", 4, "usd");

    let result = test.processor.process(multiply("zed", 4, "pi_zero")).await.unwrap();
    assert!(result.new_value().is_zero());
    assert!(store.is_payment_consumed(&PaymentIntentId::new("pi_zero")).await.unwrap());

    store.shutdown().await;
}

#[tokio::test]
async fn invalid_factor_is_rejected_before_verification() {
    let (_dir, path) = common::create_temp_db_path("factor.db");
    let store = common::open_store_with(&path, seeded("10")).await;
    let test = common::processor(&store);
    test.verifier.confirm("pi_one", 1, "usd");

    let err = test.processor.process(multiply("uma", 1, "pi_one")).await.unwrap_err();
    assert!(matches!(err, Error::MalformedMessage(_)));

    // The user can still multiply.
    assert!(test
        .processor
        .limiter()
        .can_multiply(&UserId::new("uma"))
        .await
        .unwrap());
    assert_eq!(store.get().await.unwrap().value, BigCount::from(10));

    store.shutdown().await;
}
