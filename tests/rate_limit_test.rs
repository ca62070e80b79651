mod common;

use std::time::Duration;

use counterd::codec::current_time_ms;
use counterd::rate_limit::DEFAULT_RATE_LIMIT_WINDOW;
use counterd::types::{Attribution, BigCount, Operation, PaymentIntentId, UserId};
use counterd::{Error, RateLimiter};

fn multiply(user: &str, amount: u64, intent: &str) -> Operation {
    Operation::Multiply {
        attribution: Attribution::user(user),
        multiply_amount: amount,
        payment_intent_id: PaymentIntentId::new(intent),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_user_racing_across_processes_wins_once() {
    let (_dir, path) = common::create_temp_db_path("race.db");
    let store_a = common::open_store(&path).await;
    let store_b = common::open_store(&path).await;
    store_a
        .apply_delta(counterd::Delta::Add(1), Attribution::anonymous())
        .await
        .unwrap();

    let a = common::processor(&store_a);
    let b = common::processor(&store_b);

    for round in 0..10 {
        let user = format!("racer-{round}");
        let intent_a = format!("pi_a_{round}");
        let intent_b = format!("pi_b_{round}");
        a.verifier.confirm(intent_a.as_str(), 2, "usd");
        b.verifier.confirm(intent_b.as_str(), 2, "usd");

        let pa = a.processor.clone();
        let pb = b.processor.clone();
        let (ua, ub) = (user.clone(), user.clone());
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { pa.process(multiply(&ua, 2, &intent_a)).await }),
            tokio::spawn(async move { pb.process(multiply(&ub, 2, &intent_b)).await }),
        );
        let results = [ra.unwrap(), rb.unwrap()];

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let limited = results
            .iter()
            .filter(|r| matches!(r, Err(Error::RateLimited { .. })))
            .count();
        assert_eq!((wins, limited), (1, 1), "round {round}: {results:?}");
    }

    // Ten winning doublings of 1.
    assert_eq!(store_a.get().await.unwrap().value, BigCount::from(1024));

    store_b.shutdown().await;
    store_a.shutdown().await;
}

#[tokio::test]
async fn limit_recorded_on_one_process_holds_on_another() {
    let (_dir, path) = common::create_temp_db_path("shared_limit.db");
    let store_a = common::open_store(&path).await;
    let store_b = common::open_store(&path).await;
    let limiter_a = RateLimiter::new(store_a.clone(), DEFAULT_RATE_LIMIT_WINDOW);
    let limiter_b = RateLimiter::new(store_b.clone(), DEFAULT_RATE_LIMIT_WINDOW);
    let user = UserId::new("roamer");

    limiter_a.record_multiply(&user, current_time_ms()).await.unwrap();

    assert!(!limiter_b.can_multiply(&user).await.unwrap());
    let err = limiter_b
        .record_multiply(&user, current_time_ms())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited { .. }));

    store_b.shutdown().await;
    store_a.shutdown().await;
}

#[tokio::test]
async fn rejected_multiply_does_not_use_up_the_limit() {
    let (_dir, path) = common::create_temp_db_path("rollback.db");
    let store = common::open_store(&path).await;
    let window = DEFAULT_RATE_LIMIT_WINDOW;

    store
        .multiply_once(
            UserId::new("first"),
            PaymentIntentId::new("pi_shared"),
            2,
            window,
            Attribution::user("first"),
        )
        .await
        .unwrap();

    // Reusing the intent fails, and the stamp rolls back with it.
    let err = store
        .multiply_once(
            UserId::new("second"),
            PaymentIntentId::new("pi_shared"),
            2,
            window,
            Attribution::user("second"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicatePayment { .. }));

    let wait = store
        .multiply_retry_after(&UserId::new("second"), window)
        .await
        .unwrap();
    assert!(wait.is_none());

    store.shutdown().await;
}

#[tokio::test]
async fn window_elapses() {
    let (_dir, path) = common::create_temp_db_path("window.db");
    let store = common::open_store(&path).await;
    let config = counterd::ProcessorConfig {
        rate_limit_window: Duration::from_millis(200),
        ..counterd::ProcessorConfig::default()
    };
    let test = common::processor_with(
        &store,
        std::sync::Arc::new(counterd::InMemoryPaymentVerifier::new()),
        config,
    );
    store
        .apply_delta(counterd::Delta::Add(1), Attribution::anonymous())
        .await
        .unwrap();
    test.verifier.confirm("pi_w1", 2, "usd");
    test.verifier.confirm("pi_w2", 2, "usd");

    test.processor.process(multiply("wendy", 2, "pi_w1")).await.unwrap();
    assert!(matches!(
        test.processor.process(multiply("wendy", 2, "pi_w2")).await,
        Err(Error::RateLimited { .. })
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    test.processor.process(multiply("wendy", 2, "pi_w2")).await.unwrap();
    assert_eq!(store.get().await.unwrap().value, BigCount::from(4));

    store.shutdown().await;
}
