//! Worker against a real Redis (testcontainers). Run with `--ignored`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stream_consumer::{
    handler_fn, BackoffPolicy, ConsumerConfig, ConsumerWorker, DeadLetterEntry, EntryId, Fields,
    ProcessingOutcome, RedisConnection, RedisConnector, StreamStore,
};
use test_utils::{TestDataBuilder, TestRedis};

fn config(redis: &TestRedis, names: &TestDataBuilder) -> ConsumerConfig {
    ConsumerConfig::new(names.stream("orders"), names.group("billing"))
        .with_endpoint(redis.connection_string())
        .with_consumer_name(names.consumer("1"))
        .with_group_start_id("0")
        .with_block_timeout(Duration::from_millis(100))
        .with_claim_min_idle(Duration::from_millis(200))
        .with_claim_interval(Duration::from_millis(100))
        .with_backoff(BackoffPolicy::new().with_max_retries(3))
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting until {}", what);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn processes_and_acks_entries() {
    let redis = TestRedis::new().await;
    let names = TestDataBuilder::from_test_name("processes_and_acks_entries");
    let config = config(&redis, &names);

    let handled = Arc::new(AtomicUsize::new(0));
    let handler = {
        let handled = handled.clone();
        handler_fn(move |_, _| {
            handled.fetch_add(1, Ordering::SeqCst);
            async { ProcessingOutcome::Success }
        })
    };

    let worker = ConsumerWorker::new(config.clone(), handler, RedisConnector::from_config(&config));
    worker.start().await.unwrap();
    assert!(worker.is_healthy());

    for i in 0..3 {
        redis
            .xadd(&config.stream_name, &[("order_id", i.to_string().as_str())])
            .await;
    }

    let done = handled.clone();
    wait_until("three entries are handled", move || {
        let handled = done.load(Ordering::SeqCst);
        async move { handled == 3 }
    })
    .await;
    let (redis_ref, stream, group) = (&redis, &config.stream_name, &config.group_name);
    wait_until("nothing is pending", move || async move {
        redis_ref.pending_count(stream, group).await == 0
    })
    .await;

    worker.stop().await.unwrap();
    assert_eq!(redis.xlen(&config.dead_letter_name).await, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn reclaims_entries_of_crashed_consumer_and_dead_letters() {
    let redis = TestRedis::new().await;
    let names = TestDataBuilder::from_test_name("reclaims_entries_of_crashed_consumer");
    let config = config(&redis, &names).with_max_delivery_attempts(2);

    let store = RedisConnection::connect(redis.connection_string(), config.backoff.clone())
        .await
        .unwrap();
    store
        .ensure_group(&config.stream_name, &config.group_name, "0")
        .await
        .unwrap();

    let mut payload = Fields::new();
    payload.insert("order_id".into(), b"42".to_vec());
    let id: EntryId = store.append(&config.stream_name, payload, None).await.unwrap();
    redis
        .read_without_ack(&config.stream_name, &config.group_name, &names.consumer("crashed"), 10)
        .await;

    let handler = handler_fn(|_, _| async { ProcessingOutcome::retryable("still failing") });
    let worker = ConsumerWorker::new(config.clone(), handler, RedisConnector::from_config(&config));
    worker.start().await.unwrap();

    let (redis_ref, dlq) = (&redis, &config.dead_letter_name);
    wait_until("the entry is dead-lettered", move || async move {
        redis_ref.xlen(dlq).await == 1
    })
    .await;
    let (stream, group) = (&config.stream_name, &config.group_name);
    wait_until("nothing is pending", move || async move {
        redis_ref.pending_count(stream, group).await == 0
    })
    .await;
    worker.stop().await.unwrap();

    store
        .ensure_group(&config.dead_letter_name, "inspect", "0")
        .await
        .unwrap();
    let entries = store
        .read_group(&config.dead_letter_name, "inspect", "inspector", 10, None)
        .await
        .unwrap();
    let entry = DeadLetterEntry::from_fields(entries[0].payload()).unwrap();
    assert_eq!(entry.original_id, id);
    assert_eq!(entry.delivery_count, 2);
    assert_eq!(entry.payload.get("order_id"), Some(&b"42".to_vec()));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn blocking_read_times_out_empty() {
    let redis = TestRedis::new().await;
    let names = TestDataBuilder::from_test_name("blocking_read_times_out_empty");
    let config = config(&redis, &names);

    let store = RedisConnection::connect(redis.connection_string(), config.backoff.clone())
        .await
        .unwrap();
    store
        .ensure_group(&config.stream_name, &config.group_name, "$")
        .await
        .unwrap();
    // Second call finds the group and reports it as existing
    assert!(
        !store
            .ensure_group(&config.stream_name, &config.group_name, "$")
            .await
            .unwrap()
    );

    let batch = store
        .read_group(
            &config.stream_name,
            &config.group_name,
            &config.consumer_name,
            10,
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    assert!(batch.is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn blocking_read_outlasts_client_response_timeout() {
    let redis = TestRedis::new().await;
    let names = TestDataBuilder::from_test_name("blocking_read_outlasts_client_response_timeout");
    let config = config(&redis, &names);

    let store = RedisConnection::connect(redis.connection_string(), config.backoff.clone())
        .await
        .unwrap();
    store
        .ensure_group(&config.stream_name, &config.group_name, "$")
        .await
        .unwrap();

    let read = store.read_group(
        &config.stream_name,
        &config.group_name,
        &config.consumer_name,
        10,
        Some(Duration::from_secs(3)),
    );
    let late_append = async {
        tokio::time::sleep(Duration::from_millis(1200)).await;
        redis.xadd(&config.stream_name, &[("order_id", "late")]).await;
    };
    let (batch, ()) = tokio::join!(read, late_append);

    let batch = batch.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].field_str("order_id"), Some("late"));
    assert_eq!(redis.pending_count(&config.stream_name, &config.group_name).await, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn claim_reports_delivery_count_of_every_entry() {
    let redis = TestRedis::new().await;
    let names = TestDataBuilder::from_test_name("claim_reports_delivery_count_of_every_entry");
    let config = config(&redis, &names);
    let (stream, group) = (&config.stream_name, &config.group_name);

    let store = RedisConnection::connect(redis.connection_string(), config.backoff.clone())
        .await
        .unwrap();
    store.ensure_group(stream, group, "0").await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        let mut payload = Fields::new();
        payload.insert("order_id".into(), i.to_string().into_bytes());
        ids.push(store.append(stream, payload, None).await.unwrap());
    }
    redis
        .read_without_ack(stream, group, &names.consumer("crashed"), 10)
        .await;

    // The middle entries sit between the outer two in this consumer's PEL
    let me = names.consumer("me");
    store
        .claim(stream, group, &me, Duration::ZERO, &ids[1..4])
        .await
        .unwrap();

    let outer = [ids[0], ids[4]];
    for _ in 0..3 {
        store
            .claim(stream, group, &names.consumer("other"), Duration::ZERO, &outer)
            .await
            .unwrap();
    }
    let claimed = store
        .claim(stream, group, &me, Duration::ZERO, &outer)
        .await
        .unwrap();

    let counts: Vec<(EntryId, u32)> = claimed
        .iter()
        .map(|message| (message.id(), message.delivery_count()))
        .collect();
    assert_eq!(counts, vec![(ids[0], 5), (ids[4], 5)]);
}
