use crate::helper;
use amqp_keeper::transport::Settlement;
use amqp_keeper::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn spawn_init(consumer: &Consumer) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let consumer = consumer.clone();

    tokio::spawn(async move { consumer.init().await })
}

#[tokio::test(start_paused = true)]
async fn idle_consumer_stops_after_timeout() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "idle").await.unwrap();
    let timeout = Duration::from_secs(2);

    let consumer = client
        .new_consumer(handler_fn(|_d: Delivery| async {}), "")
        .set_maintain(false)
        .set_timeout(timeout);

    let started = tokio::time::Instant::now();

    consumer.init().await.unwrap();

    let elapsed = started.elapsed();

    assert!(elapsed >= timeout, "stopped too early: {elapsed:?}");
    assert!(elapsed <= timeout + IDLE_CHECK_INTERVAL, "stopped too late: {elapsed:?}");
    assert!(!consumer.is_running());
}

#[tokio::test(start_paused = true)]
async fn deliveries_push_the_idle_deadline() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "busy").await.unwrap();
    let timeout = Duration::from_secs(2);

    let consumer = client
        .new_consumer(handler_fn(|_d: Delivery| async {}), "")
        .set_maintain(false)
        .set_timeout(timeout);

    let started = tokio::time::Instant::now();
    let running = spawn_init(&consumer);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    client.publish("keep going", "").await.unwrap();

    running.await.unwrap().unwrap();

    assert!(started.elapsed() >= Duration::from_millis(1500) + timeout);
}

#[tokio::test(start_paused = true)]
async fn maintained_consumer_does_not_idle_out() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "forever").await.unwrap();

    let consumer = client
        .new_consumer(handler_fn(|_d: Delivery| async {}), "")
        .set_timeout(Duration::from_secs(1));

    let running = spawn_init(&consumer);

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(consumer.is_running());

    consumer.close().await;
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn close_waits_for_in_flight_handlers() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "slow").await.unwrap();
    let finished = Arc::new(AtomicBool::new(false));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let consumer = client.new_consumer(
        handler_fn({
            let finished = finished.clone();

            move |_d: Delivery| {
                let finished = finished.clone();
                let started_tx = started_tx.clone();

                async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finished.store(true, Ordering::SeqCst);
                }
            }
        }),
        "",
    );

    let running = spawn_init(&consumer);

    client.publish("work", "").await.unwrap();
    started_rx.recv().await.unwrap();

    consumer.close().await;

    assert!(finished.load(Ordering::SeqCst));
    assert!(!consumer.is_running());

    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn handler_acks_and_reads_attempt_count() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "retries").await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let consumer = client.new_consumer(
        handler_fn(move |d: Delivery| {
            let tx = tx.clone();

            async move {
                let count = get_message_count_attempt(&d);

                d.ack().await.unwrap();
                let _ = tx.send((d.body_str().into_owned(), count));
            }
        }),
        "retry-consumer",
    );

    let running = spawn_init(&consumer);

    client.publish("first", "").await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), ("first".to_owned(), 0));

    client.publish_with_count("second", "", 3).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), ("second".to_owned(), 3));

    assert_eq!(broker.consumer_tags("retries"), vec!["retry-consumer"]);

    consumer.close().await;
    running.await.unwrap().unwrap();

    let settled = broker.settled();

    assert_eq!(settled.len(), 2);
    assert!(settled.iter().all(|(_, s)| *s == Settlement::Ack));
}

#[tokio::test]
async fn delay_is_applied_per_delivery() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "paced").await.unwrap();
    let handled = Arc::new(AtomicUsize::new(0));

    let consumer = client
        .new_consumer(
            handler_fn({
                let handled = handled.clone();

                move |_d: Delivery| {
                    let handled = handled.clone();

                    async move {
                        handled.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }),
            "",
        )
        .set_delay(Duration::from_millis(50));

    let started = std::time::Instant::now();
    let running = spawn_init(&consumer);

    for i in 0..3 {
        client.publish(&format!("m{i}"), "").await.unwrap();
    }

    helper::eventually("three handled deliveries", || handled.load(Ordering::SeqCst) == 3).await;

    assert!(started.elapsed() >= Duration::from_millis(150));

    consumer.close().await;
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn nacked_delivery_comes_back() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "flaky").await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let consumer = client.new_consumer(
        handler_fn(move |d: Delivery| {
            let tx = tx.clone();

            async move {
                if d.redelivered {
                    d.ack().await.unwrap();
                } else {
                    d.nack(true).await.unwrap();
                }

                let _ = tx.send(d.redelivered);
            }
        }),
        "",
    );

    let running = spawn_init(&consumer);

    client.publish("once more", "").await.unwrap();

    assert!(!rx.recv().await.unwrap());
    assert!(rx.recv().await.unwrap());

    consumer.close().await;
    running.await.unwrap().unwrap();

    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn consumer_is_running_only_once_the_stream_is_open() {
    let broker = MemoryBroker::new();
    let connector = helper::SlowConnector::new(&broker).consume_delay(Duration::from_millis(200));
    let client = helper::connect_slow(&broker, "late", connector).await.unwrap();

    let consumer = client.new_consumer(handler_fn(|_d: Delivery| async {}), "late-tag");
    let running = spawn_init(&consumer);

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!consumer.is_running());
    assert_eq!(broker.consumer_count("late"), 0);

    let err = helper::to_client_error(consumer.init().await);

    assert_eq!(err.kind, ErrorKind::ConsumerRunning);

    helper::eventually("running consumer", || consumer.is_running()).await;

    assert_eq!(broker.consumer_count("late"), 1);

    consumer.close().await;
    running.await.unwrap().unwrap();

    assert!(!consumer.is_running());
}
