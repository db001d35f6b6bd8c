use crate::helper;
use amqp_keeper::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn clear_waits_for_the_sleeping_handler() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "clear").await.unwrap();
    let finished = Arc::new(AtomicUsize::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let consumers: Vec<Consumer> = (0..3)
        .map(|_| {
            let finished = finished.clone();
            let started_tx = started_tx.clone();

            client.new_consumer(
                handler_fn(move |_d: Delivery| {
                    let finished = finished.clone();
                    let started_tx = started_tx.clone();

                    async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                    }
                }),
                "",
            )
        })
        .collect();

    let runs: Vec<_> = consumers
        .iter()
        .map(|c| {
            let c = c.clone();
            tokio::spawn(async move { c.init().await })
        })
        .collect();

    helper::eventually("three consumers", || broker.consumer_count("clear") == 3).await;

    client.publish("sleepy", "").await.unwrap();
    started_rx.recv().await.unwrap();

    client.clear_consumers().await;

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(client.get_consumers().is_empty());
    assert!(consumers.iter().all(|c| !c.is_running()));

    for run in runs {
        run.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn cleared_consumers_are_not_restarted() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "gone").await.unwrap();

    let consumer = client.new_consumer(handler_fn(|_d: Delivery| async {}), "old");
    let run = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.init().await }
    });

    helper::eventually("consumer", || broker.consumer_count("gone") == 1).await;

    client.clear_consumers().await;
    run.await.unwrap().unwrap();

    broker.fail_connections("reset");

    helper::eventually("reconnect", || client.get_channel().is_some() && broker.dial_attempts() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.consumer_count("gone"), 0);
    assert!(!consumer.is_running());
}

#[tokio::test]
async fn clear_while_consumers_restart_after_reconnect() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "restarting").await.unwrap();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let consumer = client.new_consumer(
        handler_fn(move |_d: Delivery| {
            let started_tx = started_tx.clone();

            async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }),
        "slow",
    );
    let run = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.init().await }
    });

    helper::eventually("consumer", || broker.consumer_count("restarting") == 1).await;

    client.publish("long job", "").await.unwrap();
    started_rx.recv().await.unwrap();

    broker.fail_connections("reset");

    helper::eventually("reconnect", || client.get_channel().is_some() && broker.dial_attempts() == 2).await;

    tokio::time::timeout(Duration::from_secs(5), client.clear_consumers())
        .await
        .expect("clear_consumers hangs");

    run.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(client.get_consumers().is_empty());
    assert!(!consumer.is_running());
    assert_eq!(broker.consumer_count("restarting"), 0);
}
