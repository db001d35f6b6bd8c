use crate::helper;
use amqp_keeper::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn initial_connect_failure_is_returned() {
    let broker = MemoryBroker::new();
    broker.set_available(false);

    let err = helper::to_client_error(helper::connect(&broker, "q1").await);

    assert_eq!(err.kind, ErrorKind::Unavailable);
    assert_eq!(err.addr, "localhost:5672");
    assert_eq!(broker.dial_attempts(), 1);
}

#[tokio::test]
async fn every_consumer_is_restarted_once_after_reconnect() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "jobs").await.unwrap();
    let handled = Arc::new(AtomicUsize::new(0));

    let consumers: Vec<Consumer> = ["c1", "c2"]
        .iter()
        .map(|tag| {
            let handled = handled.clone();

            client.new_consumer(
                handler_fn(move |d: Delivery| {
                    let handled = handled.clone();

                    async move {
                        handled.fetch_add(1, Ordering::SeqCst);
                        let _ = d.ack().await;
                    }
                }),
                tag,
            )
        })
        .collect();

    for c in &consumers {
        let c = c.clone();
        tokio::spawn(async move { c.init().await });
    }

    helper::eventually("two consumers", || broker.consumer_count("jobs") == 2).await;

    broker.fail_connections("connection reset by peer");

    helper::eventually("second connection", || broker.dial_attempts() == 2).await;
    helper::eventually("restarted consumers", || broker.consumer_count("jobs") == 2).await;
    helper::eventually("running consumers", || consumers.iter().all(|c| c.is_running())).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut tags = broker.consumer_tags("jobs");
    tags.sort();

    assert_eq!(tags, vec!["c1", "c2"]);
    assert_eq!(broker.dial_attempts(), 2);
    assert!(client.is_connected());

    client.publish("after reconnect", "").await.unwrap();

    helper::eventually("handled message", || handled.load(Ordering::SeqCst) == 1).await;

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_keeps_dialing_until_the_broker_is_back() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "q1").await.unwrap();

    broker.set_available(false);
    broker.fail_connections("broker restart");

    tokio::time::sleep(RECONNECT_DELAY * 3 + Duration::from_millis(500)).await;

    assert!(!client.is_connected());
    assert!(broker.dial_attempts() >= 4, "only {} dials", broker.dial_attempts());

    broker.set_available(true);

    tokio::time::sleep(RECONNECT_DELAY * 2).await;

    assert!(client.is_connected());
    assert!(client.get_channel().is_some());
    assert!(broker.has_queue("q1"));
    assert_eq!(broker.connection_count(), 1);

    client.publish("back", "").await.unwrap();
}

#[tokio::test]
async fn close_stops_reconnecting() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "q1").await.unwrap();

    client.close().await;
    broker.fail_connections("late failure");

    tokio::time::sleep(RECONNECT_DELAY + Duration::from_millis(200)).await;

    assert_eq!(broker.dial_attempts(), 1);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn connect_after_close_opens_a_new_connection() {
    let broker = MemoryBroker::new();
    let client = helper::connect(&broker, "q1").await.unwrap();

    client.close().await;
    client.connect().await.unwrap();

    assert_eq!(broker.dial_attempts(), 2);
    assert_eq!(broker.connection_count(), 1);

    client.publish("again", "").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_during_reconnect_dial_stays_closed() {
    let broker = MemoryBroker::new();
    let connector = helper::SlowConnector::new(&broker).dial_delay(Duration::from_millis(300));
    let client = helper::connect_slow(&broker, "q1", connector).await.unwrap();

    broker.fail_connections("reset");
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.close().await;

    tokio::time::sleep(RECONNECT_DELAY + Duration::from_millis(600)).await;

    assert!(!client.is_connected());
    assert!(client.get_channel().is_none());
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(broker.dial_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn connect_during_reconnect_keeps_one_connection() {
    let broker = MemoryBroker::new();
    let connector = helper::SlowConnector::new(&broker).dial_delay(Duration::from_millis(300));
    let client = helper::connect_slow(&broker, "q1", connector).await.unwrap();

    broker.fail_connections("reset");
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.connect().await.unwrap();

    tokio::time::sleep(RECONNECT_DELAY + Duration::from_millis(500)).await;

    assert!(client.is_connected());
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(broker.dial_attempts(), 3);

    broker.fail_connections("reset again");

    helper::eventually("reconnect of the new connection", || broker.dial_attempts() == 4).await;
    helper::eventually("connected", || client.get_channel().is_some()).await;

    assert_eq!(broker.connection_count(), 1);

    client.close().await;
}
