//! Loop detection across nodes talking over the request/response transport

use meshact_common::{ActionError, TransportConfig};
use meshact_server::{Act, EventLog, LoopGuardConfig, Node, NodeBuilder};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod support;
use support::builder;

async fn start(builder: NodeBuilder) -> (Node, u16) {
    let node = builder.build().unwrap();
    let port = node
        .listen(TransportConfig::http(0))
        .await
        .unwrap()
        .expect("http listeners have an address")
        .port();
    (node, port)
}

/// A node answering `<tag>:1` with its tag, counting the calls it handles
fn tagged(tag: &'static str, calls: &Arc<AtomicUsize>) -> NodeBuilder {
    let calls = calls.clone();
    builder(tag).add(&format!("{}:1", tag), move |_act: Act| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, ActionError>(json!(tag)) }
    })
}

#[tokio::test]
async fn test_own_message_two_nodes() {
    let log_a = Arc::new(EventLog::new());
    let log_b = Arc::new(EventLog::new());
    let calls_a = Arc::new(AtomicUsize::new(0));
    let calls_b = Arc::new(AtomicUsize::new(0));

    let (a, port_a) = start(
        tagged("a", &calls_a)
            .timeout(Duration::from_millis(800))
            .loop_guard(LoopGuardConfig {
                check_own_message: true,
                check_message_loop: false,
                ..Default::default()
            })
            .observer(log_a.clone()),
    )
    .await;
    let (b, port_b) = start(
        tagged("b", &calls_b)
            .timeout(Duration::from_millis(300))
            .observer(log_b.clone()),
    )
    .await;
    a.client(TransportConfig::http(port_b)).await.unwrap();
    b.client(TransportConfig::http(port_a)).await.unwrap();

    // a:1 stays local, b:1 takes one hop and is still delivered
    assert_eq!(a.act("a:1").await.unwrap(), json!("a"));
    assert_eq!(a.act("b:1").await.unwrap(), json!("b"));
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
    assert!(log_a.events().is_empty());

    // nobody handles x:1, so b sends it back to a
    let err = a.act("x:1").await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(log_a.count("own_message"), 1);
    assert_eq!(log_a.count("message_loop"), 0);
    assert!(log_b.events().is_empty());
    assert_eq!(calls_a.load(Ordering::SeqCst), 1);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_message_loop_three_nodes() {
    let log_a = Arc::new(EventLog::new());
    let log_b = Arc::new(EventLog::new());
    let log_c = Arc::new(EventLog::new());
    let calls: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    let (a, port_a) = start(
        tagged("a", &calls[0])
            .timeout(Duration::from_millis(1000))
            .loop_guard(LoopGuardConfig {
                check_own_message: false,
                ..Default::default()
            })
            .observer(log_a.clone()),
    )
    .await;
    let (b, port_b) = start(
        tagged("b", &calls[1])
            .timeout(Duration::from_millis(600))
            .observer(log_b.clone()),
    )
    .await;
    let (c, port_c) = start(
        tagged("c", &calls[2])
            .timeout(Duration::from_millis(300))
            .observer(log_c.clone()),
    )
    .await;
    a.client(TransportConfig::http(port_b)).await.unwrap();
    b.client(TransportConfig::http(port_c)).await.unwrap();
    c.client(TransportConfig::http(port_a)).await.unwrap();

    assert_eq!(a.act("a:1").await.unwrap(), json!("a"));
    assert_eq!(a.act("b:1").await.unwrap(), json!("b"));
    assert_eq!(a.act("c:1").await.unwrap(), json!("c"));

    // a > b > c > a
    let err = a.act("x:1").await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(log_a.count("message_loop"), 1);
    assert_eq!(log_a.count("own_message"), 0);
    assert!(log_b.events().is_empty());
    assert!(log_c.events().is_empty());
    for count in &calls {
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    for node in [a, b, c] {
        node.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_hop_limit_stops_long_chains() {
    let log = Arc::new(EventLog::new());
    let (last, port_last) = start(
        builder("last")
            .loop_guard(LoopGuardConfig {
                max_hops: 2,
                ..Default::default()
            })
            .observer(log.clone()),
    )
    .await;
    let (middle, port_middle) = start(builder("middle").timeout(Duration::from_millis(300))).await;
    middle.client(TransportConfig::http(port_last)).await.unwrap();

    let first = builder("first").timeout(Duration::from_millis(600)).build().unwrap();
    first.client(TransportConfig::http(port_middle)).await.unwrap();

    // path first > middle > last exceeds two hops
    assert!(first.act("x:1").await.unwrap_err().is_timeout());
    assert_eq!(log.count("message_loop"), 1);

    for node in [first, middle, last] {
        node.close().await.unwrap();
    }
}
