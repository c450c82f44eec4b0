use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use ruamq::*;

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn setup() -> (Arc<MemoryBroker>, QueueClient) {
    let _ = tracing_subscriber::fmt().try_init();
    let broker = Arc::new(MemoryBroker::with_ledger());
    let client = QueueClient::new(broker.clone(), QueueConfig::default(), MsgPackCodec).unwrap();
    (broker, client)
}

fn add_signature() -> Signature {
    Signature::new("string", "Add", ["int", "int"])
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_round_trip() {
    let (broker, client) = setup();
    client
        .bind(&add_signature(), |(a, b): (i32, i32)| (a + b).to_string())
        .unwrap();

    let sum: String = client.call(&add_signature(), (2, 3)).await.unwrap();
    assert_eq!(sum, "5");
    assert_eq!(client.pending_count(), 0);

    // request and response are both acknowledged.
    wait_until(|| broker.settlements().len() == 2).await;
    assert!(
        broker
            .settlements()
            .iter()
            .all(|s| matches!(s, Settlement::Ack { .. }))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_independent_peers() {
    let _ = tracing_subscriber::fmt().try_init();
    let config = QueueConfig {
        connection_string: "memory://test-independent-peers".into(),
        ..Default::default()
    };
    let server = QueueClient::<JsonCodec>::connect(config.clone()).unwrap();
    let caller = QueueClient::<JsonCodec>::connect(config).unwrap();

    // both sides build the signature on their own.
    server
        .bind(
            &Signature::new("String", "Text.repeat", ["String", "usize"]),
            |(text, n): (String, usize)| text.repeat(n),
        )
        .unwrap();
    let result: String = caller
        .call(
            &Signature::new(
                "String".to_owned(),
                "Text.repeat".to_owned(),
                vec!["String".to_owned(), "usize".to_owned()],
            ),
            ("ab", 3),
        )
        .await
        .unwrap();
    assert_eq!(result, "ababab");
    assert_eq!(caller.pending_count(), 0);
    assert_ne!(server.state().reply_queue, caller.state().reply_queue);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_void_call_returns_immediately() {
    let (_broker, client) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let signature = Signature::new(VOID, "Log.write", ["String"]);
    client
        .bind(&signature, move |(line,): (String,)| {
            std::thread::sleep(Duration::from_millis(100));
            assert_eq!(line, "hello");
            counter.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();

    let () = tokio::time::timeout(
        Duration::from_millis(50),
        client.call(&signature, ("hello",)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(client.pending_count(), 0);
    wait_until(|| calls.load(Ordering::Acquire) == 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_binding() {
    let (_broker, client) = setup();
    client
        .bind(&add_signature(), |(a, b): (i32, i32)| (a + b).to_string())
        .unwrap();
    let err = client
        .bind(&add_signature(), |(a, b): (i32, i32)| (a - b).to_string())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::DuplicateBinding);

    let sum: String = client.call(&add_signature(), (2, 3)).await.unwrap();
    assert_eq!(sum, "5");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_cleans_up() {
    let (broker, client) = setup();
    let signature = Signature::new("i32", "Nobody.home", Vec::<String>::new());

    let err = client
        .call_with_timeout::<_, i32>(&signature, (), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(client.pending_count(), 0);
    assert_eq!(broker.message_count(signature.identity().as_str()), 1);

    // an abandoned call is cleaned up as well.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        client.call::<_, i32>(&signature, ()),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_reply_is_discarded() {
    let (broker, client) = setup();
    let signature = Signature::new("u64", "Slow.echo", ["u64"]);
    client
        .bind(&signature, |(value,): (u64,)| {
            std::thread::sleep(Duration::from_millis(200));
            value
        })
        .unwrap();

    let err = client
        .call_with_timeout::<_, u64>(&signature, (7u64,), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    let reply_queue = client.state().reply_queue.clone();
    wait_until(|| {
        broker.settlements().iter().any(|s| {
            matches!(s, Settlement::Reject { requeue: false, queue, .. } if *queue == reply_queue)
        })
    })
    .await;
    assert_eq!(broker.message_count(&reply_queue), 0);

    // the next call on the same client still works.
    let value: u64 = client.call(&signature, (8u64,)).await.unwrap();
    assert_eq!(value, 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_without_reply_to_fails() {
    let (broker, client) = setup();
    client
        .bind(&add_signature(), |(a, b): (i32, i32)| (a + b).to_string())
        .unwrap();

    let body = client
        .codec()
        .serialize(&RpcRequest { arguments: (1, 2) })
        .unwrap();
    let properties = Properties {
        correlation_id: Some("no-reply".into()),
        reply_to: None,
        headers: add_signature().headers(),
    };
    broker
        .publish(&client.config().exchange, "", properties, body)
        .unwrap();

    let queue = add_signature().identity().to_string();
    wait_until(|| !broker.settlements().is_empty()).await;
    assert_eq!(
        broker.settlements(),
        vec![Settlement::Reject {
            delivery_tag: 1,
            queue,
            requeue: false,
        }]
    );

    // an undecodable request follows the decode failure policy.
    let properties = Properties {
        headers: add_signature().headers(),
        ..Default::default()
    };
    broker
        .publish(
            &client.config().exchange,
            "",
            properties,
            Bytes::from_static(&[0xc1]),
        )
        .unwrap();
    wait_until(|| broker.settlements().len() >= 2).await;
    assert!(matches!(
        broker.settlements()[1],
        Settlement::Reject { requeue: true, .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_calls() {
    let (broker, client) = setup();
    let client = Arc::new(client);
    client
        .bind(&add_signature(), |(a, b): (i32, i32)| (a + b).to_string())
        .unwrap();

    let calls: Vec<_> = (0..200)
        .map(|i: i32| {
            let client = client.clone();
            tokio::spawn(async move {
                let sum: String = client.call(&add_signature(), (i, i)).await.unwrap();
                assert_eq!(sum, (2 * i).to_string());
            })
        })
        .collect();
    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(client.pending_count(), 0);

    // every request and every response is acknowledged once.
    wait_until(|| broker.settlements().len() == 400).await;
    assert!(
        broker
            .settlements()
            .iter()
            .all(|s| matches!(s, Settlement::Ack { .. }))
    );
}
