use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use ruamq::*;

/// Keeps a running total.
#[ruamq::service]
pub trait Calculator {
    fn add(&self, a: i32, b: i32) -> String;
    fn accumulate(&self, value: i64) -> i64;
    fn reset(&self);
    fn total(&self) -> i64;
}

#[derive(Default)]
struct CalculatorImpl {
    total: AtomicI64,
}

impl Calculator for CalculatorImpl {
    fn add(&self, a: i32, b: i32) -> String {
        (a + b).to_string()
    }

    fn accumulate(&self, value: i64) -> i64 {
        self.total.fetch_add(value, Ordering::AcqRel) + value
    }

    fn reset(&self) {
        self.total.store(0, Ordering::Release);
    }

    fn total(&self) -> i64 {
        self.total.load(Ordering::Acquire)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_macro() {
    let _ = tracing_subscriber::fmt().try_init();
    let broker = Arc::new(MemoryBroker::with_ledger());
    let client = Arc::new(QueueClient::new(broker, QueueConfig::default(), MsgPackCodec).unwrap());
    assert_eq!(<CalculatorImpl as Calculator>::NAME, "Calculator");

    let calculator = Arc::new(CalculatorImpl::default());
    calculator.clone().ruamq_export(&client).unwrap();
    let err = calculator.clone().ruamq_export(&client).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DuplicateBinding);

    let remote = CalculatorClient::new(client.clone());
    assert_eq!(remote.add(2, 3).await.unwrap(), "5");
    assert_eq!(remote.accumulate(4).await.unwrap(), 4);
    assert_eq!(remote.accumulate(6).await.unwrap(), 10);
    remote.reset().await.unwrap();

    // the void call does not wait for the server.
    for _ in 0..100 {
        if calculator.total() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(remote.total().await.unwrap(), 0);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_generated_signatures() {
    let _ = tracing_subscriber::fmt().try_init();
    let broker = Arc::new(MemoryBroker::with_ledger());
    let client = QueueClient::new(broker.clone(), QueueConfig::default(), JsonCodec).unwrap();
    Arc::new(CalculatorImpl::default())
        .ruamq_export(&client)
        .unwrap();

    // hand-built signatures reach the generated bindings.
    let add = Signature::new("String", "Calculator.add", ["i32", "i32"]);
    let reset = Signature::new(VOID, "Calculator.reset", Vec::<String>::new());
    for signature in [&add, &reset] {
        assert!(broker.queue_exists(signature.identity().as_str()));
    }
    let sum: String = client.call(&add, (20, 22)).await.unwrap();
    assert_eq!(sum, "42");
}
