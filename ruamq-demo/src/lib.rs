use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Worker queue fed by the `worker` demo.
pub const EXAMPLE_QUEUE: &str = "EXAMPLE_QUEUE";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ExampleMessage {
    pub text: String,
}

impl ExampleMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[ruamq::service]
pub trait ExampleService {
    fn encode_message(&self, message: ExampleMessage) -> ExampleMessage;
    fn decode_message(&self, message: ExampleMessage) -> ExampleMessage;
    fn calculate(&self, number1: i32, number2: i32) -> String;
    fn process(&self, message: ExampleMessage);
}

#[derive(Default)]
pub struct DemoImpl {
    processed: AtomicU64,
}

impl DemoImpl {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }
}

impl ExampleService for DemoImpl {
    fn encode_message(&self, message: ExampleMessage) -> ExampleMessage {
        tracing::info!("encoding {}", message.text);
        ExampleMessage::new(hex::encode(message.text))
    }

    fn decode_message(&self, message: ExampleMessage) -> ExampleMessage {
        tracing::info!("decoding {}", message.text);
        match hex::decode(&message.text).map(String::from_utf8) {
            Ok(Ok(text)) => ExampleMessage::new(text),
            _ => {
                tracing::warn!("{:?} is not hex-encoded text", message.text);
                ExampleMessage::default()
            }
        }
    }

    fn calculate(&self, number1: i32, number2: i32) -> String {
        tracing::info!("calculating {number1} + {number2}");
        (number1 + number2).to_string()
    }

    fn process(&self, message: ExampleMessage) {
        self.processed.fetch_add(1, Ordering::AcqRel);
        tracing::info!("process {}", message.text);
    }
}
