pub mod consumer;

pub use consumer::{StreamConsumer, StreamMessage, StreamSource};
