//! taskgate server: synchronous HTTP front door for asynchronous bus workers.
//!
//! Requests are published as tasks on Pulsar; worker results come back over
//! `POST /res` or the `/res/ws` socket and are matched to the waiting client
//! through the correlation registry.

pub mod bus;
pub mod config;
pub mod correlation;
pub mod discovery;
pub mod network;
pub mod observability;

pub use bus::{InMemoryBus, MessageBus, ProducerCache, PulsarBus, TopicProducer};
pub use correlation::CorrelationRegistry;
pub use network::NetworkModule;
