//! Fusenet Bus Abstraction Layer
//!
//! This crate isolates the L2 coordinator from the concrete message bus.
//! The coordinator only sees [`BusTransport`]: publish an opaque payload
//! on a topic, or consume a topic with a callback until cancelled.
//!
//! Two implementations ship with the workspace:
//! - [`RedisBus`] for production deployments (Redis pub/sub)
//! - [`LocalBus`] for tests and in-process demos
//!
//! # Example
//!
//! ```ignore
//! use fusion_bus::{BusTransport, LocalBus};
//!
//! let bus = LocalBus::new();
//! bus.publish("l2_to_l1", &payload).await?;
//! ```

mod error;
mod local;
mod redis_bus;
mod transport;

pub use error::BusError;
pub use local::LocalBus;
pub use redis_bus::RedisBus;
pub use transport::{BusTransport, MessageHandler};
