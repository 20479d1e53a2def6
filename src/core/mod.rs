// src/core/mod.rs

//! The gateway core: registry, correlation, routing, durable streams, and
//! the background tasks that keep them healthy.

pub mod correlator;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod state;
pub mod stream;
pub mod tasks;

pub use errors::NexusError;
