// src/core/state/mod.rs

//! Shared gateway-wide state, split into logical sub-modules.

pub mod core;
pub mod stats;

pub use core::GatewayState;
pub use stats::{ConnectionStats, DisconnectReason, StatsSnapshot};
