// src/core/tasks/mod.rs

//! Long-running background tasks that support the gateway's core
//! functionality.

pub mod health;
