// src/connection/mod.rs

//! Per-connection machinery: the reader/writer task pair for an upgraded
//! websocket, plus the guard that settles registry bookkeeping on teardown.

pub mod guard;
pub mod handler;
pub mod writer;

pub use handler::serve_peer;
