// ===============================
// src/lib.rs
// ===============================
pub mod bus;
pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod domain;
pub mod dtc;
pub mod metrics;
pub mod mock_peer;
pub mod normalizer;
pub mod positions;
pub mod recorder;
pub mod recovery;
pub mod repository;
pub mod risk;
pub mod router;
pub mod state;
pub mod timeouts;
pub mod trade_close;
