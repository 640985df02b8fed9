pub mod config;
pub mod constants;
pub mod error;
pub mod fees;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod validation;

// Layered boundaries: use cases and ports, adapters
pub mod app;
pub mod infra;

// Marketplace records shared across layers
pub mod domain;
