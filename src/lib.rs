//! tg-forward — multi-account message forwarding engine.

pub mod config;
pub mod error;
pub mod outbound;
pub mod pipeline;
pub mod sessions;
pub mod stats;
pub mod store;
