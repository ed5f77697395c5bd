//! Forwarding pipeline.
//!
//! Every inbound event flows through:
//! 1. `router::route()` — fan-out to rules on the event's source
//! 2. `filter::CompiledFilter` — keyword and regex checks per rule
//! 3. optional per-rule delay
//! 4. an outbound adapter (relay or post), then stats and the attempt log
//!
//! `engine::ForwardEngine` owns the lifecycle and runs each step.

pub mod engine;
pub mod filter;
pub mod router;
pub mod snapshot;
pub mod types;

pub use engine::{EngineDeps, ForwardEngine};
