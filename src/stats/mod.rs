//! Running statistics and bounded audit windows.

pub mod aggregator;
pub mod ring;

pub use aggregator::{GlobalStats, RuleStats, StatsAggregator, StatsSink};
pub use ring::RingBuffer;
