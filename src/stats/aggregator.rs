//! Forwarding counters and bounded attempt logs.
//!
//! One [`StatsAggregator`] is shared by every dispatch task of an engine.
//! All state sits behind a single mutex, and each call mutates it as one
//! unit without holding the lock across an await point.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{Local, NaiveDate, Utc};
use serde::Serialize;

use crate::pipeline::types::ActiveRule;
use crate::stats::ring::RingBuffer;
use crate::store::model::{AttemptStatus, ForwardAttempt, excerpt};

pub const ATTEMPT_LOG_CAP: usize = 1000;
pub const FAILURE_LOG_CAP: usize = 500;
pub const DELAY_WINDOW_CAP: usize = 100;

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Where dispatch tasks report their outcome.
pub trait StatsSink: Send + Sync {
    /// Count one attempt and add its elapsed time to the rule's rolling window.
    fn record(&self, rule: &ActiveRule, success: bool, elapsed_secs: f64);

    /// Append one attempt to the bounded logs and return the entry written.
    fn append_log(
        &self,
        rule: &ActiveRule,
        text: &str,
        success: bool,
        error: Option<String>,
    ) -> ForwardAttempt;
}

/// Per-rule counters, keyed by rule name in the aggregator.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStats {
    pub total: u64,
    pub success: u64,
    pub today: u64,
    pub today_date: NaiveDate,
    pub success_rate: f64,
    pub avg_delay: f64,
    #[serde(skip)]
    delays: RingBuffer<f64>,
}

impl RuleStats {
    fn new(today: NaiveDate) -> Self {
        Self {
            total: 0,
            success: 0,
            today: 0,
            today_date: today,
            success_rate: 0.0,
            avg_delay: 0.0,
            delays: RingBuffer::new(DELAY_WINDOW_CAP),
        }
    }

    /// Retained elapsed-time samples, oldest first.
    pub fn delay_samples(&self) -> Vec<f64> {
        self.delays.to_vec()
    }

    fn apply(&mut self, today: NaiveDate, success: bool, elapsed_secs: f64) {
        if self.today_date != today {
            self.today_date = today;
            self.today = 0;
        }
        self.total += 1;
        self.today += 1;
        if success {
            self.success += 1;
        }
        self.success_rate = self.success as f64 / self.total as f64 * 100.0;

        self.delays.push(elapsed_secs);
        let sum: f64 = self.delays.iter().sum();
        self.avg_delay = sum / self.delays.len() as f64;
    }
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub total: u64,
    pub success: u64,
    /// Attempts per local day, keyed `YYYY-MM-DD`.
    pub daily: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct Inner {
    global: GlobalStats,
    rules: HashMap<String, RuleStats>,
    attempts: RingBuffer<ForwardAttempt>,
    failures: RingBuffer<ForwardAttempt>,
}

#[derive(Debug)]
pub struct StatsAggregator {
    inner: Mutex<Inner>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                global: GlobalStats::default(),
                rules: HashMap::new(),
                attempts: RingBuffer::new(ATTEMPT_LOG_CAP),
                failures: RingBuffer::new(FAILURE_LOG_CAP),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Updates never await or panic midway, so a poisoned guard is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count one attempt against `rule_name` as of `today`.
    pub fn record_on(&self, today: NaiveDate, rule_name: &str, success: bool, elapsed_secs: f64) {
        let mut inner = self.lock();

        inner.global.total += 1;
        if success {
            inner.global.success += 1;
        }
        *inner
            .global
            .daily
            .entry(today.format(DAY_FORMAT).to_string())
            .or_insert(0) += 1;

        inner
            .rules
            .entry(rule_name.to_string())
            .or_insert_with(|| RuleStats::new(today))
            .apply(today, success, elapsed_secs);
    }

    fn push_log(&self, attempt: ForwardAttempt) {
        let mut inner = self.lock();
        if attempt.status == AttemptStatus::Failed {
            inner.failures.push(attempt.clone());
        }
        inner.attempts.push(attempt);
    }

    pub fn global(&self) -> GlobalStats {
        self.lock().global.clone()
    }

    pub fn rule(&self, name: &str) -> Option<RuleStats> {
        self.lock().rules.get(name).cloned()
    }

    /// All per-rule stats, sorted by rule name.
    pub fn rules(&self) -> Vec<(String, RuleStats)> {
        let inner = self.lock();
        let mut rules: Vec<_> = inner
            .rules
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect();
        rules.sort_by(|a, b| a.0.cmp(&b.0));
        rules
    }

    /// Attempt log, oldest first.
    pub fn attempts(&self) -> Vec<ForwardAttempt> {
        self.lock().attempts.to_vec()
    }

    /// Failed-attempt log, oldest first.
    pub fn failures(&self) -> Vec<ForwardAttempt> {
        self.lock().failures.to_vec()
    }

    /// Daily totals for `from..=to`, with zero for days without attempts.
    pub fn daily_totals(&self, from: NaiveDate, to: NaiveDate) -> Vec<(NaiveDate, u64)> {
        let inner = self.lock();
        from.iter_days()
            .take_while(|day| *day <= to)
            .map(|day| {
                let count = inner
                    .global
                    .daily
                    .get(&day.format(DAY_FORMAT).to_string())
                    .copied()
                    .unwrap_or(0);
                (day, count)
            })
            .collect()
    }

    /// One-line summary for periodic logging.
    pub fn summary(&self) -> String {
        let inner = self.lock();
        let today = Local::now().date_naive().format(DAY_FORMAT).to_string();
        format!(
            "{} attempts ({} ok, {} today), {} rules, {} failures logged",
            inner.global.total,
            inner.global.success,
            inner.global.daily.get(&today).copied().unwrap_or(0),
            inner.rules.len(),
            inner.failures.len(),
        )
    }
}

impl StatsSink for StatsAggregator {
    fn record(&self, rule: &ActiveRule, success: bool, elapsed_secs: f64) {
        self.record_on(Local::now().date_naive(), rule.name(), success, elapsed_secs);
    }

    fn append_log(
        &self,
        rule: &ActiveRule,
        text: &str,
        success: bool,
        error: Option<String>,
    ) -> ForwardAttempt {
        let attempt = ForwardAttempt {
            timestamp: Utc::now(),
            rule_id: rule.id(),
            rule_name: rule.name().to_string(),
            source: rule.source.title.clone(),
            target: rule.target.descriptor(),
            status: if success {
                AttemptStatus::Success
            } else {
                AttemptStatus::Failed
            },
            excerpt: excerpt(text),
            error,
        };
        self.push_log(attempt.clone());
        attempt
    }
}
