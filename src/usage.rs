//! Token and cost accounting.
//!
//! Every usage event is kept as a record filed under the calendar date it
//! falls on in one fixed UTC offset. Daily totals and the per-type and
//! per-model breakdowns are computed from those records on demand.

use std::collections::BTreeMap;

use chrono::{DateTime, Days, FixedOffset, NaiveDate, Offset, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent::AgentType;

/// Token, cost and request counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    pub requests: u64,
}

impl UsageMetrics {
    pub fn add(&mut self, other: &UsageMetrics) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cost_usd += other.cost_usd;
        self.requests += other.requests;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A single attributed usage event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub model: Option<String>,
    pub at: DateTime<Utc>,
    pub metrics: UsageMetrics,
}

/// Aggregated usage for one calendar date
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub metrics: UsageMetrics,
    pub by_agent_type: BTreeMap<String, UsageMetrics>,
    pub by_model: BTreeMap<String, UsageMetrics>,
    pub cycles: u64,
    pub successful_cycles: u64,
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct DayLedger {
    records: Vec<UsageRecord>,
    cycles: u64,
    successful_cycles: u64,
}

const UNKNOWN_MODEL: &str = "unknown";

pub struct UsageAggregator {
    offset: FixedOffset,
    days: Mutex<BTreeMap<NaiveDate, DayLedger>>,
}

impl UsageAggregator {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            days: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build from an offset in minutes east of UTC; out of range values fall back to UTC
    pub fn with_offset_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| {
            warn!(minutes, "usage offset out of range, falling back to UTC");
            Utc.fix()
        });
        Self::new(offset)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Calendar date of an instant under this aggregator's offset
    pub fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    pub fn record(
        &self,
        agent_id: &str,
        agent_type: AgentType,
        model: Option<String>,
        metrics: UsageMetrics,
        at: DateTime<Utc>,
    ) {
        let date = self.date_of(at);
        self.days.lock().entry(date).or_default().records.push(UsageRecord {
            agent_id: agent_id.to_string(),
            agent_type,
            model,
            at,
            metrics,
        });
    }

    pub fn record_cycle(&self, success: bool, at: DateTime<Utc>) {
        let date = self.date_of(at);
        let mut days = self.days.lock();
        let day = days.entry(date).or_default();
        day.cycles += 1;
        if success {
            day.successful_cycles += 1;
        }
    }

    pub fn daily(&self, date: NaiveDate) -> DailyUsage {
        let days = self.days.lock();
        let mut usage = DailyUsage {
            date,
            metrics: UsageMetrics::default(),
            by_agent_type: BTreeMap::new(),
            by_model: BTreeMap::new(),
            cycles: 0,
            successful_cycles: 0,
            success_rate: 0.0,
        };
        let Some(day) = days.get(&date) else {
            return usage;
        };

        for record in &day.records {
            usage.metrics.add(&record.metrics);
            usage
                .by_agent_type
                .entry(record.agent_type.to_string())
                .or_default()
                .add(&record.metrics);
            usage
                .by_model
                .entry(record.model.clone().unwrap_or_else(|| UNKNOWN_MODEL.into()))
                .or_default()
                .add(&record.metrics);
        }
        usage.cycles = day.cycles;
        usage.successful_cycles = day.successful_cycles;
        if day.cycles > 0 {
            usage.success_rate = day.successful_cycles as f64 / day.cycles as f64 * 100.0;
        }
        usage
    }

    pub fn today(&self) -> DailyUsage {
        self.daily(self.date_of(Utc::now()))
    }

    /// The last `days` dates ending today, most recent first
    pub fn history(&self, days: u32) -> Vec<DailyUsage> {
        let today = self.date_of(Utc::now());
        (0..days)
            .filter_map(|i| today.checked_sub_days(Days::new(u64::from(i))))
            .map(|date| self.daily(date))
            .collect()
    }

    pub fn total(&self) -> UsageMetrics {
        let days = self.days.lock();
        let mut total = UsageMetrics::default();
        for record in days.values().flat_map(|d| d.records.iter()) {
            total.add(&record.metrics);
        }
        total
    }

    pub fn per_agent(&self, agent_id: &str) -> UsageMetrics {
        let days = self.days.lock();
        let mut total = UsageMetrics::default();
        for record in days
            .values()
            .flat_map(|d| d.records.iter())
            .filter(|r| r.agent_id == agent_id)
        {
            total.add(&record.metrics);
        }
        total
    }

    /// Records logged on one date, in arrival order
    pub fn records_on(&self, date: NaiveDate) -> Vec<UsageRecord> {
        self.days
            .lock()
            .get(&date)
            .map(|d| d.records.clone())
            .unwrap_or_default()
    }
}

impl Default for UsageAggregator {
    fn default() -> Self {
        Self::with_offset_minutes(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn metrics(input: u64, output: u64, cost: f64) -> UsageMetrics {
        UsageMetrics {
            input_tokens: input,
            output_tokens: output,
            cost_usd: cost,
            requests: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_daily_total_matches_records() {
        let agg = UsageAggregator::default();
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();

        agg.record("coordinator-1", AgentType::Coordinator, Some("opus".into()), metrics(100, 20, 0.5), at);
        agg.record("worker-1", AgentType::Worker, Some("sonnet".into()), metrics(300, 50, 0.25), at);
        agg.record("worker-1", AgentType::Worker, None, metrics(10, 5, 0.25), at);

        let date = agg.date_of(at);
        let expected = UsageMetrics {
            input_tokens: 410,
            output_tokens: 75,
            cost_usd: 1.0,
            requests: 3,
            ..Default::default()
        };

        let daily = agg.daily(date);
        assert_eq!(daily.metrics, expected);
        assert_eq!(agg.records_on(date).len(), 3);
        assert_eq!(daily.metrics.input_tokens, 410);
        assert_eq!(daily.metrics.requests, 3);
        assert_eq!(daily.by_agent_type["worker"].input_tokens, 310);
        assert_eq!(daily.by_model["unknown"].output_tokens, 5);
        assert_eq!(agg.per_agent("worker-1").output_tokens, 55);
        assert_eq!(agg.total(), expected);
    }

    #[test]
    fn test_midnight_boundary_splits_buckets() {
        // UTC+9: both instants are on different local days
        let agg = UsageAggregator::with_offset_minutes(9 * 60);
        let offset = agg.offset();
        let before = offset
            .with_ymd_and_hms(2026, 3, 14, 23, 59, 59)
            .unwrap()
            .with_timezone(&Utc);
        let after = offset
            .with_ymd_and_hms(2026, 3, 15, 0, 0, 1)
            .unwrap()
            .with_timezone(&Utc);

        agg.record("worker-1", AgentType::Worker, None, metrics(1, 0, 0.0), before);
        agg.record("worker-1", AgentType::Worker, None, metrics(2, 0, 0.0), after);

        let d1 = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        assert_eq!(agg.daily(d1).metrics.input_tokens, 1);
        assert_eq!(agg.daily(d2).metrics.input_tokens, 2);
    }

    #[test]
    fn test_cycle_success_rate() {
        let agg = UsageAggregator::default();
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 8, 0, 0).unwrap();
        agg.record_cycle(true, at);
        agg.record_cycle(false, at);
        agg.record_cycle(true, at);
        agg.record_cycle(true, at);

        let daily = agg.daily(agg.date_of(at));
        assert_eq!(daily.cycles, 4);
        assert_eq!(daily.successful_cycles, 3);
        assert!((daily.success_rate - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_history_covers_requested_days() {
        let agg = UsageAggregator::default();
        agg.record("worker-1", AgentType::Worker, None, metrics(7, 0, 0.0), Utc::now());

        let history = agg.history(7);
        assert_eq!(history.len(), 7);
        assert_eq!(history[0].metrics.input_tokens, 7);
        assert!(history[1..].iter().all(|d| d.metrics.is_empty()));
    }

    #[test]
    fn test_out_of_range_offset_falls_back_to_utc() {
        let agg = UsageAggregator::with_offset_minutes(48 * 60);
        assert_eq!(agg.offset().local_minus_utc(), 0);
    }

    const AGENTS: [(&str, AgentType); 3] = [
        ("coordinator-1", AgentType::Coordinator),
        ("worker-1", AgentType::Worker),
        ("evaluator-1", AgentType::Evaluator),
    ];

    proptest! {
        #[test]
        fn prop_daily_totals_sum_their_records(
            offset_quarters in -48i32..=56,
            events in prop::collection::vec((0usize..3, 0i64..4 * 86_400, 0u64..10_000, 0u64..10_000, 0u32..8), 0..40),
        ) {
            let offset_minutes = offset_quarters * 15;
            let agg = UsageAggregator::with_offset_minutes(offset_minutes);
            let start = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();

            let mut expected: BTreeMap<NaiveDate, (u64, u64, f64, u64)> = BTreeMap::new();
            for (agent, seconds, input, output, quarters) in events {
                let at = start + Duration::seconds(seconds);
                let cost = f64::from(quarters) * 0.25;
                let (id, agent_type) = AGENTS[agent];
                agg.record(id, agent_type, None, metrics(input, output, cost), at);

                // Wall-clock date: shift the instant by the offset and read the UTC calendar
                let local_date = (at + Duration::minutes(i64::from(offset_minutes))).date_naive();
                let day = expected.entry(local_date).or_default();
                day.0 += input;
                day.1 += output;
                day.2 += cost;
                day.3 += 1;
            }

            for (date, (input, output, cost, requests)) in &expected {
                let daily = agg.daily(*date);
                prop_assert_eq!(daily.metrics.input_tokens, *input);
                prop_assert_eq!(daily.metrics.output_tokens, *output);
                prop_assert_eq!(daily.metrics.cost_usd, *cost);
                prop_assert_eq!(daily.metrics.requests, *requests);
            }
            let first = NaiveDate::from_ymd_opt(2026, 4, 29).unwrap();
            for date in first.iter_days().take(8).filter(|d| !expected.contains_key(d)) {
                prop_assert!(agg.daily(date).metrics.is_empty());
            }
        }
    }
}
