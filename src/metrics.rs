//! Read side of the scrape event log.
//!
//! Aggregates are computed from raw events on demand. Health checks compare
//! them against fixed thresholds and only log; nothing here changes how
//! scraping behaves.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::warn;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{EventClass, ScrapeEvent};
use crate::store::EventLog;

pub const MAX_DAILY_WINDOW: u32 = 90;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStat {
    pub class: EventClass,
    pub count: u64,
    pub pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanMetrics {
    pub total_events: u64,
    pub classes: Vec<ClassStat>,
    pub avg_latency_ms: f64,
    pub avg_retry_count: f64,
    pub min_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

impl ScanMetrics {
    pub fn from_events(events: &[ScrapeEvent]) -> Self {
        let total = events.len() as u64;
        let mut counts: HashMap<EventClass, u64> = HashMap::new();
        for event in events {
            *counts.entry(event.class).or_default() += 1;
        }
        let classes = EventClass::ALL
            .iter()
            .map(|class| {
                let count = counts.get(class).copied().unwrap_or(0);
                ClassStat {
                    class: *class,
                    count,
                    pct: percent(count, total),
                }
            })
            .collect();

        let mean = |sum: u64| if total == 0 { 0.0 } else { sum as f64 / total as f64 };
        Self {
            total_events: total,
            classes,
            avg_latency_ms: mean(events.iter().map(|e| e.latency_ms).sum()),
            avg_retry_count: mean(events.iter().map(|e| e.retry_count as u64).sum()),
            min_delay_ms: events.iter().map(|e| e.delay_ms).min(),
            max_delay_ms: events.iter().map(|e| e.delay_ms).max(),
        }
    }

    pub fn count(&self, class: EventClass) -> u64 {
        self.classes
            .iter()
            .find(|s| s.class == class)
            .map_or(0, |s| s.count)
    }

    /// Fraction in `[0, 1]`; zero when there are no events.
    pub fn rate(&self, class: EventClass) -> f64 {
        if self.total_events == 0 {
            return 0.0;
        }
        self.count(class) as f64 / self.total_events as f64
    }
}

fn percent(count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 * 10_000.0 / total as f64).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRollup {
    pub date: NaiveDate,
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub timeout: u64,
    pub block: u64,
    pub manual_review: u64,
    pub success_pct: f64,
}

/// One rollup per UTC day that has events, oldest first.
pub fn daily_rollups(events: &[ScrapeEvent]) -> Vec<DailyRollup> {
    let mut days: BTreeMap<NaiveDate, DailyRollup> = BTreeMap::new();
    for event in events {
        let date = event.at.date_naive();
        let day = days.entry(date).or_insert_with(|| DailyRollup {
            date,
            total: 0,
            success: 0,
            error: 0,
            timeout: 0,
            block: 0,
            manual_review: 0,
            success_pct: 0.0,
        });
        day.total += 1;
        match event.class {
            EventClass::Success => day.success += 1,
            EventClass::Error => day.error += 1,
            EventClass::Timeout => day.timeout += 1,
            EventClass::Block => day.block += 1,
            EventClass::ManualReview => day.manual_review += 1,
        }
    }
    days.into_values()
        .map(|mut day| {
            day.success_pct = percent(day.success, day.total);
            day
        })
        .collect()
}

/// Start of the look-back window covering today and the `days - 1` before it.
pub fn window_start(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    let days = days.clamp(1, MAX_DAILY_WINDOW);
    let first = now.date_naive() - Duration::days(days as i64 - 1);
    first.and_time(chrono::NaiveTime::MIN).and_utc()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReason {
    pub class: EventClass,
    pub reason: String,
    pub count: u64,
}

/// Most frequent non-success reasons. Events are grouped by their error text
/// when present since reasons carry per-attempt detail like backoff times.
pub fn top_failure_reasons(events: &[ScrapeEvent], limit: usize) -> Vec<FailureReason> {
    let mut grouped: HashMap<(EventClass, &str), u64> = HashMap::new();
    for event in events.iter().filter(|e| e.class != EventClass::Success) {
        let key = event.error.as_deref().unwrap_or(&event.reason);
        *grouped.entry((event.class, key)).or_default() += 1;
    }
    let mut reasons: Vec<FailureReason> = grouped
        .into_iter()
        .map(|((class, reason), count)| FailureReason {
            class,
            reason: reason.to_string(),
            count,
        })
        .collect();
    reasons.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.class.cmp(&b.class))
            .then(a.reason.cmp(&b.reason))
    });
    reasons.truncate(limit);
    reasons
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub success_floor: f64,
    pub block_ceiling: f64,
    pub min_samples: u64,
    pub consecutive_forbidden: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            success_floor: 0.8,
            block_ceiling: 0.2,
            min_samples: 10,
            consecutive_forbidden: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HealthAlert {
    #[serde(rename_all = "camelCase")]
    LowSuccessRate { rate: f64, samples: u64 },
    #[serde(rename_all = "camelCase")]
    HighBlockRate { rate: f64, samples: u64 },
    #[serde(rename_all = "camelCase")]
    ConsecutiveForbidden { hotel_id: i64, streak: u32 },
}

impl fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthAlert::LowSuccessRate { rate, samples } => write!(
                f,
                "success rate {:.1}% over {} attempts",
                rate * 100.0,
                samples
            ),
            HealthAlert::HighBlockRate { rate, samples } => write!(
                f,
                "block rate {:.1}% over {} attempts",
                rate * 100.0,
                samples
            ),
            HealthAlert::ConsecutiveForbidden { hotel_id, streak } => {
                write!(f, "{} consecutive 403s for hotel {}", streak, hotel_id)
            }
        }
    }
}

impl HealthThresholds {
    /// `events` must be in append order for the 403 streak check.
    pub fn evaluate(&self, metrics: &ScanMetrics, events: &[ScrapeEvent]) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();
        let samples = metrics.total_events;
        if samples >= self.min_samples {
            let success = metrics.rate(EventClass::Success);
            if success < self.success_floor {
                alerts.push(HealthAlert::LowSuccessRate {
                    rate: success,
                    samples,
                });
            }
            let block = metrics.rate(EventClass::Block);
            if block > self.block_ceiling {
                alerts.push(HealthAlert::HighBlockRate {
                    rate: block,
                    samples,
                });
            }
        }

        // (current, longest) streak per hotel
        let mut streaks: BTreeMap<i64, (u32, u32)> = BTreeMap::new();
        for event in events {
            let Some(hotel_id) = event.hotel_id else {
                continue;
            };
            let (current, longest) = streaks.entry(hotel_id).or_default();
            if event.http_status == Some(403) {
                *current += 1;
                *longest = (*longest).max(*current);
            } else {
                *current = 0;
            }
        }
        alerts.extend(
            streaks
                .into_iter()
                .filter(|(_, (_, longest))| *longest >= self.consecutive_forbidden)
                .map(|(hotel_id, (_, streak))| HealthAlert::ConsecutiveForbidden { hotel_id, streak }),
        );
        alerts
    }
}

fn log_alerts(scope: &str, alerts: &[HealthAlert]) {
    for alert in alerts {
        warn!("Health alert for {}: {}", scope, alert);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub scan_id: Uuid,
    pub metrics: ScanMetrics,
    pub top_failure_reasons: Vec<FailureReason>,
    pub alerts: Vec<HealthAlert>,
}

pub async fn scan_report(
    events: &dyn EventLog,
    scan_id: Uuid,
    thresholds: &HealthThresholds,
) -> anyhow::Result<ScanReport> {
    let events = events.events_for_scan(scan_id).await?;
    let metrics = ScanMetrics::from_events(&events);
    let alerts = thresholds.evaluate(&metrics, &events);
    log_alerts(&format!("scan {}", scan_id), &alerts);
    Ok(ScanReport {
        scan_id,
        top_failure_reasons: top_failure_reasons(&events, 10),
        metrics,
        alerts,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyReport {
    pub since: DateTime<Utc>,
    pub days: Vec<DailyRollup>,
    pub metrics: ScanMetrics,
    pub alerts: Vec<HealthAlert>,
}

pub async fn daily_report(
    events: &dyn EventLog,
    days: u32,
    thresholds: &HealthThresholds,
) -> anyhow::Result<DailyReport> {
    let since = window_start(Utc::now(), days);
    let events = events.events_since(since).await?;
    let metrics = ScanMetrics::from_events(&events);
    let alerts = thresholds.evaluate(&metrics, &events);
    log_alerts(&format!("last {} days", days.clamp(1, MAX_DAILY_WINDOW)), &alerts);
    Ok(DailyReport {
        since,
        days: daily_rollups(&events),
        metrics,
        alerts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(class: EventClass, hotel_id: i64, status: Option<u16>) -> ScrapeEvent {
        ScrapeEvent {
            at: Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap(),
            scan_id: None,
            hotel_id: Some(hotel_id),
            url: "https://hotels.example/h".to_string(),
            class,
            http_status: status,
            delay_ms: 1000,
            retry_count: 0,
            error: None,
            user_agent: "ua".to_string(),
            reason: class.to_string(),
            latency_ms: 200,
            session_id: "s".to_string(),
        }
    }

    #[test]
    fn test_metrics_counts_and_averages() {
        let mut events = vec![
            event(EventClass::Success, 1, Some(200)),
            event(EventClass::Success, 1, Some(200)),
            event(EventClass::Error, 1, Some(503)),
            event(EventClass::Timeout, 2, None),
        ];
        events[2].retry_count = 2;
        events[2].delay_ms = 4000;
        events[3].latency_ms = 1000;

        let m = ScanMetrics::from_events(&events);
        assert_eq!(m.total_events, 4);
        assert_eq!(m.count(EventClass::Success), 2);
        assert_eq!(m.classes[0].pct, 50.0);
        assert_eq!(m.avg_latency_ms, 400.0);
        assert_eq!(m.avg_retry_count, 0.5);
        assert_eq!((m.min_delay_ms, m.max_delay_ms), (Some(1000), Some(4000)));
    }

    #[test]
    fn test_empty_metrics() {
        let m = ScanMetrics::from_events(&[]);
        assert_eq!(m.rate(EventClass::Success), 0.0);
        assert_eq!(m.min_delay_ms, None);
    }

    #[test]
    fn test_alerts_need_min_samples() {
        let events: Vec<_> = (0..9).map(|_| event(EventClass::Error, 1, Some(500))).collect();
        let thresholds = HealthThresholds::default();
        let m = ScanMetrics::from_events(&events);
        assert!(thresholds.evaluate(&m, &events).is_empty());

        let events: Vec<_> = (0..10).map(|_| event(EventClass::Error, 1, Some(500))).collect();
        let m = ScanMetrics::from_events(&events);
        assert_eq!(
            thresholds.evaluate(&m, &events),
            vec![HealthAlert::LowSuccessRate { rate: 0.0, samples: 10 }]
        );
    }

    #[test]
    fn test_block_rate_and_forbidden_streak() {
        let mut events: Vec<_> = (0..7).map(|_| event(EventClass::Success, 1, Some(200))).collect();
        events.push(event(EventClass::Block, 2, Some(403)));
        events.push(event(EventClass::Block, 2, Some(403)));
        events.push(event(EventClass::Success, 3, Some(200)));
        events.push(event(EventClass::Block, 2, Some(403)));
        let m = ScanMetrics::from_events(&events);
        let alerts = HealthThresholds::default().evaluate(&m, &events);

        assert!(alerts.iter().any(|a| matches!(a, HealthAlert::LowSuccessRate { .. })));
        assert!(alerts.iter().any(|a| matches!(a, HealthAlert::HighBlockRate { .. })));
        assert!(alerts.contains(&HealthAlert::ConsecutiveForbidden { hotel_id: 2, streak: 3 }));
    }

    #[test]
    fn test_streak_resets_per_hotel() {
        let events = vec![
            event(EventClass::Block, 1, Some(403)),
            event(EventClass::Block, 1, Some(403)),
            event(EventClass::Success, 1, Some(200)),
            event(EventClass::Block, 1, Some(403)),
        ];
        let m = ScanMetrics::from_events(&events);
        assert!(HealthThresholds::default().evaluate(&m, &events).is_empty());
    }

    #[test]
    fn test_daily_rollups_group_by_day() {
        let mut events = vec![
            event(EventClass::Success, 1, Some(200)),
            event(EventClass::Block, 1, Some(403)),
            event(EventClass::Success, 1, Some(200)),
        ];
        events[2].at = Utc.with_ymd_and_hms(2026, 10, 3, 8, 0, 0).unwrap();
        let days = daily_rollups(&events);
        assert_eq!(days.len(), 2);
        assert_eq!((days[0].total, days[0].block, days[0].success_pct), (2, 1, 50.0));
        assert_eq!(days[1].date, NaiveDate::from_ymd_opt(2026, 10, 3).unwrap());
    }

    #[test]
    fn test_window_start() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 15, 30, 0).unwrap();
        assert_eq!(
            window_start(now, 7),
            Utc.with_ymd_and_hms(2026, 10, 13, 0, 0, 0).unwrap()
        );
        assert_eq!(
            window_start(now, 0),
            Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_top_failure_reasons_groups_by_error() {
        let mut events = vec![
            event(EventClass::Error, 1, Some(503)),
            event(EventClass::Error, 2, Some(503)),
            event(EventClass::ManualReview, 1, Some(200)),
            event(EventClass::Success, 1, Some(200)),
        ];
        events[0].error = Some("HTTP 503".to_string());
        events[0].reason = "HTTP 503; retrying in 2100ms".to_string();
        events[1].error = Some("HTTP 503".to_string());
        events[1].reason = "HTTP 503; retrying in 2040ms".to_string();

        let top = top_failure_reasons(&events, 5);
        assert_eq!(top.len(), 2);
        assert_eq!(
            top[0],
            FailureReason {
                class: EventClass::Error,
                reason: "HTTP 503".to_string(),
                count: 2
            }
        );
    }
}
