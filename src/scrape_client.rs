//! One hotel x date lookup against an external booking source.
//!
//! [`HttpScraper`] composes pacing, identity, sessions, the retry engine and
//! the extractor. Every attempt, including intermediate retries, is written
//! to the event log before `scrape` returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use log::{debug, warn};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::extractor::{Extractor, Verdict};
use crate::models::{CellStatus, EventClass, Hotel, ScrapeEvent};
use crate::requests::{FetchAttempt, RequestClient};
use crate::retry::{Failure, RetryDecision, RetryPolicy};
use crate::store::EventLog;
use crate::text_manipulators::truncate_chars;

const USER_AGENT_LOG_CHARS: usize = 60;
const ERROR_LOG_CHARS: usize = 500;
const BODY_SNIPPET_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Occupancy {
    pub adults: u32,
    pub children: u32,
}

#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub scan_id: Option<Uuid>,
    pub hotel: Hotel,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub occupancy: Occupancy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeStatus {
    Green,
    Red,
    Error,
    Block,
}

impl ScrapeStatus {
    /// Anything not confirmed available is stored red.
    pub fn cell_status(&self) -> CellStatus {
        match self {
            ScrapeStatus::Green => CellStatus::Green,
            _ => CellStatus::Red,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub status: ScrapeStatus,
    pub payload: Value,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub error_message: Option<String>,
}

impl ScrapeOutcome {
    pub fn error(status: ScrapeStatus, message: impl Into<String>, payload: Value) -> Self {
        Self {
            status,
            payload,
            price: None,
            currency: None,
            error_message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, request: &ScrapeRequest) -> ScrapeOutcome;
}

/// Where and how a source is queried.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub base_url: Url,
    pub check_in_param: String,
    pub check_out_param: String,
    pub adults_param: String,
    pub children_param: String,
    pub rooms_param: Option<String>,
}

impl SourceConfig {
    /// Target URL for a lookup. An absolute `source_ref` is the source's own
    /// listing URL; anything else is resolved against `base_url`. Query
    /// parameters the source owns are replaced, unrelated ones are kept.
    pub fn target_url(
        &self,
        source_ref: &str,
        check_in: NaiveDate,
        check_out: NaiveDate,
        occupancy: Occupancy,
    ) -> anyhow::Result<Url> {
        let mut url = match Url::parse(source_ref) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => self.base_url.join(source_ref)?,
            Err(e) => return Err(e.into()),
        };

        let mut owned: Vec<&str> = vec![
            &self.check_in_param,
            &self.check_out_param,
            &self.adults_param,
            &self.children_param,
        ];
        if let Some(rooms) = &self.rooms_param {
            owned.push(rooms);
        }
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !owned.contains(&k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (k, v) in &kept {
                query.append_pair(k, v);
            }
            query
                .append_pair(&self.check_in_param, &check_in.format("%Y-%m-%d").to_string())
                .append_pair(&self.check_out_param, &check_out.format("%Y-%m-%d").to_string())
                .append_pair(&self.adults_param, &occupancy.adults.to_string())
                .append_pair(&self.children_param, &occupancy.children.to_string());
            if let Some(rooms) = &self.rooms_param {
                query.append_pair(rooms, "1");
            }
        }
        Ok(url)
    }
}

pub struct HttpScraper {
    source: SourceConfig,
    client: RequestClient,
    retry: RetryPolicy,
    extractor: Box<dyn Extractor>,
    events: Arc<dyn EventLog>,
    shutdown: CancellationToken,
}

impl HttpScraper {
    pub fn new(
        source: SourceConfig,
        client: RequestClient,
        retry: RetryPolicy,
        extractor: Box<dyn Extractor>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            source,
            client,
            retry,
            extractor,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Process shutdown cuts any retry backoff short and gives up on the cell.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    async fn record(&self, event: ScrapeEvent) {
        debug!(
            "[{}] {} {} status={:?} retry={} {}ms: {}",
            self.source.name,
            event.class,
            event.url,
            event.http_status,
            event.retry_count,
            event.latency_ms,
            event.reason
        );
        if let Err(e) = self.events.append_event(&event).await {
            warn!("Failed to append scrape event for {}: {:#}", event.url, e);
        }
    }

    fn classify_page(&self, body: &str) -> (Verdict, Value) {
        let extraction = self.extractor.extract(body);
        (extraction.verdict(), extraction.to_payload())
    }
}

struct AttemptContext<'a> {
    request: &'a ScrapeRequest,
    url: &'a Url,
    attempt: u32,
    applied_delay: Duration,
}

impl AttemptContext<'_> {
    fn event(
        &self,
        fetch: &FetchAttempt,
        class: EventClass,
        http_status: Option<u16>,
        error: Option<&str>,
        reason: String,
    ) -> ScrapeEvent {
        ScrapeEvent {
            at: Utc::now(),
            scan_id: self.request.scan_id,
            hotel_id: Some(self.request.hotel.id),
            url: self.url.to_string(),
            class,
            http_status,
            delay_ms: (self.applied_delay + fetch.paced).as_millis() as u64,
            retry_count: self.attempt,
            error: error.map(|e| truncate_chars(e, ERROR_LOG_CHARS)),
            user_agent: truncate_chars(fetch.user_agent, USER_AGENT_LOG_CHARS),
            reason,
            latency_ms: fetch.latency.as_millis() as u64,
            session_id: fetch.session_id.clone(),
        }
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn scrape(&self, request: &ScrapeRequest) -> ScrapeOutcome {
        let url = match self.source.target_url(
            &request.hotel.source_ref,
            request.check_in,
            request.check_out,
            request.occupancy,
        ) {
            Ok(url) => url,
            Err(e) => {
                let message = format!("cannot build target url: {}", e);
                self.record(ScrapeEvent {
                    at: Utc::now(),
                    scan_id: request.scan_id,
                    hotel_id: Some(request.hotel.id),
                    url: request.hotel.source_ref.clone(),
                    class: EventClass::Error,
                    http_status: None,
                    delay_ms: 0,
                    retry_count: 0,
                    error: Some(message.clone()),
                    user_agent: String::new(),
                    reason: "invalid target url".to_string(),
                    latency_ms: 0,
                    session_id: String::new(),
                })
                .await;
                return ScrapeOutcome::error(ScrapeStatus::Error, message, json!({}));
            }
        };

        let mut attempt = 0u32;
        let mut applied_delay = Duration::ZERO;
        loop {
            let fetch = match self.client.fetch(url.as_str()).await {
                Ok(fetch) => fetch,
                Err(e) => {
                    // No request left the process; nothing to retry against.
                    let message = format!("session setup failed: {:#}", e);
                    warn!("{} for {}", message, url);
                    return ScrapeOutcome::error(
                        ScrapeStatus::Error,
                        message,
                        json!({ "url": url.as_str() }),
                    );
                }
            };
            let ctx = AttemptContext {
                request,
                url: &url,
                attempt,
                applied_delay,
            };

            let (failure, message, http_status, snippet) = match &fetch.result {
                Ok(page) if (200..300).contains(&page.status) => {
                    let (verdict, extraction) = self.classify_page(&page.body);
                    let payload = json!({
                        "url": url.as_str(),
                        "httpStatus": page.status,
                        "attempts": attempt + 1,
                        "extraction": extraction,
                    });
                    let status = Some(page.status);
                    return match verdict {
                        Verdict::Available { price, currency } => {
                            let reason = format!("priced room from {:.2}", price);
                            self.record(ctx.event(&fetch, EventClass::Success, status, None, reason))
                                .await;
                            ScrapeOutcome {
                                status: ScrapeStatus::Green,
                                payload,
                                price: Some(price),
                                currency,
                                error_message: None,
                            }
                        }
                        Verdict::SoldOut { marker } => {
                            let reason = format!("sold out: {}", marker);
                            self.record(ctx.event(&fetch, EventClass::Success, status, None, reason))
                                .await;
                            ScrapeOutcome {
                                status: ScrapeStatus::Red,
                                payload,
                                price: None,
                                currency: None,
                                error_message: None,
                            }
                        }
                        Verdict::Challenge { marker } => {
                            let reason = format!("anti-bot challenge page ({})", marker);
                            self.record(ctx.event(
                                &fetch,
                                EventClass::Block,
                                status,
                                Some(reason.as_str()),
                                reason.clone(),
                            ))
                            .await;
                            self.rotate_after_block(&fetch.session_id).await;
                            ScrapeOutcome::error(ScrapeStatus::Block, reason, payload)
                        }
                        Verdict::Ambiguous => {
                            let reason =
                                "no priced rooms and no sold-out marker".to_string();
                            self.record(ctx.event(
                                &fetch,
                                EventClass::ManualReview,
                                status,
                                None,
                                reason,
                            ))
                            .await;
                            ScrapeOutcome {
                                status: ScrapeStatus::Red,
                                payload,
                                price: None,
                                currency: None,
                                error_message: None,
                            }
                        }
                    };
                }
                Ok(page) => (
                    Failure::Status(page.status),
                    format!("HTTP {}", page.status),
                    Some(page.status),
                    Some(truncate_chars(&page.body, BODY_SNIPPET_CHARS)),
                ),
                Err((failure, message)) => (*failure, message.clone(), None, None),
            };

            let payload = json!({
                "url": url.as_str(),
                "httpStatus": http_status,
                "attempts": attempt + 1,
                "error": message,
                "bodySnippet": snippet,
            });

            match self.retry.decide(failure, attempt) {
                RetryDecision::Retry(backoff) => {
                    let wait = backoff.sample();
                    let reason = format!("{}; retrying in {}ms", message, wait.as_millis());
                    warn!("{} -> {}", url, reason);
                    self.record(ctx.event(
                        &fetch,
                        failure.event_class(),
                        http_status,
                        Some(message.as_str()),
                        reason,
                    ))
                    .await;
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.shutdown.cancelled() => {
                            warn!("{} abandoned: shutdown during backoff", url);
                            return ScrapeOutcome::error(
                                ScrapeStatus::Error,
                                format!("{}; shutdown during backoff", message),
                                payload,
                            );
                        }
                    }
                    applied_delay = wait;
                    attempt += 1;
                }
                RetryDecision::Block => {
                    let reason = match failure {
                        Failure::Status(429) => "rate limited, retries exhausted".to_string(),
                        _ => "access forbidden".to_string(),
                    };
                    warn!("{} blocked: {}", url, reason);
                    self.record(ctx.event(
                        &fetch,
                        EventClass::Block,
                        http_status,
                        Some(message.as_str()),
                        reason.clone(),
                    ))
                    .await;
                    self.rotate_after_block(&fetch.session_id).await;
                    return ScrapeOutcome::error(ScrapeStatus::Block, reason, payload);
                }
                RetryDecision::GiveUp => {
                    let reason = if attempt == 0 {
                        format!("{}; not retryable", message)
                    } else {
                        format!("{}; giving up after {} retries", message, attempt)
                    };
                    self.record(ctx.event(
                        &fetch,
                        failure.event_class(),
                        http_status,
                        Some(message.as_str()),
                        reason,
                    ))
                    .await;
                    return ScrapeOutcome::error(ScrapeStatus::Error, message, payload);
                }
            }
        }
    }
}

impl HttpScraper {
    async fn rotate_after_block(&self, session_id: &str) {
        if let Err(e) = self.client.invalidate_session(session_id).await {
            warn!("Failed to rotate session {}: {:#}", session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceConfig {
        SourceConfig {
            name: "test".to_string(),
            base_url: Url::parse("https://hotels.example/").unwrap(),
            check_in_param: "checkin".to_string(),
            check_out_param: "checkout".to_string(),
            adults_param: "group_adults".to_string(),
            children_param: "group_children".to_string(),
            rooms_param: Some("no_rooms".to_string()),
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 12, d).unwrap()
    }

    #[test]
    fn test_relative_ref_joins_base() {
        let url = source()
            .target_url(
                "/hotel/ch/alpina.html",
                date(1),
                date(3),
                Occupancy { adults: 2, children: 0 },
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://hotels.example/hotel/ch/alpina.html?checkin=2026-12-01&checkout=2026-12-03&group_adults=2&group_children=0&no_rooms=1"
        );
    }

    #[test]
    fn test_absolute_ref_replaces_owned_params() {
        let url = source()
            .target_url(
                "https://other.example/listing/42?lang=de&checkin=2020-01-01",
                date(5),
                date(6),
                Occupancy { adults: 1, children: 1 },
            )
            .unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(url.host_str(), Some("other.example"));
        assert!(pairs.contains(&("lang".to_string(), "de".to_string())));
        assert!(pairs.contains(&("checkin".to_string(), "2026-12-05".to_string())));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "checkin").count(), 1);
    }

    #[test]
    fn test_cell_status_mapping() {
        assert_eq!(ScrapeStatus::Green.cell_status(), CellStatus::Green);
        for s in [ScrapeStatus::Red, ScrapeStatus::Error, ScrapeStatus::Block] {
            assert_eq!(s.cell_status(), CellStatus::Red);
        }
    }
}
