//! Drives `HttpScraper` against a local axum server.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
};
use chrono::NaiveDate;
use hotelscan::extractor::{SelectorExtractor, SelectorSet};
use hotelscan::store::EventLog;
use hotelscan::store::memory::InMemoryStore;
use hotelscan::{
    EventClass, Hotel, HttpScraper, IdentityPool, Occupancy, PacingConfig, RateLimiter,
    RequestClient, RetryPolicy, ScrapeRequest, ScrapeStatus, Scraper, SessionConfig, SourceConfig,
};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

const PRICED: &str = r#"<html><body>
  <div class="room"><span class="room-name">Double Deluxe</span><span class="price">€ 189</span></div>
  <div class="room"><span class="room-name">Single</span><span class="price">€ 120</span></div>
</body></html>"#;

const SOLD_OUT: &str =
    r#"<html><body><div class="sold-out">Sold out on your dates</div></body></html>"#;

const CHALLENGE: &str =
    r#"<html><body><h1>Please verify you are human</h1><div id="captcha"></div></body></html>"#;

const EMPTY: &str = r#"<html><body><h1>Welcome</h1></body></html>"#;

#[derive(Default)]
struct Hits {
    flaky: AtomicUsize,
    rate_limited: AtomicUsize,
    forbidden: AtomicUsize,
}

async fn spawn_site(hits: Arc<Hits>) -> Url {
    async fn priced(Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
        // Only answer with rates for a well-formed search.
        let complete = ["checkin", "checkout", "group_adults", "group_children"]
            .iter()
            .all(|k| q.contains_key(*k));
        if complete { Html(PRICED) } else { Html(EMPTY) }
    }
    async fn forbidden(State(hits): State<Arc<Hits>>) -> impl IntoResponse {
        hits.forbidden.fetch_add(1, Ordering::SeqCst);
        (StatusCode::FORBIDDEN, "denied")
    }
    async fn flaky(State(hits): State<Arc<Hits>>) -> axum::response::Response {
        if hits.flaky.fetch_add(1, Ordering::SeqCst) < 2 {
            (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
        } else {
            Html(PRICED).into_response()
        }
    }
    async fn rate_limited(State(hits): State<Arc<Hits>>) -> impl IntoResponse {
        hits.rate_limited.fetch_add(1, Ordering::SeqCst);
        (StatusCode::TOO_MANY_REQUESTS, "slow down")
    }
    async fn slow() -> impl IntoResponse {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Html(PRICED)
    }

    let app = Router::new()
        .route("/hotel/priced", get(priced))
        .route("/hotel/sold-out", get(|| async { Html(SOLD_OUT) }))
        .route("/hotel/challenge", get(|| async { Html(CHALLENGE) }))
        .route("/hotel/empty", get(|| async { Html(EMPTY) }))
        .route("/hotel/missing", get(|| async { (StatusCode::NOT_FOUND, "gone") }))
        .route("/hotel/forbidden", get(forbidden))
        .route("/hotel/flaky", get(flaky))
        .route("/hotel/rate-limited", get(rate_limited))
        .route("/hotel/slow", get(slow))
        .with_state(hits);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}/", addr)).unwrap()
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        rate_limit_base: Duration::from_millis(2),
        server_error_base: Duration::from_millis(2),
        timeout_base: Duration::from_millis(2),
        ..RetryPolicy::default()
    }
}

fn scraper(base_url: Url, events: Arc<InMemoryStore>) -> HttpScraper {
    scraper_with_retries(base_url, events, fast_retries())
}

fn scraper_with_retries(base_url: Url, events: Arc<InMemoryStore>, retry: RetryPolicy) -> HttpScraper {
    let source = SourceConfig {
        name: "local".to_string(),
        base_url,
        check_in_param: "checkin".to_string(),
        check_out_param: "checkout".to_string(),
        adults_param: "group_adults".to_string(),
        children_param: "group_children".to_string(),
        rooms_param: None,
    };
    let session = SessionConfig {
        max_requests: 3,
        max_age: Duration::from_secs(60),
        request_timeout: Duration::from_millis(300),
    };
    let client = RequestClient::new(
        session,
        IdentityPool::new(None),
        RateLimiter::new(NonZeroU32::new(6000).unwrap(), Duration::ZERO),
        PacingConfig {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
    )
    .unwrap();
    let extractor = SelectorExtractor::new(&SelectorSet::default(), Some("EUR".to_string())).unwrap();
    HttpScraper::new(source, client, retry, Box::new(extractor), events)
}

fn request(scan_id: Uuid, path: &str) -> ScrapeRequest {
    ScrapeRequest {
        scan_id: Some(scan_id),
        hotel: Hotel {
            id: 7,
            name: "Alpina".to_string(),
            source_ref: path.to_string(),
        },
        check_in: NaiveDate::from_ymd_opt(2026, 12, 20).unwrap(),
        check_out: NaiveDate::from_ymd_opt(2026, 12, 22).unwrap(),
        occupancy: Occupancy {
            adults: 2,
            children: 0,
        },
    }
}

async fn setup() -> (HttpScraper, Arc<InMemoryStore>, Arc<Hits>) {
    let hits = Arc::new(Hits::default());
    let base = spawn_site(hits.clone()).await;
    let events = Arc::new(InMemoryStore::new());
    (scraper(base, events.clone()), events, hits)
}

#[tokio::test]
async fn test_priced_page_is_green_with_cheapest_rate() {
    let (scraper, events, _) = setup().await;
    let scan_id = Uuid::new_v4();
    let outcome = scraper.scrape(&request(scan_id, "/hotel/priced")).await;

    assert_eq!(outcome.status, ScrapeStatus::Green);
    assert_eq!(outcome.price, Some(120.0));
    assert_eq!(outcome.currency.as_deref(), Some("EUR"));
    assert_eq!(outcome.payload["httpStatus"], 200);

    let logged = events.events_for_scan(scan_id).await.unwrap();
    assert_eq!(logged.len(), 1);
    let event = &logged[0];
    assert_eq!(event.class, EventClass::Success);
    assert_eq!(event.retry_count, 0);
    assert_eq!(event.hotel_id, Some(7));
    assert!(event.url.contains("checkin=2026-12-20"));
    assert!(event.url.contains("checkout=2026-12-22"));
    assert!(!event.user_agent.is_empty() && event.user_agent.chars().count() <= 60);
    assert!(!event.session_id.is_empty());
}

#[tokio::test]
async fn test_forbidden_blocks_without_retry() {
    let (scraper, events, hits) = setup().await;
    let scan_id = Uuid::new_v4();
    let outcome = scraper.scrape(&request(scan_id, "/hotel/forbidden")).await;

    assert_eq!(outcome.status, ScrapeStatus::Block);
    assert_eq!(hits.forbidden.load(Ordering::SeqCst), 1);
    let logged = events.events_for_scan(scan_id).await.unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].class, EventClass::Block);
    assert_eq!(logged[0].http_status, Some(403));
    assert_eq!(logged[0].retry_count, 0);
}

#[tokio::test]
async fn test_server_errors_are_retried_then_succeed() {
    let (scraper, events, hits) = setup().await;
    let scan_id = Uuid::new_v4();
    let outcome = scraper.scrape(&request(scan_id, "/hotel/flaky")).await;

    assert_eq!(outcome.status, ScrapeStatus::Green);
    assert_eq!(hits.flaky.load(Ordering::SeqCst), 3);
    let logged = events.events_for_scan(scan_id).await.unwrap();
    let classes: Vec<_> = logged.iter().map(|e| (e.class, e.retry_count)).collect();
    assert_eq!(
        classes,
        vec![
            (EventClass::Error, 0),
            (EventClass::Error, 1),
            (EventClass::Success, 2)
        ]
    );
    assert_eq!(logged[0].http_status, Some(503));
    // The backoff waited before a retry shows up as that attempt's delay.
    assert!(logged[1].delay_ms >= 2);
}

#[tokio::test]
async fn test_rate_limit_exhaustion_is_a_block() {
    let (scraper, events, hits) = setup().await;
    let scan_id = Uuid::new_v4();
    let outcome = scraper.scrape(&request(scan_id, "/hotel/rate-limited")).await;

    assert_eq!(outcome.status, ScrapeStatus::Block);
    assert_eq!(hits.rate_limited.load(Ordering::SeqCst), 4);
    let logged = events.events_for_scan(scan_id).await.unwrap();
    assert_eq!(logged.len(), 4);
    assert_eq!(logged[3].class, EventClass::Block);
    assert_eq!(logged[3].retry_count, 3);
    assert!(logged[..3].iter().all(|e| e.http_status == Some(429)));
}

#[tokio::test]
async fn test_timeouts_retry_twice_then_error() {
    let (scraper, events, _) = setup().await;
    let scan_id = Uuid::new_v4();
    let outcome = scraper.scrape(&request(scan_id, "/hotel/slow")).await;

    assert_eq!(outcome.status, ScrapeStatus::Error);
    let logged = events.events_for_scan(scan_id).await.unwrap();
    assert_eq!(logged.len(), 3);
    assert!(logged.iter().all(|e| e.class == EventClass::Timeout));
    assert!(logged.iter().all(|e| e.http_status.is_none()));
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let (scraper, events, _) = setup().await;
    let scan_id = Uuid::new_v4();
    let outcome = scraper.scrape(&request(scan_id, "/hotel/missing")).await;

    assert_eq!(outcome.status, ScrapeStatus::Error);
    assert_eq!(outcome.error_message.as_deref(), Some("HTTP 404"));
    assert_eq!(events.events_for_scan(scan_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sold_out_is_red() {
    let (scraper, events, _) = setup().await;
    let scan_id = Uuid::new_v4();
    let outcome = scraper.scrape(&request(scan_id, "/hotel/sold-out")).await;

    assert_eq!(outcome.status, ScrapeStatus::Red);
    assert_eq!(outcome.price, None);
    let logged = events.events_for_scan(scan_id).await.unwrap();
    assert_eq!(logged[0].class, EventClass::Success);
}

#[tokio::test]
async fn test_challenge_page_blocks_and_rotates_session() {
    let (scraper, events, _) = setup().await;
    let scan_id = Uuid::new_v4();
    let first = scraper.scrape(&request(scan_id, "/hotel/challenge")).await;
    let second = scraper.scrape(&request(scan_id, "/hotel/priced")).await;

    assert_eq!(first.status, ScrapeStatus::Block);
    assert_eq!(second.status, ScrapeStatus::Green);
    let logged = events.events_for_scan(scan_id).await.unwrap();
    assert_eq!(logged[0].class, EventClass::Block);
    assert_eq!(logged[0].retry_count, 0);
    assert_ne!(logged[0].session_id, logged[1].session_id);
}

#[tokio::test]
async fn test_ambiguous_page_is_red_for_review() {
    let (scraper, events, _) = setup().await;
    let scan_id = Uuid::new_v4();
    let outcome = scraper.scrape(&request(scan_id, "/hotel/empty")).await;

    assert_eq!(outcome.status, ScrapeStatus::Red);
    let logged = events.events_for_scan(scan_id).await.unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].class, EventClass::ManualReview);
}

#[tokio::test]
async fn test_session_rotates_after_request_budget() {
    let (scraper, events, _) = setup().await;
    let scan_id = Uuid::new_v4();
    for _ in 0..4 {
        scraper.scrape(&request(scan_id, "/hotel/priced")).await;
    }
    let logged = events.events_for_scan(scan_id).await.unwrap();
    assert_eq!(logged[0].session_id, logged[2].session_id);
    assert_ne!(logged[2].session_id, logged[3].session_id);
}

#[tokio::test]
async fn test_shutdown_cuts_rate_limit_backoff_short() {
    let hits = Arc::new(Hits::default());
    let base = spawn_site(hits.clone()).await;
    let events = Arc::new(InMemoryStore::new());
    let shutdown = CancellationToken::new();
    let slow_backoff = RetryPolicy {
        rate_limit_base: Duration::from_secs(60),
        ..fast_retries()
    };
    let scraper = scraper_with_retries(base, events.clone(), slow_backoff)
        .with_shutdown(shutdown.clone());

    let cancel = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let scan_id = Uuid::new_v4();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        scraper.scrape(&request(scan_id, "/hotel/rate-limited")),
    )
    .await
    .expect("backoff ignored shutdown");

    assert_eq!(outcome.status, ScrapeStatus::Error);
    assert!(outcome.error_message.unwrap().contains("shutdown"));
    assert_eq!(hits.rate_limited.load(Ordering::SeqCst), 1);
    let logged = events.events_for_scan(scan_id).await.unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].http_status, Some(429));
}
