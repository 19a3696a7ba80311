pub mod batch;
pub mod config;
pub mod enumerator;
pub mod error;
pub mod extractor;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod scrape_client;
pub mod scraping_context;
pub mod server;
pub mod store;

mod delay;
mod identity;
mod ratelimit;
mod requests;
mod retry;
mod session;
mod text_manipulators;

pub use batch::{BatchConfig, BatchOutcome, BatchProcessor};
pub use config::{AppEnv, LoadFromEnv};
pub use error::{ScanError, ScanResult};
pub use identity::IdentityPool;
pub use models::{CellResult, CellStatus, EventClass, Hotel, NewScan, Scan, ScanStatus, ScrapeEvent};
pub use orchestrator::{Orchestrator, OrchestratorConfig, ResumeOutcome};
pub use ratelimit::RateLimiter;
pub use requests::{PacingConfig, RequestClient};
pub use retry::{Failure, RetryDecision, RetryPolicy};
pub use scrape_client::{HttpScraper, Occupancy, ScrapeOutcome, ScrapeRequest, ScrapeStatus, Scraper, SourceConfig};
pub use scraping_context::ScrapingContext;
pub use session::SessionConfig;
