use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, de::DeserializeOwned};
use url::Url;

use crate::batch::BatchConfig;
use crate::extractor::SelectorSet;
use crate::metrics::HealthThresholds;
use crate::orchestrator::OrchestratorConfig;
use crate::ratelimit::{DEFAULT_REQ_PER_MIN, RateLimiter};
use crate::requests::PacingConfig;
use crate::retry::RetryPolicy;
use crate::scrape_client::SourceConfig;
use crate::session::SessionConfig;

/// Hard cap on cells per batch, whatever BATCH_SIZE or a caller asks for.
pub const MAX_BATCH_SIZE: u64 = 200;

/// Every env var the scanner reads. Only `DATABASE_URL` has no default, and
/// only commands that touch Postgres need it.
#[derive(Debug, Clone, Deserialize)]
pub struct AppEnv {
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,
    pub database_url: Option<String>,
    #[serde(default = "defaults::database_max_connections")]
    pub database_max_connections: u32,

    #[serde(default = "defaults::source_name")]
    pub source_name: String,
    #[serde(default = "defaults::source_base_url")]
    pub source_base_url: String,
    #[serde(default = "defaults::check_in_param")]
    pub source_check_in_param: String,
    #[serde(default = "defaults::check_out_param")]
    pub source_check_out_param: String,
    #[serde(default = "defaults::adults_param")]
    pub source_adults_param: String,
    #[serde(default = "defaults::children_param")]
    pub source_children_param: String,
    #[serde(default = "defaults::rooms_param")]
    pub source_rooms_param: Option<String>,
    pub source_currency: Option<String>,

    pub selector_room: Option<String>,
    pub selector_room_name: Option<String>,
    pub selector_price: Option<String>,
    pub selector_sold_out: Option<String>,

    #[serde(default = "defaults::min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "defaults::requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "defaults::min_spacing_ms")]
    pub min_spacing_ms: u64,
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "defaults::session_max_requests")]
    pub session_max_requests: u32,
    #[serde(default = "defaults::session_max_age_secs")]
    pub session_max_age_secs: u64,

    #[serde(default = "defaults::batch_size")]
    pub batch_size: u64,
    #[serde(default = "defaults::batch_concurrency")]
    pub batch_concurrency: usize,
    #[serde(default = "defaults::soft_budget_secs")]
    pub soft_budget_secs: u64,
    #[serde(default = "defaults::resume_interval_secs")]
    pub resume_interval_secs: u64,

    #[serde(default = "defaults::retry_server_base_ms")]
    pub retry_server_base_ms: u64,
    #[serde(default = "defaults::retry_timeout_base_ms")]
    pub retry_timeout_base_ms: u64,
    #[serde(default = "defaults::retry_rate_limit_base_secs")]
    pub retry_rate_limit_base_secs: u64,

    #[serde(default = "defaults::health_success_floor")]
    pub health_success_floor: f64,
    #[serde(default = "defaults::health_block_ceiling")]
    pub health_block_ceiling: f64,
    #[serde(default = "defaults::health_min_samples")]
    pub health_min_samples: u64,
    #[serde(default = "defaults::health_consecutive_403")]
    pub health_consecutive_403: u32,
}

mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }
    pub fn database_max_connections() -> u32 {
        5
    }
    pub fn source_name() -> String {
        "booking".to_string()
    }
    pub fn source_base_url() -> String {
        "https://www.booking.com/".to_string()
    }
    pub fn check_in_param() -> String {
        "checkin".to_string()
    }
    pub fn check_out_param() -> String {
        "checkout".to_string()
    }
    pub fn adults_param() -> String {
        "group_adults".to_string()
    }
    pub fn children_param() -> String {
        "group_children".to_string()
    }
    pub fn rooms_param() -> Option<String> {
        Some("no_rooms".to_string())
    }
    pub fn min_delay_ms() -> u64 {
        1500
    }
    pub fn max_delay_ms() -> u64 {
        4500
    }
    pub fn requests_per_minute() -> u32 {
        20
    }
    pub fn min_spacing_ms() -> u64 {
        750
    }
    pub fn request_timeout_secs() -> u64 {
        20
    }
    pub fn session_max_requests() -> u32 {
        40
    }
    pub fn session_max_age_secs() -> u64 {
        900
    }
    pub fn batch_size() -> u64 {
        30
    }
    pub fn batch_concurrency() -> usize {
        4
    }
    pub fn soft_budget_secs() -> u64 {
        40
    }
    pub fn resume_interval_secs() -> u64 {
        60
    }
    pub fn retry_server_base_ms() -> u64 {
        2000
    }
    pub fn retry_timeout_base_ms() -> u64 {
        5000
    }
    pub fn retry_rate_limit_base_secs() -> u64 {
        60
    }
    pub fn health_success_floor() -> f64 {
        0.8
    }
    pub fn health_block_ceiling() -> f64 {
        0.2
    }
    pub fn health_min_samples() -> u64 {
        10
    }
    pub fn health_consecutive_403() -> u32 {
        3
    }
}

impl AppEnv {
    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow!("DATABASE_URL must be set"))
    }

    pub fn source(&self) -> anyhow::Result<SourceConfig> {
        let base_url = Url::parse(&self.source_base_url)
            .with_context(|| format!("invalid SOURCE_BASE_URL: {}", self.source_base_url))?;
        Ok(SourceConfig {
            name: self.source_name.clone(),
            base_url,
            check_in_param: self.source_check_in_param.clone(),
            check_out_param: self.source_check_out_param.clone(),
            adults_param: self.source_adults_param.clone(),
            children_param: self.source_children_param.clone(),
            rooms_param: self.source_rooms_param.clone().filter(|p| !p.is_empty()),
        })
    }

    pub fn selectors(&self) -> SelectorSet {
        let mut set = SelectorSet::default();
        let overrides = [
            (&self.selector_room, &mut set.room),
            (&self.selector_room_name, &mut set.room_name),
            (&self.selector_price, &mut set.price),
            (&self.selector_sold_out, &mut set.sold_out),
        ];
        for (value, slot) in overrides {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        set
    }

    pub fn pacing(&self) -> anyhow::Result<PacingConfig> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(anyhow!(
                "MIN_DELAY_MS ({}) exceeds MAX_DELAY_MS ({})",
                self.min_delay_ms,
                self.max_delay_ms
            ));
        }
        Ok(PacingConfig {
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        })
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        let per_minute = NonZeroU32::new(self.requests_per_minute).unwrap_or(DEFAULT_REQ_PER_MIN);
        RateLimiter::new(per_minute, Duration::from_millis(self.min_spacing_ms))
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            max_requests: self.session_max_requests.max(1),
            max_age: Duration::from_secs(self.session_max_age_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            rate_limit_base: Duration::from_secs(self.retry_rate_limit_base_secs),
            server_error_base: Duration::from_millis(self.retry_server_base_ms),
            timeout_base: Duration::from_millis(self.retry_timeout_base_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn batch(&self) -> BatchConfig {
        BatchConfig {
            concurrency: self.batch_concurrency.max(1),
            soft_budget: Duration::from_secs(self.soft_budget_secs),
            max_size: MAX_BATCH_SIZE,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            batch_size: self.batch_size.clamp(1, MAX_BATCH_SIZE),
            resume_interval: Duration::from_secs(self.resume_interval_secs),
        }
    }

    pub fn health(&self) -> HealthThresholds {
        HealthThresholds {
            success_floor: self.health_success_floor,
            block_ceiling: self.health_block_ceiling,
            min_samples: self.health_min_samples,
            consecutive_forbidden: self.health_consecutive_403,
        }
    }
}

// Extension trait.
pub trait LoadFromEnv: DeserializeOwned {
    fn load_from_env() -> anyhow::Result<Self> {
        // Don't throw an error if .env file doesn't exist.
        let _ = dotenv::dotenv();
        let config =
            envy::from_env::<Self>().context("failed to load env variables into config struct")?;
        Ok(config)
    }
}

impl<T: DeserializeOwned> LoadFromEnv for T {}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> AppEnv {
        envy::from_iter::<_, AppEnv>(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let env = env(&[]);
        assert_eq!(env.bind_addr, "0.0.0.0:8080");
        assert!(env.database_url().is_err());
        assert_eq!(env.orchestrator().batch_size, 30);
        assert_eq!(env.batch().concurrency, 4);
        assert_eq!(env.batch().soft_budget, Duration::from_secs(40));
        assert_eq!(env.session().max_requests, 40);
        assert_eq!(env.session().max_age, Duration::from_secs(900));
        assert_eq!(env.retry_policy().server_error_base, Duration::from_millis(2000));
        assert_eq!(env.health().consecutive_forbidden, 3);
    }

    #[test]
    fn test_overrides_and_caps() {
        let env = env(&[
            ("BATCH_SIZE", "5000"),
            ("SELECTOR_PRICE", ".amount"),
            ("SOURCE_ROOMS_PARAM", ""),
            ("SOURCE_BASE_URL", "https://hotels.example/search/"),
        ]);
        assert_eq!(env.orchestrator().batch_size, MAX_BATCH_SIZE);
        assert_eq!(env.selectors().price, ".amount");
        assert_eq!(env.selectors().room, SelectorSet::default().room);
        let source = env.source().unwrap();
        assert_eq!(source.rooms_param, None);
        assert_eq!(source.base_url.host_str(), Some("hotels.example"));
    }

    #[test]
    fn test_pacing_rejects_inverted_range() {
        let env = env(&[("MIN_DELAY_MS", "5000"), ("MAX_DELAY_MS", "100")]);
        assert!(env.pacing().is_err());
    }
}
