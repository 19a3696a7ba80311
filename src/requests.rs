use std::time::{Duration, Instant};

use log::debug;

use crate::{
    delay,
    identity::{BrowserProfile, IdentityPool},
    ratelimit::RateLimiter,
    retry::Failure,
    session::{SessionConfig, SessionManager},
};

/// Human-like pause drawn before every fetch.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1500),
            max_delay: Duration::from_millis(4500),
        }
    }
}

/// A response that arrived, whatever its status.
#[derive(Debug)]
pub struct Fetched {
    pub status: u16,
    pub body: String,
}

/// Everything observed about one outbound request.
#[derive(Debug)]
pub struct FetchAttempt {
    pub result: Result<Fetched, (Failure, String)>,
    pub latency: Duration,
    pub paced: Duration,
    pub user_agent: &'static str,
    pub session_id: String,
}

pub struct RequestClient {
    sessions: SessionManager,
    identities: IdentityPool,
    rate_limiter: RateLimiter,
    pacing: PacingConfig,
}

impl RequestClient {
    pub fn new(
        session_config: SessionConfig,
        identities: IdentityPool,
        rate_limiter: RateLimiter,
        pacing: PacingConfig,
    ) -> anyhow::Result<Self> {
        let sessions = SessionManager::new(session_config)?;
        Ok(Self {
            sessions,
            identities,
            rate_limiter,
            pacing,
        })
    }

    /// Paces, picks an identity and session, and issues a GET.
    ///
    /// Transport failures come back as values so the caller can feed them
    /// to the retry engine alongside non-2xx statuses.
    pub async fn fetch(&self, url: &str) -> anyhow::Result<FetchAttempt> {
        let paced = delay::pause(self.pacing.min_delay, self.pacing.max_delay).await;
        // Wait (non-blocking) until we're allowed to make a request according
        // to our self-imposed rate-limiting policy.
        self.rate_limiter.wait_until_ready().await;

        let BrowserProfile {
            user_agent,
            headers,
        } = self.identities.next_profile();
        let lease = self.sessions.lease().await?;
        debug!(
            "GET {} (session {} #{})",
            url, lease.session_id, lease.request_number
        );

        let start = Instant::now();
        let result = match lease.client.get(url).headers(headers).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.text().await {
                    Ok(body) => Ok(Fetched { status, body }),
                    Err(e) => Err(classify_transport(&e)),
                }
            }
            Err(e) => Err(classify_transport(&e)),
        };

        Ok(FetchAttempt {
            result,
            latency: start.elapsed(),
            paced,
            user_agent,
            session_id: lease.session_id,
        })
    }

    pub async fn invalidate_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.sessions.invalidate(session_id).await
    }
}

fn classify_transport(e: &reqwest::Error) -> (Failure, String) {
    if e.is_timeout() {
        (Failure::Timeout, format!("timed out: {}", e))
    } else {
        (Failure::Network, e.to_string())
    }
}
