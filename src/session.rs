//! Cookie-carrying sessions with bounded lifetime.
//!
//! A session is a `reqwest::Client` bound to its own cookie jar. It is
//! retired once it has served `max_requests` requests or is older than
//! `max_age`, and the next lease starts from an empty jar.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use reqwest::cookie::Jar;
use reqwest::{Client, ClientBuilder};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_requests: u32,
    pub max_age: Duration,
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_requests: 40,
            max_age: Duration::from_secs(15 * 60),
            request_timeout: Duration::from_secs(20),
        }
    }
}

struct Session {
    id: String,
    client: Client,
    requests: u32,
    created: Instant,
}

impl Session {
    fn open(config: &SessionConfig) -> anyhow::Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = ClientBuilder::new()
            .cookie_provider(jar)
            .timeout(config.request_timeout)
            .build()?;
        let id = Uuid::new_v4().simple().to_string()[..12].to_string();
        Ok(Self {
            id,
            client,
            requests: 0,
            created: Instant::now(),
        })
    }

    fn expired(&self, config: &SessionConfig) -> bool {
        self.requests >= config.max_requests || self.created.elapsed() >= config.max_age
    }
}

/// A client handle valid for one request.
#[derive(Clone)]
pub struct SessionLease {
    pub session_id: String,
    pub client: Client,
    /// 1-based position of this request within its session.
    pub request_number: u32,
}

pub struct SessionManager {
    config: SessionConfig,
    current: Mutex<Session>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> anyhow::Result<Self> {
        let session = Session::open(&config)?;
        Ok(Self {
            config,
            current: Mutex::new(session),
        })
    }

    /// Hands out the current session, rotating first if it is spent.
    pub async fn lease(&self) -> anyhow::Result<SessionLease> {
        let mut session = self.current.lock().await;
        if session.expired(&self.config) {
            let fresh = Session::open(&self.config)?;
            debug!(
                "Rotating session {} after {} requests / {:?}",
                session.id,
                session.requests,
                session.created.elapsed()
            );
            *session = fresh;
        }
        session.requests += 1;
        Ok(SessionLease {
            session_id: session.id.clone(),
            client: session.client.clone(),
            request_number: session.requests,
        })
    }

    /// Drops the session immediately, e.g. after the source blocked it.
    /// A no-op if `session_id` was already rotated out.
    pub async fn invalidate(&self, session_id: &str) -> anyhow::Result<()> {
        let mut session = self.current.lock().await;
        if session.id == session_id {
            debug!("Invalidating session {}", session.id);
            *session = Session::open(&self.config)?;
        }
        Ok(())
    }
}
