//! Browser identity rotation.
//!
//! Each request gets a real-browser User-Agent and a header set that agrees
//! with it (Chromium-family agents send client hints, Firefox and Safari
//! don't).

use rand::seq::SliceRandom;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, HeaderMap, HeaderName, HeaderValue, REFERER,
    USER_AGENT,
};

pub const USER_AGENTS: &[&str] = &[
    // Chrome on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    // Chrome on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Firefox
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0",
    // Safari on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
    // Edge on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9,en-US;q=0.8",
    "en-US,en;q=0.9,de;q=0.7",
    "en-US,en;q=0.8,fr;q=0.6",
];

const CACHE_CONTROLS: &[&str] = &["no-cache", "max-age=0"];

const SEARCH_REFERERS: &[&str] = &[
    "https://www.google.com/",
    "https://www.bing.com/",
    "https://duckduckgo.com/",
];

const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

/// The identity presented for one request.
#[derive(Debug, Clone)]
pub struct BrowserProfile {
    pub user_agent: &'static str,
    pub headers: HeaderMap,
}

/// Picks coherent browser identities. `site_origin` is used as an
/// occasional same-site Referer.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    site_origin: Option<String>,
}

impl IdentityPool {
    pub fn new(site_origin: Option<String>) -> Self {
        Self { site_origin }
    }

    pub fn next_profile(&self) -> BrowserProfile {
        let mut rng = rand::thread_rng();
        let user_agent = USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0]);
        let language = ACCEPT_LANGUAGES
            .choose(&mut rng)
            .copied()
            .unwrap_or(ACCEPT_LANGUAGES[0]);
        let cache_control = CACHE_CONTROLS
            .choose(&mut rng)
            .copied()
            .unwrap_or(CACHE_CONTROLS[0]);

        let mut referers: Vec<&str> = SEARCH_REFERERS.to_vec();
        if let Some(origin) = &self.site_origin {
            referers.push(origin.as_str());
        }
        let referer = referers.choose(&mut rng).copied().unwrap_or(SEARCH_REFERERS[0]);

        BrowserProfile {
            user_agent,
            headers: build_headers(user_agent, language, cache_control, referer),
        }
    }
}

fn build_headers(
    user_agent: &'static str,
    language: &'static str,
    cache_control: &'static str,
    referer: &str,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(user_agent));
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(language));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
    if let Ok(value) = HeaderValue::from_str(referer) {
        headers.insert(REFERER, value);
    }
    headers.insert(
        HeaderName::from_static("upgrade-insecure-requests"),
        HeaderValue::from_static("1"),
    );

    if let Some((brand, platform)) = client_hints(user_agent) {
        headers.insert(HeaderName::from_static("sec-ch-ua"), HeaderValue::from_static(brand));
        headers.insert(
            HeaderName::from_static("sec-ch-ua-mobile"),
            HeaderValue::from_static("?0"),
        );
        headers.insert(
            HeaderName::from_static("sec-ch-ua-platform"),
            HeaderValue::from_static(platform),
        );
    }
    headers
}

/// Client hints for Chromium-based agents; `None` for Firefox and Safari.
fn client_hints(user_agent: &str) -> Option<(&'static str, &'static str)> {
    if !user_agent.contains("Chrome/") {
        return None;
    }
    let platform = if user_agent.contains("Macintosh") {
        "\"macOS\""
    } else {
        "\"Windows\""
    };
    let brand = if user_agent.contains("Edg/") {
        "\"Microsoft Edge\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\""
    } else if user_agent.contains("Chrome/130") {
        "\"Google Chrome\";v=\"130\", \"Chromium\";v=\"130\", \"Not?A_Brand\";v=\"99\""
    } else {
        "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\""
    };
    Some((brand, platform))
}
