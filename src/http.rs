//! HTTP client for the Discord REST API.
//!
//! Command replies are the only REST traffic. [`DiscordHttpClient`] adds the
//! bot token and backs off per rate-limit bucket; commands see it through the
//! [`Messenger`] trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_lock::Mutex;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use crate::error::HttpError;
use crate::types::*;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const BASE_URL: &str = "https://discord.com/api/v10";
const USER_AGENT: &str = "DiscordBot (https://github.com/guild-bot/guild-bot, 0.1)";
const MAX_RETRIES: u32 = 5;

// ---------------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------------

/// What commands need from the chat platform: sending messages.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn create_message(
        &self,
        channel_id: &str,
        body: &CreateMessage,
    ) -> Result<Message, HttpError>;
}

// ---------------------------------------------------------------------------
// Rate-limit tracker (per-bucket)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
struct RateLimitInfo {
    remaining: Option<u32>,
    reset_after: Option<f64>,
    bucket: Option<String>,
    is_global: bool,
}

impl RateLimitInfo {
    fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        Self {
            remaining: header("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
            reset_after: header("x-ratelimit-reset-after").and_then(|s| s.parse().ok()),
            bucket: header("x-ratelimit-bucket").map(str::to_string),
            is_global: header("x-ratelimit-global") == Some("true"),
        }
    }
}

#[derive(Debug, Clone)]
struct BucketState {
    remaining: u32,
    resets_at: Instant,
}

#[derive(Debug, Default)]
struct RateLimiter {
    /// Route-key → bucket id mapping.
    route_buckets: HashMap<String, String>,
    /// Bucket id → state.
    buckets: HashMap<String, BucketState>,
    /// No request may be sent before this instant.
    global_until: Option<Instant>,
}

impl RateLimiter {
    /// How long to wait before sending on `route_key`, if at all.
    fn delay_for(&self, route_key: &str) -> Option<Duration> {
        let now = Instant::now();
        if let Some(until) = self.global_until {
            if until > now {
                return Some(until - now);
            }
        }

        let bucket_id = self.route_buckets.get(route_key)?;
        let state = self.buckets.get(bucket_id)?;
        if state.remaining == 0 && state.resets_at > now {
            return Some(state.resets_at - now);
        }
        None
    }

    fn update(&mut self, route_key: &str, info: &RateLimitInfo) {
        let reset_after = info.reset_after.map(Duration::from_secs_f64);

        if info.is_global {
            if let Some(delay) = reset_after {
                self.global_until = Some(Instant::now() + delay);
            }
        }

        if let Some(bucket) = &info.bucket {
            self.route_buckets
                .insert(route_key.to_string(), bucket.clone());
            self.buckets.insert(
                bucket.clone(),
                BucketState {
                    remaining: info.remaining.unwrap_or(1),
                    resets_at: Instant::now() + reset_after.unwrap_or(Duration::from_secs(1)),
                },
            );
        }
    }
}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// A thin, rate-limit–aware HTTP client. Cheap to clone.
#[derive(Clone)]
pub struct DiscordHttpClient {
    token: Arc<str>,
    client: reqwest::Client,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl DiscordHttpClient {
    pub fn new(token: &str) -> Self {
        Self {
            token: Arc::from(token),
            client: reqwest::Client::new(),
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
        }
    }

    /// Send a request to `{BASE_URL}/{path}` and return the raw body.
    ///
    /// `route_key` is a template like `POST /channels/{channel_id}/messages`
    /// used for rate-limit bucketing.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>, HttpError> {
        let url = format!("{}/{}", BASE_URL, path.trim_start_matches('/'));

        for attempt in 0..=MAX_RETRIES {
            let delay = self.limiter.lock().await.delay_for(route_key);
            if let Some(delay) = delay {
                let delay = delay.min(Duration::from_secs(60));
                debug!(
                    route = route_key,
                    delay_ms = delay.as_millis() as u64,
                    "rate-limit pre-emptive backoff"
                );
                tokio::time::sleep(delay).await;
            }

            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("authorization", format!("Bot {}", self.token))
                .header("user-agent", USER_AGENT);
            if let Some(json) = body {
                req = req.json(json);
            }

            let resp = req.send().await?;
            let status = resp.status();
            let rl_info = RateLimitInfo::from_headers(resp.headers());
            self.limiter.lock().await.update(route_key, &rl_info);

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RETRIES {
                let retry_after = rl_info.reset_after.unwrap_or(1.0).min(60.0);
                warn!(
                    route = route_key,
                    attempt,
                    retry_after_s = retry_after,
                    global = rl_info.is_global,
                    "rate-limited by Discord, backing off"
                );
                tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                continue;
            }

            let bytes = resp.bytes().await?;
            if status.is_success() {
                return Ok(bytes.to_vec());
            }
            return Err(HttpError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).to_string(),
                route: route_key.to_string(),
            });
        }

        Err(HttpError::Api {
            status: 429,
            body: "rate-limited after max retries".to_string(),
            route: route_key.to_string(),
        })
    }

    /// Like [`request`](Self::request) but deserialises the body as JSON.
    pub async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, HttpError> {
        let bytes = self.request(method, path, route_key, body).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            let raw = String::from_utf8_lossy(&bytes);
            HttpError::Serde(format!("{}: {}", e, body_excerpt(&raw)))
        })
    }
}

/// First [`EXCERPT_CHARS`] characters of a response body, for error text.
fn body_excerpt(raw: &str) -> String {
    raw.chars().take(EXCERPT_CHARS).collect()
}

const EXCERPT_CHARS: usize = 200;

#[async_trait]
impl Messenger for DiscordHttpClient {
    async fn create_message(
        &self,
        channel_id: &str,
        body: &CreateMessage,
    ) -> Result<Message, HttpError> {
        let json = serde_json::to_value(body).map_err(|e| HttpError::Serde(e.to_string()))?;
        self.request_json(
            Method::POST,
            &format!("channels/{}/messages", channel_id),
            "POST /channels/{channel_id}/messages",
            Some(&json),
        )
        .await
    }
}

impl std::fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("token", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn parses_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset-after", HeaderValue::from_static("1.5"));
        headers.insert("x-ratelimit-bucket", HeaderValue::from_static("abc"));
        let info = RateLimitInfo::from_headers(&headers);
        assert_eq!(info.remaining, Some(0));
        assert_eq!(info.reset_after, Some(1.5));
        assert_eq!(info.bucket.as_deref(), Some("abc"));
        assert!(!info.is_global);
    }

    #[test]
    fn body_excerpt_cuts_on_char_boundaries() {
        let body = format!("{}{}", "a".repeat(199), "é🦀 trailing");
        let excerpt = body_excerpt(&body);
        assert_eq!(excerpt.chars().count(), 200);
        assert!(excerpt.ends_with('é'));

        let emoji = "🦀".repeat(120);
        assert_eq!(body_excerpt(&emoji).chars().count(), 120);
        assert_eq!(body_excerpt("short"), "short");
    }

    #[test]
    fn limiter_has_no_delay_for_unknown_route() {
        let limiter = RateLimiter::default();
        assert!(limiter.delay_for("GET /x").is_none());
    }

    #[test]
    fn exhausted_bucket_delays_route() {
        let mut limiter = RateLimiter::default();
        limiter.update(
            "POST /channels/{channel_id}/messages",
            &RateLimitInfo {
                remaining: Some(0),
                reset_after: Some(5.0),
                bucket: Some("b1".into()),
                is_global: false,
            },
        );
        let delay = limiter
            .delay_for("POST /channels/{channel_id}/messages")
            .expect("expected delay");
        assert!(delay <= Duration::from_secs(5));
        assert!(limiter.delay_for("GET /guilds/{guild_id}").is_none());
    }

    #[test]
    fn global_limit_delays_every_route() {
        let mut limiter = RateLimiter::default();
        limiter.update(
            "GET /a",
            &RateLimitInfo {
                reset_after: Some(2.0),
                is_global: true,
                ..Default::default()
            },
        );
        assert!(limiter.delay_for("GET /b").is_some());
    }

    #[test]
    fn debug_redacts_token() {
        let client = DiscordHttpClient::new("secret-token");
        assert!(!format!("{:?}", client).contains("secret-token"));
    }
}
