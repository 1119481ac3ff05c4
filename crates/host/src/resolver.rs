//! Signaling endpoint resolution and reconnect pacing.
//!
//! The resolver URL is fetched every five minutes; a `url` field in the JSON
//! body names the relay WebSocket endpoint. A resolver URL that is already a
//! ws(s):// URI bypasses HTTP entirely. Failures back off exponentially from
//! five seconds to the poll interval; a signaling drop wakes the loop
//! immediately instead of waiting out the timer.

use crate::config::ConfigStore;
use crate::signaling::SignalingClient;
use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// True when the configured URL is itself the signaling endpoint.
pub fn is_direct_endpoint(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

/// Extract the endpoint from a resolver response body.
pub fn parse_endpoint(body: &str) -> Result<String> {
    let value: serde_json::Value =
        serde_json::from_str(body).context("Resolver returned invalid JSON")?;
    match value.get("url").and_then(|u| u.as_str()) {
        Some(url) if !url.is_empty() => Ok(url.to_string()),
        _ => bail!("Resolver response missing url field"),
    }
}

pub struct ResolverLoop {
    http: reqwest::Client,
    store: Arc<ConfigStore>,
    client: Arc<SignalingClient>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

impl ResolverLoop {
    pub fn new(
        store: Arc<ConfigStore>,
        client: Arc<SignalingClient>,
        wake: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
            client,
            wake,
            cancel,
        }
    }

    async fn resolve(&self, resolver_url: &str) -> Result<String> {
        if is_direct_endpoint(resolver_url) {
            return Ok(resolver_url.to_string());
        }
        let response = self
            .http
            .get(resolver_url)
            .send()
            .await
            .context("Resolver request failed")?;
        if !response.status().is_success() {
            bail!("Resolver returned {}", response.status());
        }
        let body = response.text().await.context("Resolver body unreadable")?;
        parse_endpoint(&body)
    }

    pub async fn run(self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let resolver_url = self.store.snapshot().signaling_resolver_url;
            let delay = if resolver_url.is_empty() {
                debug!("No resolver URL configured");
                POLL_INTERVAL
            } else {
                match self.resolve(&resolver_url).await {
                    Ok(endpoint) => {
                        backoff = INITIAL_BACKOFF;
                        let needs_connect = !self.client.is_connected()
                            || self.client.current_uri().as_deref() != Some(endpoint.as_str());
                        if needs_connect {
                            if self.client.current_uri().is_some() {
                                info!(%endpoint, "Signaling endpoint changed or socket down, reconnecting");
                            }
                            match self.client.connect(&endpoint).await {
                                Ok(()) => POLL_INTERVAL,
                                Err(e) => {
                                    warn!("Signaling connect failed: {e:#}");
                                    let delay = backoff;
                                    backoff = next_backoff(backoff);
                                    delay
                                }
                            }
                        } else {
                            POLL_INTERVAL
                        }
                    }
                    Err(e) => {
                        // Keep the last known endpoint; just slow down.
                        warn!("Endpoint resolution failed: {e:#}");
                        let delay = backoff;
                        backoff = next_backoff(backoff);
                        delay
                    }
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.client.disconnect();
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {
                    debug!("Resolver loop woken early");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_saturates() {
        let mut delays = Vec::new();
        let mut current = INITIAL_BACKOFF;
        for _ in 0..10 {
            delays.push(current);
            current = next_backoff(current);
        }
        // Non-decreasing, bounded by five minutes.
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[1], Duration::from_secs(10));
        assert_eq!(*delays.last().unwrap(), MAX_BACKOFF);
    }

    #[test]
    fn direct_ws_urls_bypass_http() {
        assert!(is_direct_endpoint("ws://127.0.0.1:8080/ws"));
        assert!(is_direct_endpoint("wss://relay.example/ws"));
        assert!(!is_direct_endpoint("https://resolver.example/endpoint"));
        assert!(!is_direct_endpoint(""));
    }

    #[test]
    fn endpoint_parsed_from_json() {
        let url = parse_endpoint(r#"{"url":"wss://signaling.example/ws"}"#).unwrap();
        assert_eq!(url, "wss://signaling.example/ws");
    }

    #[test]
    fn missing_or_empty_url_rejected() {
        assert!(parse_endpoint(r#"{}"#).is_err());
        assert!(parse_endpoint(r#"{"url":""}"#).is_err());
        assert!(parse_endpoint("not json").is_err());
    }
}
