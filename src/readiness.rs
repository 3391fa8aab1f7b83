//! Network readiness probes.
//!
//! A server is considered reachable when its TCP port is bound or when an HTTP
//! endpoint answers with a success status. Every check here returns a value:
//! `Ok(false)` means "not yet", while `Err` is reserved for checks that cannot
//! be performed at all (for example a malformed URL).

use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use reqwest::{redirect, Client, Url};
use tokio::net::TcpListener;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::error::ReadinessError;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// What to poll to decide that a server is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessTarget {
    /// Something is listening on the TCP port.
    Port { number: u16 },
    /// The URL answers with a status in `[200, 399]`.
    Url { url: String },
}

impl ReadinessTarget {
    pub fn describe(&self) -> String {
        match self {
            ReadinessTarget::Port { number } => format!("port {}", number),
            ReadinessTarget::Url { url } => format!("url {}", url),
        }
    }
}

/// Poll timing for readiness waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Overall bound for a wait.
    pub timeout: Duration,
    /// Delay between polls.
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(60_000),
            interval: Duration::from_millis(1_000),
        }
    }
}

/// Checks whether `port` can be bound on all interfaces.
///
/// The transient listener is released immediately. `AddrInUse` means the port
/// is taken; any other bind error is returned as an error.
pub async fn port_available(port: u16) -> Result<bool, ReadinessError> {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::AddrInUse => Ok(false),
        Err(source) => Err(ReadinessError::PortProbe { port, source }),
    }
}

/// HTTP probe bound to one validated URL.
#[derive(Debug, Clone)]
pub struct UrlProbe {
    url: Url,
    client: Client,
}

impl UrlProbe {
    /// Validates `url` and prepares a client with a hard request timeout.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ReadinessError> {
        let parsed = Url::parse(url).map_err(|err| ReadinessError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ReadinessError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        let client = Client::builder()
            .user_agent(format!("serverwatch/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|err| ReadinessError::Client(err.to_string()))?;
        Ok(Self {
            url: parsed,
            client,
        })
    }

    /// Issues one GET. Any failure to get a success status is `false`.
    pub async fn check(&self) -> bool {
        match self.client.get(self.url.clone()).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                trace!(url = %self.url, status, "readiness response");
                (200..=399).contains(&status)
            }
            Err(err) => {
                trace!(url = %self.url, error = %err, "readiness request failed");
                false
            }
        }
    }
}

/// Checks whether `url` answers with a status in `[200, 399]` within `timeout`.
pub async fn url_available(url: &str, timeout: Duration) -> Result<bool, ReadinessError> {
    let probe = UrlProbe::new(url, timeout)?;
    Ok(probe.check().await)
}

/// Polls `poll` until it returns `true` or `timeout` elapses.
///
/// The first poll happens immediately, later ones start every `interval`
/// regardless of how long each poll took. A poll still running at the deadline
/// counts as `false`. Errors from `poll` end the wait and are returned as-is.
pub async fn wait_for_condition<F, Fut, E>(
    mut poll: F,
    timeout: Duration,
    interval: Duration,
) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let deadline = Instant::now() + timeout;
    let mut ticker = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, poll()).await {
            Ok(Ok(true)) => return Ok(true),
            Ok(Ok(false)) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Ok(false),
        }
        if tokio::time::timeout_at(deadline, ticker.tick()).await.is_err() {
            return Ok(false);
        }
    }
}

/// Waits until `port` can be bound.
pub async fn wait_for_port(port: u16, config: ReadinessConfig) -> Result<bool, ReadinessError> {
    debug!(port, timeout_ms = config.timeout.as_millis() as u64, "waiting for port to be free");
    wait_for_condition(|| port_available(port), config.timeout, config.interval).await
}

/// Waits until something is listening on `port`.
pub async fn wait_for_port_to_become_unavailable(
    port: u16,
    config: ReadinessConfig,
) -> Result<bool, ReadinessError> {
    debug!(port, timeout_ms = config.timeout.as_millis() as u64, "waiting for port to be bound");
    wait_for_condition(
        || async move { port_available(port).await.map(|free| !free) },
        config.timeout,
        config.interval,
    )
    .await
}

/// Waits until `url` answers with a success status.
///
/// Fails without polling when the URL itself is unusable.
pub async fn wait_for_url(url: &str, config: ReadinessConfig) -> Result<bool, ReadinessError> {
    let probe = UrlProbe::new(url, config.timeout)?;
    debug!(url, timeout_ms = config.timeout.as_millis() as u64, "waiting for url");
    wait_for_condition(
        || {
            let probe = probe.clone();
            async move { Ok::<_, ReadinessError>(probe.check().await) }
        },
        config.timeout,
        config.interval,
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn config(timeout_ms: u64, interval_ms: u64) -> ReadinessConfig {
        ReadinessConfig {
            timeout: Duration::from_millis(timeout_ms),
            interval: Duration::from_millis(interval_ms),
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn serve_status(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 0\r\nlocation: /next\r\nconnection: close\r\n\r\n",
                    status_line
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn port_is_available_until_bound() {
        let port = free_port().await;
        assert!(port_available(port).await.unwrap());
        let _held = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert!(!port_available(port).await.unwrap());
    }

    #[tokio::test]
    async fn url_status_ranges() {
        let ok = serve_status("200 OK").await;
        let found = serve_status("302 Found").await;
        let broken = serve_status("503 Service Unavailable").await;
        let timeout = Duration::from_secs(2);
        assert!(url_available(&format!("http://127.0.0.1:{}/", ok), timeout)
            .await
            .unwrap());
        assert!(url_available(&format!("http://127.0.0.1:{}/", found), timeout)
            .await
            .unwrap());
        assert!(!url_available(&format!("http://127.0.0.1:{}/", broken), timeout)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn dead_server_is_unavailable_not_an_error() {
        let port = free_port().await;
        let available = url_available(
            &format!("http://127.0.0.1:{}/health", port),
            Duration::from_millis(500),
        )
        .await
        .unwrap();
        assert!(!available);
    }

    #[tokio::test]
    async fn malformed_url_is_an_error() {
        let err = url_available("not a url", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::InvalidUrl { .. }));
        let err = wait_for_url("ftp://example.com", config(100, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn condition_polls_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ready = wait_for_condition(
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ReadinessError>(true) }
            },
            Duration::ZERO,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert!(ready);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn condition_retries_until_true() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ready = wait_for_condition(
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, ReadinessError>(n >= 2) }
            },
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert!(ready);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn condition_times_out() {
        let started = Instant::now();
        let ready = wait_for_condition(
            || async { Ok::<_, ReadinessError>(false) },
            Duration::from_millis(100),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        assert!(!ready);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn slow_polls_keep_the_interval_cadence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ready = wait_for_condition(
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, ReadinessError>(false)
                }
            },
            Duration::from_millis(330),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert!(!ready);
        // Polls start at 0, 50, ..., 300 ms; sleeping after each poll would
        // only fit five.
        assert!(calls.load(Ordering::SeqCst) >= 6);
    }

    #[tokio::test]
    async fn condition_propagates_poll_errors() {
        let result = wait_for_condition(
            || async { Err::<bool, &str>("boom") },
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(result, Err("boom"));
    }

    #[tokio::test]
    async fn waits_for_port_to_be_bound() {
        let port = free_port().await;
        let waiter = tokio::spawn(wait_for_port_to_become_unavailable(port, config(2_000, 20)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn port_wait_times_out_when_nothing_listens() {
        let port = free_port().await;
        let bound = wait_for_port_to_become_unavailable(port, config(150, 30))
            .await
            .unwrap();
        assert!(!bound);
        assert!(wait_for_port(port, config(150, 30)).await.unwrap());
    }

    #[tokio::test]
    async fn waits_for_url() {
        let port = serve_status("204 No Content").await;
        let ready = wait_for_url(&format!("http://127.0.0.1:{}/", port), config(2_000, 50))
            .await
            .unwrap();
        assert!(ready);
    }
}
