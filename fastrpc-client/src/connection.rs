//! Connection configuration and establishment.

use crate::error::ClientError;
use crate::event::{ClientEvent, Events};
use fastrpc_protocol::DEFAULT_PORT;
use rand::seq::SliceRandom;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of canceled ids kept reserved per connection.
pub const DEFAULT_MAX_CANCELED: usize = 1024;

/// Default delay before reconnecting after a lost connection.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Retry policy for connection establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt. `None` retries forever.
    pub retries: Option<u32>,
    /// Delay before the first retry.
    pub min_timeout: Duration,
    /// Upper bound for the exponential delay. `None` is unbounded.
    pub max_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: Some(3),
            min_timeout: Duration::from_millis(1000),
            max_timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32) -> Self {
        Self {
            retries: Some(retries),
            ..Default::default()
        }
    }

    pub fn unlimited() -> Self {
        Self {
            retries: None,
            ..Default::default()
        }
    }

    pub fn with_min_timeout(mut self, timeout: Duration) -> Self {
        self.min_timeout = timeout;
        self
    }

    pub fn with_max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = Some(timeout);
        self
    }

    /// Returns whether another attempt may follow `failures` failed ones.
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.retries.map_or(true, |retries| failures <= retries)
    }
}

/// Exponential backoff: `min_timeout`, doubled per retry, capped at `max_timeout`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Option<Duration>,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            next: policy.min_timeout,
            max: policy.max_timeout,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.max {
            Some(max) => self.next.min(max),
            None => self.next,
        };
        self.next = self.next.saturating_mul(2);
        delay
    }
}

/// What to do after an established connection is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    /// Finalize the client.
    Disabled,
    /// Start a fresh connect cycle after the delay.
    After(Duration),
}

impl Reconnect {
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Reconnect::Disabled => None,
            Reconnect::After(delay) => Some(*delay),
        }
    }
}

impl Default for Reconnect {
    fn default() -> Self {
        Reconnect::After(DEFAULT_RECONNECT_DELAY)
    }
}

impl From<bool> for Reconnect {
    fn from(enabled: bool) -> Self {
        if enabled {
            Reconnect::default()
        } else {
            Reconnect::Disabled
        }
    }
}

impl From<Duration> for Reconnect {
    fn from(delay: Duration) -> Self {
        Reconnect::After(delay)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or literal address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Bound on each connection attempt, resolution included.
    pub connect_timeout: Duration,
    /// Reconnect behavior after a lost connection.
    pub reconnect: Reconnect,
    /// Retry policy for connection establishment.
    pub retry: RetryPolicy,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Canceled calls whose ids stay reserved so late replies are discarded.
    pub max_canceled: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_millis(1000),
            reconnect: Reconnect::default(),
            retry: RetryPolicy::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_canceled: DEFAULT_MAX_CANCELED,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: impl Into<Reconnect>) -> Self {
        self.reconnect = reconnect.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_max_canceled(mut self, max: usize) -> Self {
        self.max_canceled = max;
        self
    }
}

/// Resolves the configured host to one address.
///
/// Literal addresses are used as-is. Otherwise IPv4 results are preferred and
/// one is picked at random to spread load across attempts.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ClientError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    let v4: Vec<SocketAddr> = resolved.iter().copied().filter(SocketAddr::is_ipv4).collect();
    let candidates = if v4.is_empty() { &resolved } else { &v4 };

    candidates
        .choose(&mut rand::thread_rng())
        .copied()
        .ok_or_else(|| ClientError::Resolve {
            host: host.to_string(),
            reason: "no addresses found".to_string(),
        })
}

/// Makes one connection attempt bounded by the connect timeout.
async fn attempt(
    config: &ClientConfig,
    number: u32,
    events: &Events,
) -> Result<(TcpStream, SocketAddr), ClientError> {
    let fut = async {
        let addr = resolve(&config.host, config.port).await?;
        tracing::debug!("Connecting to {} (attempt {})...", addr, number);
        events.emit(ClientEvent::ConnectAttempt {
            attempt: number,
            addr,
        });
        let stream = TcpStream::connect(addr).await?;
        Ok::<_, ClientError>((stream, addr))
    };

    tokio::time::timeout(config.connect_timeout, fut)
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::ConnectTimeout(config.connect_timeout)
        })?
}

/// Connects with retries, emitting `ConnectError` for every failed attempt.
///
/// Returns the last attempt's error once the retry budget is exhausted.
pub(crate) async fn establish(
    config: &ClientConfig,
    events: &Events,
) -> Result<(TcpStream, SocketAddr), ClientError> {
    let mut backoff = Backoff::new(&config.retry);
    let mut failures = 0u32;

    loop {
        match attempt(config, failures + 1, events).await {
            Ok(connected) => return Ok(connected),
            Err(e) => {
                failures += 1;
                tracing::debug!(
                    "Connection attempt {} to {}:{} failed: {}",
                    failures,
                    config.host,
                    config.port,
                    e
                );
                events.emit(ClientEvent::ConnectError {
                    attempt: failures,
                    error: e.clone(),
                });

                if !e.is_retryable() || !config.retry.allows_retry(failures) {
                    tracing::warn!(
                        "Giving up on {}:{} after {} attempts",
                        config.host,
                        config.port,
                        failures
                    );
                    return Err(e);
                }

                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
}
