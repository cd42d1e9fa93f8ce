use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(25);

/// Url-encoded timeout settings, e.g. `read=60s&write=5s&heartbeat=25s`.
///
/// Recognised keys are `connect`, `read`, `write` and `heartbeat`; missing
/// keys fall back to the defaults each component supplies. Values use
/// human-readable durations (`60s`, `100ms`).
#[derive(Debug, Clone, Default)]
pub struct TimeoutConfig {
    values: HashMap<String, String>,
}

impl TimeoutConfig {
    pub fn parse(s: &str) -> Result<Self> {
        let mut values = HashMap::new();
        if !s.is_empty() {
            for (key, value) in url::form_urlencoded::parse(s.as_bytes()) {
                values.insert(key.into_owned(), value.into_owned());
            }
        }
        Ok(Self { values })
    }

    /// A zero duration is treated the same as an absent key.
    pub fn get(&self, key: &str, default: Duration) -> Result<Duration> {
        let Some(raw) = self.values.get(key) else {
            return Ok(default);
        };
        let parsed = humantime::parse_duration(raw)
            .map_err(|err| Error::bad_config(format!("timeout '{key}={raw}': {err}")))?;
        if parsed.is_zero() {
            return Ok(default);
        }
        Ok(parsed)
    }
}

/// Byte stream with per-operation idle deadlines.
///
/// Every read and write gets a fresh deadline, so a slow-but-steady peer
/// stays connected while a silent one fails its next operation. The
/// heartbeat protocol rides on top of this.
pub struct TimeoutStream<S> {
    inner: S,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TimeoutStream<S> {
    pub fn new(inner: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match tokio::time::timeout(self.read_timeout, self.inner.read(buf)).await {
            Ok(res) => res,
            Err(_) => Err(timed_out("read timed out")),
        }
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match tokio::time::timeout(self.read_timeout, self.inner.read_exact(buf)).await {
            Ok(res) => res.map(|_| ()),
            Err(_) => Err(timed_out("read timed out")),
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match tokio::time::timeout(self.write_timeout, self.inner.write_all(buf)).await {
            Ok(res) => res,
            Err(_) => Err(timed_out("write timed out")),
        }
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        match tokio::time::timeout(self.write_timeout, self.inner.flush()).await {
            Ok(res) => res,
            Err(_) => Err(timed_out("write timed out")),
        }
    }
}

fn timed_out(msg: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, msg)
}
