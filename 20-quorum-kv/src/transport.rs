//! Socket plumbing shared by servers and coordinators.

use std::io;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::codec::Hex;

/// Read size for request streams: 73 whole requests.
pub const REQUEST_READ_SIZE: usize = 511;
/// Read size for response streams: 102 whole responses.
pub const RESPONSE_READ_SIZE: usize = 510;

/// Write half of a connection shared by several tasks.
///
/// Each record is written while holding the lock, so bytes of two records
/// never interleave on the wire. Writers to different connections do not
/// contend.
pub struct LockedWriter<W> {
    label: String,
    inner: Mutex<W>,
}

impl<W> LockedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(label: impl Into<String>, inner: W) -> Self {
        Self {
            label: label.into(),
            inner: Mutex::new(inner),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn send(&self, record: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.write_all(record).await?;
        trace!(conn = %self.label, "sent {}", Hex(record));
        Ok(())
    }

    pub async fn shutdown(&self) -> io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}

/// Connects to `addr`, retrying refused or reset attempts.
///
/// Makes up to `max_retries + 1` attempts, sleeping `delay` between them.
pub async fn connect_with_retry<A>(addr: A, max_retries: u32, delay: Duration) -> Result<TcpStream>
where
    A: ToSocketAddrs + Clone + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr.clone()).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) if attempt < max_retries => {
                warn!(%addr, attempt, error = %err, "connection failed, retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                bail!("could not connect to {addr} after {} attempts: {err}", attempt + 1)
            }
        }
    }
}
