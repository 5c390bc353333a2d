//! Byte stream access to the instrument.
//!
//! The dispatcher never opens transports itself, it is handed a [`Connector`]. The
//! [`StreamConnector`] adapts any tokio byte stream, such as a TCP socket or an in-memory pipe.
use std::mem;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

use anyhow::anyhow;

use crate::{Error, FramingError};

/// Raw socket SCPI port of the instrument.
pub const DEFAULT_PORT: u16 = 5025;

const READ_CHUNK: usize = 64 * 1024;

#[async_trait]
pub trait Connector: Send {
    /// Human readable name of the connection, used for logging.
    fn name(&self) -> &str;

    async fn write_all(&mut self, data: &[u8]) -> crate::Result<()>;

    async fn flush(&mut self) -> crate::Result<()>;

    /// Read up to and including `delimiter`.
    ///
    /// Fails with [`FramingError::LimitExceeded`] if more than `limit` bytes arrive without
    /// a delimiter, and with [`FramingError::Incomplete`] if the stream ends first.
    /// Must be cancel safe: bytes read before a cancellation are kept for the next call.
    async fn read_until(&mut self, delimiter: &[u8], limit: usize) -> crate::Result<Vec<u8>>;

    /// Read exactly `count` bytes. Must be cancel safe.
    async fn read_exact(&mut self, count: usize) -> crate::Result<Vec<u8>>;

    /// Discard buffered and incoming bytes until the stream stays silent for `quiet`.
    /// Returns the number of bytes discarded.
    async fn drain(&mut self, quiet: Duration) -> crate::Result<usize>;

    /// True once the peer closed the stream.
    fn at_eof(&self) -> bool;
}

pub struct StreamConnector<T> {
    stream: T,
    name: String,
    buf: Vec<u8>,
    eof: bool,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamConnector<T> {
    pub fn new<S: Into<String>>(stream: T, name: S) -> Self {
        Self {
            stream,
            name: name.into(),
            buf: Vec::new(),
            eof: false,
        }
    }

    /// Read more bytes into the look-ahead buffer. Returns false at end of stream.
    async fn fill(&mut self) -> crate::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        self.buf.reserve(READ_CHUNK);
        let n = self.stream.read_buf(&mut self.buf).await.map_err(Error::transport)?;
        if n == 0 {
            log::debug!("{}: end of stream", self.name);
            self.eof = true;
        }
        Ok(n > 0)
    }

    fn take(&mut self, count: usize) -> Vec<u8> {
        let rest = self.buf.split_off(count);
        mem::replace(&mut self.buf, rest)
    }
}

impl StreamConnector<TcpStream> {
    /// Connect to the raw socket interface of an instrument, e.g. `"192.168.1.20"` or
    /// `"scope.local:5025"`.
    pub async fn connect_tcp(addr: &str, connect_timeout: Duration) -> crate::Result<Self> {
        let addr = resolve(addr).await?;
        let fut = async move { TcpStream::connect(&addr).await.map_err(Error::transport) };
        let stream = match timeout(connect_timeout, fut).await {
            Ok(Ok(x)) => x,
            Ok(Err(x)) => return Err(x),
            Err(_) => return Err(Error::timeout(format!("Connecting to {} timed out", addr))),
        };
        stream.set_nodelay(true).map_err(Error::transport)?;
        Ok(StreamConnector::new(stream, addr.to_string()))
    }
}

async fn resolve(addr: &str) -> crate::Result<SocketAddr> {
    if let Ok(x) = addr.parse::<SocketAddr>() {
        return Ok(x);
    }
    let with_port = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    };
    let mut iter = lookup_host(&with_port).await.map_err(Error::argument)?;
    iter.next()
        .ok_or_else(|| Error::argument(anyhow!("Invalid tcp socket address: {}", addr)))
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connector for StreamConnector<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_all(&mut self, data: &[u8]) -> crate::Result<()> {
        AsyncWriteExt::write_all(&mut self.stream, data).await.map_err(Error::transport)
    }

    async fn flush(&mut self) -> crate::Result<()> {
        AsyncWriteExt::flush(&mut self.stream).await.map_err(Error::transport)
    }

    async fn read_until(&mut self, delimiter: &[u8], limit: usize) -> crate::Result<Vec<u8>> {
        if delimiter.is_empty() {
            return Err(Error::argument(anyhow!("Empty delimiter")));
        }
        let mut searched = 0;
        loop {
            if let Some(pos) = find(&self.buf[searched..], delimiter) {
                return Ok(self.take(searched + pos + delimiter.len()));
            }
            searched = self.buf.len().saturating_sub(delimiter.len() - 1);
            if self.buf.len() > limit {
                let partial = mem::take(&mut self.buf);
                return Err(Error::framing(FramingError::LimitExceeded { limit, partial }));
            }
            if !self.fill().await? {
                let partial = mem::take(&mut self.buf);
                return Err(Error::framing(FramingError::Incomplete {
                    expected: None,
                    partial,
                }));
            }
        }
    }

    async fn read_exact(&mut self, count: usize) -> crate::Result<Vec<u8>> {
        while self.buf.len() < count {
            if !self.fill().await? {
                let partial = mem::take(&mut self.buf);
                return Err(Error::framing(FramingError::Incomplete {
                    expected: Some(count),
                    partial,
                }));
            }
        }
        Ok(self.take(count))
    }

    async fn drain(&mut self, quiet: Duration) -> crate::Result<usize> {
        let mut discarded = mem::take(&mut self.buf).len();
        let mut scratch = vec![0_u8; READ_CHUNK];
        while !self.eof {
            match timeout(quiet, self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) => self.eof = true,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(err)) => return Err(Error::transport(err)),
                Err(_) => break,
            }
        }
        Ok(discarded)
    }

    fn at_eof(&self) -> bool {
        self.eof && self.buf.is_empty()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|x| x == needle)
}
