//! Reading the reply of the command in flight: delimited text or a length prefixed binary block.
use std::future::Future;
use std::time::Duration;

use tokio::time;

use sds_protocol::scpi;

use crate::config::Timeouts;
use crate::connector::Connector;
use crate::{Error, FramingError};

#[derive(Clone, Debug)]
pub struct Framing {
    pub timeouts: Timeouts,
    pub limit: usize,
}

async fn with_timeout<F, T>(duration: Duration, what: &str, fut: F) -> crate::Result<T>
where
    F: Future<Output = crate::Result<T>>,
{
    match time::timeout(duration, fut).await {
        Ok(x) => x,
        Err(_) => Err(Error::timeout(format!("Timeout when reading {}", what))),
    }
}

impl Framing {
    pub fn new(timeouts: Timeouts, limit: usize) -> Self {
        Self { timeouts, limit }
    }

    /// Read a text reply. The delimiter is kept at the end of the returned bytes.
    pub async fn read_text<C: Connector + ?Sized>(&self, conn: &mut C, delimiter: &[u8]) -> crate::Result<Vec<u8>> {
        with_timeout(
            self.timeouts.text.into(),
            "response",
            conn.read_until(delimiter, self.limit),
        )
        .await
    }

    /// Read a binary block `<junk>#<N><L digits><L bytes><delimiter>` and return the `L` payload bytes.
    pub async fn read_binary<C: Connector + ?Sized>(&self, conn: &mut C, delimiter: &[u8]) -> crate::Result<Vec<u8>> {
        let header: Duration = self.timeouts.block_header.into();
        let junk = with_timeout(header, "block header", conn.read_until(b"#", self.limit)).await?;
        if junk.len() > 1 {
            log::debug!(
                "Skipping {} bytes before data block: {:?}",
                junk.len() - 1,
                String::from_utf8_lossy(&junk[..junk.len() - 1])
            );
        }
        let digits = with_timeout(header, "block header", conn.read_exact(1)).await?;
        let digits = scpi::header_digits(digits[0])?;
        let length = with_timeout(header, "block header", conn.read_exact(digits)).await?;
        let length = scpi::block_length(&length)?;
        if length > self.limit {
            return Err(Error::framing(FramingError::LimitExceeded {
                limit: self.limit,
                partial: Vec::new(),
            }));
        }
        log::debug!("Reading {} byte data block from {}", length, conn.name());
        let mut data = with_timeout(
            self.timeouts.block_payload.into(),
            "data block",
            conn.read_exact(length + delimiter.len()),
        )
        .await?;
        if !data.ends_with(delimiter) {
            log::warn!("Data block from {} is not followed by the expected delimiter", conn.name());
        }
        data.truncate(length);
        Ok(data)
    }

    /// Discard whatever is left over from a failed exchange.
    pub async fn resync<C: Connector + ?Sized>(&self, conn: &mut C) {
        match conn.drain(self.timeouts.drain.into()).await {
            Ok(0) => {}
            Ok(n) => log::debug!("Discarded {} stale bytes from {}", n, conn.name()),
            Err(err) => log::debug!("Flushing read buffer failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BUFFER_LIMIT;
    use crate::connector::StreamConnector;
    use tokio::io::{duplex, AsyncWriteExt};

    fn framing() -> Framing {
        Framing::new(Timeouts::default(), DEFAULT_BUFFER_LIMIT)
    }

    #[tokio::test]
    async fn binary_block_with_leading_junk() {
        let (a, mut b) = duplex(4096);
        let mut conn = StreamConnector::new(a, "test");
        let payload: Vec<u8> = (0..128_u8).collect();
        let mut reply = b"C1:WF DAT2,#9000000128".to_vec();
        reply.extend_from_slice(&payload);
        reply.extend_from_slice(b"\n\n");
        reply.extend_from_slice(b"next\n");
        b.write_all(&reply).await.unwrap();

        let data = framing().read_binary(&mut conn, b"\n\n").await.unwrap();
        assert_eq!(data, payload);
        assert_eq!(framing().read_text(&mut conn, b"\n").await.unwrap(), b"next\n");
    }

    #[tokio::test]
    async fn empty_waveform() {
        let (a, mut b) = duplex(4096);
        let mut conn = StreamConnector::new(a, "test");
        b.write_all(b"C1:WF DAT2,#9000000000\n\n").await.unwrap();
        assert!(framing().read_binary(&mut conn, b"\n\n").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_header() {
        let (a, mut b) = duplex(4096);
        let mut conn = StreamConnector::new(a, "test");
        b.write_all(b"#x123").await.unwrap();
        let err = framing().read_binary(&mut conn, b"\n").await.unwrap_err();
        assert!(matches!(err, Error::Framing(FramingError::InvalidBinaryHeader(_))));

        b.write_all(b"#21a").await.unwrap();
        let err = framing().read_binary(&mut conn, b"\n").await.unwrap_err();
        assert!(matches!(err, Error::Framing(FramingError::InvalidBinaryHeader(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts() {
        let (a, mut b) = duplex(4096);
        let mut conn = StreamConnector::new(a, "test");
        let err = framing().read_text(&mut conn, b"\n").await.unwrap_err();
        assert!(err.is_timeout());

        // header arrives, payload is cut short
        b.write_all(b"#15ab").await.unwrap();
        let err = framing().read_binary(&mut conn, b"\n").await.unwrap_err();
        assert!(err.is_timeout());

        framing().resync(&mut conn).await;
        b.write_all(b"1.5\n").await.unwrap();
        assert_eq!(framing().read_text(&mut conn, b"\n").await.unwrap(), b"1.5\n");
    }

    #[tokio::test]
    async fn closed_mid_block() {
        let (a, mut b) = duplex(4096);
        let mut conn = StreamConnector::new(a, "test");
        b.write_all(b"#210abc").await.unwrap();
        drop(b);
        let err = framing().read_binary(&mut conn, b"\n").await.unwrap_err();
        assert!(err.is_connection_lost());
        assert!(conn.at_eof());
    }
}
