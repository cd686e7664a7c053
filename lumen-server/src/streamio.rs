//! Timeout-protected stream plumbing between an encoder and its consumers.
//!
//! The encoder's stdout is teed into the transcode cache file and, when a
//! client is attached, into a bounded channel feeding the HTTP response
//! body. The cache write is never sacrificed for the client: a slow or gone
//! client only detaches the client leg while the drain to disk continues.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

/// Chunk size for video streaming.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Per-chunk client write deadline.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum gap between chunks before the client leg is declared stalled.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("client disconnected")]
    ClientGone,

    #[error("stream stalled past the write timeout")]
    WriteTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub chunk_size: usize,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Result of a tee run. The cache leg's failure aborts the whole stream and
/// surfaces as `Err`; the client leg's fate is reported here.
#[derive(Debug)]
pub struct TeeOutcome {
    /// Bytes drained from the reader and written to the cache file.
    pub bytes: u64,
    /// Bytes successfully handed to the client before it detached (equal to
    /// `bytes` for a client that kept up to the end).
    pub client_bytes: u64,
    /// `Ok` when the client received the full stream.
    pub client: Result<(), StreamError>,
}

/// Drive `reader` to completion, writing every chunk to `cache` and
/// forwarding to `client` under the configured timeouts.
pub async fn tee_with_timeout<R>(
    mut reader: R,
    cache: &mut tokio::fs::File,
    client: mpsc::Sender<Bytes>,
    options: &StreamOptions,
) -> Result<TeeOutcome, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; options.chunk_size.max(1)];
    let mut total = 0u64;
    let mut client_bytes = 0u64;
    let mut client = Some(client);
    let mut client_state: Result<(), StreamError> = Ok(());
    let mut last_report = tokio::time::Instant::now();

    loop {
        let read = if client.is_some() {
            match tokio::time::timeout(options.idle_timeout, reader.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    // No data for the client within the idle window; detach
                    // it and keep draining for the cache.
                    debug!("client leg idle-timed out after {total} bytes");
                    client_state = Err(StreamError::WriteTimeout);
                    client = None;
                    continue;
                }
            }
        } else {
            reader.read(&mut buf).await?
        };

        if read == 0 {
            break;
        }
        let chunk = Bytes::copy_from_slice(&buf[..read]);

        cache.write_all(&chunk).await?;
        total += read as u64;

        if let Some(tx) = &client {
            let failure = match tokio::time::timeout(options.write_timeout, tx.send(chunk)).await
            {
                Ok(Ok(())) => {
                    client_bytes += read as u64;
                    None
                }
                Ok(Err(_)) => {
                    debug!("client disconnected after {client_bytes} bytes");
                    Some(StreamError::ClientGone)
                }
                Err(_) => {
                    debug!("client write timed out after {client_bytes} bytes");
                    Some(StreamError::WriteTimeout)
                }
            };
            if let Some(failure) = failure {
                client_state = Err(failure);
                client = None;
            }
        }

        if last_report.elapsed() >= PROGRESS_INTERVAL {
            debug!(bytes = total, client_bytes, "streaming progress");
            last_report = tokio::time::Instant::now();
        }
    }

    cache.flush().await?;
    Ok(TeeOutcome {
        bytes: total,
        client_bytes,
        client: client_state,
    })
}

/// Forward `reader` into `client` alone, chunked and timeout-protected.
pub async fn stream_with_timeout<R>(
    mut reader: R,
    client: mpsc::Sender<Bytes>,
    options: &StreamOptions,
) -> Result<u64, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; options.chunk_size.max(1)];
    let mut total = 0u64;
    let mut last_report = tokio::time::Instant::now();

    loop {
        let read = match tokio::time::timeout(options.idle_timeout, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => return Err(StreamError::WriteTimeout),
        };
        if read == 0 {
            return Ok(total);
        }

        let chunk = Bytes::copy_from_slice(&buf[..read]);
        match tokio::time::timeout(options.write_timeout, client.send(chunk)).await {
            Ok(Ok(())) => total += read as u64,
            Ok(Err(_)) => return Err(StreamError::ClientGone),
            Err(_) => return Err(StreamError::WriteTimeout),
        }

        if last_report.elapsed() >= PROGRESS_INTERVAL {
            debug!(bytes = total, "streaming progress");
            last_report = tokio::time::Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> StreamOptions {
        StreamOptions {
            chunk_size: 8 * 1024,
            write_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(500),
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn cache_file(dir: &TempDir) -> tokio::fs::File {
        tokio::fs::File::create(dir.path().join("out.tmp")).await.unwrap()
    }

    #[tokio::test]
    async fn tee_delivers_to_both_legs() {
        let dir = TempDir::new().unwrap();
        let data = payload(100 * 1024);
        let mut cache = cache_file(&dir).await;
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);

        let drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(chunk) = rx.recv().await {
                got.extend_from_slice(&chunk);
            }
            got
        });

        let outcome = tee_with_timeout(data.as_slice(), &mut cache, tx, &options())
            .await
            .unwrap();
        assert_eq!(outcome.bytes, data.len() as u64);
        assert_eq!(outcome.client_bytes, data.len() as u64);
        assert!(outcome.client.is_ok());

        assert_eq!(drain.await.unwrap(), data);
        assert_eq!(
            std::fs::read(dir.path().join("out.tmp")).unwrap(),
            data
        );
    }

    #[tokio::test]
    async fn tee_survives_client_disconnect() {
        let dir = TempDir::new().unwrap();
        let data = payload(64 * 1024);
        let mut cache = cache_file(&dir).await;
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        drop(rx);

        let outcome = tee_with_timeout(data.as_slice(), &mut cache, tx, &options())
            .await
            .unwrap();
        assert_eq!(outcome.bytes, data.len() as u64);
        assert!(matches!(outcome.client, Err(StreamError::ClientGone)));
        // The cache leg is intact.
        assert_eq!(std::fs::read(dir.path().join("out.tmp")).unwrap(), data);
    }

    #[tokio::test]
    async fn tee_detaches_stalled_client() {
        let dir = TempDir::new().unwrap();
        let data = payload(64 * 1024);
        let mut cache = cache_file(&dir).await;
        // Capacity 1 and nobody draining: the second send must time out.
        let (tx, _rx) = mpsc::channel::<Bytes>(1);

        let outcome = tee_with_timeout(data.as_slice(), &mut cache, tx, &options())
            .await
            .unwrap();
        assert_eq!(outcome.bytes, data.len() as u64);
        assert!(outcome.client_bytes < outcome.bytes);
        assert!(matches!(outcome.client, Err(StreamError::WriteTimeout)));
        assert_eq!(std::fs::read(dir.path().join("out.tmp")).unwrap(), data);
    }

    #[tokio::test]
    async fn stream_delivers_all_bytes() {
        let data = payload(40 * 1024);
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);

        let drain = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(chunk) = rx.recv().await {
                got.extend_from_slice(&chunk);
            }
            got
        });

        let sent = stream_with_timeout(data.as_slice(), tx, &options())
            .await
            .unwrap();
        assert_eq!(sent, data.len() as u64);
        assert_eq!(drain.await.unwrap(), data);
    }

    #[tokio::test]
    async fn stream_reports_client_gone() {
        let data = payload(40 * 1024);
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        drop(rx);

        assert!(matches!(
            stream_with_timeout(data.as_slice(), tx, &options()).await,
            Err(StreamError::ClientGone)
        ));
    }

    #[tokio::test]
    async fn stream_times_out_on_idle_reader() {
        // A duplex pipe with no writer activity never yields data.
        let (_writer, reader) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::channel::<Bytes>(1);

        let started = tokio::time::Instant::now();
        let result = stream_with_timeout(reader, tx, &options()).await;
        assert!(matches!(result, Err(StreamError::WriteTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(400));
    }
}
