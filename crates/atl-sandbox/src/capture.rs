//! Bounded stream capture
//!
//! Each child stream is drained by its own task so a chatty process can never
//! block on a full pipe. Bytes past the bound are counted and dropped; the
//! drop is reported through `CapturedOutput::truncated`.

use crate::types::CapturedOutput;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Buffer {
    kept: Vec<u8>,
    total: u64,
}

/// A stream being drained in the background
#[derive(Debug)]
pub(crate) struct StreamCapture {
    shared: Arc<Mutex<Buffer>>,
    handle: JoinHandle<()>,
}

impl StreamCapture {
    /// Start draining `reader`, retaining at most `limit` bytes
    pub(crate) fn spawn<R>(mut reader: R, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(Buffer::default()));
        let sink = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut buf = sink.lock();
                        buf.total += n as u64;
                        let room = limit.saturating_sub(buf.kept.len());
                        if room > 0 {
                            buf.kept.extend_from_slice(&chunk[..n.min(room)]);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "sandbox stream closed with error");
                        break;
                    }
                }
            }
        });
        Self { shared, handle }
    }

    /// Wait up to `grace` for the stream to close, then return what was captured.
    ///
    /// A stream still open after `grace` (held by a straggler process) is
    /// abandoned and reported as truncated.
    pub(crate) async fn finish(self, grace: Duration) -> CapturedOutput {
        let mut handle = self.handle;
        let closed = tokio::time::timeout(grace, &mut handle).await.is_ok();
        if !closed {
            handle.abort();
            tracing::warn!("sandbox stream still open after grace period; output cut short");
        }
        let buf = self.shared.lock();
        let mut out = CapturedOutput::from_bytes(&buf.kept, buf.total);
        out.truncated |= !closed;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_small_stream_completely() {
        let capture = StreamCapture::spawn(b"hello sandbox".as_slice(), 1024);
        let out = capture.finish(Duration::from_secs(1)).await;
        assert_eq!(out.text, "hello sandbox");
        assert!(!out.truncated);
        assert_eq!(out.total_bytes, 13);
    }

    #[tokio::test]
    async fn bounds_large_stream_and_flags_truncation() {
        let data: &'static [u8] = Box::leak(vec![b'x'; 20_000].into_boxed_slice());
        let capture = StreamCapture::spawn(data, 100);
        let out = capture.finish(Duration::from_secs(1)).await;
        assert_eq!(out.text.len(), 100);
        assert!(out.truncated);
        assert_eq!(out.total_bytes, 20_000);
    }

    #[tokio::test]
    async fn abandons_stream_that_never_closes() {
        let (_writer, reader) = tokio::io::duplex(64);
        let capture = StreamCapture::spawn(reader, 100);
        let out = capture.finish(Duration::from_millis(50)).await;
        assert!(out.truncated);
        assert!(out.text.is_empty());
    }
}
