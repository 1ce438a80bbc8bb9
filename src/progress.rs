//! Download progress metering and cancellation

use std::io::{self, Read};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Receives `(current, max)` byte counts while a package streams in
pub type ProgressListener = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Payload of the `io::Error` a cancelled [`ProgressReader`] fails with.
///
/// `ErrorKind::Interrupted` is not used because `io::copy` retries on it.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("download cancelled")]
pub struct DownloadCancelled;

/// Reader that reports progress every `step` bytes and aborts as soon as its
/// token is cancelled.
pub struct ProgressReader<R> {
    inner: R,
    current: u64,
    max: u64,
    step: u64,
    next_report: u64,
    listener: Option<ProgressListener>,
    cancel: CancellationToken,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(
        inner: R,
        max: u64,
        step: u64,
        listener: Option<ProgressListener>,
        cancel: CancellationToken,
    ) -> Self {
        let step = step.max(1);
        Self {
            inner,
            current: 0,
            max,
            step,
            next_report: step,
            listener,
            cancel,
        }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, DownloadCancelled));
        }

        let n = self.inner.read(buf)?;
        self.current += n as u64;

        if let Some(listener) = &self.listener {
            if self.current >= self.next_report {
                listener(self.current, self.max);
                while self.next_report <= self.current {
                    self.next_report += self.step;
                }
            } else if n == 0 && !buf.is_empty() {
                listener(self.current, self.max);
            }
        }

        Ok(n)
    }
}
