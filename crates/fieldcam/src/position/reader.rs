//! Background task feeding sensor lines into the tracker.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::PositionTracker;

/// Lines arriving within this window of each other form one burst.
const BATCH_WINDOW: Duration = Duration::from_millis(100);

/// Upper bound on lines per burst for chatty receivers.
const MAX_BATCH: usize = 32;

/// Longest line accepted before it is treated as noise.
const MAX_LINE: usize = 1024;

/// Why the reader task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// Shutdown was requested.
    Cancelled,
    /// The stream ended.
    EndOfStream,
    /// The stream failed.
    Failed(String),
}

/// Spawn a task reading newline-delimited sentences from `source`.
///
/// The stream is owned by the task and dropped when it exits, which
/// releases the underlying port.
pub fn spawn_reader<R>(
    source: R,
    tracker: Arc<PositionTracker>,
    cancel: CancellationToken,
) -> JoinHandle<ReaderExit>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let exit = read_loop(source, &tracker, &cancel).await;
        match &exit {
            ReaderExit::Failed(e) => warn!(error = %e, "Position reader stopped"),
            other => info!(reason = ?other, "Position reader stopped"),
        }
        exit
    })
}

async fn read_loop<R>(source: R, tracker: &PositionTracker, cancel: &CancellationToken) -> ReaderExit
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(source);
    let mut buf = Vec::with_capacity(128);
    let mut batch: Vec<String> = Vec::with_capacity(MAX_BATCH);

    loop {
        // A timed-out read leaves its partial line in `buf` for the next call
        let read = tokio::select! {
            () = cancel.cancelled() => return ReaderExit::Cancelled,
            read = tokio::time::timeout(BATCH_WINDOW, reader.read_until(b'\n', &mut buf)) => read,
        };

        match read {
            Ok(Ok(0)) => {
                flush(tracker, &mut batch).await;
                return ReaderExit::EndOfStream;
            }
            Ok(Ok(_)) => {
                if buf.len() > MAX_LINE {
                    debug!(len = buf.len(), "Dropping oversized sensor line");
                } else {
                    let line = String::from_utf8_lossy(&buf).trim().to_string();
                    if !line.is_empty() {
                        batch.push(line);
                    }
                }
                buf.clear();
                if batch.len() >= MAX_BATCH {
                    flush(tracker, &mut batch).await;
                }
            }
            Ok(Err(e)) => {
                flush(tracker, &mut batch).await;
                return ReaderExit::Failed(e.to_string());
            }
            Err(_) => {
                // Quiet line: the burst is complete
                if batch.is_empty() {
                    tracker.check_silence();
                } else {
                    flush(tracker, &mut batch).await;
                }
            }
        }
    }
}

async fn flush(tracker: &PositionTracker, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }
    tracker.update(batch.as_slice());
    batch.clear();

    // Setting the clock is a blocking system call
    if let Some(correction) = tracker.take_clock_correction() {
        if let Err(e) = tokio::task::spawn_blocking(move || correction.apply()).await {
            warn!(error = %e, "Clock correction task failed");
        }
    }
}

/// Open the serial port the position sensor is attached to.
///
/// # Errors
///
/// Returns [`crate::Error::DeviceUnavailable`] if the port cannot be opened.
#[cfg(feature = "serial")]
pub fn open_serial(port: &str, baud: u32) -> crate::Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    tokio_serial::new(port, baud)
        .timeout(Duration::from_millis(500))
        .open_native_async()
        .map_err(|e| crate::Error::device_unavailable("position", format!("{port}: {e}")))
}
