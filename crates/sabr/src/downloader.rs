//! Public façade over one download session.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::buffer::Dimension;
use crate::error::{SabrError, SabrResult};
use crate::session::{FormatSpec, Session, SessionOptions, TICK_INTERVAL};

/// An adaptive-bitrate media downloader speaking the SABR protocol.
///
/// One instance drives one logical playback timeline. A background control
/// loop ticks every scheduling quantum while playback is active and fetches
/// whatever the readahead window is missing; [`fetch_chunk`] gives
/// non-realtime consumers random byte-range access over the same machinery.
///
/// [`fetch_chunk`]: SabrDownloader::fetch_chunk
pub struct SabrDownloader {
    session: Arc<Mutex<Session>>,
}

impl SabrDownloader {
    pub fn new(options: SessionOptions) -> SabrResult<Self> {
        let session = Arc::new(Mutex::new(Session::new(options)?));
        spawn_ticker(Arc::downgrade(&session));
        Ok(Self { session })
    }

    /// Random-access read of `[start, end]` (inclusive, HTTP-range style)
    /// from one format, defaulting to the whole declared content length.
    ///
    /// Blocks cooperatively until the span is buffered, resuming virtual
    /// playback whenever nothing else is scheduled to make progress. Ranges
    /// outside the declared content length are rejected up front.
    pub async fn fetch_chunk(
        &self,
        itag: i32,
        start: Option<u64>,
        end: Option<u64>,
    ) -> SabrResult<(FormatSpec, Bytes)> {
        let (spec, start, end) = {
            let mut session = self.session.lock().await;
            let spec = session.select_format(itag)?;

            let start = start.unwrap_or(0);
            let end = end.unwrap_or(spec.content_length.saturating_sub(1));
            if spec.content_length == 0 || start > end || end >= spec.content_length {
                return Err(SabrError::RangeOutOfBounds {
                    start,
                    end,
                    content_length: spec.content_length,
                });
            }
            // Inclusive request bounds, half-open buffer ranges.
            (spec, start as i64, end as i64 + 1)
        };
        let key = spec.key();

        loop {
            {
                let mut session = self.session.lock().await;
                if let Some(data) = session
                    .buffer(&key)
                    .and_then(|buffer| buffer.buffer_at(Dimension::Byte, start, end))
                {
                    return Ok((spec, data));
                }
                if session.paused() || session.ended() {
                    session.resume_for_fetch(&key, Instant::now());
                }
            }
            time::sleep(TICK_INTERVAL).await;
        }
    }

    /// Hot-swap the auth token used by subsequent requests. Already
    /// buffered segments stay valid.
    pub async fn set_po_token(&self, po_token: Vec<u8>) {
        self.session.lock().await.set_po_token(po_token);
    }

    /// Start (or resume) virtual playback. This also lifts a protection
    /// pause, so rotate the token first.
    pub async fn play(&self) {
        self.session.lock().await.play(Instant::now());
    }

    pub async fn pause(&self) {
        self.session.lock().await.pause(Instant::now());
    }

    /// Jump to `position_ms`, absolute or relative to the current playback
    /// position (rate-scaled).
    pub async fn seek(&self, position_ms: i64, relative: bool) {
        self.session
            .lock()
            .await
            .seek(position_ms, relative, Instant::now());
    }

    pub async fn paused(&self) -> bool {
        self.session.lock().await.paused()
    }

    /// Playing but stalled on missing data.
    pub async fn buffering(&self) -> bool {
        self.session.lock().await.buffering()
    }

    pub async fn ended(&self) -> bool {
        self.session.lock().await.ended()
    }

    /// Current virtual playback position in milliseconds.
    pub async fn current_time(&self) -> i64 {
        self.session.lock().await.current_time_ms(Instant::now())
    }
}

/// Periodic control loop. Holds only a weak reference so dropping the
/// façade stops the loop; `try_lock` skips a tick that fires while the
/// previous request cycle is still in flight.
fn spawn_ticker(session: Weak<Mutex<Session>>) {
    tokio::spawn(async move {
        let mut ticker = time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(session) = session.upgrade() else {
                break;
            };
            let Ok(mut session) = session.try_lock() else {
                continue;
            };
            if let Err(error) = session.tick(Instant::now()).await {
                // Transport and framing errors are transient; the next
                // tick retries. Protection state is already recorded.
                tracing::warn!(%error, "request cycle failed");
            }
        }
    });
}
