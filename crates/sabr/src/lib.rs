//! A client for the SABR server-side adaptive bitrate streaming protocol.
//!
//! ```text
//! fetch_chunk / play ──► Scheduler tick ──► Request Builder ──► HTTP POST
//!                                                                  │
//!      caller ◄── FormatBuffer ◄── Dispatcher ◄── UmpParser ◄── response
//! ```
//!
//! The session POSTs its full playback state (selected formats, buffered
//! ranges, server-pushed context) to a redirectable media URL and receives
//! a multiplexed stream of slices: media segments interleaved with policy,
//! redirect and protection messages. Segments land in per-format buffers
//! indexed by both time and byte offset; a virtual playback clock decides
//! when to ask for more.

pub mod buffer;
mod clock;
pub mod downloader;
pub mod error;
pub mod session;
pub mod ump;
pub mod util;

pub use buffer::{Dimension, FormatBuffer, FormatKey, Segment};
pub use downloader::SabrDownloader;
pub use error::{SabrError, SabrResult};
pub use session::{FormatSpec, SessionOptions, TrackKind};
pub use ump::{encode_media_segment, Slice, SliceType, UmpParser};
