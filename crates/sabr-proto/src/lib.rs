//! Hand-maintained `prost` definitions for the subset of the SABR wire
//! schema the client exchanges with the streaming backend.
//!
//! These mirror the reverse-engineered protobuf schema; field numbers must
//! not be changed. Only the fields the client reads or writes are declared,
//! unknown fields are skipped by prost on decode.

/// Identifies one elementary audio or video stream variant.
///
/// `(itag, last_modified, xtags)` is the join key between requested formats,
/// buffered ranges reported to the server and locally buffered segments.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FormatId {
    #[prost(int32, optional, tag = "1")]
    pub itag: Option<i32>,
    #[prost(uint64, optional, tag = "2")]
    pub last_modified: Option<u64>,
    #[prost(string, optional, tag = "3")]
    pub xtags: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimeRange {
    #[prost(int64, optional, tag = "1")]
    pub start_ticks: Option<i64>,
    #[prost(int64, optional, tag = "2")]
    pub duration_ticks: Option<i64>,
    #[prost(int32, optional, tag = "3")]
    pub timescale: Option<i32>,
}

/// Announces one forthcoming media segment. MEDIA and MEDIA_END slices
/// reference it through `header_id`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MediaHeader {
    #[prost(uint32, optional, tag = "1")]
    pub header_id: Option<u32>,
    #[prost(string, optional, tag = "2")]
    pub video_id: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub itag: Option<i32>,
    #[prost(uint64, optional, tag = "4")]
    pub lmt: Option<u64>,
    #[prost(string, optional, tag = "5")]
    pub xtags: Option<String>,
    #[prost(int64, optional, tag = "6")]
    pub start_range: Option<i64>,
    #[prost(int32, optional, tag = "7")]
    pub compression_algorithm: Option<i32>,
    #[prost(bool, optional, tag = "8")]
    pub is_init_seg: Option<bool>,
    #[prost(int64, optional, tag = "9")]
    pub sequence_number: Option<i64>,
    #[prost(int64, optional, tag = "10")]
    pub bitrate_bps: Option<i64>,
    #[prost(int64, optional, tag = "11")]
    pub start_ms: Option<i64>,
    #[prost(int64, optional, tag = "12")]
    pub duration_ms: Option<i64>,
    #[prost(message, optional, tag = "13")]
    pub format_id: Option<FormatId>,
    #[prost(int64, optional, tag = "14")]
    pub content_length: Option<i64>,
    #[prost(message, optional, tag = "15")]
    pub time_range: Option<TimeRange>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlaybackCookie {
    #[prost(message, optional, tag = "7")]
    pub video_fmt: Option<FormatId>,
    #[prost(message, optional, tag = "8")]
    pub audio_fmt: Option<FormatId>,
}

/// Server-dictated pacing for the next request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NextRequestPolicy {
    #[prost(int32, optional, tag = "1")]
    pub target_audio_readahead_ms: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub target_video_readahead_ms: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub backoff_time_ms: Option<i32>,
    #[prost(message, optional, tag = "7")]
    pub playback_cookie: Option<PlaybackCookie>,
    #[prost(string, optional, tag = "8")]
    pub video_id: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FormatInitializationMetadata {
    #[prost(string, optional, tag = "1")]
    pub video_id: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub format_id: Option<FormatId>,
    #[prost(int32, optional, tag = "3")]
    pub end_time_ms: Option<i32>,
    #[prost(int64, optional, tag = "4")]
    pub end_segment_number: Option<i64>,
    #[prost(string, optional, tag = "5")]
    pub mime_type: Option<String>,
    #[prost(int64, optional, tag = "9")]
    pub duration_units: Option<i64>,
    #[prost(int32, optional, tag = "10")]
    pub duration_timescale: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SabrRedirect {
    #[prost(string, optional, tag = "1")]
    pub url: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SabrError {
    #[prost(string, optional, tag = "1")]
    pub r#type: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub code: Option<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SabrContextWritePolicy {
    Unspecified = 0,
    KeepExisting = 1,
    Overwrite = 2,
}

/// Server-pushed opaque context blob, persisted across requests per the
/// write policy.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SabrContextUpdate {
    #[prost(int32, optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub scope: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub value: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "4")]
    pub send_by_default: Option<bool>,
    #[prost(enumeration = "SabrContextWritePolicy", optional, tag = "5")]
    pub write_policy: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SabrContextSendingPolicy {
    #[prost(int32, repeated, tag = "1")]
    pub start_policy: Vec<i32>,
    #[prost(int32, repeated, tag = "2")]
    pub stop_policy: Vec<i32>,
    #[prost(int32, repeated, tag = "3")]
    pub discard_policy: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamProtectionStatus {
    #[prost(int32, optional, tag = "1")]
    pub status: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub max_retries: Option<i32>,
}

impl StreamProtectionStatus {
    pub const OK: i32 = 1;
    pub const ATTESTATION_PENDING: i32 = 2;
    pub const ATTESTATION_REQUIRED: i32 = 3;
}

/// One contiguous run of media the client already holds, reported back so
/// the server does not resend it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BufferedRange {
    #[prost(message, optional, tag = "1")]
    pub format_id: Option<FormatId>,
    #[prost(int64, optional, tag = "2")]
    pub start_time_ms: Option<i64>,
    #[prost(int64, optional, tag = "3")]
    pub duration_ms: Option<i64>,
    #[prost(int32, optional, tag = "4")]
    pub start_segment_index: Option<i32>,
    #[prost(int32, optional, tag = "5")]
    pub end_segment_index: Option<i32>,
    #[prost(message, optional, tag = "6")]
    pub time_range: Option<TimeRange>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientInfo {
    #[prost(string, optional, tag = "12")]
    pub device_make: Option<String>,
    #[prost(string, optional, tag = "13")]
    pub device_model: Option<String>,
    #[prost(int32, optional, tag = "16")]
    pub client_name: Option<i32>,
    #[prost(string, optional, tag = "17")]
    pub client_version: Option<String>,
    #[prost(string, optional, tag = "18")]
    pub os_name: Option<String>,
    #[prost(string, optional, tag = "19")]
    pub os_version: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SabrContext {
    #[prost(int32, optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub value: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamerContext {
    #[prost(message, optional, tag = "1")]
    pub client_info: Option<ClientInfo>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub po_token: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub playback_cookie: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub gp: Option<Vec<u8>>,
    #[prost(message, repeated, tag = "5")]
    pub sabr_contexts: Vec<SabrContext>,
    #[prost(int32, repeated, tag = "6")]
    pub unsent_sabr_contexts: Vec<i32>,
}

/// Client playback state sent with every request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientAbrState {
    #[prost(int32, optional, tag = "13")]
    pub last_manual_direction: Option<i32>,
    #[prost(int64, optional, tag = "14")]
    pub time_since_last_manual_format_selection_ms: Option<i64>,
    #[prost(int32, optional, tag = "16")]
    pub last_manual_selected_resolution: Option<i32>,
    #[prost(int32, optional, tag = "17")]
    pub client_viewport_width: Option<i32>,
    #[prost(int32, optional, tag = "18")]
    pub client_viewport_height: Option<i32>,
    #[prost(int64, optional, tag = "23")]
    pub bandwidth_estimate: Option<i64>,
    #[prost(int64, optional, tag = "28")]
    pub player_time_ms: Option<i64>,
    #[prost(int32, optional, tag = "34")]
    pub visibility: Option<i32>,
    #[prost(int32, optional, tag = "40")]
    pub enabled_track_types_bitfield: Option<i32>,
    #[prost(float, optional, tag = "50")]
    pub playback_rate: Option<f32>,
}

/// The full per-request payload POSTed to the streaming backend.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VideoPlaybackAbrRequest {
    #[prost(message, optional, tag = "1")]
    pub client_abr_state: Option<ClientAbrState>,
    #[prost(message, repeated, tag = "2")]
    pub selected_format_ids: Vec<FormatId>,
    #[prost(message, repeated, tag = "3")]
    pub buffered_ranges: Vec<BufferedRange>,
    #[prost(int64, optional, tag = "4")]
    pub player_time_ms: Option<i64>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub video_playback_ustreamer_config: Option<Vec<u8>>,
    #[prost(message, repeated, tag = "16")]
    pub preferred_audio_format_ids: Vec<FormatId>,
    #[prost(message, repeated, tag = "17")]
    pub preferred_video_format_ids: Vec<FormatId>,
    #[prost(message, optional, tag = "19")]
    pub streamer_context: Option<StreamerContext>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn media_header_roundtrip() {
        let header = MediaHeader {
            header_id: Some(3),
            itag: Some(140),
            lmt: Some(1700000000000000),
            sequence_number: Some(7),
            start_ms: Some(14_000),
            duration_ms: Some(2_000),
            start_range: Some(123_456),
            content_length: Some(65_536),
            ..Default::default()
        };

        let decoded = MediaHeader::decode(header.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        // backoff_time_ms sits at tag 4, which SabrContextSendingPolicy
        // does not declare; decoding must drop it rather than error.
        let policy = NextRequestPolicy {
            backoff_time_ms: Some(5000),
            ..Default::default()
        };
        let decoded = SabrContextSendingPolicy::decode(policy.encode_to_vec().as_slice()).unwrap();
        assert!(decoded.start_policy.is_empty());
        assert!(decoded.stop_policy.is_empty());
        assert!(decoded.discard_policy.is_empty());
    }

    #[test]
    fn abr_request_roundtrip() {
        let request = VideoPlaybackAbrRequest {
            client_abr_state: Some(ClientAbrState {
                player_time_ms: Some(42),
                playback_rate: Some(1.0),
                ..Default::default()
            }),
            selected_format_ids: vec![FormatId {
                itag: Some(140),
                last_modified: Some(1),
                xtags: None,
            }],
            streamer_context: Some(StreamerContext {
                po_token: Some(vec![1, 2, 3]),
                unsent_sabr_contexts: vec![4, 5],
                ..Default::default()
            }),
            ..Default::default()
        };

        let decoded =
            VideoPlaybackAbrRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, request);
    }
}
