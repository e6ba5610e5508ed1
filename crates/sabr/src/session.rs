//! Session state, slice dispatch and request building.
//!
//! A [`Session`] owns everything mutable for one download: the format
//! catalog, per-format segment buffers, server-pushed context, the playback
//! cookie, backoff and readahead hints, the redirectable base URL and the
//! virtual playback clock. Buffers are only ever mutated from the dispatch
//! path, which runs inside the guarded tick/request cycle.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use futures::StreamExt;
use prost::Message;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use sabr_proto as proto;
use tokio::time::Instant;
use url::Url;

use crate::buffer::{Dimension, FormatBuffer, FormatKey};
use crate::clock::PlaybackClock;
use crate::error::{SabrError, SabrResult};
use crate::ump::{Slice, SliceType, UmpParser};
use crate::util::http::HttpClient;

/// Scheduling quantum: tick period of the control loop and the re-poll
/// interval of blocked `fetch_chunk` callers.
pub(crate) const TICK_INTERVAL: Duration = Duration::from_millis(100);

const DEFAULT_READAHEAD_MS: i64 = 15_000;
const DEFAULT_MEMORY_BUDGET: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One elementary stream from the caller-supplied format catalog, as
/// obtained from a separately fetched player response.
#[derive(Debug, Clone)]
pub struct FormatSpec {
    pub itag: i32,
    pub last_modified: u64,
    pub xtags: Option<String>,
    pub content_length: u64,
    pub duration_ms: i64,
    pub audio_quality: Option<String>,
    pub video_quality: Option<String>,
}

impl FormatSpec {
    pub fn key(&self) -> FormatKey {
        FormatKey {
            itag: self.itag,
            last_modified: self.last_modified,
            xtags: self.xtags.clone(),
        }
    }

    pub fn kind(&self) -> TrackKind {
        if self.video_quality.is_some() {
            TrackKind::Video
        } else {
            TrackKind::Audio
        }
    }
}

/// Options for a [`SabrDownloader`](crate::SabrDownloader) session.
#[derive(Clone)]
pub struct SessionOptions {
    pub base_url: String,
    pub formats: Vec<FormatSpec>,
    pub po_token: Option<Vec<u8>>,
    pub ustreamer_config: Option<Vec<u8>>,
    pub client_info: proto::ClientInfo,
    pub memory_budget: usize,
    /// Cookies handed out alongside the format catalog. Some streaming
    /// hosts bind their media URLs to them.
    pub cookies: Vec<String>,
}

impl SessionOptions {
    pub fn new(base_url: impl Into<String>, formats: Vec<FormatSpec>) -> Self {
        Self {
            base_url: base_url.into(),
            formats,
            po_token: None,
            ustreamer_config: None,
            client_info: default_client_info(),
            memory_budget: DEFAULT_MEMORY_BUDGET,
            cookies: Vec::new(),
        }
    }

    pub fn with_po_token(mut self, po_token: Vec<u8>) -> Self {
        self.po_token = Some(po_token);
        self
    }

    pub fn with_cookies(mut self, cookies: Vec<String>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_ustreamer_config(mut self, config: Vec<u8>) -> Self {
        self.ustreamer_config = Some(config);
        self
    }

    pub fn with_client_info(mut self, client_info: proto::ClientInfo) -> Self {
        self.client_info = client_info;
        self
    }

    pub fn with_memory_budget(mut self, memory_budget: usize) -> Self {
        self.memory_budget = memory_budget;
        self
    }
}

fn default_client_info() -> proto::ClientInfo {
    proto::ClientInfo {
        client_name: Some(1),
        client_version: Some("2.20240726.00.00".to_string()),
        os_name: Some("Windows".to_string()),
        os_version: Some("10.0".to_string()),
        ..Default::default()
    }
}

/// A MEDIA_HEADER registered for reassembly, resolved again by the
/// `header_id` carried in MEDIA / MEDIA_END slices. Carries the segment
/// geometry so a MEDIA slice can recreate a segment the budget evicted.
struct PendingHeader {
    key: FormatKey,
    sequence: i64,
    start_time_ms: i64,
    duration_ms: i64,
    start_byte: i64,
    content_length: usize,
}

pub(crate) struct Session {
    http: HttpClient,
    base_url: Url,
    formats: Vec<FormatSpec>,
    buffers: HashMap<FormatKey, FormatBuffer>,
    selected: Vec<FormatKey>,
    preferred_audio: Option<FormatKey>,
    preferred_video: Option<FormatKey>,
    /// Server-pushed context, ordered by type code. `None` marks a known
    /// type whose value is acknowledged but not retransmitted.
    contexts: BTreeMap<i32, Option<Vec<u8>>>,
    headers: HashMap<u32, PendingHeader>,
    playback_cookie: Option<Vec<u8>>,
    po_token: Option<Vec<u8>>,
    ustreamer_config: Option<Vec<u8>>,
    client_info: proto::ClientInfo,
    backoff_until: Option<Instant>,
    readahead_ms: i64,
    request_number: u64,
    last_selection_at: Instant,
    memory_budget: usize,
    protection_paused: bool,
    ended: bool,
    clock: PlaybackClock,
}

impl Session {
    pub fn new(options: SessionOptions) -> SabrResult<Self> {
        let base_url = Url::parse(&options.base_url)?;
        let duration_ms = options
            .formats
            .iter()
            .map(|f| f.duration_ms)
            .max()
            .unwrap_or(0);

        let http = HttpClient::new(reqwest::Client::builder())?;
        if !options.cookies.is_empty() {
            http.add_cookies(options.cookies, base_url.clone())?;
        }

        Ok(Self {
            http,
            base_url,
            formats: options.formats,
            buffers: HashMap::new(),
            selected: Vec::new(),
            preferred_audio: None,
            preferred_video: None,
            contexts: BTreeMap::new(),
            headers: HashMap::new(),
            playback_cookie: None,
            po_token: options.po_token,
            ustreamer_config: options.ustreamer_config,
            client_info: options.client_info,
            backoff_until: None,
            readahead_ms: DEFAULT_READAHEAD_MS,
            request_number: 0,
            last_selection_at: Instant::now(),
            memory_budget: options.memory_budget,
            protection_paused: false,
            ended: false,
            clock: PlaybackClock::new(duration_ms),
        })
    }

    /// Mark a format as selected and return its catalog entry. The most
    /// recent selection per track kind becomes the preferred pick.
    pub fn select_format(&mut self, itag: i32) -> SabrResult<FormatSpec> {
        let spec = self
            .formats
            .iter()
            .find(|f| f.itag == itag)
            .cloned()
            .ok_or(SabrError::UnknownFormat(itag))?;

        let key = spec.key();
        if !self.selected.contains(&key) {
            self.selected.push(key.clone());
        }
        match spec.kind() {
            TrackKind::Audio => self.preferred_audio = Some(key.clone()),
            TrackKind::Video => self.preferred_video = Some(key.clone()),
        }
        self.last_selection_at = Instant::now();

        let budget = self.memory_budget;
        self.buffers
            .entry(key.clone())
            .or_insert_with(|| FormatBuffer::new(key, spec.content_length, budget));
        Ok(spec)
    }

    pub fn buffer(&self, key: &FormatKey) -> Option<&FormatBuffer> {
        self.buffers.get(key)
    }

    fn spec_for(&self, key: &FormatKey) -> Option<&FormatSpec> {
        self.formats.iter().find(|f| f.key() == *key)
    }

    pub fn set_po_token(&mut self, po_token: Vec<u8>) {
        self.po_token = Some(po_token);
    }

    pub fn play(&mut self, now: Instant) {
        self.protection_paused = false;
        self.clock.play(now);
    }

    pub fn pause(&mut self, now: Instant) {
        self.clock.pause(now);
    }

    pub fn seek(&mut self, target_ms: i64, relative: bool, now: Instant) {
        self.ended = false;
        self.clock.seek(target_ms, relative, now);
    }

    pub fn paused(&self) -> bool {
        !self.clock.is_playing()
    }

    pub fn buffering(&self) -> bool {
        self.clock.is_frozen()
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn protection_paused(&self) -> bool {
        self.protection_paused
    }

    /// Restart prefetching on behalf of a blocked random-access read: seek
    /// just past the furthest buffered data for that format and resume.
    /// Never overrides a protection pause.
    pub fn resume_for_fetch(&mut self, key: &FormatKey, now: Instant) {
        if self.protection_paused {
            return;
        }
        let resume_at = self
            .buffer(key)
            .and_then(FormatBuffer::last_buffered_time_end)
            .unwrap_or(0);
        self.ended = false;
        self.clock.seek(resume_at, false, now);
        self.clock.play(now);
    }

    fn ready_for_request(&self, now: Instant) -> bool {
        self.backoff_until.map_or(true, |deadline| now >= deadline)
    }

    /// Whether any selected format misses buffered data inside the
    /// readahead window starting at the current playback position.
    fn window_uncovered(&self, now: Instant) -> bool {
        let start = self.clock.current_ms(now);
        let window_end = start.saturating_add(self.readahead_ms);
        self.selected.iter().any(|key| {
            let Some(spec) = self.spec_for(key) else {
                return false;
            };
            let end = window_end.min(spec.duration_ms);
            if start >= end {
                return false;
            }
            !self.buffers[key].covers(Dimension::Time, start, end)
        })
    }

    fn stream_ended(&self, now: Instant) -> bool {
        !self.selected.is_empty()
            && self.clock.current_ms(now) >= self.clock.duration_ms()
            && self
                .selected
                .iter()
                .all(|key| self.buffers[key].terminal_buffered())
    }

    /// One control step: freeze the clock over uncovered data and fetch
    /// more (backoff permitting), resume it once the window is buffered,
    /// self-pause at end of stream.
    pub async fn tick(&mut self, now: Instant) -> SabrResult<()> {
        if self.protection_paused || !self.clock.is_playing() || self.ended {
            return Ok(());
        }

        let mut outcome = Ok(());
        if self.window_uncovered(now) {
            self.clock.freeze(now);
            if self.ready_for_request(now) {
                outcome = self.run_request_cycle().await;
            }
        } else {
            self.clock.unfreeze(now);
        }

        let now = Instant::now();
        if self.stream_ended(now) {
            tracing::debug!("all selected formats terminal, pausing");
            self.clock.pause(now);
            self.ended = true;
        }
        outcome
    }

    /// Build one request, POST it and pump the response body through the
    /// slice parser into the dispatcher.
    async fn run_request_cycle(&mut self) -> SabrResult<()> {
        let now = Instant::now();
        let body = self.build_request(now).encode_to_vec();

        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("rn", &self.request_number.to_string())
            .append_pair("alr", "yes");

        tracing::debug!(
            rn = self.request_number,
            bytes = body.len(),
            url = %self.base_url,
            "issuing media request"
        );
        self.request_number += 1;

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header(ACCEPT, "application/vnd.yt-ump")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            tracing::warn!("media request rejected with 403, pausing until a fresh token arrives");
            self.protection_paused = true;
            self.clock.pause(Instant::now());
            return Err(SabrError::HttpError(status));
        }
        if !status.is_success() {
            return Err(SabrError::HttpError(status));
        }

        let mut parser = match response.content_length() {
            Some(length) => UmpParser::with_body_size(length),
            None => UmpParser::new(),
        };

        let mut received = 0usize;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len();
            parser.push(&chunk);
            while let Some(slice) = parser.next_slice()? {
                self.dispatch(slice, Instant::now())?;
            }
        }
        parser.finish()?;

        if received == 0 {
            return Err(SabrError::EmptyResponse);
        }
        Ok(())
    }

    fn build_request(&self, now: Instant) -> proto::VideoPlaybackAbrRequest {
        let player_time_ms = self.clock.current_ms(now);
        let audio_only = self
            .selected
            .iter()
            .filter_map(|key| self.spec_for(key))
            .all(|spec| spec.kind() == TrackKind::Audio);

        let client_abr_state = proto::ClientAbrState {
            last_manual_direction: Some(0),
            time_since_last_manual_format_selection_ms: Some(
                now.saturating_duration_since(self.last_selection_at)
                    .as_millis() as i64,
            ),
            client_viewport_width: Some(1920),
            client_viewport_height: Some(1080),
            player_time_ms: Some(player_time_ms),
            visibility: Some(1),
            enabled_track_types_bitfield: Some(if audio_only { 1 } else { 0 }),
            playback_rate: Some(self.clock.rate() as f32),
            ..Default::default()
        };

        let buffered_ranges = self
            .selected
            .iter()
            .filter_map(|key| self.buffers.get(key))
            .flat_map(FormatBuffer::buffered_ranges)
            .collect();

        let mut sabr_contexts = Vec::new();
        let mut unsent_sabr_contexts = Vec::new();
        for (context_type, value) in &self.contexts {
            match value {
                Some(value) => sabr_contexts.push(proto::SabrContext {
                    r#type: Some(*context_type),
                    value: Some(value.clone()),
                }),
                None => unsent_sabr_contexts.push(*context_type),
            }
        }

        proto::VideoPlaybackAbrRequest {
            client_abr_state: Some(client_abr_state),
            selected_format_ids: self.selected.iter().map(FormatKey::to_proto).collect(),
            buffered_ranges,
            player_time_ms: Some(player_time_ms),
            video_playback_ustreamer_config: self.ustreamer_config.clone(),
            preferred_audio_format_ids: self
                .preferred_audio
                .iter()
                .map(FormatKey::to_proto)
                .collect(),
            preferred_video_format_ids: self
                .preferred_video
                .iter()
                .map(FormatKey::to_proto)
                .collect(),
            streamer_context: Some(proto::StreamerContext {
                client_info: Some(self.client_info.clone()),
                po_token: self.po_token.clone(),
                playback_cookie: self.playback_cookie.clone(),
                gp: None,
                sabr_contexts,
                unsent_sabr_contexts,
            }),
        }
    }

    /// Route one decoded slice to its handler. Order matters: a
    /// MEDIA_HEADER must arrive before the MEDIA slices that reference it.
    pub(crate) fn dispatch(&mut self, slice: Slice, now: Instant) -> SabrResult<()> {
        match slice.slice_type {
            SliceType::MediaHeader => self.on_media_header(&slice.payload)?,
            SliceType::Media => self.on_media(&slice.payload),
            SliceType::MediaEnd => self.on_media_end(&slice.payload),
            SliceType::NextRequestPolicy => self.on_next_request_policy(&slice.payload, now)?,
            SliceType::SabrRedirect => self.on_redirect(&slice.payload)?,
            SliceType::SabrContextUpdate => self.on_context_update(&slice.payload)?,
            SliceType::SabrContextSendingPolicy => self.on_context_sending_policy(&slice.payload)?,
            SliceType::StreamProtectionStatus => self.on_stream_protection(&slice.payload, now)?,
            SliceType::FormatInitialization => self.on_format_initialization(&slice.payload)?,
            SliceType::SabrError => {
                let error = proto::SabrError::decode(&slice.payload[..])?;
                return Err(SabrError::Server {
                    kind: error.r#type,
                    code: error.code.unwrap_or(0),
                });
            }
            SliceType::Other(raw) => {
                tracing::debug!(slice_type = raw, bytes = slice.payload.len(), "unhandled slice");
            }
        }
        Ok(())
    }

    fn on_media_header(&mut self, payload: &[u8]) -> SabrResult<()> {
        let header = proto::MediaHeader::decode(payload)?;
        let header_id = header.header_id.unwrap_or(0);

        let format_id = header.format_id.as_ref();
        let key = FormatKey {
            itag: header
                .itag
                .or_else(|| format_id.and_then(|f| f.itag))
                .unwrap_or(0),
            last_modified: header
                .lmt
                .or_else(|| format_id.and_then(|f| f.last_modified))
                .unwrap_or(0),
            xtags: header
                .xtags
                .clone()
                .or_else(|| format_id.and_then(|f| f.xtags.clone())),
        };

        let Some(buffer) = self.buffers.get_mut(&key) else {
            tracing::debug!(itag = key.itag, header_id, "header for unselected format, ignoring");
            return Ok(());
        };

        let sequence = header.sequence_number.unwrap_or(0);
        let start_ms = header.start_ms.unwrap_or_else(|| {
            header
                .time_range
                .as_ref()
                .map(|tr| ticks_to_ms(tr.start_ticks, tr.timescale))
                .unwrap_or(0)
        });
        let duration_ms = header.duration_ms.unwrap_or_else(|| {
            header
                .time_range
                .as_ref()
                .map(|tr| ticks_to_ms(tr.duration_ticks, tr.timescale))
                .unwrap_or(0)
        });

        tracing::debug!(
            header_id,
            itag = key.itag,
            sequence,
            start_ms,
            duration_ms,
            content_length = header.content_length.unwrap_or(0),
            "media header"
        );

        let pending = PendingHeader {
            key,
            sequence,
            start_time_ms: start_ms,
            duration_ms,
            start_byte: header.start_range.unwrap_or(0),
            content_length: header.content_length.unwrap_or(0) as usize,
        };
        buffer.get_or_insert(
            pending.sequence,
            pending.start_time_ms,
            pending.duration_ms,
            pending.start_byte,
            pending.content_length,
        );
        self.headers.insert(header_id, pending);
        Ok(())
    }

    fn on_media(&mut self, payload: &[u8]) {
        let Some((&header_id, data)) = payload.split_first() else {
            return;
        };
        let Some(pending) = self.headers.get(&(header_id as u32)) else {
            tracing::warn!(header_id, "media slice for unknown header");
            return;
        };
        if let Some(buffer) = self.buffers.get_mut(&pending.key) {
            let segment = buffer.get_or_insert(
                pending.sequence,
                pending.start_time_ms,
                pending.duration_ms,
                pending.start_byte,
                pending.content_length,
            );
            segment.append(data);
        }
    }

    fn on_media_end(&mut self, payload: &[u8]) {
        let Some(&header_id) = payload.first() else {
            return;
        };
        let Some(pending) = self.headers.remove(&(header_id as u32)) else {
            return;
        };
        let Some(buffer) = self.buffers.get_mut(&pending.key) else {
            return;
        };

        let discard = buffer
            .segment_mut(pending.sequence)
            .map(|segment| segment.is_buffering() || segment.is_empty())
            .unwrap_or(false);
        if discard {
            tracing::debug!(
                itag = pending.key.itag,
                sequence = pending.sequence,
                "segment ended short of its declared size, discarding"
            );
            buffer.remove_segment(pending.sequence);
        }
    }

    fn on_next_request_policy(&mut self, payload: &[u8], now: Instant) -> SabrResult<()> {
        let policy = proto::NextRequestPolicy::decode(payload)?;

        let backoff_ms = policy.backoff_time_ms.unwrap_or(0).max(0);
        self.backoff_until = Some(now + Duration::from_millis(backoff_ms as u64));

        let readahead = policy
            .target_audio_readahead_ms
            .unwrap_or(0)
            .max(policy.target_video_readahead_ms.unwrap_or(0));
        if readahead > 0 {
            self.readahead_ms = readahead as i64;
        }

        if let Some(cookie) = policy.playback_cookie {
            self.playback_cookie = Some(cookie.encode_to_vec());
        }

        tracing::debug!(backoff_ms, readahead, "next request policy");
        Ok(())
    }

    fn on_redirect(&mut self, payload: &[u8]) -> SabrResult<()> {
        let redirect = proto::SabrRedirect::decode(payload)?;
        if let Some(url) = redirect.url {
            tracing::debug!(%url, "redirected to new streaming host");
            self.base_url = Url::parse(&url)?;
        }
        Ok(())
    }

    fn on_context_update(&mut self, payload: &[u8]) -> SabrResult<()> {
        let update = proto::SabrContextUpdate::decode(payload)?;
        let context_type = update.r#type.unwrap_or(0);

        let keep_existing =
            update.write_policy == Some(proto::SabrContextWritePolicy::KeepExisting as i32);
        if keep_existing && self.contexts.contains_key(&context_type) {
            tracing::debug!(context_type, "context update kept existing value");
            return Ok(());
        }

        let send_by_default = update.send_by_default.unwrap_or(false);
        let value = send_by_default.then(|| update.value.unwrap_or_default());
        tracing::debug!(context_type, send_by_default, "context update");
        self.contexts.insert(context_type, value);
        Ok(())
    }

    fn on_context_sending_policy(&mut self, payload: &[u8]) -> SabrResult<()> {
        let policy = proto::SabrContextSendingPolicy::decode(payload)?;
        for context_type in &policy.stop_policy {
            if let Some(value) = self.contexts.get_mut(context_type) {
                *value = None;
            }
        }
        for context_type in &policy.discard_policy {
            self.contexts.remove(context_type);
        }
        // Values for non-default-send contexts are not retained, so there
        // is nothing to start sending again.
        for context_type in &policy.start_policy {
            if self.contexts.get(context_type).map_or(true, Option::is_none) {
                tracing::debug!(context_type, "start policy for context without stored value");
            }
        }
        Ok(())
    }

    fn on_stream_protection(&mut self, payload: &[u8], now: Instant) -> SabrResult<()> {
        let status = proto::StreamProtectionStatus::decode(payload)?
            .status
            .unwrap_or(0);
        match status {
            proto::StreamProtectionStatus::ATTESTATION_REQUIRED => {
                tracing::warn!("stream protection tripped, pausing until a fresh token arrives");
                self.protection_paused = true;
                self.clock.pause(now);
            }
            proto::StreamProtectionStatus::ATTESTATION_PENDING => {
                tracing::debug!("stream protection pending");
            }
            _ => {}
        }
        Ok(())
    }

    fn on_format_initialization(&mut self, payload: &[u8]) -> SabrResult<()> {
        let metadata = proto::FormatInitializationMetadata::decode(payload)?;
        let itag = metadata.format_id.as_ref().and_then(|f| f.itag).unwrap_or(0);

        tracing::debug!(
            itag,
            mime_type = metadata.mime_type.as_deref().unwrap_or(""),
            end_time_ms = metadata.end_time_ms.unwrap_or(0),
            end_segment_number = metadata.end_segment_number.unwrap_or(0),
            "format initialization metadata"
        );

        if let Some(spec) = self.formats.iter().find(|f| f.itag == itag) {
            let end_time_ms = metadata.end_time_ms.unwrap_or(0) as i64;
            if end_time_ms > 0 && end_time_ms > spec.duration_ms {
                tracing::warn!(
                    itag,
                    catalog_ms = spec.duration_ms,
                    server_ms = end_time_ms,
                    "server reports a longer stream than the format catalog"
                );
            }
        }
        Ok(())
    }

    pub fn current_time_ms(&self, now: Instant) -> i64 {
        self.clock.current_ms(now)
    }
}

fn ticks_to_ms(ticks: Option<i64>, timescale: Option<i32>) -> i64 {
    let ticks = ticks.unwrap_or(0);
    match timescale.unwrap_or(1000) {
        0 => 0,
        timescale => ticks * 1000 / timescale as i64,
    }
}
