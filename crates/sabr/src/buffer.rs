//! Per-format segment buffers with dual time/byte indexing.
//!
//! A [`FormatBuffer`] owns the segments fetched for one elementary stream,
//! ordered by sequence index. Reads resolve over *complete* segments only;
//! a segment still receiving data never satisfies a lookup. Total buffered
//! bytes are bounded by a per-format budget, enforced by dropping the
//! lowest-index segments first.

use bytes::{Bytes, BytesMut};
use sabr_proto as proto;

/// Join key of one elementary stream variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FormatKey {
    pub itag: i32,
    pub last_modified: u64,
    pub xtags: Option<String>,
}

impl FormatKey {
    pub fn to_proto(&self) -> proto::FormatId {
        proto::FormatId {
            itag: Some(self.itag),
            last_modified: Some(self.last_modified),
            xtags: self.xtags.clone(),
        }
    }
}

/// Lookup axis for segment queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Time,
    Byte,
}

/// One fetched, time- and byte-ranged chunk of a format's media data.
#[derive(Debug)]
pub struct Segment {
    index: i64,
    start_time_ms: i64,
    duration_ms: i64,
    start_byte: i64,
    content_length: usize,
    data: BytesMut,
}

impl Segment {
    fn new(
        index: i64,
        start_time_ms: i64,
        duration_ms: i64,
        start_byte: i64,
        content_length: usize,
    ) -> Self {
        Self {
            index,
            start_time_ms,
            duration_ms,
            start_byte,
            content_length,
            data: BytesMut::with_capacity(content_length),
        }
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Still receiving data; the write cursor has not reached the declared
    /// segment size.
    pub fn is_buffering(&self) -> bool {
        self.data.len() < self.content_length
    }

    /// Append media bytes, capped at the declared segment size.
    pub(crate) fn append(&mut self, chunk: &[u8]) {
        let remaining = self.content_length - self.data.len();
        let take = remaining.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
    }

    /// `[start, end)` of this segment along `dim`.
    fn range(&self, dim: Dimension) -> (i64, i64) {
        match dim {
            Dimension::Time => (self.start_time_ms, self.start_time_ms + self.duration_ms),
            Dimension::Byte => (self.start_byte, self.start_byte + self.content_length as i64),
        }
    }

    fn time_end(&self) -> i64 {
        self.start_time_ms + self.duration_ms
    }
}

/// Index-ordered collection of the segments buffered for one format.
pub struct FormatBuffer {
    key: FormatKey,
    content_length: i64,
    memory_budget: usize,
    segments: Vec<Segment>,
}

impl FormatBuffer {
    pub fn new(key: FormatKey, content_length: u64, memory_budget: usize) -> Self {
        Self {
            key,
            content_length: content_length as i64,
            memory_budget,
            segments: Vec::new(),
        }
    }

    pub fn key(&self) -> &FormatKey {
        &self.key
    }

    /// Allocated bytes across all segments. Buffers are sized up front, so
    /// a still-buffering segment counts at its declared size.
    pub fn allocated_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.content_length).sum()
    }

    /// Look up or create the segment for `index`, keeping the list ordered
    /// by index. Creation first evicts the lowest-index segments until the
    /// newcomer fits the memory budget.
    pub(crate) fn get_or_insert(
        &mut self,
        index: i64,
        start_time_ms: i64,
        duration_ms: i64,
        start_byte: i64,
        content_length: usize,
    ) -> &mut Segment {
        match self.segments.binary_search_by_key(&index, |s| s.index) {
            Ok(pos) => &mut self.segments[pos],
            Err(_) => {
                self.enforce_budget(content_length);
                // Eviction shifted positions, search again.
                let pos = match self.segments.binary_search_by_key(&index, |s| s.index) {
                    Ok(pos) | Err(pos) => pos,
                };
                self.segments.insert(
                    pos,
                    Segment::new(index, start_time_ms, duration_ms, start_byte, content_length),
                );
                &mut self.segments[pos]
            }
        }
    }

    pub(crate) fn segment_mut(&mut self, index: i64) -> Option<&mut Segment> {
        self.segments
            .binary_search_by_key(&index, |s| s.index)
            .ok()
            .map(|pos| &mut self.segments[pos])
    }

    pub(crate) fn remove_segment(&mut self, index: i64) -> bool {
        match self.segments.binary_search_by_key(&index, |s| s.index) {
            Ok(pos) => {
                self.segments.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    fn enforce_budget(&mut self, incoming: usize) {
        let mut total = self.allocated_bytes();
        while total + incoming > self.memory_budget && !self.segments.is_empty() {
            let removed = self.segments.remove(0);
            total -= removed.content_length;
            tracing::debug!(
                itag = self.key.itag,
                index = removed.index,
                bytes = removed.content_length,
                "evicted segment to respect memory budget"
            );
        }
    }

    /// Last complete segment whose start along `dim` is at or before
    /// `position`.
    pub fn segment_before_or_at(&self, dim: Dimension, position: i64) -> Option<&Segment> {
        self.segments
            .iter()
            .rev()
            .filter(|s| !s.is_buffering())
            .find(|s| s.range(dim).0 <= position)
    }

    /// Whether `[start, end)` along `dim` is fully covered by complete,
    /// index-contiguous segments.
    pub fn covers(&self, dim: Dimension, start: i64, end: i64) -> bool {
        self.covering_run(dim, start, end).is_some()
    }

    /// The concatenated bytes spanning `[start, end)` along `dim`, or `None`
    /// while any part of the span is missing, still buffering, or split
    /// across non-adjacent segment indices. Byte reads are cropped to the
    /// exact requested offsets.
    pub fn buffer_at(&self, dim: Dimension, start: i64, end: i64) -> Option<Bytes> {
        let (first, last) = self.covering_run(dim, start, end)?;

        let mut out = BytesMut::new();
        for segment in &self.segments[first..=last] {
            match dim {
                Dimension::Byte => {
                    let (seg_start, seg_end) = segment.range(dim);
                    let from = start.max(seg_start);
                    let to = end.min(seg_end);
                    if from >= to {
                        continue;
                    }
                    let lo = (from - seg_start) as usize;
                    let hi = (to - seg_start) as usize;
                    out.extend_from_slice(&segment.data[lo..hi]);
                }
                Dimension::Time => out.extend_from_slice(&segment.data),
            }
        }
        Some(out.freeze())
    }

    /// Positions (in the segment list) of the run covering `[start, end)`,
    /// or `None` if unavailable.
    fn covering_run(&self, dim: Dimension, start: i64, end: i64) -> Option<(usize, usize)> {
        let first = self
            .segments
            .iter()
            .rposition(|s| !s.is_buffering() && s.range(dim).0 <= start)?;

        let mut covered_end = self.segments[first].range(dim).1;
        let mut last = first;
        while covered_end < end {
            let next = self.segments.get(last + 1)?;
            if next.is_buffering() || next.index != self.segments[last].index + 1 {
                return None;
            }
            let (next_start, next_end) = next.range(dim);
            if next_start > covered_end {
                return None;
            }
            covered_end = covered_end.max(next_end);
            last += 1;
        }
        Some((first, last))
    }

    /// Collapse index-adjacent complete segments into coarse ranges for
    /// reporting back to the server.
    pub fn buffered_ranges(&self) -> Vec<proto::BufferedRange> {
        let mut ranges: Vec<proto::BufferedRange> = Vec::new();
        let mut last_index: Option<i64> = None;

        for segment in self.segments.iter().filter(|s| !s.is_buffering()) {
            let adjacent = last_index == Some(segment.index - 1);
            if adjacent {
                if let Some(range) = ranges.last_mut() {
                    let start = range.start_time_ms.unwrap_or(0);
                    range.duration_ms = Some(segment.time_end() - start);
                    range.end_segment_index = Some(segment.index as i32);
                    range.time_range = Some(proto::TimeRange {
                        start_ticks: Some(start),
                        duration_ticks: Some(segment.time_end() - start),
                        timescale: Some(1000),
                    });
                }
            } else {
                ranges.push(proto::BufferedRange {
                    format_id: Some(self.key.to_proto()),
                    start_time_ms: Some(segment.start_time_ms),
                    duration_ms: Some(segment.duration_ms),
                    start_segment_index: Some(segment.index as i32),
                    end_segment_index: Some(segment.index as i32),
                    time_range: Some(proto::TimeRange {
                        start_ticks: Some(segment.start_time_ms),
                        duration_ticks: Some(segment.duration_ms),
                        timescale: Some(1000),
                    }),
                });
            }
            last_index = Some(segment.index);
        }
        ranges
    }

    /// Time end of the furthest complete segment, the resume point used when
    /// a random-access read outruns the buffered data.
    pub fn last_buffered_time_end(&self) -> Option<i64> {
        self.segments
            .iter()
            .rev()
            .find(|s| !s.is_buffering())
            .map(Segment::time_end)
    }

    /// Whether the terminal byte of the stream is buffered.
    pub fn terminal_buffered(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !s.is_buffering() && s.range(Dimension::Byte).1 >= self.content_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FormatKey {
        FormatKey {
            itag: 140,
            last_modified: 1,
            xtags: None,
        }
    }

    fn buffer_with(budget: usize) -> FormatBuffer {
        FormatBuffer::new(key(), 10_000, budget)
    }

    /// Insert a complete segment: index n covers 1000ms / 1000 bytes.
    fn fill(buffer: &mut FormatBuffer, index: i64) {
        let segment = buffer.get_or_insert(
            index,
            index * 1000,
            1000,
            index * 1000,
            1000,
        );
        let fill = vec![index as u8; 1000];
        segment.append(&fill);
    }

    #[test]
    fn segment_completes_at_declared_size() {
        let mut buffer = buffer_with(usize::MAX);
        let segment = buffer.get_or_insert(0, 0, 1000, 0, 100);
        assert!(segment.is_buffering());

        segment.append(&[0; 60]);
        assert!(segment.is_buffering());
        segment.append(&[0; 40]);
        assert!(!segment.is_buffering());
    }

    #[test]
    fn append_is_capped_at_declared_size() {
        let mut buffer = buffer_with(usize::MAX);
        let segment = buffer.get_or_insert(0, 0, 1000, 0, 100);
        segment.append(&[7; 500]);
        assert_eq!(segment.data.len(), 100);
    }

    #[test]
    fn buffered_ranges_merge_adjacent_indices() {
        let mut buffer = buffer_with(usize::MAX);
        for index in [3, 4, 5, 8] {
            fill(&mut buffer, index);
        }

        let ranges = buffer.buffered_ranges();
        assert_eq!(ranges.len(), 2);

        assert_eq!(ranges[0].start_segment_index, Some(3));
        assert_eq!(ranges[0].end_segment_index, Some(5));
        assert_eq!(ranges[0].start_time_ms, Some(3000));
        assert_eq!(ranges[0].duration_ms, Some(3000));

        assert_eq!(ranges[1].start_segment_index, Some(8));
        assert_eq!(ranges[1].end_segment_index, Some(8));
        assert_eq!(ranges[1].duration_ms, Some(1000));
    }

    #[test]
    fn buffering_segment_breaks_a_range() {
        let mut buffer = buffer_with(usize::MAX);
        fill(&mut buffer, 0);
        buffer.get_or_insert(1, 1000, 1000, 1000, 1000); // no data yet
        fill(&mut buffer, 2);

        let ranges = buffer.buffered_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].end_segment_index, Some(0));
        assert_eq!(ranges[1].start_segment_index, Some(2));
    }

    #[test]
    fn full_byte_read_requires_contiguous_complete_run() {
        let mut buffer = FormatBuffer::new(key(), 5000, usize::MAX);
        for index in 0..5 {
            fill(&mut buffer, index);
        }

        let data = buffer
            .buffer_at(Dimension::Byte, 0, 5000)
            .expect("all segments complete and contiguous");
        assert_eq!(data.len(), 5000);

        buffer.remove_segment(2);
        assert!(buffer.buffer_at(Dimension::Byte, 0, 5000).is_none());

        fill(&mut buffer, 2);
        assert!(buffer.buffer_at(Dimension::Byte, 0, 5000).is_some());
    }

    #[test]
    fn byte_read_is_cropped_to_requested_offsets() {
        let mut buffer = buffer_with(usize::MAX);
        fill(&mut buffer, 0);
        fill(&mut buffer, 1);

        let data = buffer
            .buffer_at(Dimension::Byte, 500, 1500)
            .expect("span covered");
        assert_eq!(data.len(), 1000);
        assert!(data[..500].iter().all(|&b| b == 0));
        assert!(data[500..].iter().all(|&b| b == 1));
    }

    #[test]
    fn read_before_first_segment_is_unavailable() {
        let mut buffer = buffer_with(usize::MAX);
        fill(&mut buffer, 2); // starts at byte 2000

        assert!(buffer.buffer_at(Dimension::Byte, 0, 100).is_none());
        assert!(buffer.buffer_at(Dimension::Byte, 2000, 2100).is_some());
    }

    #[test]
    fn read_past_buffered_data_is_unavailable() {
        let mut buffer = buffer_with(usize::MAX);
        fill(&mut buffer, 0);

        assert!(buffer.buffer_at(Dimension::Byte, 0, 1001).is_none());
    }

    #[test]
    fn buffering_segment_does_not_satisfy_reads() {
        let mut buffer = buffer_with(usize::MAX);
        let segment = buffer.get_or_insert(0, 0, 1000, 0, 1000);
        segment.append(&[1; 999]);

        assert!(buffer.buffer_at(Dimension::Byte, 0, 500).is_none());
        buffer.segment_mut(0).unwrap().append(&[1; 1]);
        assert!(buffer.buffer_at(Dimension::Byte, 0, 500).is_some());
    }

    #[test]
    fn non_adjacent_indices_do_not_join_even_when_bytes_abut() {
        let mut buffer = buffer_with(usize::MAX);
        fill(&mut buffer, 0);
        // Index jumps to 2 but byte range continues at 1000.
        let segment = buffer.get_or_insert(2, 1000, 1000, 1000, 1000);
        segment.append(&[2; 1000]);

        assert!(buffer.buffer_at(Dimension::Byte, 0, 2000).is_none());
    }

    #[test]
    fn time_lookup_finds_covering_segments() {
        let mut buffer = buffer_with(usize::MAX);
        fill(&mut buffer, 0);
        fill(&mut buffer, 1);

        assert!(buffer.covers(Dimension::Time, 0, 2000));
        assert!(!buffer.covers(Dimension::Time, 0, 2001));
        assert_eq!(
            buffer
                .segment_before_or_at(Dimension::Time, 1500)
                .map(Segment::index),
            Some(1)
        );
    }

    #[test]
    fn eviction_drops_lowest_index_first() {
        let mut buffer = buffer_with(3000);
        for index in 0..3 {
            fill(&mut buffer, index);
        }
        assert_eq!(buffer.allocated_bytes(), 3000);

        // The fourth segment forces index 0 out, even though a still
        // buffering low-index segment would be equally evictable.
        fill(&mut buffer, 3);
        assert_eq!(buffer.allocated_bytes(), 3000);
        assert!(buffer.buffer_at(Dimension::Byte, 0, 1000).is_none());
        assert!(buffer.buffer_at(Dimension::Byte, 1000, 4000).is_some());
    }

    #[test]
    fn eviction_drops_buffering_low_index_segments() {
        let mut buffer = buffer_with(2000);
        buffer.get_or_insert(0, 0, 1000, 0, 1000); // still buffering
        fill(&mut buffer, 1);
        fill(&mut buffer, 2); // evicts index 0 mid-buffering

        assert!(buffer.segment_mut(0).is_none());
        assert!(buffer.segment_mut(1).is_some());
    }

    #[test]
    fn terminal_detection_uses_declared_content_length() {
        let mut buffer = FormatBuffer::new(key(), 2000, usize::MAX);
        fill(&mut buffer, 0);
        assert!(!buffer.terminal_buffered());
        fill(&mut buffer, 1);
        assert!(buffer.terminal_buffered());
    }

    #[test]
    fn resume_point_is_last_complete_segment_end() {
        let mut buffer = buffer_with(usize::MAX);
        assert_eq!(buffer.last_buffered_time_end(), None);
        fill(&mut buffer, 0);
        fill(&mut buffer, 1);
        buffer.get_or_insert(2, 2000, 1000, 2000, 1000); // buffering
        assert_eq!(buffer.last_buffered_time_end(), Some(2000));
    }
}
