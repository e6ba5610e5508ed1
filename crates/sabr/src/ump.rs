//! Codec for the multiplexed slice envelope carried in media responses.
//!
//! A response body is a sequence of slices, each framed as
//! `[varint: type] [varint: size] [size bytes: payload]`. Bodies arrive in
//! arbitrarily sized chunks, so the parser buffers partial frames and
//! completes them when more data is pushed.
//!
//! The varint is the protocol's own variable-length integer, not the
//! protobuf one: the number of leading ones in the first byte selects a
//! 1 to 5 byte encoding.

use bytes::{Bytes, BytesMut};
use prost::Message;

use crate::error::{SabrError, SabrResult};

const MEDIA_HEADER: u32 = 20;
const MEDIA: u32 = 21;
const MEDIA_END: u32 = 22;
const NEXT_REQUEST_POLICY: u32 = 35;
const FORMAT_INITIALIZATION_METADATA: u32 = 42;
const SABR_REDIRECT: u32 = 43;
const SABR_ERROR: u32 = 44;
const SABR_CONTEXT_UPDATE: u32 = 57;
const STREAM_PROTECTION_STATUS: u32 = 58;
const SABR_CONTEXT_SENDING_POLICY: u32 = 59;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceType {
    MediaHeader,
    Media,
    MediaEnd,
    NextRequestPolicy,
    FormatInitialization,
    SabrRedirect,
    SabrError,
    SabrContextUpdate,
    StreamProtectionStatus,
    SabrContextSendingPolicy,
    Other(u32),
}

impl SliceType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            MEDIA_HEADER => Self::MediaHeader,
            MEDIA => Self::Media,
            MEDIA_END => Self::MediaEnd,
            NEXT_REQUEST_POLICY => Self::NextRequestPolicy,
            FORMAT_INITIALIZATION_METADATA => Self::FormatInitialization,
            SABR_REDIRECT => Self::SabrRedirect,
            SABR_ERROR => Self::SabrError,
            SABR_CONTEXT_UPDATE => Self::SabrContextUpdate,
            STREAM_PROTECTION_STATUS => Self::StreamProtectionStatus,
            SABR_CONTEXT_SENDING_POLICY => Self::SabrContextSendingPolicy,
            other => Self::Other(other),
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            Self::MediaHeader => MEDIA_HEADER,
            Self::Media => MEDIA,
            Self::MediaEnd => MEDIA_END,
            Self::NextRequestPolicy => NEXT_REQUEST_POLICY,
            Self::FormatInitialization => FORMAT_INITIALIZATION_METADATA,
            Self::SabrRedirect => SABR_REDIRECT,
            Self::SabrError => SABR_ERROR,
            Self::SabrContextUpdate => SABR_CONTEXT_UPDATE,
            Self::StreamProtectionStatus => STREAM_PROTECTION_STATUS,
            Self::SabrContextSendingPolicy => SABR_CONTEXT_SENDING_POLICY,
            Self::Other(other) => *other,
        }
    }
}

/// One `(type, payload)` unit of the multiplexed envelope.
#[derive(Debug, Clone)]
pub struct Slice {
    pub slice_type: SliceType,
    pub payload: Bytes,
}

impl Slice {
    pub fn new(slice_type: SliceType, payload: impl Into<Bytes>) -> Self {
        Self {
            slice_type,
            payload: payload.into(),
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        write_varint(out, self.slice_type.raw());
        write_varint(out, self.payload.len() as u32);
        out.extend_from_slice(&self.payload);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 10);
        self.encode_into(&mut out);
        out
    }
}

/// Read a varint from `buf`, returning `(value, bytes_consumed)`, or `None`
/// if the buffer ends inside the encoding.
pub fn read_varint(buf: &[u8]) -> Option<(u32, usize)> {
    let first = *buf.first()?;

    if first < 128 {
        Some((first as u32, 1))
    } else if first < 192 {
        let b1 = *buf.get(1)?;
        Some(((first as u32 & 0x3F) + 64 * b1 as u32, 2))
    } else if first < 224 {
        let b1 = *buf.get(1)?;
        let b2 = *buf.get(2)?;
        Some(((first as u32 & 0x1F) + 32 * (b1 as u32 + 256 * b2 as u32), 3))
    } else if first < 240 {
        let b1 = *buf.get(1)?;
        let b2 = *buf.get(2)?;
        let b3 = *buf.get(3)?;
        let value = (first as u32 & 0x0F) + 16 * (b1 as u32 + 256 * (b2 as u32 + 256 * b3 as u32));
        Some((value, 4))
    } else {
        if buf.len() < 5 {
            return None;
        }
        Some((u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]), 5))
    }
}

pub fn write_varint(out: &mut Vec<u8>, value: u32) {
    if value < 128 {
        out.push(value as u8);
    } else if value < 64 * 256 {
        out.push(128 | (value % 64) as u8);
        out.push((value / 64) as u8);
    } else if value < 32 * 256 * 256 {
        let rest = value / 32;
        out.push(192 | (value % 32) as u8);
        out.push((rest % 256) as u8);
        out.push((rest / 256) as u8);
    } else if value < 16 * 256 * 256 * 256 {
        let rest = value / 16;
        out.push(224 | (value % 16) as u8);
        out.push((rest % 256) as u8);
        out.push((rest / 256 % 256) as u8);
        out.push((rest / 256 / 256) as u8);
    } else {
        out.push(240);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Incremental slice parser over a chunked byte stream.
///
/// Push response chunks as they arrive and drain complete slices with
/// [`next_slice`](UmpParser::next_slice). When the declared body size is
/// known up front, a frame whose length prefix would run past it fails the
/// parse instead of waiting for data that can never come.
pub struct UmpParser {
    buffer: BytesMut,
    consumed: u64,
    body_size: Option<u64>,
}

impl UmpParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            consumed: 0,
            body_size: None,
        }
    }

    pub fn with_body_size(body_size: u64) -> Self {
        Self {
            buffer: BytesMut::new(),
            consumed: 0,
            body_size: Some(body_size),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Extract the next complete slice, `Ok(None)` if more data is needed.
    pub fn next_slice(&mut self) -> SabrResult<Option<Slice>> {
        let Some((raw_type, type_len)) = read_varint(&self.buffer) else {
            return Ok(None);
        };
        let Some((size, size_len)) = read_varint(&self.buffer[type_len..]) else {
            return Ok(None);
        };

        let header_len = type_len + size_len;
        let total_len = header_len + size as usize;

        if let Some(body_size) = self.body_size {
            if self.consumed + total_len as u64 > body_size {
                return Err(SabrError::Framing(format!(
                    "slice type {raw_type} declares {size} payload bytes past the end of a {body_size} byte body"
                )));
            }
        }

        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total_len);
        let payload = frame.split_off(header_len).freeze();
        self.consumed += total_len as u64;

        Ok(Some(Slice {
            slice_type: SliceType::from_raw(raw_type),
            payload,
        }))
    }

    /// Call once the response body is exhausted. Leftover bytes mean the
    /// stream ended inside a frame.
    pub fn finish(&self) -> SabrResult<()> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(SabrError::Framing(format!(
                "{} trailing bytes form no complete slice",
                self.buffer.len()
            )))
        }
    }
}

impl Default for UmpParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a fetched segment as a self-contained `MEDIA_HEADER, MEDIA,
/// MEDIA_END` triple, for hand-off to consumers that expect protocol-shaped
/// input rather than raw bytes.
pub fn encode_media_segment(header: &sabr_proto::MediaHeader, data: &[u8]) -> Vec<u8> {
    let header_id = header.header_id.unwrap_or(0) as u8;

    let mut out = Vec::with_capacity(data.len() + 64);
    Slice::new(SliceType::MediaHeader, header.encode_to_vec()).encode_into(&mut out);

    let mut media = Vec::with_capacity(data.len() + 1);
    media.push(header_id);
    media.extend_from_slice(data);
    Slice::new(SliceType::Media, media).encode_into(&mut out);

    Slice::new(SliceType::MediaEnd, vec![header_id]).encode_into(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: u32) {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        let (decoded, consumed) = read_varint(&buf).expect("should decode");
        assert_eq!(decoded, value, "value mismatch for {value}");
        assert_eq!(consumed, buf.len(), "length mismatch for {value}");
    }

    #[test]
    fn varint_boundaries() {
        for value in [
            0,
            1,
            127,
            128,
            16383,
            16384,
            2_097_151,
            2_097_152,
            268_435_455,
            268_435_456,
            u32::MAX,
        ] {
            roundtrip(value);
        }
    }

    #[test]
    fn varint_short_buffer() {
        assert!(read_varint(&[]).is_none());
        assert!(read_varint(&[0x80]).is_none());
        assert!(read_varint(&[0xF0, 0x01, 0x02]).is_none());
    }

    #[test]
    fn parser_yields_slices_in_order() {
        let mut body = Vec::new();
        for i in 0..3u8 {
            Slice::new(SliceType::Media, vec![i, i + 10]).encode_into(&mut body);
        }

        let mut parser = UmpParser::new();
        parser.push(&body);

        for i in 0..3u8 {
            let slice = parser.next_slice().unwrap().expect("should yield");
            assert_eq!(slice.slice_type, SliceType::Media);
            assert_eq!(&slice.payload[..], &[i, i + 10]);
        }
        assert!(parser.next_slice().unwrap().is_none());
        parser.finish().unwrap();
    }

    #[test]
    fn parser_survives_chunked_delivery() {
        let body = Slice::new(SliceType::SabrRedirect, b"https://example.com".to_vec()).encode();

        let mut parser = UmpParser::new();
        for (i, byte) in body.iter().enumerate() {
            assert!(
                parser.next_slice().unwrap().is_none(),
                "yielded before byte {i} arrived"
            );
            parser.push(std::slice::from_ref(byte));
        }

        let slice = parser.next_slice().unwrap().expect("complete after last byte");
        assert_eq!(slice.slice_type, SliceType::SabrRedirect);
        assert_eq!(&slice.payload[..], b"https://example.com");
    }

    #[test]
    fn parser_accepts_empty_payload() {
        let body = Slice::new(SliceType::MediaEnd, Vec::new()).encode();
        let mut parser = UmpParser::new();
        parser.push(&body);

        let slice = parser.next_slice().unwrap().expect("should yield");
        assert_eq!(slice.slice_type, SliceType::MediaEnd);
        assert!(slice.payload.is_empty());
    }

    #[test]
    fn corrupt_length_fails_the_parse() {
        // Declares 1000 payload bytes inside a 10 byte body.
        let mut body = Vec::new();
        write_varint(&mut body, MEDIA);
        write_varint(&mut body, 1000);
        body.extend_from_slice(&[0; 6]);

        let mut parser = UmpParser::with_body_size(10);
        parser.push(&body);
        assert!(matches!(
            parser.next_slice(),
            Err(SabrError::Framing(_))
        ));
    }

    #[test]
    fn truncated_body_fails_on_finish() {
        let body = Slice::new(SliceType::Media, vec![0; 64]).encode();
        let mut parser = UmpParser::new();
        parser.push(&body[..body.len() - 1]);

        assert!(parser.next_slice().unwrap().is_none());
        assert!(matches!(parser.finish(), Err(SabrError::Framing(_))));
    }

    #[test]
    fn unknown_types_are_preserved() {
        let body = Slice::new(SliceType::Other(99), vec![1]).encode();
        let mut parser = UmpParser::new();
        parser.push(&body);

        let slice = parser.next_slice().unwrap().expect("should yield");
        assert_eq!(slice.slice_type, SliceType::Other(99));
    }

    #[test]
    fn synthetic_media_triple_parses_back() {
        let header = sabr_proto::MediaHeader {
            header_id: Some(5),
            itag: Some(140),
            sequence_number: Some(0),
            content_length: Some(4),
            ..Default::default()
        };
        let body = encode_media_segment(&header, &[9, 8, 7, 6]);

        let mut parser = UmpParser::with_body_size(body.len() as u64);
        parser.push(&body);

        let first = parser.next_slice().unwrap().unwrap();
        assert_eq!(first.slice_type, SliceType::MediaHeader);
        let decoded = <sabr_proto::MediaHeader as prost::Message>::decode(&first.payload[..])
            .expect("header decodes");
        assert_eq!(decoded.header_id, Some(5));

        let media = parser.next_slice().unwrap().unwrap();
        assert_eq!(media.slice_type, SliceType::Media);
        assert_eq!(&media.payload[..], &[5, 9, 8, 7, 6]);

        let end = parser.next_slice().unwrap().unwrap();
        assert_eq!(end.slice_type, SliceType::MediaEnd);
        assert_eq!(&end.payload[..], &[5]);

        assert!(parser.next_slice().unwrap().is_none());
        parser.finish().unwrap();
    }
}
