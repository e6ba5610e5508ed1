use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use sabr::{encode_media_segment, FormatSpec, SabrDownloader, SabrError, SessionOptions};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn catalog() -> Vec<FormatSpec> {
    vec![
        FormatSpec {
            itag: 140,
            last_modified: 1_722_000_000_000_000,
            xtags: None,
            content_length: 1_000_000,
            duration_ms: 60_000,
            audio_quality: Some("AUDIO_QUALITY_MEDIUM".to_string()),
            video_quality: None,
        },
        FormatSpec {
            itag: 160,
            last_modified: 1_722_000_000_000_001,
            xtags: None,
            content_length: 5_000_000,
            duration_ms: 60_000,
            audio_quality: None,
            video_quality: Some("144p".to_string()),
        },
    ]
}

/// A complete audio segment wrapped as a MEDIA_HEADER/MEDIA/MEDIA_END
/// triple, plus a next-request policy, the way a real response looks.
fn audio_response(data: &[u8]) -> Vec<u8> {
    let header = sabr_proto::MediaHeader {
        header_id: Some(1),
        itag: Some(140),
        lmt: Some(1_722_000_000_000_000),
        sequence_number: Some(0),
        start_ms: Some(0),
        duration_ms: Some(60_000),
        start_range: Some(0),
        content_length: Some(data.len() as i64),
        ..Default::default()
    };
    let mut body = encode_media_segment(&header, data);

    let policy = sabr_proto::NextRequestPolicy {
        target_audio_readahead_ms: Some(15_000),
        ..Default::default()
    };
    body.extend(
        sabr::Slice::new(sabr::SliceType::NextRequestPolicy, policy.encode_to_vec()).encode(),
    );
    body
}

#[tokio::test]
async fn fetch_chunk_resolves_after_a_single_request() {
    let server = MockServer::start().await;

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(audio_response(&payload)))
        .expect(1)
        .mount(&server)
        .await;

    let options = SessionOptions::new(format!("{}/videoplayback", server.uri()), catalog());
    let downloader = SabrDownloader::new(options).unwrap();

    let (format, bytes) = downloader.fetch_chunk(140, Some(0), Some(999)).await.unwrap();
    assert_eq!(format.itag, 140);
    assert_eq!(bytes.len(), 1000);
    assert_eq!(&bytes[..], &payload[..1000]);
}

#[tokio::test]
async fn fetch_chunk_defaults_to_the_whole_content_length() {
    let server = MockServer::start().await;

    let payload = vec![42u8; 4096];
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(audio_response(&payload)))
        .mount(&server)
        .await;

    let mut formats = catalog();
    formats[0].content_length = payload.len() as u64;

    let options = SessionOptions::new(format!("{}/videoplayback", server.uri()), formats);
    let downloader = SabrDownloader::new(options).unwrap();

    let (_, bytes) = downloader.fetch_chunk(140, None, None).await.unwrap();
    assert_eq!(&bytes[..], &payload[..]);
}

#[tokio::test]
async fn out_of_range_requests_fail_fast() {
    let options = SessionOptions::new("https://example.com/videoplayback", catalog());
    let downloader = SabrDownloader::new(options).unwrap();

    assert!(matches!(
        downloader.fetch_chunk(140, Some(0), Some(1_000_000)).await,
        Err(SabrError::RangeOutOfBounds { .. })
    ));
    assert!(matches!(
        downloader.fetch_chunk(140, Some(500), Some(400)).await,
        Err(SabrError::RangeOutOfBounds { .. })
    ));
    assert!(matches!(
        downloader.fetch_chunk(999, None, None).await,
        Err(SabrError::UnknownFormat(999))
    ));
}

#[tokio::test]
async fn protection_pause_blocks_until_token_rotation_and_resume() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let payload = vec![5u8; 2000];
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(audio_response(&payload)))
        .mount(&server)
        .await;

    let options = SessionOptions::new(format!("{}/videoplayback", server.uri()), catalog());
    let downloader = Arc::new(SabrDownloader::new(options).unwrap());

    let pending = tokio::spawn({
        let downloader = downloader.clone();
        async move { downloader.fetch_chunk(140, Some(0), Some(499)).await }
    });

    // The 403 hard-pauses the session; the read stays blocked.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!pending.is_finished());
    assert!(downloader.paused().await);

    downloader.set_po_token(b"fresh-token".to_vec()).await;
    downloader.play().await;

    let (_, bytes) = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("resumes after token rotation")
        .unwrap()
        .unwrap();
    assert_eq!(bytes.len(), 500);
    assert!(bytes.iter().all(|&b| b == 5));
}
