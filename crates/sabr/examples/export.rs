//! Export one format's full byte stream to a file, without playing it.
//!
//! The format catalog (itag, content length, duration) normally comes from
//! a separately fetched player response; pass the relevant values on the
//! command line:
//!
//!   cargo run --example export -- <media_url> <itag> <content_length> <duration_ms> <output>

use sabr::{FormatSpec, SabrDownloader, SessionOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let (Some(url), Some(itag), Some(content_length), Some(duration_ms), Some(output)) = (
        args.next(),
        args.next(),
        args.next(),
        args.next(),
        args.next(),
    ) else {
        eprintln!("Usage: export <media_url> <itag> <content_length> <duration_ms> <output>");
        std::process::exit(1);
    };

    let itag: i32 = itag.parse()?;
    let format = FormatSpec {
        itag,
        last_modified: 0,
        xtags: None,
        content_length: content_length.parse()?,
        duration_ms: duration_ms.parse()?,
        audio_quality: Some(String::new()),
        video_quality: None,
    };

    let downloader = SabrDownloader::new(SessionOptions::new(url, vec![format]))?;
    let (format, bytes) = downloader.fetch_chunk(itag, None, None).await?;

    tracing::info!(itag = format.itag, bytes = bytes.len(), "download complete");
    std::fs::write(&output, &bytes)?;
    Ok(())
}
