use thiserror::Error;

#[derive(Error, Debug)]
pub enum SabrError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("empty response body")]
    EmptyResponse,

    #[error("malformed slice stream: {0}")]
    Framing(String),

    #[error("server error: type={kind:?}, code={code}")]
    Server { kind: Option<String>, code: i32 },

    #[error("unknown format itag {0}")]
    UnknownFormat(i32),

    #[error("requested range {start}..={end} outside content length {content_length}")]
    RangeOutOfBounds {
        start: u64,
        end: u64,
        content_length: u64,
    },

    #[error(transparent)]
    MessageDecode(#[from] prost::DecodeError),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),
}

pub type SabrResult<T> = Result<T, SabrError>;
