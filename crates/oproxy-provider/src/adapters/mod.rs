pub mod anthropic;
pub mod custom_http;
pub mod mock;
pub mod ollama;
pub mod openai;

use bytes::Bytes;

use crate::http::{Headers, HttpMethod, UpstreamHttpRequest, header_set};

pub(crate) fn set_bearer(headers: &mut Headers, secret: &str) {
    header_set(headers, "authorization", &format!("Bearer {secret}"));
}

pub(crate) fn set_json_headers(headers: &mut Headers) {
    header_set(headers, "content-type", "application/json");
    header_set(headers, "accept", "application/json");
}

pub(crate) fn post_json(
    url: String,
    headers: Headers,
    body: Vec<u8>,
    is_stream: bool,
) -> UpstreamHttpRequest {
    UpstreamHttpRequest {
        method: HttpMethod::Post,
        url,
        headers,
        body: Some(Bytes::from(body)),
        is_stream,
    }
}

/// Response ids for dialects that do not supply one.
pub(crate) fn synthesize_id(prefix: &str) -> String {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("{prefix}-{nanos:x}")
}

pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
