//! HTTP header helpers for ranged downloads.

use std::time::Duration;

use reqwest::header::{
    HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, IF_RANGE, RANGE,
    RETRY_AFTER,
};

/// Parsed `Content-Range: bytes <start>-<end>/<size>` (or `bytes */<size>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
    /// Full length of the resource, when the server knows it.
    pub size: Option<u64>,
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, size) = rest.split_once('/')?;

    let size = match size.trim() {
        "*" => None,
        n => Some(n.parse().ok()?),
    };

    let (start, end) = match span.trim() {
        "*" => (None, None),
        span => {
            let (start, end) = span.split_once('-')?;
            let start: u64 = start.trim().parse().ok()?;
            let end: u64 = end.trim().parse().ok()?;
            if end < start {
                return None;
            }
            (Some(start), Some(end))
        }
    };

    if start.is_none() && size.is_none() {
        return None;
    }
    Some(ContentRange { start, end, size })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &reqwest::header::HeaderName) -> Option<&'a str> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn content_range(headers: &HeaderMap) -> Option<ContentRange> {
    header_str(headers, &CONTENT_RANGE).and_then(parse_content_range)
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, &CONTENT_LENGTH)?.parse().ok()
}

pub fn etag(headers: &HeaderMap) -> Option<String> {
    header_str(headers, &ETAG).map(str::to_string)
}

/// Media type without parameters, e.g. `image/png`.
pub fn mime(headers: &HeaderMap) -> Option<String> {
    let value = header_str(headers, &CONTENT_TYPE)?;
    let essence = value.split(';').next().unwrap_or(value).trim();
    (!essence.is_empty()).then(|| essence.to_ascii_lowercase())
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = header_str(headers, &RETRY_AFTER)?;
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

/// Request headers resuming at `offset`, conditional on `etag` when known.
pub fn resume_headers(offset: u64, etag: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if offset == 0 {
        return headers;
    }
    if let Ok(range) = HeaderValue::from_str(&format!("bytes={offset}-")) {
        headers.insert(RANGE, range);
    }
    if let Some(etag) = etag {
        match HeaderValue::from_str(etag) {
            Ok(value) => {
                headers.insert(IF_RANGE, value);
            }
            Err(_) => tracing::warn!(etag, "ETag is not a valid header value, resuming without If-Range"),
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_forms() {
        assert_eq!(
            parse_content_range("bytes 2-5/6"),
            Some(ContentRange { start: Some(2), end: Some(5), size: Some(6) })
        );
        assert_eq!(
            parse_content_range("bytes 0-99/*"),
            Some(ContentRange { start: Some(0), end: Some(99), size: None })
        );
        assert_eq!(
            parse_content_range("bytes */1234"),
            Some(ContentRange { start: None, end: None, size: Some(1234) })
        );
        assert_eq!(parse_content_range("bytes */*"), None);
        assert_eq!(parse_content_range("bytes 5-2/6"), None);
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes x-y/z"), None);
    }

    #[test]
    fn resume_headers_only_when_resuming() {
        assert!(resume_headers(0, Some("\"e\"")).is_empty());

        let headers = resume_headers(2, Some("6-1"));
        assert_eq!(headers.get(RANGE).unwrap(), "bytes=2-");
        assert_eq!(headers.get(IF_RANGE).unwrap(), "6-1");

        let headers = resume_headers(10, None);
        assert!(headers.get(IF_RANGE).is_none());
    }

    #[test]
    fn response_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers.insert(ETAG, HeaderValue::from_static(" \"abc\" "));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("Image/PNG; charset=binary"));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));

        assert_eq!(content_length(&headers), Some(42));
        assert_eq!(etag(&headers).as_deref(), Some("\"abc\""));
        assert_eq!(mime(&headers).as_deref(), Some("image/png"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));
        assert_eq!(content_range(&headers), None);
    }

    #[test]
    fn retry_after_in_the_past_is_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), Some(Duration::ZERO));
    }
}
