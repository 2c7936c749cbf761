//! HTTP transport for logical requests.
//!
//! Converts a `RequestKind` plus authenticated base parameters into a single
//! HTTP call, either GET with a query string or a form-encoded POST when the
//! server has negotiated that mode. Classification of the status code is kept
//! as pure functions so the retry supervisor and tests can exercise it
//! without a socket.

use std::io::Read;
use std::time::Duration;

use log::debug;

use crate::error::SyncError;
use crate::request::RequestKind;

/// Fallback retry delay when `Retry-After` is missing or unparseable.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Responses over this size fail with a transport error.
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// Classified outcome of one HTTP exchange.
#[derive(Debug)]
pub enum TransportReply {
    /// HTTP 200. App-level errors still arrive this way, inside the body.
    Body { mime: String, bytes: Vec<u8> },
    /// HTTP 404/410/501: the server lacks this feature.
    Unsupported,
    /// HTTP 429: re-issue the identical request after the delay.
    RateLimited(Duration),
}

/// Transport seam; the production implementation speaks HTTP via `ureq`.
pub trait RequestTransport: Send {
    fn send(
        &self,
        base_url: &str,
        auth: &[(String, String)],
        kind: &RequestKind,
        use_form_post: bool,
    ) -> Result<TransportReply, SyncError>;
}

/// Classifies a non-200 status per the protocol contract.
///
/// Note that Subsonic and Navidrome return app-level error bodies in HTTP
/// 200; HTTP 404/410/501 are used for unsupported features, and newer
/// Navidrome rate limits cover fetches backed by third-party APIs with 429.
pub fn classify_status(
    status: u16,
    retry_after: Option<&str>,
    endpoint: &str,
) -> Result<TransportReply, SyncError> {
    match status {
        404 | 410 | 501 => Ok(TransportReply::Unsupported),
        429 => Ok(TransportReply::RateLimited(parse_retry_after(retry_after))),
        _ => Err(SyncError::Http {
            status,
            endpoint: endpoint.to_string(),
        }),
    }
}

/// Parses a `Retry-After` header value: delay seconds or an HTTP-date.
pub fn parse_retry_after(value: Option<&str>) -> Duration {
    let Some(value) = value else {
        return DEFAULT_RETRY_AFTER;
    };
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Duration::from_secs(seconds);
    }
    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        let delta = date.signed_duration_since(chrono::Utc::now());
        return delta.to_std().unwrap_or(Duration::ZERO);
    }
    DEFAULT_RETRY_AFTER
}

/// Returns whether a reported protocol version is at least `major.minor`.
/// Used to negotiate form-POST support after a successful ping.
pub fn api_version_at_least(version: &str, major: u32, minor: u32) -> bool {
    let mut parts = version.trim().split('.').map(|part| part.parse::<u32>());
    let reported_major = parts.next().and_then(Result::ok).unwrap_or(0);
    let reported_minor = parts.next().and_then(Result::ok).unwrap_or(0);
    (reported_major, reported_minor) >= (major, minor)
}

/// Buffers a response body, erroring out when it exceeds the cap so an
/// oversized reply can never be cached half-read.
fn read_capped(reader: impl Read, cap: u64) -> Result<Vec<u8>, SyncError> {
    let mut bytes = Vec::new();
    reader.take(cap + 1).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > cap {
        return Err(SyncError::Transport(format!(
            "response body exceeds the {cap} byte limit"
        )));
    }
    Ok(bytes)
}

fn endpoint_base(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

/// Builds the full GET URL for an endpoint with all parameters encoded.
pub fn build_query_url(base_url: &str, endpoint: &str, parameters: &[(String, String)]) -> String {
    let query: Vec<String> = parameters
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect();
    format!(
        "{}/rest/{}.view?{}",
        endpoint_base(base_url),
        endpoint,
        query.join("&")
    )
}

/// Builds the parameterless POST URL; parameters travel in the form body.
pub fn build_post_url(base_url: &str, endpoint: &str) -> String {
    format!("{}/rest/{}.view", endpoint_base(base_url), endpoint)
}

/// Production transport backed by `ureq`.
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(15))
            .timeout_write(Duration::from_secs(15))
            .build();
        Self { agent }
    }

    fn read_body(response: ureq::Response) -> Result<TransportReply, SyncError> {
        let mime = response.content_type().to_string();
        let bytes = read_capped(response.into_reader(), MAX_BODY_BYTES)?;
        Ok(TransportReply::Body { mime, bytes })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTransport for HttpTransport {
    fn send(
        &self,
        base_url: &str,
        auth: &[(String, String)],
        kind: &RequestKind,
        use_form_post: bool,
    ) -> Result<TransportReply, SyncError> {
        let endpoint = kind.endpoint();
        let mut parameters = auth.to_vec();
        parameters.extend(kind.parameters());

        // URLs are logged without the query string: it carries credentials.
        let result = if use_form_post {
            let url = build_post_url(base_url, endpoint);
            debug!("POST {url}");
            let form: Vec<(&str, &str)> = parameters
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str()))
                .collect();
            self.agent.post(&url).send_form(&form)
        } else {
            let url = build_query_url(base_url, endpoint, &parameters);
            debug!("GET {}/rest/{}.view", endpoint_base(base_url), endpoint);
            self.agent.get(&url).call()
        };

        match result {
            Ok(response) => Self::read_body(response),
            Err(ureq::Error::Status(status, response)) => {
                debug!("\tStatus code is {status}");
                classify_status(status, response.header("Retry-After"), endpoint)
            }
            Err(err) => Err(SyncError::Transport(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        api_version_at_least, build_post_url, build_query_url, classify_status, parse_retry_after,
        read_capped, TransportReply,
    };
    use crate::error::SyncError;
    use std::time::Duration;

    #[test]
    fn test_unsupported_statuses_classify() {
        for status in [404u16, 410, 501] {
            assert!(matches!(
                classify_status(status, None, "getPodcasts"),
                Ok(TransportReply::Unsupported)
            ));
        }
    }

    #[test]
    fn test_rate_limit_classifies_with_delay() {
        let reply = classify_status(429, Some("2"), "getCoverArt").expect("429 is recoverable");
        let TransportReply::RateLimited(delay) = reply else {
            panic!("429 should classify as rate limited");
        };
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn test_other_statuses_surface_as_http_errors() {
        let err = classify_status(500, None, "ping").expect_err("500 is fatal");
        let SyncError::Http { status, endpoint } = err else {
            panic!("expected http error");
        };
        assert_eq!(status, 500);
        assert_eq!(endpoint, "ping");
    }

    #[test]
    fn test_retry_after_parses_seconds_and_defaults() {
        assert_eq!(parse_retry_after(Some("3")), Duration::from_secs(3));
        assert_eq!(parse_retry_after(Some(" 10 ")), Duration::from_secs(10));
        assert_eq!(parse_retry_after(None), Duration::from_secs(5));
        assert_eq!(parse_retry_after(Some("soon")), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_after_parses_http_dates() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(30);
        let delay = parse_retry_after(Some(&future.to_rfc2822()));
        assert!(delay > Duration::from_secs(25) && delay <= Duration::from_secs(31));

        let past = chrono::Utc::now() - chrono::Duration::seconds(30);
        assert_eq!(parse_retry_after(Some(&past.to_rfc2822())), Duration::ZERO);
    }

    #[test]
    fn test_oversized_body_is_rejected_not_truncated() {
        let body = [0u8; 16];
        let err = read_capped(&body[..], 8).expect_err("over the cap must fail");
        assert!(matches!(err, SyncError::Transport(_)));
        // at the cap is fine
        assert_eq!(read_capped(&body[..], 16).expect("within cap").len(), 16);
    }

    #[test]
    fn test_query_url_encodes_parameters() {
        let url = build_query_url(
            "https://music.example.com/",
            "search3",
            &[("query".to_string(), "blue in green".to_string())],
        );
        assert_eq!(
            url,
            "https://music.example.com/rest/search3.view?query=blue%20in%20green"
        );
    }

    #[test]
    fn test_post_url_has_no_query_string() {
        let url = build_post_url("https://music.example.com", "createPlaylist");
        assert_eq!(url, "https://music.example.com/rest/createPlaylist.view");
    }

    #[test]
    fn test_api_version_comparison() {
        assert!(api_version_at_least("1.16.1", 1, 13));
        assert!(api_version_at_least("1.13.0", 1, 13));
        assert!(!api_version_at_least("1.12.0", 1, 13));
        assert!(api_version_at_least("2.0", 1, 13));
        assert!(!api_version_at_least("garbage", 1, 13));
    }
}
