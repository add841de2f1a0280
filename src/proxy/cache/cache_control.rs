use std::time::Duration;

use crate::proxy::http::Headers;

/// Freshness used when a cacheable response names neither `max-age` nor `s-max-age`.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const SEGMENT_CONTENT_TYPES: &[&str] = &["video/mp2t", "video/mp4", "video/iso.segment"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
}

impl CacheControl {
    /// Directives may be separated by commas, whitespace, or both.
    pub fn parse(value: &str) -> Self {
        let mut cc = CacheControl::default();
        for part in value
            .split(|c: char| c == ',' || c.is_ascii_whitespace())
            .filter(|part| !part.is_empty())
        {
            let (name, argument) = match part.split_once('=') {
                Some((name, argument)) => (name, Some(argument.trim_matches('"'))),
                None => (part, None),
            };
            if name.eq_ignore_ascii_case("no-cache") {
                cc.no_cache = true;
            } else if name.eq_ignore_ascii_case("no-store") {
                cc.no_store = true;
            } else if name.eq_ignore_ascii_case("max-age")
                && let Some(secs) = argument.and_then(|arg| arg.parse::<u64>().ok())
            {
                cc.max_age = Some(Duration::from_secs(secs));
            } else if (name.eq_ignore_ascii_case("s-max-age")
                || name.eq_ignore_ascii_case("s-maxage"))
                && let Some(secs) = argument.and_then(|arg| arg.parse::<u64>().ok())
            {
                cc.s_maxage = Some(Duration::from_secs(secs));
            }
        }
        cc
    }

    pub fn from_headers(headers: &Headers) -> Option<Self> {
        headers.get("cache-control").map(Self::parse)
    }

    /// `max-age`, then `s-max-age`, then [`DEFAULT_MAX_AGE`].
    pub fn freshness_lifetime(&self) -> Duration {
        self.max_age.or(self.s_maxage).unwrap_or(DEFAULT_MAX_AGE)
    }
}

pub fn is_segment_content_type(content_type: &str) -> bool {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    SEGMENT_CONTENT_TYPES
        .iter()
        .any(|known| known.eq_ignore_ascii_case(media_type))
}

/// A response may be stored when it has a non-empty `ETag`, a `Cache-Control` header without
/// `no-store`, and a segment `Content-Type`.
pub fn is_cacheable(headers: &Headers) -> bool {
    let has_etag = headers
        .get("etag")
        .is_some_and(|etag| !etag.trim().is_empty());
    if !has_etag {
        return false;
    }
    match CacheControl::from_headers(headers) {
        Some(cc) if !cc.no_store => {}
        _ => return false,
    }
    headers
        .get("content-type")
        .is_some_and(is_segment_content_type)
}

/// Origin `Age` in seconds; absent or unparsable values count as zero.
pub fn resource_age(headers: &Headers) -> u64 {
    headers
        .get("age")
        .and_then(|age| age.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_headers(cache_control: &str) -> Headers {
        let mut headers = Headers::new();
        headers.set("ETag", "\"abc\"");
        headers.set("Cache-Control", cache_control);
        headers.set("Content-Type", "video/MP2T");
        headers
    }

    #[test]
    fn no_store_is_never_cacheable() {
        for value in [
            "no-store",
            "no-cache no-store must-revalidate",
            "no-store max-age=12345",
            "public, NO-STORE",
        ] {
            assert!(!is_cacheable(&segment_headers(value)), "{value}");
        }
    }

    #[test]
    fn cacheable_segment() {
        assert!(is_cacheable(&segment_headers("max-age=600")));
        assert!(is_cacheable(&segment_headers("no-cache")));
    }

    #[test]
    fn missing_etag_or_cache_control_is_not_cacheable() {
        let mut headers = segment_headers("max-age=600");
        headers.set("ETag", "  ");
        assert!(!is_cacheable(&headers));
        headers.remove("etag");
        assert!(!is_cacheable(&headers));

        let mut headers = segment_headers("max-age=600");
        headers.remove("cache-control");
        assert!(!is_cacheable(&headers));
    }

    #[test]
    fn only_segment_types_are_cacheable() {
        let mut headers = segment_headers("max-age=600");
        headers.set("Content-Type", "application/vnd.apple.mpegurl");
        assert!(!is_cacheable(&headers));
        headers.remove("content-type");
        assert!(!is_cacheable(&headers));

        for content_type in ["video/mp4", "VIDEO/ISO.SEGMENT", "video/mp2t; charset=binary"] {
            headers.set("Content-Type", content_type);
            assert!(is_cacheable(&headers), "{content_type}");
        }
    }

    #[test]
    fn freshness_prefers_max_age_then_s_max_age() {
        assert_eq!(
            CacheControl::parse("s-maxage=30, max-age=600").freshness_lifetime(),
            Duration::from_secs(600)
        );
        assert_eq!(
            CacheControl::parse("s-max-age=30").freshness_lifetime(),
            Duration::from_secs(30)
        );
        assert_eq!(
            CacheControl::parse("max-age=soon").freshness_lifetime(),
            DEFAULT_MAX_AGE
        );
    }

    #[test]
    fn age_header_defaults_to_zero() {
        let mut headers = Headers::new();
        assert_eq!(resource_age(&headers), 0);
        headers.set("Age", "42");
        assert_eq!(resource_age(&headers), 42);
        headers.set("Age", "-1");
        assert_eq!(resource_age(&headers), 0);
    }
}
