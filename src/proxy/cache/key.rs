use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// Segment URLs served under this shape are identical across CDNs, so only the path is keyed.
static CHUNK_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https://[^/]*/v1/chunk/([^/]*)/([^/]*)\.(m4s|ts)").expect("chunk path regex")
});

/// Lookup key for `url`: the path for recognised chunk URLs, the full URL otherwise.
pub fn generate_cache_key(url: &Url) -> String {
    if CHUNK_PATH.is_match(url.as_str()) {
        return url.path().to_string();
    }
    url.to_string()
}

/// Reversible URL- and filename-safe form of a lookup key.
pub fn safe_cache_key(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    raw: String,
    safe: String,
}

impl CacheKey {
    pub fn for_url(url: &Url) -> Self {
        let raw = generate_cache_key(url);
        let safe = safe_cache_key(&raw);
        Self { raw, safe }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn safe(&self) -> &str {
        &self.safe
    }
}
