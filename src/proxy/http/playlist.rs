use url::Url;

use crate::proxy::loopback::LoopbackEndpoint;

const PLAYLIST_CONTENT_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "audio/mpegurl",
    "application/mpegurl",
    "application/x-mpegurl",
    "audio/x-mpegurl",
];

/// Whether a `Content-Type` value names an HLS playlist. Parameters after `;` are ignored.
pub fn is_playlist_content_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    PLAYLIST_CONTENT_TYPES
        .iter()
        .any(|known| known.eq_ignore_ascii_case(media_type))
}

/// Rewrites every resource line of a playlist to its loopback form.
///
/// Tag and comment lines (`#...`) and blank lines pass through untouched and every line keeps its
/// original terminator. Lines that cannot be resolved against `playlist_url` are left as they are.
pub fn rewrite_playlist(body: &str, playlist_url: &Url, endpoint: &LoopbackEndpoint) -> String {
    let mut rewritten = String::with_capacity(body.len() + body.len() / 4);
    for raw_line in body.split_inclusive('\n') {
        let content = raw_line.trim_end_matches(['\r', '\n']);
        let terminator = &raw_line[content.len()..];
        let resource = content.trim();

        if resource.is_empty() || resource.starts_with('#') {
            rewritten.push_str(raw_line);
            continue;
        }

        match resolve_resource(resource, playlist_url) {
            Some(url) => {
                rewritten.push_str(&endpoint.encode_url(&url));
                rewritten.push_str(terminator);
            }
            None => {
                tracing::debug!(line = resource, "leaving unresolvable playlist line as-is");
                rewritten.push_str(raw_line);
            }
        }
    }
    rewritten
}

fn resolve_resource(resource: &str, playlist_url: &Url) -> Option<Url> {
    if let Ok(absolute) = Url::parse(resource) {
        return Some(absolute);
    }
    let mut resolved = playlist_url.join(resource).ok()?;
    if resolved.query().is_none() {
        resolved.set_query(playlist_url.query());
    }
    Some(resolved)
}
