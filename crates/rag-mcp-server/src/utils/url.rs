use crate::utils::error::ServiceError;
use reqwest::Url;

/// Normalize a fetch URL before it is used as a lookup key.
///
/// Requires an http/https scheme, lowercases the host, strips surrounding
/// whitespace, and rewrites `youtu.be/<id>` short links to their canonical
/// `youtube.com/watch?v=<id>` form.
pub fn normalize_url(raw: &str) -> Result<String, ServiceError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::InvalidParams("URL must not be empty".to_string()));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| ServiceError::InvalidParams(format!("Invalid URL '{}': {}", trimmed, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ServiceError::InvalidParams(format!(
                "Unsupported URL scheme '{}'; expected http or https",
                other
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| ServiceError::InvalidParams(format!("URL '{}' has no host", trimmed)))?
        .to_lowercase();

    // youtu.be short links: the path is the video id.
    if host == "youtu.be" {
        let video_id = url.path().trim_matches('/');
        if !video_id.is_empty() {
            return Ok(format!("{}://youtube.com/watch?v={}", url.scheme(), video_id));
        }
    }

    let mut normalized = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(url.path());
    if let Some(query) = url.query() {
        normalized.push('?');
        normalized.push_str(query);
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_host_and_keeps_path_case() {
        let url = normalize_url("  https://Developer.Apple.COM/Documentation/SwiftUI ").unwrap();
        assert_eq!(url, "https://developer.apple.com/Documentation/SwiftUI");
    }

    #[test]
    fn rewrites_youtube_short_links() {
        let url = normalize_url("https://youtu.be/abc123").unwrap();
        assert_eq!(url, "https://youtube.com/watch?v=abc123");
    }

    #[test]
    fn preserves_query_strings() {
        let url = normalize_url("https://example.com/a/b?x=1&y=2").unwrap();
        assert_eq!(url, "https://example.com/a/b?x=1&y=2");
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(normalize_url("developer.apple.com/documentation").is_err());
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(normalize_url("ftp://example.com/file").is_err());
        assert!(normalize_url("").is_err());
    }
}
