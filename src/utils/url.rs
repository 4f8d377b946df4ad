//! URL utilities for consistent URL handling
//!
//! Base URLs come from user configuration and may carry trailing slashes;
//! identifiers placed into paths come from the backend and are escaped.

use std::fmt::Write;

/// Normalize a base URL by removing trailing slashes
///
/// # Examples
///
/// ```
/// use syntra::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://chat.example.com/api/v1"), "https://chat.example.com/api/v1");
/// assert_eq!(normalize_base_url("https://chat.example.com/api/v1///"), "https://chat.example.com/api/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete API endpoint URL from a base URL and endpoint path
///
/// # Examples
///
/// ```
/// use syntra::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://chat.example.com/api/v1/", "/conversations"),
///     "https://chat.example.com/api/v1/conversations"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Join path segments, percent-encoding everything outside the RFC 3986
/// unreserved set so an identifier can never add or escape a segment.
///
/// # Examples
///
/// ```
/// use syntra::utils::url::endpoint_path;
///
/// assert_eq!(
///     endpoint_path(&["conversations", "c 1/x", "history"]),
///     "conversations/c%201%2Fx/history"
/// );
/// ```
pub fn endpoint_path(segments: &[&str]) -> String {
    let mut path = String::new();
    for (index, segment) in segments.iter().enumerate() {
        if index > 0 {
            path.push('/');
        }
        for byte in segment.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
                path.push(byte as char);
            } else {
                let _ = write!(path, "%{byte:02X}");
            }
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://chat.example.com/api/v1/"),
            "https://chat.example.com/api/v1"
        );
        assert_eq!(
            normalize_base_url("https://chat.example.com"),
            "https://chat.example.com"
        );
        assert_eq!(normalize_base_url("///"), "");
    }

    #[test]
    fn test_construct_api_url() {
        assert_eq!(
            construct_api_url("https://chat.example.com/api/v1", "chat"),
            "https://chat.example.com/api/v1/chat"
        );
        assert_eq!(
            construct_api_url("https://auth.example.com/api/v1///", "///auth/login"),
            "https://auth.example.com/api/v1/auth/login"
        );
    }

    #[test]
    fn endpoint_path_escapes_identifiers() {
        assert_eq!(
            endpoint_path(&["conversations", "3f2a-91", "messages", "t-1"]),
            "conversations/3f2a-91/messages/t-1"
        );
        assert_eq!(endpoint_path(&["conversations", "../admin"]), "conversations/..%2Fadmin");
        assert_eq!(endpoint_path(&["a", "é"]), "a/%C3%A9");
        assert_eq!(endpoint_path(&[]), "");
    }
}
