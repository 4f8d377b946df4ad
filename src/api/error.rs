use std::error::Error as StdError;
use std::fmt;

/// Failures talking to the chat or authentication backend.
///
/// Cloneable so a single failed fetch can be handed to every caller that was
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The backend rejected the access token (HTTP 401) or none was available.
    Unauthorized,

    /// The backend answered with a non-success status.
    Status {
        /// HTTP status code.
        status: u16,
        /// Message extracted from the error body.
        message: String,
    },

    /// The request never produced a response.
    Network(String),

    /// The response body did not match the expected shape.
    Decode(String),

    /// The backend reported a failure inside an event stream, or the stream
    /// ended without producing anything.
    Stream(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }

    /// Whether repeating the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Unauthorized | ApiError::Decode(_) => false,
            ApiError::Status { status, .. } => *status >= 500 || *status == 429,
            ApiError::Network(_) | ApiError::Stream(_) => true,
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        if status == 401 {
            return ApiError::Unauthorized;
        }
        let message = extract_error_detail(body).unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("request failed with status {status}")
            } else {
                trimmed.to_string()
            }
        });
        ApiError::Status { status, message }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Authentication required"),
            ApiError::Status { status, message } => write!(f, "{message} (HTTP {status})"),
            ApiError::Network(message) => {
                write!(f, "Network error: no response from server ({message})")
            }
            ApiError::Decode(message) => write!(f, "Unexpected response from server: {message}"),
            ApiError::Stream(message) => write!(f, "{message}"),
        }
    }
}

impl StdError for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status.as_u16(), "")
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

/// Pull a human readable message out of a backend error body.
///
/// The backends report failures as `{"detail": …}`, `{"message": …}` or
/// `{"error": …}` (where `error` may itself be an object with a `message`).
pub fn extract_error_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    extract_error_summary(&value)
}

pub(crate) fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .get("detail")
        .and_then(detail_text)
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        })
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                serde_json::Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        });

    summary
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
}

// Validation failures come back as `{"detail": [{"msg": …}, …]}`.
fn detail_text(detail: &serde_json::Value) -> Option<String> {
    match detail {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => {
            let messages: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect();
            (!messages.is_empty()).then(|| messages.join("; "))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_takes_priority_over_message() {
        let body = r#"{"detail":"Conversation not found","message":"ignored"}"#;
        assert_eq!(
            extract_error_detail(body).as_deref(),
            Some("Conversation not found")
        );
    }

    #[test]
    fn nested_error_objects_and_validation_lists_are_summarized() {
        assert_eq!(
            extract_error_detail(r#"{"error":{"message":"model   overloaded"}}"#).as_deref(),
            Some("model overloaded")
        );
        assert_eq!(
            extract_error_detail(
                r#"{"detail":[{"msg":"field required"},{"msg":"value too long"}]}"#
            )
            .as_deref(),
            Some("field required; value too long")
        );
        assert_eq!(extract_error_detail("<html>oops</html>"), None);
    }

    #[test]
    fn status_401_maps_to_unauthorized() {
        assert_eq!(ApiError::from_status(401, "{}"), ApiError::Unauthorized);
        assert!(!ApiError::Unauthorized.is_retryable());
    }

    #[test]
    fn status_errors_fall_back_to_body_or_code() {
        let err = ApiError::from_status(404, r#"{"detail":"Conversation not found"}"#);
        assert_eq!(err.to_string(), "Conversation not found (HTTP 404)");
        assert!(!err.is_retryable());

        let err = ApiError::from_status(503, "");
        assert_eq!(
            err,
            ApiError::Status {
                status: 503,
                message: "request failed with status 503".to_string()
            }
        );
        assert!(err.is_retryable());
    }
}
