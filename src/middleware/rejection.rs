//! The response sent when admission is denied.

use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use serde::{Deserialize, Serialize};

/// Machine-readable reason code for an exhausted budget.
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";

/// JSON body of a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    /// Reason code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl Default for RejectionBody {
    fn default() -> Self {
        Self {
            code: RATE_LIMIT_EXCEEDED.to_string(),
            message: "too many requests".to_string(),
        }
    }
}

/// Build a `429 Too Many Requests` response with a JSON reason body.
pub fn rejection_response<B: From<String>>() -> Response<B> {
    // Serializing two strings cannot fail.
    let body = serde_json::to_string(&RejectionBody::default()).unwrap_or_default();

    let mut response = Response::new(B::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_response() {
        let response: Response<String> = rejection_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body: RejectionBody = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body.code, "rate_limit_exceeded");
        assert_eq!(body.message, "too many requests");
    }
}
