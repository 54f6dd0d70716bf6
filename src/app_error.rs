use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// The error taxonomy surfaced across the webhook boundary. Every component
/// error is converted into one of these variants before it reaches the HTTP
/// layer; internal details never leak past `#[cfg(not(debug_assertions))]`.
#[derive(Debug, Error)]
pub enum PacError {
    #[error("malformed_payload: {0}")]
    MalformedPayload(#[source] anyhow::Error),
    #[error("signature_invalid")]
    SignatureInvalid,
    #[error("no_binding: {0}")]
    NoBinding(String),
    #[error("provider_unavailable: {0}")]
    ProviderUnavailable(#[source] anyhow::Error),
    #[error("access_denied")]
    AccessDenied,
    #[error("template_error: unresolved key `{0}`")]
    TemplateError(String),
    #[error("submission_error: {0}")]
    SubmissionError(#[source] anyhow::Error),
    #[error("internal_error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for PacError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Self::MalformedPayload(inner) => (
                StatusCode::BAD_REQUEST,
                "malformed_payload",
                #[cfg(debug_assertions)]
                format!("malformed payload:\n{inner}"),
                #[cfg(not(debug_assertions))]
                "malformed payload".to_owned(),
            ),
            Self::SignatureInvalid => {
                // No body, no log of the payload: see spec §7.
                return StatusCode::UNAUTHORIZED.into_response();
            }
            Self::NoBinding(url) => (
                StatusCode::ACCEPTED,
                "no_binding",
                format!("no repository binding for {url}, dropping"),
            ),
            Self::ProviderUnavailable(inner) => {
                error!(error = ?inner, "provider unavailable");
                let mut res = (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({
                        "error_code": "provider_unavailable",
                        "message": "upstream provider unavailable, safe to replay",
                    })),
                )
                    .into_response();
                res.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from_static("30"),
                );
                return res;
            }
            Self::AccessDenied => (
                StatusCode::OK,
                "access_denied",
                "event consumed, sender not authorized to trigger CI".to_owned(),
            ),
            Self::TemplateError(key) => (
                StatusCode::OK,
                "template_error",
                format!("unresolved template key: {key}"),
            ),
            Self::SubmissionError(inner) => {
                error!(error = ?inner, "pipeline run submission failed");
                (
                    StatusCode::OK,
                    "submission_error",
                    "failed to submit PipelineRun after retries".to_owned(),
                )
            }
            Self::Internal(inner) => {
                error!(error = ?inner, "handler failed to process request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    #[cfg(debug_assertions)]
                    format!("something went wrong:\n{inner}"),
                    #[cfg(not(debug_assertions))]
                    "something went wrong".to_owned(),
                )
            }
        };

        let body = Json(json!({
            "error_code": code,
            "message": message,
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signature_invalid_has_no_body() {
        let res = PacError::SignatureInvalid.into_response();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn no_binding_is_accepted() {
        let res = PacError::NoBinding("https://example.com/o/r".to_owned()).into_response();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn provider_unavailable_sets_retry_after() {
        let res = PacError::ProviderUnavailable(anyhow::anyhow!("timeout")).into_response();
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(res.headers().get(header::RETRY_AFTER).unwrap(), "30");
    }

    #[tokio::test]
    async fn access_denied_is_consumed_ok() {
        let res = PacError::AccessDenied.into_response();
        assert_eq!(res.status(), StatusCode::OK);
    }
}
