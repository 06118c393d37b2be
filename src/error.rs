use actix_web::{http::StatusCode, HttpResponse};
use serde::Serialize;
use snafu::Snafu;

use crate::message::MessageId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Unauthorized"))]
    Unauthorized,

    #[snafu(display("Invalid header: {header}"))]
    InvalidHeader { header: String },

    #[snafu(display("Invalid request: {message}"))]
    Validation { message: String },

    #[snafu(display("Payload of {size} bytes exceeds the limit of {limit} bytes"))]
    PayloadTooLarge { size: usize, limit: usize },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Lease token for message {message_id} is stale or the message is finalized"))]
    StaleToken { message_id: MessageId },

    #[snafu(display("Store unavailable: {message}"))]
    StoreUnavailable {
        message: String,
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::StoreUnavailable {
            message: source.to_string(),
            source: Some(source.into()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation {
            message: e.to_string(),
        }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn opaque() -> Self {
        Self::InternalServerError { source: None }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn topic_not_found(topic: impl AsRef<str>, subtopic: impl AsRef<str>) -> Self {
        let (topic, subtopic) = (topic.as_ref(), subtopic.as_ref());
        Self::NotFound {
            resource: if subtopic.is_empty() {
                format!("topic {topic}")
            } else {
                format!("topic {topic}/{subtopic}")
            },
        }
    }

    pub fn message_not_found(id: MessageId) -> Self {
        Self::NotFound {
            resource: format!("message {id}"),
        }
    }

    pub fn stale_token(message_id: MessageId) -> Self {
        Self::StaleToken { message_id }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Stable, machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::InvalidHeader { .. } | Self::Validation { .. } => "ValidationError",
            Self::PayloadTooLarge { .. } => "PayloadTooLarge",
            Self::NotFound { .. } => "NotFound",
            Self::StaleToken { .. } => "StaleToken",
            Self::StoreUnavailable { .. } => "StoreUnavailable",
            Self::Migration { .. } | Self::InternalServerError { .. } => "InternalError",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    retryable: bool,
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::StaleToken { .. } => StatusCode::CONFLICT,

            Self::InvalidHeader { .. } | Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            Self::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,

            Self::Migration { .. } | Self::InternalServerError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let Self::InternalServerError {
            source: Some(source),
        } = self
        {
            tracing::error!("internal error: {source:?}");
        }

        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        })
    }
}

#[cfg(test)]
mod tests {
    use actix_web::ResponseError;

    use super::*;

    #[test]
    fn test_status_codes_keep_kinds_apart() {
        let id = MessageId::new();

        assert_eq!(
            Error::validation("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::topic_not_found("ci-jobs", "").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(Error::stale_token(id).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            Error::store_unavailable("down").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(Error::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_only_store_errors_are_retryable() {
        assert!(Error::store_unavailable("down").is_retryable());
        assert!(!Error::stale_token(MessageId::new()).is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::opaque().is_retryable());
    }

    #[test]
    fn test_topic_not_found_names_subtopic() {
        assert_eq!(
            Error::topic_not_found("ci-jobs", "linux").to_string(),
            "Resource not found: topic ci-jobs/linux"
        );
        assert_eq!(
            Error::topic_not_found("ci-jobs", "").to_string(),
            "Resource not found: topic ci-jobs"
        );
    }
}
