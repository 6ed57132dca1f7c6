//! Error handling.

use axum::{
    extract::rejection::JsonRejection,
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::error::Error;
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};

use crate::engine::Phase;

/// Outcome of an operator invocation.
///
/// Discriminants are ordered so that the error with the highest code wins when the statuses of
/// all workers are combined with a MAX reduction. `Success` is the only non-error status.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success = 0,
    UtilityError = 1,
    InvalidParam = 2,
    MemoryErr = 3,
    CatalogError = 4,
    NullOperatorHandle = 5,
}

impl Status {
    /// Numeric code used on the wire.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Status for a numeric code. Unknown codes are treated as generic failures.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Status::Success,
            2 => Status::InvalidParam,
            3 => Status::MemoryErr,
            4 => Status::CatalogError,
            5 => Status::NullOperatorHandle,
            _ => Status::UtilityError,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// HTTP status used when a report with this status is returned to a client.
    pub fn http_status(self) -> StatusCode {
        match self {
            Status::Success => StatusCode::OK,
            Status::InvalidParam | Status::MemoryErr => StatusCode::BAD_REQUEST,
            Status::NullOperatorHandle => StatusCode::NOT_FOUND,
            Status::UtilityError | Status::CatalogError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Datacube framework error type
///
/// This type encapsulates the various errors that may occur.
/// Each variant maps onto a [Status] and, at the HTTP boundary, an API error response.
#[derive(Debug, Error)]
pub enum CubeError {
    /// Malformed subset, fragment-id or coordinate expression
    #[error("invalid expression \"{expr}\": {reason}")]
    Parse { expr: String, reason: String },

    /// Index outside the declared dimension size
    #[error("{what} {value} is out of bounds (max {max})")]
    Bounds {
        what: &'static str,
        value: u64,
        max: u64,
    },

    /// Two datacubes cannot be combined fragment by fragment
    #[error("datacubes are not comparable: {0}")]
    Comparison(String),

    /// Metadata catalog failure
    #[error("metadata catalog error: {0}")]
    Catalog(String),

    /// Fragment storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// A collective step observed a failure on some worker
    #[error("collective step failed during {phase}")]
    Utility { phase: Phase },

    /// Insufficient memory to process request
    #[error("Insufficient memory to process request ({requested} > {total})")]
    InsufficientMemory { requested: usize, total: usize },

    /// Invalid operator parameter value
    #[error("invalid value for parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },

    /// Missing mandatory operator parameter
    #[error("missing required parameter {0}")]
    MissingParam(String),

    /// Unknown measure or coordinate type name
    #[error("unsupported data type {0}")]
    UnsupportedType(String),

    /// Unsupported operator requested
    #[error("unsupported operator {operator}")]
    UnsupportedOperator { operator: String },

    /// Catalog object does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Session may not access a folder
    #[error("session is not authorised to access folder {folder}")]
    PermissionDenied { folder: u64 },

    /// Error converting from bytes to a type
    #[error("failed to convert from bytes to {type_name}")]
    FromBytes { type_name: &'static str },

    /// Error compressing or decompressing fragment rows
    #[error("failed to (de)compress fragment data")]
    Compression(#[from] std::io::Error),

    /// Error serialising a collective message
    #[error("failed to encode collective message")]
    Message(#[from] serde_json::Error),

    /// Error deserialising request data into InvocationRequest
    #[error("request data is not valid")]
    RequestDataJsonRejection(#[from] JsonRejection),

    /// Error validating InvocationRequest
    #[error("request data is not valid")]
    RequestDataValidation(#[from] validator::ValidationErrors),

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    /// A worker task panicked or was cancelled
    #[error("worker task failed")]
    Join(#[from] tokio::task::JoinError),
}

impl CubeError {
    /// Status reported for this error.
    pub fn status(&self) -> Status {
        match self {
            CubeError::Parse { .. }
            | CubeError::Bounds { .. }
            | CubeError::Comparison(_)
            | CubeError::InvalidParam { .. }
            | CubeError::MissingParam(_)
            | CubeError::UnsupportedType(_)
            | CubeError::RequestDataJsonRejection(_)
            | CubeError::RequestDataValidation(_) => Status::InvalidParam,

            CubeError::InsufficientMemory { .. } | CubeError::SemaphoreAcquireError(_) => {
                Status::MemoryErr
            }

            CubeError::Catalog(_)
            | CubeError::Storage(_)
            | CubeError::NotFound(_)
            | CubeError::PermissionDenied { .. }
            | CubeError::FromBytes { .. }
            | CubeError::Compression(_) => Status::CatalogError,

            CubeError::UnsupportedOperator { .. } => Status::NullOperatorHandle,

            CubeError::Utility { .. }
            | CubeError::Message(_)
            | CubeError::TryFromInt(_)
            | CubeError::Join(_) => Status::UtilityError,
        }
    }
}

impl IntoResponse for CubeError {
    /// Convert from a `CubeError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Status of the failed invocation
    status: Status,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    fn new(error: &CubeError) -> Self {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorBody {
            message,
            status: error.status(),
            caused_by,
        }
    }
}

/// A response to send in error cases
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl From<CubeError> for ErrorResponse {
    /// Convert from a `CubeError` into an `ErrorResponse`.
    fn from(error: CubeError) -> Self {
        let response = ErrorResponse {
            status: error.status().http_status(),
            error: ErrorBody::new(&error),
        };

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hyper::HeaderMap;

    // Jump through the hoops to get the body as a string.
    async fn body_string(response: Response) -> String {
        String::from_utf8(
            hyper::body::to_bytes(response.into_body())
                .await
                .unwrap()
                .to_vec(),
        )
        .unwrap()
    }

    async fn test_cube_error(
        error: CubeError,
        status: StatusCode,
        message: &str,
        caused_by: Option<Vec<&'static str>>,
    ) {
        let expected_status = error.status();
        let response = error.into_response();
        assert_eq!(status, response.status());
        let mut headers = HeaderMap::new();
        headers.insert(&header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert_eq!(headers, *response.headers());
        let error_response: ErrorResponse =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(message.to_string(), error_response.error.message);
        assert_eq!(expected_status, error_response.error.status);
        // Map Vec items from str to String
        let caused_by = caused_by.map(|cb| cb.iter().map(|s| s.to_string()).collect());
        assert_eq!(caused_by, error_response.error.caused_by);
    }

    #[test]
    fn status_codes_order_errors_above_success() {
        assert!(Status::Success < Status::UtilityError);
        for status in [
            Status::UtilityError,
            Status::InvalidParam,
            Status::MemoryErr,
            Status::CatalogError,
            Status::NullOperatorHandle,
        ] {
            assert!(status.code() > Status::Success.code());
            assert_eq!(status, Status::from_code(status.code()));
        }
        assert_eq!(Status::UtilityError, Status::from_code(42));
    }

    #[test]
    fn status_display() {
        assert_eq!("SUCCESS", Status::Success.to_string());
        assert_eq!("INVALID_PARAM", Status::InvalidParam.to_string());
        assert_eq!("NULL_OPERATOR_HANDLE", Status::NullOperatorHandle.to_string());
    }

    #[tokio::test]
    async fn parse_error() {
        let error = CubeError::Parse {
            expr: "1:x".to_string(),
            reason: "\"x\" is not a valid index".to_string(),
        };
        let message = "invalid expression \"1:x\": \"x\" is not a valid index";
        test_cube_error(error, StatusCode::BAD_REQUEST, message, None).await;
    }

    #[tokio::test]
    async fn bounds_error() {
        let error = CubeError::Bounds {
            what: "index",
            value: 11,
            max: 10,
        };
        let message = "index 11 is out of bounds (max 10)";
        test_cube_error(error, StatusCode::BAD_REQUEST, message, None).await;
    }

    #[tokio::test]
    async fn compression_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::InvalidInput, "corrupt deflate stream");
        let error = CubeError::Compression(io_error);
        let message = "failed to (de)compress fragment data";
        let caused_by = Some(vec!["corrupt deflate stream"]);
        test_cube_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, caused_by).await;
    }

    #[tokio::test]
    async fn utility_error() {
        let error = CubeError::Utility {
            phase: Phase::TaskExecute,
        };
        let message = "collective step failed during task_execute";
        test_cube_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, None).await;
    }

    #[tokio::test]
    async fn insufficient_memory() {
        let error = CubeError::InsufficientMemory {
            requested: 2,
            total: 1,
        };
        let message = "Insufficient memory to process request (2 > 1)";
        test_cube_error(error, StatusCode::BAD_REQUEST, message, None).await;
    }

    #[tokio::test]
    async fn request_data_validation() {
        let mut validation_errors = validator::ValidationErrors::new();
        let validation_error = validator::ValidationError::new("foo");
        validation_errors.add("bar", validation_error);
        let error = CubeError::RequestDataValidation(validation_errors);
        let message = "request data is not valid";
        let caused_by = Some(vec!["bar: Validation error: foo [{}]"]);
        test_cube_error(error, StatusCode::BAD_REQUEST, message, caused_by).await;
    }

    #[tokio::test]
    async fn semaphore_acquire_error() {
        let sem = tokio::sync::Semaphore::new(1);
        sem.close();
        let error = CubeError::SemaphoreAcquireError(sem.acquire().await.unwrap_err());
        let message = "error acquiring resources";
        let caused_by = Some(vec!["semaphore closed"]);
        test_cube_error(error, StatusCode::BAD_REQUEST, message, caused_by).await;
    }

    #[tokio::test]
    async fn try_from_int_error() {
        let error = CubeError::TryFromInt(u8::try_from(-1_i8).unwrap_err());
        let message = "out of range integral type conversion attempted";
        test_cube_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, None).await;
    }

    #[tokio::test]
    async fn catalog_not_found() {
        let error = CubeError::NotFound("datacube 7".to_string());
        test_cube_error(error, StatusCode::INTERNAL_SERVER_ERROR, "datacube 7 not found", None)
            .await;
    }

    #[tokio::test]
    async fn unsupported_operator() {
        let error = CubeError::UnsupportedOperator {
            operator: "foo".to_string(),
        };
        let message = "unsupported operator foo";
        test_cube_error(error, StatusCode::NOT_FOUND, message, None).await;
    }
}
