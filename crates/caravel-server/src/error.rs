use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use caravel_types::CaravelError;

/// Server error mapping the engine taxonomy to HTTP status codes.
#[derive(Debug)]
pub struct ServerError {
    status: StatusCode,
    message: String,
}

impl ServerError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl From<CaravelError> for ServerError {
    fn from(error: CaravelError) -> Self {
        let status = match &error {
            CaravelError::BadFileFormat(_) | CaravelError::ParameterOutOfRange(_) => {
                StatusCode::BAD_REQUEST
            }
            CaravelError::UnknownResource(_) => StatusCode::NOT_FOUND,
            CaravelError::BadSequenceOfCalls(_) => StatusCode::CONFLICT,
            CaravelError::NetworkProtocol(_) | CaravelError::CorruptedFile(_) => {
                StatusCode::BAD_GATEWAY
            }
            CaravelError::CannotWriteFile(_)
            | CaravelError::Io(_)
            | CaravelError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        tracing::error!(status = %self.status, error = %self.message);
        (self.status, self.message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_kinds_map_to_status_codes() {
        let cases = [
            (CaravelError::BadFileFormat("x".into()), StatusCode::BAD_REQUEST),
            (CaravelError::ParameterOutOfRange("x".into()), StatusCode::BAD_REQUEST),
            (CaravelError::UnknownResource("x".into()), StatusCode::NOT_FOUND),
            (CaravelError::BadSequenceOfCalls("x".into()), StatusCode::CONFLICT),
            (CaravelError::NetworkProtocol("x".into()), StatusCode::BAD_GATEWAY),
            (CaravelError::CorruptedFile("x".into()), StatusCode::BAD_GATEWAY),
            (CaravelError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            assert_eq!(ServerError::from(error).status, expected);
        }
    }
}
