use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use strider_core::{RouteError, UpstreamError};
use strider_engine::EngineError;

use crate::token::TokenError;

/// Error surfaced by an HTTP handler, rendered as status + plain text.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No token")]
    NoToken,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("upstream: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoToken | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(_: TokenError) -> Self {
        Self::NoToken
    }
}

impl From<RouteError> for ApiError {
    fn from(e: RouteError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::AlreadyWalking | EngineError::NoViewer => Self::Conflict(e.to_string()),
            EngineError::InvalidRoute(e) => e.into(),
            EngineError::Upstream(e) => Self::Upstream(e),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::from(TokenError::Missing).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(EngineError::NoViewer).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(EngineError::AlreadyWalking).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(EngineError::InvalidRoute(RouteError::Empty)).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(UpstreamError::Network("down".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn no_token_body() {
        assert_eq!(ApiError::NoToken.to_string(), "No token");
    }
}
