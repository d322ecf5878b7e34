use axum::{RequestPartsExt, extract::FromRequestParts, http::StatusCode, response::IntoResponse};
use axum_extra::{
    TypedHeader,
    headers::{self, authorization::Basic},
};
use serde::Serialize;
use valuable::Valuable;

use super::AppState;
use crate::config::FRONTEND_USER;

pub const ROLE_HEADER: &str = "X-Sortlab-Role";
pub const LAB_ROLE: &str = "lab";

/// A request made by the web frontend on behalf of a user holding the lab role.
///
/// The frontend authenticates itself with basic auth and forwards the session's role in
/// [`ROLE_HEADER`]. Development servers accept every request.
pub(super) struct LabUser;

impl FromRequestParts<AppState> for LabUser {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AppState::Prod { config, .. } = state else {
            return Ok(Self);
        };

        let Ok(TypedHeader(headers::Authorization(credentials))) = parts
            .extract::<TypedHeader<headers::Authorization<Basic>>>()
            .await
        else {
            return Err(Error::InvalidFrontendCredentials);
        };

        let expected_token = config.frontend_token();
        if expected_token.is_empty()
            || (credentials.username(), credentials.password()) != (FRONTEND_USER, expected_token)
        {
            return Err(Error::InvalidFrontendCredentials);
        }

        let role = parts
            .headers
            .get(ROLE_HEADER)
            .and_then(|r| r.to_str().ok())
            .unwrap_or_default();

        if role != LAB_ROLE {
            return Err(Error::MissingRole {
                required: LAB_ROLE.to_string(),
            });
        }

        Ok(Self)
    }
}

#[derive(thiserror::Error, Serialize, Debug, Clone, Valuable)]
#[serde(rename_all = "snake_case", tag = "type")]
pub(super) enum Error {
    #[error("invalid frontend credentials")]
    InvalidFrontendCredentials,
    #[error("missing role {required}")]
    MissingRole { required: String },
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        tracing::error!(auth_error = self.as_value());

        #[derive(Serialize)]
        struct ErrorResponse {
            status: u16,
            error: Error,
        }

        let status = match self {
            Self::InvalidFrontendCredentials => StatusCode::UNAUTHORIZED,
            Self::MissingRole { .. } => StatusCode::FORBIDDEN,
        };

        (
            status,
            axum::Json(ErrorResponse {
                status: status.as_u16(),
                error: self,
            }),
        )
            .into_response()
    }
}
