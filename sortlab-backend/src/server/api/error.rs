use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::QueryRejection;
use diesel_async::pooled_connection::deadpool;
use serde::Serialize;
use valuable::Valuable;

use crate::{db, equipment::sequencer::SequenceFailure};

#[derive(thiserror::Error, Serialize, Debug, Clone, Valuable)]
#[serde(untagged)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] db::Error),
    #[error(transparent)]
    Equipment(#[from] SequenceFailure),
    #[error("simple invalid data")]
    SimpleData { reason: String },
    #[error("malformed request")]
    MalformedRequest {
        #[serde(skip)]
        #[valuable(skip)]
        status: StatusCode,
        message: String,
    },
}

impl Error {
    fn status_code(&self) -> StatusCode {
        use Error::{Database, Equipment, MalformedRequest, SimpleData};
        use db::Error::{
            DuplicateRecord, InvalidData, OccupantMismatch, Other, RecordNotFound,
            ReferenceNotFound, SampleAlreadyPlaced, SlotTaken,
        };

        match self {
            SimpleData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Equipment(_) => StatusCode::BAD_GATEWAY,
            Database(inner) => match inner {
                SlotTaken { .. }
                | OccupantMismatch { .. }
                | SampleAlreadyPlaced { .. }
                | DuplicateRecord { .. } => StatusCode::CONFLICT,
                RecordNotFound { .. } => StatusCode::NOT_FOUND,
                ReferenceNotFound { .. } | InvalidData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                Other { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            MalformedRequest { status, .. } => *status,
        }
    }

    /// Broad classification shown to clients next to the detailed error
    fn kind(&self) -> &'static str {
        match self {
            Self::SimpleData { .. } => "validation",
            Self::MalformedRequest { .. } => "malformed_request",
            Self::Equipment(_) => "equipment",
            Self::Database(_) => match self.status_code() {
                StatusCode::CONFLICT => "conflict",
                StatusCode::NOT_FOUND => "not_found",
                StatusCode::UNPROCESSABLE_ENTITY => "validation",
                _ => "storage",
            },
        }
    }
}

impl From<JsonRejection> for Error {
    fn from(err: JsonRejection) -> Self {
        Self::MalformedRequest {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl From<QueryRejection> for Error {
    fn from(err: QueryRejection) -> Self {
        Self::MalformedRequest {
            status: err.status(),
            message: format!("{err:#}"),
        }
    }
}

impl From<PathRejection> for Error {
    fn from(err: PathRejection) -> Self {
        Self::MalformedRequest {
            status: err.status(),
            message: err.body_text(),
        }
    }
}

impl From<deadpool::PoolError> for Error {
    fn from(err: deadpool::PoolError) -> Self {
        Self::Database(db::Error::from(err))
    }
}

impl From<garde::Report> for Error {
    fn from(err: garde::Report) -> Self {
        Self::SimpleData {
            reason: format!("{err:#}"),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        tracing::error!(error = self.as_value());

        #[derive(Serialize)]
        struct ErrorResponse {
            status: u16,
            kind: &'static str,
            error: Option<Error>,
        }

        let status = self.status_code();
        let kind = self.kind();

        // Storage failures may leak internals, so their details stay in the log
        let error = (status != StatusCode::INTERNAL_SERVER_ERROR).then_some(self);

        (
            status,
            axum::Json(ErrorResponse {
                status: status.as_u16(),
                kind,
                error,
            }),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
