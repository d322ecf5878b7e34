use std::sync::LazyLock;

use diesel::result::DatabaseErrorInformation;
use diesel_async::pooled_connection::deadpool;
use regex::Regex;
use serde::Serialize;
use valuable::Valuable;

static CONSTRAINT_DETAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Key \((.+)\)=\((.+)\).+").unwrap()); // This isn't perfect

#[derive(thiserror::Error, Debug, Serialize, Valuable, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Error {
    #[error("slot {position} on rack {rack_id} is already taken")]
    SlotTaken {
        rack_id: i32,
        position: i16,
        occupant_id: Option<i32>,
    },
    #[error("slot {position} on rack {rack_id} holds sample {occupant_id}, not {expected_id}")]
    OccupantMismatch {
        rack_id: i32,
        position: i16,
        expected_id: i32,
        occupant_id: i32,
    },
    #[error("sample {sample_id} is already placed in another slot")]
    SampleAlreadyPlaced { sample_id: i32 },
    #[error("{entity} with {} = {} already exists", field.clone().unwrap_or_default(), value.clone().unwrap_or_default())]
    DuplicateRecord {
        entity: String,
        field: Option<String>,
        value: Option<String>,
    },
    #[error("unable to create reference between {entity} and {referenced_entity}: {} not found", value.clone().unwrap_or_default())]
    ReferenceNotFound {
        entity: String,
        referenced_entity: String,
        value: Option<String>,
    },
    #[error("{} {} not found", entity.as_deref().unwrap_or("record"), id.clone().unwrap_or_default())]
    RecordNotFound {
        entity: Option<String>,
        id: Option<String>,
    },
    #[error("invalid data: {message}")]
    InvalidData { message: String },
    #[error("{message}")]
    Other { message: String },
}

impl Error {
    pub(crate) fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::RecordNotFound {
            entity: Some(entity.to_string()),
            id: Some(id.to_string()),
        }
    }

    fn from_other_error(err: impl std::error::Error) -> Self {
        Self::Other {
            message: format!("{err:?}"),
        }
    }

    /// Whether this error is a unique-constraint violation on `field`
    pub(crate) fn is_duplicate_of(&self, field_name: &str) -> bool {
        matches!(self, Self::DuplicateRecord { field: Some(field), .. } if field == field_name)
    }
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::Error::{DatabaseError, NotFound};
        match err {
            DatabaseError(kind, info) => Self::from((kind, info)),
            NotFound => Self::RecordNotFound {
                entity: None,
                id: None,
            },
            _ => Self::from_other_error(err),
        }
    }
}

impl From<deadpool::PoolError> for Error {
    fn from(err: deadpool::PoolError) -> Self {
        Self::from_other_error(err)
    }
}

impl From<diesel::ConnectionError> for Error {
    fn from(err: diesel::ConnectionError) -> Self {
        Self::from_other_error(err)
    }
}

impl From<garde::Report> for Error {
    fn from(err: garde::Report) -> Self {
        Self::InvalidData {
            message: format!("{err:#}"),
        }
    }
}

impl
    From<(
        diesel::result::DatabaseErrorKind,
        Box<dyn DatabaseErrorInformation + Send + Sync>,
    )> for Error
{
    fn from(
        (kind, info): (
            diesel::result::DatabaseErrorKind,
            Box<dyn DatabaseErrorInformation + Send + Sync>,
        ),
    ) -> Self {
        use diesel::result::DatabaseErrorKind::{
            CheckViolation, ForeignKeyViolation, UniqueViolation,
        };
        let entity = info.table_name().unwrap_or_default();

        let details = info.details().unwrap_or_default();
        let field_value: Vec<String> = CONSTRAINT_DETAIL
            .captures(details)
            .and_then(|cap| {
                cap.iter()
                    .take(3)
                    .map(|m| m.map(|s| s.as_str().to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let field = field_value.get(1).cloned();
        let value = field_value.get(2).cloned();

        match kind {
            UniqueViolation => Self::DuplicateRecord {
                entity: entity.to_string(),
                field,
                value,
            },
            ForeignKeyViolation => {
                let referenced_entity = details
                    .split_whitespace()
                    .last()
                    .unwrap_or_default()
                    .replace('"', "");
                let referenced_entity = referenced_entity.strip_suffix('.').unwrap_or_default();

                Self::ReferenceNotFound {
                    entity: entity.to_string(),
                    referenced_entity: referenced_entity.to_string(),
                    value,
                }
            }
            CheckViolation => Self::InvalidData {
                message: format!(
                    "{entity} violates constraint {}",
                    info.constraint_name().unwrap_or_default()
                ),
            },
            _ => Self::from_other_error(diesel::result::Error::DatabaseError(kind, info)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Error;

    #[test]
    fn not_found_names_entity_and_id() {
        let err = Error::not_found("rack", 7);

        assert_eq!(err.to_string(), "rack 7 not found");
    }

    #[test]
    fn diesel_not_found_is_record_not_found() {
        let err = Error::from(diesel::result::Error::NotFound);

        assert!(matches!(
            err,
            Error::RecordNotFound {
                entity: None,
                id: None
            }
        ));
    }

    #[test]
    fn duplicate_field_detection() {
        let err = Error::DuplicateRecord {
            entity: "rack_slot".to_string(),
            field: Some("sample_id".to_string()),
            value: Some("4".to_string()),
        };

        assert!(err.is_duplicate_of("sample_id"));
        assert!(!err.is_duplicate_of("rfid"));
    }
}
