use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Wrong credentials")]
    WrongCredentials,
    #[error("Missing credentials")]
    MissingCredentials,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token creation error")]
    TokenCreation,
    #[error("Password hashing error")]
    PasswordHash,
    #[error("Db connection error")]
    DBConnection,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    InvalidBody(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Database(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::WrongCredentials | ApiError::MissingCredentials | ApiError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::PermissionDenied => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidBody(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::TokenCreation
            | ApiError::PasswordHash
            | ApiError::DBConnection
            | ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

impl From<DieselError> for ApiError {
    fn from(e: DieselError) -> Self {
        match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                ApiError::Conflict(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                ApiError::Validation(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::CheckViolation, info) => {
                ApiError::Validation(info.message().to_string())
            }
            other => ApiError::Database(other.to_string()),
        }
    }
}

/// Logs a failed query under the name of the operation that issued it.
pub fn db_error(op: &'static str) -> impl Fn(DieselError) -> ApiError {
    move |e| {
        tracing::debug!("{}: {}", op, e);
        ApiError::from(e)
    }
}

/// Like [`db_error`], but a missing row becomes a 404 for `entity`.
pub fn not_found(op: &'static str, entity: &'static str) -> impl Fn(DieselError) -> ApiError {
    move |e| {
        tracing::debug!("{}: {}", op, e);
        match e {
            DieselError::NotFound => ApiError::NotFound(entity),
            other => ApiError::from(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(ApiError::WrongCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::PermissionDenied.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotFound("User").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Conflict("taken".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::InvalidBody("bad".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn missing_rows_become_not_found() {
        let err = not_found("get_user", "User")(DieselError::NotFound);
        assert!(matches!(err, ApiError::NotFound("User")));
        assert_eq!(err.to_string(), "User not found");

        let err = db_error("list_users")(DieselError::NotFound);
        assert!(matches!(err, ApiError::Database(_)));
    }
}
