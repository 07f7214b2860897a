use axum::{
    async_trait,
    extract::{FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::error::ApiError;

/// JSON body that only reaches the handler once it passes its `validator` rules.
///
/// Malformed JSON and failed rules are both rejected as [`ApiError::InvalidBody`],
/// before the handler (or any query) runs.
#[derive(Debug)]
pub struct ValidatedForm<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidatedForm<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::InvalidBody(rejection.body_text()))?;
        value
            .validate()
            .map_err(|e| ApiError::InvalidBody(e.to_string()))?;
        Ok(ValidatedForm(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, StatusCode};

    use crate::model::{CareerForm, Credentials};

    fn json_request(body: &str) -> Request {
        Request::builder()
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn valid_bodies_pass_through() {
        let ValidatedForm(career) = ValidatedForm::<CareerForm>::from_request(
            json_request(r#"{"name": "Computer Engineering", "semester_count": 9}"#),
            &(),
        )
        .await
        .unwrap();
        assert_eq!(career.name, "Computer Engineering");
        assert_eq!(career.semester_count, 9);
    }

    #[tokio::test]
    async fn broken_rules_name_the_field() {
        let err = ValidatedForm::<Credentials>::from_request(
            json_request(r#"{"email": "", "password": "secret"}"#),
            &(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(matches!(&err, ApiError::InvalidBody(msg) if msg.contains("email is required")));
        assert!(!err.to_string().contains("Failed to deserialize"));

        let err = ValidatedForm::<CareerForm>::from_request(
            json_request(r#"{"name": "Law", "semester_count": 0}"#),
            &(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("semester count must be between 1 and 12"));
    }

    #[tokio::test]
    async fn malformed_json_is_an_invalid_body() {
        let err = ValidatedForm::<CareerForm>::from_request(json_request("{not json"), &())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidBody(_)));
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
