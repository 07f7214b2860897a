use axum::extract::State;
use axum::Json;
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::{verify_password, Claims};
use crate::error::ApiError;
use crate::model::{Credentials, UserProfile};
use crate::users::load_profile;
use crate::validate::ValidatedForm;
use crate::{AppState, SESSION_TAG};

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(login))
        .routes(routes!(me))
}

#[derive(Debug, ToSchema, Serialize)]
pub struct AuthBody {
    access_token: String,
    token_type: String,
    user: UserProfile,
}

/// Get bearer token
#[utoipa::path(
    post,
    path = "/api/session/login",
    request_body = Credentials,
    responses((status = OK, body = AuthBody)),
    tag = SESSION_TAG
)]
async fn login(
    State(AppState { pool, keys, .. }): State<AppState>,
    ValidatedForm(credentials): ValidatedForm<Credentials>,
) -> Result<Json<AuthBody>, ApiError> {
    use crate::schema::users::dsl::*;

    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let found = users
        .filter(email.eq(credentials.email.trim().to_lowercase()))
        .select(crate::model::User::as_select())
        .first(&mut conn)
        .await
        .map_err(|e| {
            tracing::debug!("login: {}", e);
            ApiError::WrongCredentials
        })?;
    if !verify_password(&credentials.password, &found.password_hash) {
        return Err(ApiError::WrongCredentials);
    }

    let user = load_profile(&mut conn, found.user_id).await?;
    let access_token = keys.issue(&user)?;
    tracing::info!("{} signed in as {}", user.email, user.role);

    Ok(Json(AuthBody {
        access_token,
        token_type: "Bearer".to_string(),
        user,
    }))
}

/// Profile of the signed-in user
#[utoipa::path(
    get,
    path = "/api/session/me",
    responses((status = OK, body = UserProfile)),
    tag = SESSION_TAG,
    security(("bearer_jwt" = []))
)]
async fn me(
    claims: Claims,
    State(AppState { pool, .. }): State<AppState>,
) -> Result<Json<UserProfile>, ApiError> {
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    Ok(Json(load_profile(&mut conn, claims.user_id).await?))
}
