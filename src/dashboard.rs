use axum::extract::State;
use axum::Json;
use diesel::{ExpressionMethods, QueryDsl};
use diesel_async::RunQueryDsl;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::Claims;
use crate::error::{db_error, ApiError};
use crate::model::Role;
use crate::schema::{careers, class_groups, roles, schedule_slots, subjects, users};
use crate::{AppState, DASHBOARD_TAG};

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().routes(routes!(dashboard))
}

#[derive(Debug, ToSchema, Serialize)]
pub struct Stats {
    users: i64,
    teachers: i64,
    students: i64,
    groups: i64,
    subjects: i64,
    careers: i64,
    schedules: i64,
}

/// Totals for the administrator's overview
#[utoipa::path(get, path = "/api/dashboard", responses((status = OK, body = Stats)), tag = DASHBOARD_TAG, security(
    ("bearer_jwt" = [])
))]
async fn dashboard(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
) -> Result<Json<Stats>, ApiError> {
    claims.authorize(&enforcer, "dashboard", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let failed = db_error("dashboard");

    let by_role = |role: Role| {
        users::table
            .inner_join(roles::table)
            .filter(roles::role_name.eq(role.as_str()))
            .count()
    };

    Ok(Json(Stats {
        users: users::table
            .count()
            .get_result(&mut conn)
            .await
            .map_err(&failed)?,
        teachers: by_role(Role::Teacher)
            .get_result(&mut conn)
            .await
            .map_err(&failed)?,
        students: by_role(Role::Student)
            .get_result(&mut conn)
            .await
            .map_err(&failed)?,
        groups: class_groups::table
            .count()
            .get_result(&mut conn)
            .await
            .map_err(&failed)?,
        subjects: subjects::table
            .count()
            .get_result(&mut conn)
            .await
            .map_err(&failed)?,
        careers: careers::table
            .count()
            .get_result(&mut conn)
            .await
            .map_err(&failed)?,
        schedules: schedule_slots::table
            .count()
            .get_result(&mut conn)
            .await
            .map_err(&failed)?,
    }))
}
