use axum::extract::{Query, State};
use axum::Json;
use diesel::dsl::insert_into;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::Claims;
use crate::error::{db_error, not_found, ApiError};
use crate::model::{Career, CareerForm, EntityId};
use crate::schema::careers::dsl::*;
use crate::schema::subjects;
use crate::validate::ValidatedForm;
use crate::{AppState, CAREERS_TAG};

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(get_career, create_career, update_career, delete_career))
        .routes(routes!(list_careers))
}

pub(crate) async fn load_career(conn: &mut AsyncPgConnection, id: i32) -> Result<Career, ApiError> {
    careers
        .find(id)
        .select(Career::as_select())
        .first(conn)
        .await
        .map_err(not_found("load_career", "Career"))
}

async fn ensure_unique_name(
    conn: &mut AsyncPgConnection,
    name: &str,
    except: Option<i32>,
) -> Result<(), ApiError> {
    let taken = careers
        .filter(career_name.eq(name))
        .select(career_id)
        .first::<i32>(conn)
        .await
        .optional()
        .map_err(db_error("ensure_unique_name"))?;
    match taken {
        Some(found) if Some(found) != except => Err(ApiError::Conflict(format!(
            "A career named {name} already exists"
        ))),
        _ => Ok(()),
    }
}

/// The plan cannot shrink below a semester that already has subjects.
fn check_semester_count(count: i32, highest_taught: Option<i32>) -> Result<(), ApiError> {
    match highest_taught {
        Some(highest) if highest > count => Err(ApiError::Conflict(format!(
            "subjects are still taught in semester {highest}, the career needs at least {highest} semesters"
        ))),
        _ => Ok(()),
    }
}

/// Get career
#[utoipa::path(get, path = "/api/careers", responses((status = OK, body = Career)), tag = CAREERS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Career database id"),
)
)]
async fn get_career(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<Json<Career>, ApiError> {
    claims.authorize(&enforcer, "career", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    Ok(Json(load_career(&mut conn, id).await?))
}

/// List careers
#[utoipa::path(get, path = "/api/careers/list", responses((status = OK, body = Vec<Career>)), tag = CAREERS_TAG, security(
    ("bearer_jwt" = [])
))]
async fn list_careers(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
) -> Result<Json<Vec<Career>>, ApiError> {
    claims.authorize(&enforcer, "career", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let rows = careers
        .select(Career::as_select())
        .order(career_name)
        .load(&mut conn)
        .await
        .map_err(db_error("list_careers"))?;
    Ok(Json(rows))
}

/// Create career
#[utoipa::path(post, path = "/api/careers", request_body = CareerForm, responses((status = OK, body = Career)), tag = CAREERS_TAG, security(
    ("bearer_jwt" = [])
))]
async fn create_career(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    ValidatedForm(career): ValidatedForm<CareerForm>,
) -> Result<Json<Career>, ApiError> {
    claims.authorize(&enforcer, "career", "create")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    ensure_unique_name(&mut conn, &career.name, None).await?;
    let created = insert_into(careers)
        .values(&career)
        .returning(Career::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(db_error("create_career"))?;
    Ok(Json(created))
}

/// Update career
#[utoipa::path(put, path = "/api/careers", request_body = CareerForm, responses((status = OK, body = Career)), tag = CAREERS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Career database id"),
)
)]
async fn update_career(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
    ValidatedForm(career): ValidatedForm<CareerForm>,
) -> Result<Json<Career>, ApiError> {
    claims.authorize(&enforcer, "career", "update")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    ensure_unique_name(&mut conn, &career.name, Some(id)).await?;
    let highest_taught = subjects::table
        .filter(subjects::career_id.eq(id))
        .select(diesel::dsl::max(subjects::semester))
        .first::<Option<i32>>(&mut conn)
        .await
        .map_err(db_error("update_career"))?;
    check_semester_count(career.semester_count, highest_taught)?;
    let updated = diesel::update(careers.find(id))
        .set(&career)
        .returning(Career::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(not_found("update_career", "Career"))?;
    Ok(Json(updated))
}

/// Delete career
#[utoipa::path(delete, path = "/api/careers", responses((status = OK, body = ())), tag = CAREERS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Career database id"),
)
)]
async fn delete_career(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<(), ApiError> {
    claims.authorize(&enforcer, "career", "delete")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    if diesel::delete(careers.find(id))
        .execute(&mut conn)
        .await
        .map_err(db_error("delete_career"))?
        == 0
    {
        Err(ApiError::NotFound("Career"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_cannot_drop_taught_semesters() {
        let err = check_semester_count(4, Some(8)).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        assert!(err.to_string().contains("semester 8"));
    }

    #[test]
    fn plans_may_shrink_to_the_last_taught_semester() {
        assert!(check_semester_count(8, Some(8)).is_ok());
        assert!(check_semester_count(10, Some(8)).is_ok());
        assert!(check_semester_count(1, None).is_ok());
    }
}
