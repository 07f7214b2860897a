use axum::extract::{Query, State};
use axum::Json;
use diesel::dsl::insert_into;
use diesel::{QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::Claims;
use crate::error::{db_error, not_found, ApiError};
use crate::model::{Building, BuildingForm, EntityId};
use crate::schema::buildings::dsl::*;
use crate::validate::ValidatedForm;
use crate::{AppState, BUILDINGS_TAG};

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(
            get_building,
            create_building,
            update_building,
            delete_building
        ))
        .routes(routes!(list_buildings))
}

/// Get building
#[utoipa::path(get, path = "/api/buildings", responses((status = OK, body = Building)), tag = BUILDINGS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Building database id"),
)
)]
async fn get_building(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<Json<Building>, ApiError> {
    claims.authorize(&enforcer, "building", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let building = buildings
        .find(id)
        .select(Building::as_select())
        .first(&mut conn)
        .await
        .map_err(not_found("get_building", "Building"))?;
    Ok(Json(building))
}

/// List buildings
#[utoipa::path(get, path = "/api/buildings/list", responses((status = OK, body = Vec<Building>)), tag = BUILDINGS_TAG, security(
    ("bearer_jwt" = [])
))]
async fn list_buildings(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
) -> Result<Json<Vec<Building>>, ApiError> {
    claims.authorize(&enforcer, "building", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let rows = buildings
        .select(Building::as_select())
        .order((faculty, building_name))
        .load(&mut conn)
        .await
        .map_err(db_error("list_buildings"))?;
    Ok(Json(rows))
}

/// Create building
#[utoipa::path(post, path = "/api/buildings", request_body = BuildingForm, responses((status = OK, body = Building)), tag = BUILDINGS_TAG, security(
    ("bearer_jwt" = [])
))]
async fn create_building(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    ValidatedForm(building): ValidatedForm<BuildingForm>,
) -> Result<Json<Building>, ApiError> {
    claims.authorize(&enforcer, "building", "create")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let created = insert_into(buildings)
        .values(&building)
        .returning(Building::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(db_error("create_building"))?;
    Ok(Json(created))
}

/// Update building
#[utoipa::path(put, path = "/api/buildings", request_body = BuildingForm, responses((status = OK, body = Building)), tag = BUILDINGS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Building database id"),
)
)]
async fn update_building(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
    ValidatedForm(building): ValidatedForm<BuildingForm>,
) -> Result<Json<Building>, ApiError> {
    claims.authorize(&enforcer, "building", "update")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let updated = diesel::update(buildings.find(id))
        .set(&building)
        .returning(Building::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(not_found("update_building", "Building"))?;
    Ok(Json(updated))
}

/// Delete building
#[utoipa::path(delete, path = "/api/buildings", responses((status = OK, body = ())), tag = BUILDINGS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Building database id"),
)
)]
async fn delete_building(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<(), ApiError> {
    claims.authorize(&enforcer, "building", "delete")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    if diesel::delete(buildings.find(id))
        .execute(&mut conn)
        .await
        .map_err(db_error("delete_building"))?
        == 0
    {
        Err(ApiError::NotFound("Building"))
    } else {
        Ok(())
    }
}
