use axum::extract::{Query, State};
use axum::Json;
use diesel::dsl::insert_into;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::Claims;
use crate::error::{db_error, not_found, ApiError};
use crate::model::{
    BuildingAssignment, CareerFilter, ClassroomAssignment, EntityId, Group, GroupChanges,
    LeaderAssignment, NewGroup, Role,
};
use crate::schema::{class_groups, roles, users};
use crate::validate::ValidatedForm;
use crate::{AppState, GROUPS_TAG};

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(get_group, create_group, update_group, delete_group))
        .routes(routes!(list_groups))
        .routes(routes!(assign_classroom))
        .routes(routes!(assign_building))
        .routes(routes!(assign_leader))
        .routes(routes!(list_classrooms))
        .routes(routes!(list_group_buildings))
        .routes(routes!(my_group))
}

/// The group whose leader account matches the caller.
pub(crate) async fn led_group(
    conn: &mut AsyncPgConnection,
    claims: &Claims,
) -> Result<Group, ApiError> {
    let account = claims
        .account_number
        .as_deref()
        .ok_or(ApiError::NotFound("Group led by this account"))?;
    class_groups::table
        .filter(class_groups::leader_account.eq(account))
        .select(Group::as_select())
        .first(conn)
        .await
        .map_err(not_found("led_group", "Group led by this account"))
}

/// Only group leaders may lead a group, and only one group each.
fn check_leader(account: &str, role: &str, already_leads: Option<&str>) -> Result<(), ApiError> {
    if role != Role::GroupLeader.as_str() {
        return Err(ApiError::Validation(format!(
            "account {account} does not belong to a group leader"
        )));
    }
    match already_leads {
        Some(other) => Err(ApiError::Conflict(format!(
            "account {account} already leads group {other}"
        ))),
        None => Ok(()),
    }
}

async fn ensure_unique_name(
    conn: &mut AsyncPgConnection,
    name: &str,
    except: Option<i32>,
) -> Result<(), ApiError> {
    let taken = class_groups::table
        .filter(class_groups::group_name.eq(name))
        .select(class_groups::group_id)
        .first::<i32>(conn)
        .await
        .optional()
        .map_err(db_error("ensure_unique_name"))?;
    match taken {
        Some(found) if Some(found) != except => Err(ApiError::Conflict(format!(
            "Group {name} already exists"
        ))),
        _ => Ok(()),
    }
}

async fn update_columns(
    conn: &mut AsyncPgConnection,
    id: i32,
    changes: &GroupChanges,
) -> Result<Group, ApiError> {
    diesel::update(class_groups::table.find(id))
        .set(changes)
        .returning(Group::as_returning())
        .get_result(conn)
        .await
        .map_err(not_found("update_group", "Group"))
}

/// Get group
#[utoipa::path(get, path = "/api/groups", responses((status = OK, body = Group)), tag = GROUPS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Group database id"),
)
)]
async fn get_group(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<Json<Group>, ApiError> {
    claims.authorize(&enforcer, "group", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let group = class_groups::table
        .find(id)
        .select(Group::as_select())
        .first(&mut conn)
        .await
        .map_err(not_found("get_group", "Group"))?;
    Ok(Json(group))
}

/// List groups
#[utoipa::path(get, path = "/api/groups/list", responses((status = OK, body = Vec<Group>)), tag = GROUPS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("career_id" = Option<i32>, Query, description = "Only groups of this career"),
)
)]
async fn list_groups(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(CareerFilter { career_id }): Query<CareerFilter>,
) -> Result<Json<Vec<Group>>, ApiError> {
    claims.authorize(&enforcer, "group", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let mut query = class_groups::table
        .select(Group::as_select())
        .order(class_groups::group_name)
        .into_boxed();
    if let Some(career) = career_id {
        query = query.filter(class_groups::career_id.eq(career));
    }
    let rows = query
        .load(&mut conn)
        .await
        .map_err(db_error("list_groups"))?;
    Ok(Json(rows))
}

/// Group led by the signed-in group leader
#[utoipa::path(get, path = "/api/groups/mine", responses((status = OK, body = Group)), tag = GROUPS_TAG, security(
    ("bearer_jwt" = [])
))]
async fn my_group(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
) -> Result<Json<Group>, ApiError> {
    claims.authorize(&enforcer, "group", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    Ok(Json(led_group(&mut conn, &claims).await?))
}

/// Classrooms in use by any group
#[utoipa::path(get, path = "/api/groups/classrooms", responses((status = OK, body = Vec<String>)), tag = GROUPS_TAG, security(
    ("bearer_jwt" = [])
))]
async fn list_classrooms(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
) -> Result<Json<Vec<String>>, ApiError> {
    claims.authorize(&enforcer, "group", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let rows = class_groups::table
        .select(class_groups::classroom)
        .filter(class_groups::classroom.is_not_null())
        .distinct()
        .order(class_groups::classroom)
        .load::<Option<String>>(&mut conn)
        .await
        .map_err(db_error("list_classrooms"))?;
    Ok(Json(rows.into_iter().flatten().collect()))
}

/// Buildings in use by any group
#[utoipa::path(get, path = "/api/groups/buildings", responses((status = OK, body = Vec<String>)), tag = GROUPS_TAG, security(
    ("bearer_jwt" = [])
))]
async fn list_group_buildings(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
) -> Result<Json<Vec<String>>, ApiError> {
    claims.authorize(&enforcer, "group", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let rows = class_groups::table
        .select(class_groups::building)
        .filter(class_groups::building.is_not_null())
        .distinct()
        .order(class_groups::building)
        .load::<Option<String>>(&mut conn)
        .await
        .map_err(db_error("list_group_buildings"))?;
    Ok(Json(rows.into_iter().flatten().collect()))
}

/// Create group
#[utoipa::path(post, path = "/api/groups", request_body = NewGroup, responses((status = OK, body = Group)), tag = GROUPS_TAG, security(
    ("bearer_jwt" = [])
))]
async fn create_group(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    ValidatedForm(group): ValidatedForm<NewGroup>,
) -> Result<Json<Group>, ApiError> {
    claims.authorize(&enforcer, "group", "create")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    ensure_unique_name(&mut conn, &group.name, None).await?;
    let created = insert_into(class_groups::table)
        .values(&group)
        .returning(Group::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(db_error("create_group"))?;
    Ok(Json(created))
}

/// Update group
#[utoipa::path(put, path = "/api/groups", request_body = GroupChanges, responses((status = OK, body = Group)), tag = GROUPS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Group database id"),
)
)]
async fn update_group(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
    ValidatedForm(changes): ValidatedForm<GroupChanges>,
) -> Result<Json<Group>, ApiError> {
    claims.authorize(&enforcer, "group", "update")?;
    if changes.name.is_none()
        && changes.classroom.is_none()
        && changes.building.is_none()
        && changes.career_id.is_none()
    {
        return Err(ApiError::Validation("nothing to update".to_string()));
    }
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    if let Some(name) = &changes.name {
        ensure_unique_name(&mut conn, name, Some(id)).await?;
    }
    Ok(Json(update_columns(&mut conn, id, &changes).await?))
}

/// Assign a classroom to a group
#[utoipa::path(put, path = "/api/groups/classroom", request_body = ClassroomAssignment, responses((status = OK, body = Group)), tag = GROUPS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Group database id"),
)
)]
async fn assign_classroom(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
    ValidatedForm(ClassroomAssignment { classroom }): ValidatedForm<ClassroomAssignment>,
) -> Result<Json<Group>, ApiError> {
    claims.authorize(&enforcer, "group", "update")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let changes = GroupChanges {
        name: None,
        classroom: Some(classroom),
        building: None,
        career_id: None,
    };
    Ok(Json(update_columns(&mut conn, id, &changes).await?))
}

/// Assign a building to a group
#[utoipa::path(put, path = "/api/groups/building", request_body = BuildingAssignment, responses((status = OK, body = Group)), tag = GROUPS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Group database id"),
)
)]
async fn assign_building(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
    ValidatedForm(BuildingAssignment { building }): ValidatedForm<BuildingAssignment>,
) -> Result<Json<Group>, ApiError> {
    claims.authorize(&enforcer, "group", "update")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let changes = GroupChanges {
        name: None,
        classroom: None,
        building: Some(building),
        career_id: None,
    };
    Ok(Json(update_columns(&mut conn, id, &changes).await?))
}

/// Set or clear the group leader
#[utoipa::path(put, path = "/api/groups/leader", request_body = LeaderAssignment, responses((status = OK, body = Group)), tag = GROUPS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Group database id"),
)
)]
async fn assign_leader(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
    ValidatedForm(LeaderAssignment { account_number }): ValidatedForm<LeaderAssignment>,
) -> Result<Json<Group>, ApiError> {
    claims.authorize(&enforcer, "group", "update")?;
    let account_number = account_number.map(|account| account.trim().to_string());
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;

    if let Some(account) = &account_number {
        let role = users::table
            .inner_join(roles::table)
            .filter(users::account_number.eq(account))
            .select(roles::role_name)
            .first::<String>(&mut conn)
            .await
            .map_err(not_found("assign_leader", "User"))?;
        let led = class_groups::table
            .filter(class_groups::leader_account.eq(account))
            .filter(class_groups::group_id.ne(id))
            .select(class_groups::group_name)
            .first::<String>(&mut conn)
            .await
            .optional()
            .map_err(db_error("assign_leader"))?;
        check_leader(account, &role, led.as_deref())?;
    }

    let group = diesel::update(class_groups::table.find(id))
        .set(class_groups::leader_account.eq(&account_number))
        .returning(Group::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(not_found("assign_leader", "Group"))?;
    tracing::info!(
        "group {} leader set to {:?}",
        group.group_name,
        group.leader_account
    );
    Ok(Json(group))
}

/// Delete group
#[utoipa::path(delete, path = "/api/groups", responses((status = OK, body = ())), tag = GROUPS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Group database id"),
)
)]
async fn delete_group(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<(), ApiError> {
    claims.authorize(&enforcer, "group", "delete")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    if diesel::delete(class_groups::table.find(id))
        .execute(&mut conn)
        .await
        .map_err(db_error("delete_group"))?
        == 0
    {
        Err(ApiError::NotFound("Group"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_group_leaders_can_lead() {
        assert!(check_leader("A1", "group_leader", None).is_ok());
    }

    #[test]
    fn other_roles_cannot_lead() {
        for role in ["student", "teacher", "checker", "administrator"] {
            let err = check_leader("A1", role, None).unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)), "{role}");
        }
    }

    #[test]
    fn a_leader_leads_one_group_only() {
        let err = check_leader("A1", "group_leader", Some("ICO-21")).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        assert_eq!(err.to_string(), "account A1 already leads group ICO-21");
    }
}
