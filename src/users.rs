use axum::extract::{Query, State};
use axum::Json;
use diesel::dsl::insert_into;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::{hash_password, Claims};
use crate::config::AdminSeed;
use crate::error::{db_error, not_found, ApiError};
use crate::model::{
    AccountQuery, EntityId, NewUser, NewUserRow, Role, RoleEntry, UpdateUser, User, UserChanges,
    UserFilter, UserProfile,
};
use crate::schema::{class_groups, roles, schedule_slots, users};
use crate::validate::ValidatedForm;
use crate::{AppState, Pool, USERS_TAG};

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(get_user, create_user, update_user, delete_user))
        .routes(routes!(list_users))
        .routes(routes!(find_by_account))
}

fn to_profile((user, role): (User, RoleEntry)) -> Result<UserProfile, ApiError> {
    let role = role.role_name.parse::<Role>().map_err(|e| {
        tracing::debug!("to_profile: {}", e);
        ApiError::NotFound("Role")
    })?;
    Ok(UserProfile::new(user, role))
}

pub(crate) async fn load_profile(
    conn: &mut AsyncPgConnection,
    id: i32,
) -> Result<UserProfile, ApiError> {
    let row = users::table
        .inner_join(roles::table)
        .filter(users::user_id.eq(id))
        .select((User::as_select(), RoleEntry::as_select()))
        .first::<(User, RoleEntry)>(conn)
        .await
        .map_err(not_found("load_profile", "User"))?;
    to_profile(row)
}

async fn role_id_of(conn: &mut AsyncPgConnection, role: Role) -> Result<i32, ApiError> {
    roles::table
        .filter(roles::role_name.eq(role.as_str()))
        .select(roles::role_id)
        .first::<i32>(conn)
        .await
        .map_err(not_found("role_id_of", "Role"))
}

/// Trims both identifiers and lowercases the email, so lookups match what was stored.
fn normalize_identity(
    email: &str,
    account_number: Option<&str>,
) -> Result<(String, Option<String>), ApiError> {
    let account = match account_number.map(str::trim) {
        Some("") => {
            return Err(ApiError::Validation(
                "account number must not be blank".to_string(),
            ))
        }
        other => other.map(str::to_string),
    };
    Ok((email.trim().to_lowercase(), account))
}

/// Describes which identifier of the user being saved is held by someone else.
fn find_duplicate(
    email: &str,
    account_number: Option<&str>,
    holders: &[(i32, String, Option<String>)],
    except: Option<i32>,
) -> Option<String> {
    let others = holders.iter().filter(|(id, ..)| Some(*id) != except);
    for (_, held_email, held_account) in others {
        if held_email == email {
            return Some(format!("A user with email {email} already exists"));
        }
        if let Some(account) = account_number {
            if held_account.as_deref() == Some(account) {
                return Some(format!("Account number {account} is already assigned"));
            }
        }
    }
    None
}

/// Why `role` cannot be given to a user who still leads a group or teaches classes.
fn role_change_conflict(role: Role, leads_group: Option<&str>, taught_slots: i64) -> Option<String> {
    if role != Role::GroupLeader {
        if let Some(group) = leads_group {
            return Some(format!(
                "the user leads group {group}, assign another leader first"
            ));
        }
    }
    if role != Role::Teacher && taught_slots > 0 {
        return Some(format!(
            "the user still teaches {taught_slots} scheduled classes, reassign them first"
        ));
    }
    None
}

/// Rejects an email or account number already held by another user.
async fn ensure_unique(
    conn: &mut AsyncPgConnection,
    email: &str,
    account_number: Option<&str>,
    except: Option<i32>,
) -> Result<(), ApiError> {
    let mut query = users::table
        .select((users::user_id, users::email, users::account_number))
        .filter(users::email.eq(email))
        .into_boxed();
    if let Some(account) = account_number {
        query = query.or_filter(users::account_number.eq(account));
    }
    let holders = query
        .load::<(i32, String, Option<String>)>(conn)
        .await
        .map_err(db_error("ensure_unique"))?;
    match find_duplicate(email, account_number, &holders, except) {
        Some(duplicate) => Err(ApiError::Conflict(duplicate)),
        None => Ok(()),
    }
}

/// Keeps group leadership and scheduled classes consistent with the user's new role.
async fn check_role_change(
    conn: &mut AsyncPgConnection,
    id: i32,
    role: Role,
) -> Result<(), ApiError> {
    let current = users::table
        .find(id)
        .select(users::account_number)
        .first::<Option<String>>(conn)
        .await
        .map_err(not_found("check_role_change", "User"))?;
    let leads_group = match &current {
        Some(account) => class_groups::table
            .filter(class_groups::leader_account.eq(account))
            .select(class_groups::group_name)
            .first::<String>(conn)
            .await
            .optional()
            .map_err(db_error("check_role_change"))?,
        None => None,
    };
    let taught_slots = schedule_slots::table
        .filter(schedule_slots::teacher_id.eq(id))
        .count()
        .get_result::<i64>(conn)
        .await
        .map_err(db_error("check_role_change"))?;
    match role_change_conflict(role, leads_group.as_deref(), taught_slots) {
        Some(conflict) => Err(ApiError::Conflict(conflict)),
        None => Ok(()),
    }
}

/// Get user
#[utoipa::path(get, path = "/api/users", responses((status = OK, body = UserProfile)), tag = USERS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "User database id"),
)
)]
async fn get_user(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<Json<UserProfile>, ApiError> {
    claims.authorize(&enforcer, "user", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    Ok(Json(load_profile(&mut conn, id).await?))
}

/// List users
#[utoipa::path(get, path = "/api/users/list", responses((status = OK, body = Vec<UserProfile>)), tag = USERS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("role" = Option<Role>, Query, description = "Only users with this role"),
)
)]
async fn list_users(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(filter): Query<UserFilter>,
) -> Result<Json<Vec<UserProfile>>, ApiError> {
    claims.authorize(&enforcer, "user", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;

    let mut query = users::table
        .inner_join(roles::table)
        .select((User::as_select(), RoleEntry::as_select()))
        .order(users::full_name)
        .into_boxed();
    if let Some(role) = filter.role {
        query = query.filter(roles::role_name.eq(role.as_str()));
    }
    let rows = query
        .load::<(User, RoleEntry)>(&mut conn)
        .await
        .map_err(db_error("list_users"))?;
    Ok(Json(
        rows.into_iter()
            .map(to_profile)
            .collect::<Result<Vec<_>, _>>()?,
    ))
}

/// Find user by account number
#[utoipa::path(get, path = "/api/users/by-account", responses((status = OK, body = UserProfile)), tag = USERS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("account_number" = String, Query, description = "School account number"),
)
)]
async fn find_by_account(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(AccountQuery { account_number }): Query<AccountQuery>,
) -> Result<Json<UserProfile>, ApiError> {
    claims.authorize(&enforcer, "user", "read")?;
    if account_number.trim().is_empty() {
        return Err(ApiError::Validation(
            "an account number is required to search".to_string(),
        ));
    }
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let row = users::table
        .inner_join(roles::table)
        .filter(users::account_number.eq(account_number.trim()))
        .select((User::as_select(), RoleEntry::as_select()))
        .first::<(User, RoleEntry)>(&mut conn)
        .await
        .map_err(not_found("find_by_account", "User"))?;
    Ok(Json(to_profile(row)?))
}

/// Create user
#[utoipa::path(post, path = "/api/users", request_body = NewUser, responses((status = OK, body = UserProfile)), tag = USERS_TAG, security(
    ("bearer_jwt" = [])
))]
async fn create_user(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    ValidatedForm(user): ValidatedForm<NewUser>,
) -> Result<Json<UserProfile>, ApiError> {
    claims.authorize(&enforcer, "user", "create")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;

    let (email, account_number) =
        normalize_identity(&user.email, user.account_number.as_deref())?;
    ensure_unique(&mut conn, &email, account_number.as_deref(), None).await?;
    let role = role_id_of(&mut conn, user.role).await?;
    let row = NewUserRow {
        full_name: user.full_name,
        email,
        password_hash: hash_password(&user.password)?,
        account_number,
        role_id: role,
    };
    let created = insert_into(users::table)
        .values(&row)
        .returning(User::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(db_error("create_user"))?;
    tracing::info!("created user {} ({})", created.user_id, user.role);
    Ok(Json(UserProfile::new(created, user.role)))
}

/// Update user
#[utoipa::path(put, path = "/api/users", request_body = UpdateUser, responses((status = OK, body = UserProfile)), tag = USERS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "User database id"),
)
)]
async fn update_user(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
    ValidatedForm(user): ValidatedForm<UpdateUser>,
) -> Result<Json<UserProfile>, ApiError> {
    claims.authorize(&enforcer, "user", "update")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;

    let (email, account_number) =
        normalize_identity(&user.email, user.account_number.as_deref())?;
    ensure_unique(&mut conn, &email, account_number.as_deref(), Some(id)).await?;
    check_role_change(&mut conn, id, user.role).await?;
    let changes = UserChanges {
        full_name: user.full_name,
        email,
        password_hash: user.password.as_deref().map(hash_password).transpose()?,
        account_number,
        role_id: role_id_of(&mut conn, user.role).await?,
    };
    let updated = diesel::update(users::table.find(id))
        .set(&changes)
        .returning(User::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(not_found("update_user", "User"))?;
    Ok(Json(UserProfile::new(updated, user.role)))
}

/// Delete user
#[utoipa::path(delete, path = "/api/users", responses((status = OK, body = ())), tag = USERS_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "User database id"),
)
)]
async fn delete_user(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<(), ApiError> {
    claims.authorize(&enforcer, "user", "delete")?;
    if id == claims.user_id {
        return Err(ApiError::Validation(
            "you cannot delete your own account".to_string(),
        ));
    }
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    if diesel::delete(users::table.find(id))
        .execute(&mut conn)
        .await
        .map_err(db_error("delete_user"))?
        == 0
    {
        Err(ApiError::NotFound("User"))
    } else {
        Ok(())
    }
}

/// Creates the configured administrator unless one already exists.
pub async fn ensure_admin(pool: &Pool, seed: &AdminSeed) -> Result<(), ApiError> {
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let existing = users::table
        .inner_join(roles::table)
        .filter(roles::role_name.eq(Role::Administrator.as_str()))
        .count()
        .get_result::<i64>(&mut conn)
        .await
        .map_err(db_error("ensure_admin"))?;
    if existing > 0 {
        return Ok(());
    }

    let row = NewUserRow {
        full_name: "Administrator".to_string(),
        email: seed.email.trim().to_lowercase(),
        password_hash: hash_password(&seed.password)?,
        account_number: None,
        role_id: role_id_of(&mut conn, Role::Administrator).await?,
    };
    insert_into(users::table)
        .values(&row)
        .execute(&mut conn)
        .await
        .map_err(db_error("ensure_admin"))?;
    tracing::info!("created administrator {}", seed.email);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(id: i32, email: &str, account: Option<&str>) -> (i32, String, Option<String>) {
        (id, email.to_string(), account.map(str::to_string))
    }

    #[test]
    fn identities_are_stored_normalized() {
        let (email, account) = normalize_identity("  Ana.Ruiz@School.TEST ", Some(" A1 ")).unwrap();
        assert_eq!(email, "ana.ruiz@school.test");
        assert_eq!(account.as_deref(), Some("A1"));
        assert_eq!(normalize_identity("a@b.c", None).unwrap().1, None);
        assert!(matches!(
            normalize_identity("a@b.c", Some("   ")),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn taken_email_is_a_duplicate() {
        let holders = [holder(1, "ana@school.test", Some("A1"))];
        assert_eq!(
            find_duplicate("ana@school.test", Some("B2"), &holders, None).as_deref(),
            Some("A user with email ana@school.test already exists")
        );
    }

    #[test]
    fn taken_account_number_is_a_duplicate() {
        let holders = [holder(1, "ana@school.test", Some("A1"))];
        assert_eq!(
            find_duplicate("leo@school.test", Some("A1"), &holders, None).as_deref(),
            Some("Account number A1 is already assigned")
        );
        assert_eq!(find_duplicate("leo@school.test", None, &holders, None), None);
    }

    #[test]
    fn a_user_does_not_collide_with_itself() {
        let holders = [holder(4, "ana@school.test", Some("A1"))];
        assert_eq!(
            find_duplicate("ana@school.test", Some("A1"), &holders, Some(4)),
            None
        );
        assert!(find_duplicate("ana@school.test", Some("A1"), &holders, Some(5)).is_some());
    }

    #[test]
    fn group_leaders_keep_their_role_while_leading() {
        let conflict = role_change_conflict(Role::Student, Some("ICO-21"), 0).unwrap();
        assert!(conflict.contains("ICO-21"));
        assert_eq!(role_change_conflict(Role::GroupLeader, Some("ICO-21"), 0), None);
    }

    #[test]
    fn teachers_keep_their_role_while_scheduled() {
        let conflict = role_change_conflict(Role::Student, None, 3).unwrap();
        assert!(conflict.contains("3 scheduled classes"));
        assert_eq!(role_change_conflict(Role::Teacher, None, 3), None);
        assert_eq!(role_change_conflict(Role::Checker, None, 0), None);
    }
}
