use axum::extract::{Query, State};
use axum::Json;
use diesel::dsl::insert_into;
use diesel::{BoolExpressionMethods, ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::Claims;
use crate::error::{db_error, not_found, ApiError};
use crate::groups::led_group;
use crate::model::{Day, EntityId, Role, ScheduleSlot, SlotAttendance, SlotFilter, SlotForm};
use crate::schema::{class_groups, roles, schedule_slots, subjects, users};
use crate::timetable::{build_timetable, SlotDetail, Timetable};
use crate::validate::ValidatedForm;
use crate::{AppState, SCHEDULES_TAG};

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(get_slot, create_slot, update_slot, delete_slot))
        .routes(routes!(list_slots))
        .routes(routes!(set_slot_attendance))
        .routes(routes!(group_timetable))
        .routes(routes!(teacher_timetable))
        .routes(routes!(my_timetable))
}

/// Slots joined with teacher, subject and group names, restricted by `filter`.
pub(crate) async fn load_slot_details(
    conn: &mut AsyncPgConnection,
    filter: &SlotFilter,
    building: Option<&str>,
) -> Result<Vec<SlotDetail>, ApiError> {
    let mut query = schedule_slots::table
        .inner_join(users::table)
        .inner_join(subjects::table)
        .inner_join(class_groups::table)
        .select((
            schedule_slots::slot_id,
            schedule_slots::day,
            schedule_slots::hour,
            schedule_slots::attended,
            schedule_slots::teacher_id,
            users::full_name,
            subjects::subject_name,
            schedule_slots::group_id,
            class_groups::group_name,
            class_groups::classroom,
            class_groups::building,
        ))
        .into_boxed();
    if let Some(teacher) = filter.teacher_id {
        query = query.filter(schedule_slots::teacher_id.eq(teacher));
    }
    if let Some(group) = filter.group_id {
        query = query.filter(schedule_slots::group_id.eq(group));
    }
    if let Some(day) = filter.day {
        query = query.filter(schedule_slots::day.eq(day));
    }
    if let Some(building) = building {
        query = query.filter(class_groups::building.eq(building));
    }
    query
        .order(schedule_slots::hour)
        .load::<SlotDetail>(conn)
        .await
        .map_err(db_error("load_slot_details"))
}

/// Describes why `form` cannot take its day and hour, given the slots already there.
pub(crate) fn find_conflict(form: &SlotForm, booked: &[ScheduleSlot], except: Option<i32>) -> Option<String> {
    let others = booked
        .iter()
        .filter(|slot| Some(slot.slot_id) != except)
        .filter(|slot| slot.day == form.day && slot.hour == form.hour);
    for slot in others {
        if slot.teacher_id == form.teacher_id {
            return Some(format!(
                "teacher already has a class on {} at {:02}:00",
                form.day, form.hour
            ));
        }
        if slot.group_id == form.group_id {
            return Some(format!(
                "group already has a class on {} at {:02}:00",
                form.day, form.hour
            ));
        }
    }
    None
}

async fn check_slot(
    conn: &mut AsyncPgConnection,
    form: &SlotForm,
    except: Option<i32>,
) -> Result<(), ApiError> {
    let role = users::table
        .inner_join(roles::table)
        .filter(users::user_id.eq(form.teacher_id))
        .select(roles::role_name)
        .first::<String>(conn)
        .await
        .map_err(not_found("check_slot", "Teacher"))?;
    if role != Role::Teacher.as_str() {
        return Err(ApiError::Validation(format!(
            "user {} is not a teacher",
            form.teacher_id
        )));
    }

    let booked = schedule_slots::table
        .filter(schedule_slots::day.eq(form.day))
        .filter(schedule_slots::hour.eq(form.hour))
        .filter(
            schedule_slots::teacher_id
                .eq(form.teacher_id)
                .or(schedule_slots::group_id.eq(form.group_id)),
        )
        .select(ScheduleSlot::as_select())
        .load(conn)
        .await
        .map_err(db_error("check_slot"))?;
    match find_conflict(form, &booked, except) {
        Some(conflict) => Err(ApiError::Conflict(conflict)),
        None => Ok(()),
    }
}

/// Get schedule slot
#[utoipa::path(get, path = "/api/schedules", responses((status = OK, body = ScheduleSlot)), tag = SCHEDULES_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Schedule slot database id"),
)
)]
async fn get_slot(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<Json<ScheduleSlot>, ApiError> {
    claims.authorize(&enforcer, "schedule", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let slot = schedule_slots::table
        .find(id)
        .select(ScheduleSlot::as_select())
        .first(&mut conn)
        .await
        .map_err(not_found("get_slot", "Schedule slot"))?;
    Ok(Json(slot))
}

/// List schedule slots
#[utoipa::path(get, path = "/api/schedules/list", responses((status = OK, body = Vec<SlotDetail>)), tag = SCHEDULES_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("teacher_id" = Option<i32>, Query, description = "Only this teacher's classes"),
    ("group_id" = Option<i32>, Query, description = "Only this group's classes"),
    ("day" = Option<Day>, Query, description = "Only classes on this day"),
)
)]
async fn list_slots(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(filter): Query<SlotFilter>,
) -> Result<Json<Vec<SlotDetail>>, ApiError> {
    claims.authorize(&enforcer, "schedule", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let mut slots = load_slot_details(&mut conn, &filter, None).await?;
    slots.sort_by_key(|s| (s.day, s.hour));
    Ok(Json(slots))
}

/// Create schedule slot
#[utoipa::path(post, path = "/api/schedules", request_body = SlotForm, responses((status = OK, body = ScheduleSlot)), tag = SCHEDULES_TAG, security(
    ("bearer_jwt" = [])
))]
async fn create_slot(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    ValidatedForm(slot): ValidatedForm<SlotForm>,
) -> Result<Json<ScheduleSlot>, ApiError> {
    claims.authorize(&enforcer, "schedule", "create")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    check_slot(&mut conn, &slot, None).await?;
    let created = insert_into(schedule_slots::table)
        .values(&slot)
        .returning(ScheduleSlot::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(db_error("create_slot"))?;
    tracing::info!(
        "scheduled slot {} for group {} on {} at {}",
        created.slot_id,
        created.group_id,
        created.day,
        created.hour
    );
    Ok(Json(created))
}

/// Update schedule slot
#[utoipa::path(put, path = "/api/schedules", request_body = SlotForm, responses((status = OK, body = ScheduleSlot)), tag = SCHEDULES_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Schedule slot database id"),
)
)]
async fn update_slot(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
    ValidatedForm(slot): ValidatedForm<SlotForm>,
) -> Result<Json<ScheduleSlot>, ApiError> {
    claims.authorize(&enforcer, "schedule", "update")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    check_slot(&mut conn, &slot, Some(id)).await?;
    let updated = diesel::update(schedule_slots::table.find(id))
        .set(&slot)
        .returning(ScheduleSlot::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(not_found("update_slot", "Schedule slot"))?;
    Ok(Json(updated))
}

/// Set the attendance flag of a schedule slot
#[utoipa::path(put, path = "/api/schedules/attendance", request_body = SlotAttendance, responses((status = OK, body = ScheduleSlot)), tag = SCHEDULES_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Schedule slot database id"),
)
)]
async fn set_slot_attendance(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
    Json(SlotAttendance { attended }): Json<SlotAttendance>,
) -> Result<Json<ScheduleSlot>, ApiError> {
    claims.authorize(&enforcer, "schedule", "update")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let updated = diesel::update(schedule_slots::table.find(id))
        .set(schedule_slots::attended.eq(attended))
        .returning(ScheduleSlot::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(not_found("set_slot_attendance", "Schedule slot"))?;
    Ok(Json(updated))
}

/// Delete schedule slot
#[utoipa::path(delete, path = "/api/schedules", responses((status = OK, body = ())), tag = SCHEDULES_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Schedule slot database id"),
)
)]
async fn delete_slot(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<(), ApiError> {
    claims.authorize(&enforcer, "schedule", "delete")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    if diesel::delete(schedule_slots::table.find(id))
        .execute(&mut conn)
        .await
        .map_err(db_error("delete_slot"))?
        == 0
    {
        Err(ApiError::NotFound("Schedule slot"))
    } else {
        Ok(())
    }
}

/// Weekly timetable of a group
#[utoipa::path(get, path = "/api/schedules/group", responses((status = OK, body = Timetable)), tag = SCHEDULES_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Group database id"),
)
)]
async fn group_timetable(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<Json<Timetable>, ApiError> {
    claims.authorize(&enforcer, "schedule", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let filter = SlotFilter {
        group_id: Some(id),
        ..SlotFilter::default()
    };
    let slots = load_slot_details(&mut conn, &filter, None).await?;
    Ok(Json(build_timetable(slots)))
}

/// Weekly timetable of a teacher
#[utoipa::path(get, path = "/api/schedules/teacher", responses((status = OK, body = Timetable)), tag = SCHEDULES_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("id" = i32, Query, description = "Teacher's user id"),
)
)]
async fn teacher_timetable(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(EntityId { id }): Query<EntityId>,
) -> Result<Json<Timetable>, ApiError> {
    claims.authorize(&enforcer, "schedule", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let filter = SlotFilter {
        teacher_id: Some(id),
        ..SlotFilter::default()
    };
    let slots = load_slot_details(&mut conn, &filter, None).await?;
    Ok(Json(build_timetable(slots)))
}

/// Timetable of the signed-in teacher, or of the group the signed-in leader leads
#[utoipa::path(get, path = "/api/schedules/mine", responses((status = OK, body = Timetable)), tag = SCHEDULES_TAG, security(
    ("bearer_jwt" = [])
))]
async fn my_timetable(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
) -> Result<Json<Timetable>, ApiError> {
    claims.authorize(&enforcer, "schedule", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let filter = match claims.role {
        Role::Teacher => SlotFilter {
            teacher_id: Some(claims.user_id),
            ..SlotFilter::default()
        },
        Role::GroupLeader => SlotFilter {
            group_id: Some(led_group(&mut conn, &claims).await?.group_id),
            ..SlotFilter::default()
        },
        _ => {
            return Err(ApiError::Validation(format!(
                "{} accounts have no timetable of their own",
                claims.role
            )))
        }
    };
    let slots = load_slot_details(&mut conn, &filter, None).await?;
    Ok(Json(build_timetable(slots)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booked(slot_id: i32, teacher_id: i32, group_id: i32, day: Day, hour: i32) -> ScheduleSlot {
        ScheduleSlot {
            slot_id,
            teacher_id,
            subject_id: 1,
            group_id,
            day,
            hour,
            attended: false,
        }
    }

    fn form(teacher_id: i32, group_id: i32, day: Day, hour: i32) -> SlotForm {
        SlotForm {
            teacher_id,
            subject_id: 2,
            group_id,
            day,
            hour,
        }
    }

    #[test]
    fn busy_teacher_is_a_conflict() {
        let existing = [booked(1, 5, 10, Day::Monday, 9)];
        let conflict = find_conflict(&form(5, 11, Day::Monday, 9), &existing, None).unwrap();
        assert_eq!(conflict, "teacher already has a class on monday at 09:00");
    }

    #[test]
    fn busy_group_is_a_conflict() {
        let existing = [booked(1, 5, 10, Day::Tuesday, 13)];
        let conflict = find_conflict(&form(6, 10, Day::Tuesday, 13), &existing, None).unwrap();
        assert_eq!(conflict, "group already has a class on tuesday at 13:00");
    }

    #[test]
    fn other_hours_and_days_are_free() {
        let existing = [
            booked(1, 5, 10, Day::Monday, 9),
            booked(2, 5, 10, Day::Tuesday, 10),
        ];
        assert_eq!(find_conflict(&form(5, 10, Day::Monday, 10), &existing, None), None);
        assert_eq!(find_conflict(&form(5, 10, Day::Friday, 9), &existing, None), None);
    }

    #[test]
    fn a_slot_does_not_conflict_with_itself() {
        let existing = [booked(4, 5, 10, Day::Thursday, 8)];
        assert_eq!(
            find_conflict(&form(5, 10, Day::Thursday, 8), &existing, Some(4)),
            None
        );
        assert!(find_conflict(&form(5, 10, Day::Thursday, 8), &existing, Some(3)).is_some());
    }
}
