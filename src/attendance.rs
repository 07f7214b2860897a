use axum::extract::{Query, State};
use axum::Json;
use chrono::NaiveDate;
use diesel::dsl::insert_into;
use diesel::upsert::excluded;
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::Claims;
use crate::error::{db_error, not_found, ApiError};
use crate::groups::led_group;
use crate::model::{
    AttendanceRecord, AttendanceStatus, DailyQuery, DateQuery, Day, MarkAttendance, NewAttendance,
    Recorder, ReportQuery, Role, ScheduleSlot, SlotFilter,
};
use crate::schedules::load_slot_details;
use crate::schema::{attendance_records, schedule_slots};
use crate::timetable::{daily_sheet, week_bounds, weekly_report, DailySheet, WeeklyReport};
use crate::validate::ValidatedForm;
use crate::{AppState, ATTENDANCE_TAG};

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(mark_attendance))
        .routes(routes!(daily_attendance))
        .routes(routes!(weekly_attendance))
        .routes(routes!(fill_pending))
}

/// Sheet the caller writes to: its own role's, or the requested one for administrators.
fn recorder_for(role: Role, requested: Option<Recorder>) -> Result<Recorder, ApiError> {
    match (role.recorder(), requested) {
        (Some(own), _) => Ok(own),
        (None, Some(requested)) if role == Role::Administrator => Ok(requested),
        (None, None) if role == Role::Administrator => Err(ApiError::Validation(
            "administrators must name the recorder".to_string(),
        )),
        (None, _) => Err(ApiError::PermissionDenied),
    }
}

/// Whether the caller may record `slot` on `date`; `led_group` is the group a leader leads.
fn may_mark(
    claims: &Claims,
    led_group: Option<i32>,
    slot: &ScheduleSlot,
    date: NaiveDate,
) -> Result<(), ApiError> {
    if Day::of(date) != Some(slot.day) {
        return Err(ApiError::Validation(format!(
            "{} is not a {}, the class is not held that day",
            date, slot.day
        )));
    }
    match claims.role {
        Role::GroupLeader if led_group != Some(slot.group_id) => Err(ApiError::PermissionDenied),
        Role::Teacher if slot.teacher_id != claims.user_id => Err(ApiError::PermissionDenied),
        _ => Ok(()),
    }
}

#[derive(Debug, ToSchema, Serialize)]
pub struct FillSummary {
    inserted: usize,
}

/// Record attendance for a class on a date
#[utoipa::path(post, path = "/api/attendance", request_body = MarkAttendance, responses((status = OK, body = AttendanceRecord)), tag = ATTENDANCE_TAG, security(
    ("bearer_jwt" = [])
))]
async fn mark_attendance(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    ValidatedForm(mark): ValidatedForm<MarkAttendance>,
) -> Result<Json<AttendanceRecord>, ApiError> {
    claims.authorize(&enforcer, "attendance", "mark")?;
    let recorder = recorder_for(claims.role, mark.recorder)?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;

    let slot = schedule_slots::table
        .find(mark.slot_id)
        .select(ScheduleSlot::as_select())
        .first(&mut conn)
        .await
        .map_err(not_found("mark_attendance", "Schedule slot"))?;
    let led = match claims.role {
        Role::GroupLeader => Some(led_group(&mut conn, &claims).await?.group_id),
        _ => None,
    };
    may_mark(&claims, led, &slot, mark.date)?;

    let record = NewAttendance {
        slot_id: slot.slot_id,
        record_date: mark.date,
        recorder,
        status: mark.status,
    };
    let saved = insert_into(attendance_records::table)
        .values(&record)
        .on_conflict((
            attendance_records::slot_id,
            attendance_records::record_date,
            attendance_records::recorder,
        ))
        .do_update()
        .set((
            attendance_records::status.eq(excluded(attendance_records::status)),
            attendance_records::updated_at.eq(diesel::dsl::now),
        ))
        .returning(AttendanceRecord::as_returning())
        .get_result(&mut conn)
        .await
        .map_err(db_error("mark_attendance"))?;
    tracing::info!(
        "{} marked slot {} on {} as {}",
        recorder,
        saved.slot_id,
        saved.record_date,
        saved.status
    );
    Ok(Json(saved))
}

/// Attendance sheet of a day for the caller's recorder role
#[utoipa::path(get, path = "/api/attendance/daily", responses((status = OK, body = DailySheet)), tag = ATTENDANCE_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("date" = String, Query, description = "Date of the sheet, YYYY-MM-DD"),
    ("building" = Option<String>, Query, description = "Only classes of groups in this building"),
    ("recorder" = Option<Recorder>, Query, description = "Sheet to show; administrators only, defaults to checker"),
)
)]
async fn daily_attendance(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(DailyQuery {
        date,
        building,
        recorder,
    }): Query<DailyQuery>,
) -> Result<Json<DailySheet>, ApiError> {
    claims.authorize(&enforcer, "attendance", "read")?;
    let recorder = recorder_for(claims.role, recorder.or(Some(Recorder::Checker)))?;
    let Some(day) = Day::of(date) else {
        return Ok(Json(daily_sheet(date, recorder, Vec::new(), &[])));
    };

    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let mut filter = SlotFilter {
        day: Some(day),
        ..SlotFilter::default()
    };
    match claims.role {
        Role::GroupLeader => filter.group_id = Some(led_group(&mut conn, &claims).await?.group_id),
        Role::Teacher => filter.teacher_id = Some(claims.user_id),
        _ => {}
    }
    let slots = load_slot_details(&mut conn, &filter, building.as_deref()).await?;
    let slot_ids: Vec<i32> = slots.iter().map(|s| s.slot_id).collect();
    let records = attendance_records::table
        .filter(attendance_records::record_date.eq(date))
        .filter(attendance_records::recorder.eq(recorder))
        .filter(attendance_records::slot_id.eq_any(slot_ids))
        .select(AttendanceRecord::as_select())
        .load(&mut conn)
        .await
        .map_err(db_error("daily_attendance"))?;
    Ok(Json(daily_sheet(date, recorder, slots, &records)))
}

/// Weekly attendance report of a teacher, as seen by every recorder
#[utoipa::path(get, path = "/api/attendance/report", responses((status = OK, body = WeeklyReport)), tag = ATTENDANCE_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("teacher_id" = i32, Query, description = "Teacher's user id"),
    ("date" = String, Query, description = "Any date in the week, YYYY-MM-DD"),
)
)]
async fn weekly_attendance(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(ReportQuery { teacher_id, date }): Query<ReportQuery>,
) -> Result<Json<WeeklyReport>, ApiError> {
    claims.authorize(&enforcer, "attendance", "report")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let filter = SlotFilter {
        teacher_id: Some(teacher_id),
        ..SlotFilter::default()
    };
    let slots = load_slot_details(&mut conn, &filter, None).await?;
    let slot_ids: Vec<i32> = slots.iter().map(|s| s.slot_id).collect();
    let (week_start, week_end) = week_bounds(date);
    let records = attendance_records::table
        .filter(attendance_records::slot_id.eq_any(slot_ids))
        .filter(attendance_records::record_date.between(week_start, week_end))
        .select(AttendanceRecord::as_select())
        .load(&mut conn)
        .await
        .map_err(db_error("weekly_attendance"))?;
    Ok(Json(weekly_report(date, slots, &records)))
}

/// Create pending records for every class held on a date
#[utoipa::path(post, path = "/api/attendance/fill", responses((status = OK, body = FillSummary)), tag = ATTENDANCE_TAG, security(
    ("bearer_jwt" = [])
),
params(
    ("date" = String, Query, description = "Date to prepare, YYYY-MM-DD"),
)
)]
async fn fill_pending(
    claims: Claims,
    State(AppState { pool, enforcer, .. }): State<AppState>,
    Query(DateQuery { date }): Query<DateQuery>,
) -> Result<Json<FillSummary>, ApiError> {
    claims.authorize(&enforcer, "attendance", "fill")?;
    let Some(day) = Day::of(date) else {
        return Ok(Json(FillSummary { inserted: 0 }));
    };
    let mut conn = pool.get().await.map_err(|_| ApiError::DBConnection)?;
    let slot_ids = schedule_slots::table
        .filter(schedule_slots::day.eq(day))
        .select(schedule_slots::slot_id)
        .load::<i32>(&mut conn)
        .await
        .map_err(db_error("fill_pending"))?;
    let rows: Vec<NewAttendance> = slot_ids
        .iter()
        .flat_map(|slot| {
            Recorder::ALL.into_iter().map(move |recorder| NewAttendance {
                slot_id: *slot,
                record_date: date,
                recorder,
                status: AttendanceStatus::Pending,
            })
        })
        .collect();
    if rows.is_empty() {
        return Ok(Json(FillSummary { inserted: 0 }));
    }
    let inserted = insert_into(attendance_records::table)
        .values(&rows)
        .on_conflict_do_nothing()
        .execute(&mut conn)
        .await
        .map_err(db_error("fill_pending"))?;
    tracing::info!("prepared {} pending records for {}", inserted, date);
    Ok(Json(FillSummary { inserted }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_roles_use_their_own_sheet() {
        assert_eq!(
            recorder_for(Role::Teacher, Some(Recorder::Checker)).unwrap(),
            Recorder::Teacher
        );
        assert_eq!(
            recorder_for(Role::GroupLeader, None).unwrap(),
            Recorder::GroupLeader
        );
    }

    #[test]
    fn administrators_name_the_sheet() {
        assert_eq!(
            recorder_for(Role::Administrator, Some(Recorder::GroupLeader)).unwrap(),
            Recorder::GroupLeader
        );
        assert!(matches!(
            recorder_for(Role::Administrator, None),
            Err(ApiError::Validation(_))
        ));
    }

    fn claims(role: Role, user_id: i32) -> Claims {
        Claims {
            sub: "someone@school.test".into(),
            user_id,
            account_number: Some("A1".into()),
            role,
            exp: 0,
        }
    }

    fn monday_slot() -> ScheduleSlot {
        ScheduleSlot {
            slot_id: 3,
            teacher_id: 20,
            subject_id: 4,
            group_id: 7,
            day: Day::Monday,
            hour: 9,
            attended: false,
        }
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 11, 18).unwrap()
    }

    #[test]
    fn leaders_mark_only_their_own_group() {
        let leader = claims(Role::GroupLeader, 50);
        assert!(may_mark(&leader, Some(7), &monday_slot(), monday()).is_ok());
        assert!(matches!(
            may_mark(&leader, Some(8), &monday_slot(), monday()),
            Err(ApiError::PermissionDenied)
        ));
        assert!(matches!(
            may_mark(&leader, None, &monday_slot(), monday()),
            Err(ApiError::PermissionDenied)
        ));
    }

    #[test]
    fn teachers_mark_only_their_own_classes() {
        assert!(may_mark(&claims(Role::Teacher, 20), None, &monday_slot(), monday()).is_ok());
        assert!(matches!(
            may_mark(&claims(Role::Teacher, 21), None, &monday_slot(), monday()),
            Err(ApiError::PermissionDenied)
        ));
    }

    #[test]
    fn checkers_and_administrators_mark_any_class() {
        for role in [Role::Checker, Role::Administrator] {
            assert!(may_mark(&claims(role, 1), None, &monday_slot(), monday()).is_ok());
        }
    }

    #[test]
    fn classes_are_marked_on_their_own_weekday() {
        let tuesday = NaiveDate::from_ymd_opt(2024, 11, 19).unwrap();
        let err = may_mark(&claims(Role::Checker, 1), None, &monday_slot(), tuesday).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(
            err.to_string(),
            "2024-11-19 is not a monday, the class is not held that day"
        );
    }

    #[test]
    fn students_have_no_sheet() {
        assert!(matches!(
            recorder_for(Role::Student, Some(Recorder::Checker)),
            Err(ApiError::PermissionDenied)
        ));
    }
}
