use std::fmt;
use std::io::Write;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::{AsChangeset, Insertable, Queryable, Selectable};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::schema::{
    attendance_records, buildings, careers, class_groups, roles, schedule_slots, subjects, users,
};

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} `{}`", stringify!($name), other)),
                }
            }
        }
    };
}

/// Maps a `text_enum!` type onto a Postgres text column.
macro_rules! text_sql {
    ($name:ident) => {
        impl ToSql<Text, Pg> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                out.write_all(self.as_str().as_bytes())?;
                Ok(IsNull::No)
            }
        }

        impl FromSql<Text, Pg> for $name {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                Ok(std::str::from_utf8(bytes.as_bytes())?.parse()?)
            }
        }
    };
}

#[derive(ToSchema, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Administrator,
    GroupLeader,
    Teacher,
    Checker,
    Student,
}

text_enum!(Role {
    Administrator => "administrator",
    GroupLeader => "group_leader",
    Teacher => "teacher",
    Checker => "checker",
    Student => "student",
});

impl Role {
    /// The attendance sheet this role writes to, if it records attendance at all.
    pub fn recorder(&self) -> Option<Recorder> {
        match self {
            Role::Checker => Some(Recorder::Checker),
            Role::GroupLeader => Some(Recorder::GroupLeader),
            Role::Teacher => Some(Recorder::Teacher),
            Role::Administrator | Role::Student => None,
        }
    }
}

/// Teaching days, Monday through Friday.
#[derive(
    ToSchema,
    Serialize,
    Deserialize,
    AsExpression,
    FromSqlRow,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
}

text_enum!(Day {
    Monday => "monday",
    Tuesday => "tuesday",
    Wednesday => "wednesday",
    Thursday => "thursday",
    Friday => "friday",
});
text_sql!(Day);

impl Day {
    pub const ALL: [Day; 5] = [
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
    ];

    pub fn from_weekday(weekday: Weekday) -> Option<Day> {
        match weekday {
            Weekday::Mon => Some(Day::Monday),
            Weekday::Tue => Some(Day::Tuesday),
            Weekday::Wed => Some(Day::Wednesday),
            Weekday::Thu => Some(Day::Thursday),
            Weekday::Fri => Some(Day::Friday),
            Weekday::Sat | Weekday::Sun => None,
        }
    }

    /// Teaching day a calendar date falls on; `None` on weekends.
    pub fn of(date: NaiveDate) -> Option<Day> {
        Day::from_weekday(date.weekday())
    }

    /// Days since Monday.
    pub fn offset(&self) -> u64 {
        match self {
            Day::Monday => 0,
            Day::Tuesday => 1,
            Day::Wednesday => 2,
            Day::Thursday => 3,
            Day::Friday => 4,
        }
    }
}

#[derive(
    ToSchema,
    Serialize,
    Deserialize,
    AsExpression,
    FromSqlRow,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    #[default]
    Pending,
    Present,
    Absent,
}

text_enum!(AttendanceStatus {
    Pending => "pending",
    Present => "present",
    Absent => "absent",
});
text_sql!(AttendanceStatus);

/// Who wrote an attendance record.
#[derive(
    ToSchema,
    Serialize,
    Deserialize,
    AsExpression,
    FromSqlRow,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum Recorder {
    Checker,
    GroupLeader,
    Teacher,
}

text_enum!(Recorder {
    Checker => "checker",
    GroupLeader => "group_leader",
    Teacher => "teacher",
});
text_sql!(Recorder);

impl Recorder {
    pub const ALL: [Recorder; 3] = [Recorder::Checker, Recorder::GroupLeader, Recorder::Teacher];
}

#[derive(Selectable, Queryable, Debug)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(Pg))]
pub struct User {
    pub user_id: i32,
    pub full_name: String,
    pub email: String,
    pub password_hash: String,
    pub account_number: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Selectable, Queryable, Debug)]
#[diesel(table_name = roles)]
#[diesel(check_for_backend(Pg))]
pub struct RoleEntry {
    pub role_name: String,
}

/// A user as returned by the API, without the password hash.
#[derive(ToSchema, Serialize, Deserialize, Clone, Debug)]
pub struct UserProfile {
    pub user_id: i32,
    pub full_name: String,
    pub email: String,
    pub account_number: Option<String>,
    pub role: Role,
    pub created_at: NaiveDateTime,
}

impl UserProfile {
    pub fn new(user: User, role: Role) -> Self {
        Self {
            user_id: user.user_id,
            full_name: user.full_name,
            email: user.email,
            account_number: user.account_number,
            role,
            created_at: user.created_at,
        }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = users)]
pub struct NewUserRow {
    pub full_name: String,
    pub email: String,
    pub password_hash: String,
    pub account_number: Option<String>,
    pub role_id: i32,
}

#[derive(AsChangeset, Debug)]
#[diesel(table_name = users)]
pub struct UserChanges {
    pub full_name: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub account_number: Option<String>,
    pub role_id: i32,
}

#[derive(Deserialize, ToSchema, Debug, Validate)]
pub struct NewUser {
    #[validate(length(min = 1, message = "name is required"))]
    pub full_name: String,
    #[validate(email(message = "a valid email is required"))]
    pub email: String,
    #[validate(length(min = 1, message = "password is required"))]
    pub password: String,
    #[validate(length(min = 1, max = 32, message = "account number must be 1-32 characters"))]
    pub account_number: Option<String>,
    pub role: Role,
}

#[derive(Deserialize, ToSchema, Debug, Validate)]
pub struct UpdateUser {
    #[validate(length(min = 1, message = "name is required"))]
    pub full_name: String,
    #[validate(email(message = "a valid email is required"))]
    pub email: String,
    /// Left unchanged when omitted.
    #[validate(length(min = 1, message = "password must not be empty"))]
    pub password: Option<String>,
    #[validate(length(min = 1, max = 32, message = "account number must be 1-32 characters"))]
    pub account_number: Option<String>,
    pub role: Role,
}

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug, Clone)]
#[diesel(table_name = careers)]
#[diesel(check_for_backend(Pg))]
pub struct Career {
    pub career_id: i32,
    pub career_name: String,
    pub semester_count: i32,
}

#[derive(Deserialize, ToSchema, Insertable, AsChangeset, Debug, Validate)]
#[diesel(table_name = careers)]
pub struct CareerForm {
    #[diesel(column_name = career_name)]
    #[validate(length(min = 1, message = "career name is required"))]
    pub name: String,
    #[validate(range(min = 1, max = 12, message = "semester count must be between 1 and 12"))]
    pub semester_count: i32,
}

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug, Clone)]
#[diesel(table_name = buildings)]
#[diesel(check_for_backend(Pg))]
pub struct Building {
    pub building_id: i32,
    pub faculty: String,
    pub building_name: String,
}

#[derive(Deserialize, ToSchema, Insertable, AsChangeset, Debug, Validate)]
#[diesel(table_name = buildings)]
pub struct BuildingForm {
    #[validate(length(min = 1, message = "faculty is required"))]
    pub faculty: String,
    #[diesel(column_name = building_name)]
    #[validate(length(min = 1, message = "building name is required"))]
    pub name: String,
}

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug, Clone)]
#[diesel(table_name = class_groups)]
#[diesel(check_for_backend(Pg))]
pub struct Group {
    pub group_id: i32,
    pub group_name: String,
    pub classroom: Option<String>,
    pub building: Option<String>,
    pub leader_account: Option<String>,
    pub career_id: Option<i32>,
}

#[derive(Deserialize, ToSchema, Insertable, Debug, Validate)]
#[diesel(table_name = class_groups)]
pub struct NewGroup {
    #[diesel(column_name = group_name)]
    #[validate(length(min = 1, message = "group name is required"))]
    pub name: String,
    pub classroom: Option<String>,
    pub building: Option<String>,
    pub career_id: Option<i32>,
}

/// Partial group update; omitted fields are left as they are.
#[derive(Deserialize, ToSchema, AsChangeset, Debug, Validate)]
#[diesel(table_name = class_groups)]
pub struct GroupChanges {
    #[diesel(column_name = group_name)]
    #[validate(length(min = 1, message = "group name must not be empty"))]
    pub name: Option<String>,
    #[validate(length(min = 1, message = "classroom must not be empty"))]
    pub classroom: Option<String>,
    #[validate(length(min = 1, message = "building must not be empty"))]
    pub building: Option<String>,
    pub career_id: Option<i32>,
}

#[derive(Deserialize, ToSchema, Debug, Validate)]
pub struct ClassroomAssignment {
    #[validate(length(min = 1, message = "classroom is required"))]
    pub classroom: String,
}

#[derive(Deserialize, ToSchema, Debug, Validate)]
pub struct BuildingAssignment {
    #[validate(length(min = 1, message = "building is required"))]
    pub building: String,
}

#[derive(Deserialize, ToSchema, Debug, Validate)]
pub struct LeaderAssignment {
    /// `null` removes the current leader.
    #[validate(length(min = 1, message = "account number must not be empty"))]
    pub account_number: Option<String>,
}

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug, Clone)]
#[diesel(table_name = subjects)]
#[diesel(check_for_backend(Pg))]
pub struct Subject {
    pub subject_id: i32,
    pub subject_name: String,
    pub semester: i32,
    pub career_id: i32,
}

#[derive(Deserialize, ToSchema, Insertable, AsChangeset, Debug, Validate)]
#[diesel(table_name = subjects)]
pub struct SubjectForm {
    #[diesel(column_name = subject_name)]
    #[validate(length(min = 1, message = "subject name is required"))]
    pub name: String,
    #[validate(range(min = 1, message = "a semester is required"))]
    pub semester: i32,
    pub career_id: i32,
}

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug, Clone, PartialEq)]
#[diesel(table_name = schedule_slots)]
#[diesel(check_for_backend(Pg))]
pub struct ScheduleSlot {
    pub slot_id: i32,
    pub teacher_id: i32,
    pub subject_id: i32,
    pub group_id: i32,
    pub day: Day,
    pub hour: i32,
    pub attended: bool,
}

#[derive(Deserialize, ToSchema, Insertable, AsChangeset, Debug, Clone, Validate)]
#[diesel(table_name = schedule_slots)]
pub struct SlotForm {
    pub teacher_id: i32,
    pub subject_id: i32,
    pub group_id: i32,
    pub day: Day,
    /// Start hour of the class; it runs until the next hour.
    #[validate(range(min = 7, max = 19, message = "classes start between 07:00 and 19:00"))]
    pub hour: i32,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct SlotAttendance {
    pub attended: bool,
}

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug, Clone)]
#[diesel(table_name = attendance_records)]
#[diesel(check_for_backend(Pg))]
pub struct AttendanceRecord {
    pub record_id: i32,
    pub slot_id: i32,
    pub record_date: NaiveDate,
    pub recorder: Recorder,
    pub status: AttendanceStatus,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = attendance_records)]
pub struct NewAttendance {
    pub slot_id: i32,
    pub record_date: NaiveDate,
    pub recorder: Recorder,
    pub status: AttendanceStatus,
}

#[derive(Deserialize, ToSchema, Debug, Validate)]
pub struct MarkAttendance {
    pub slot_id: i32,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    /// Only read for administrators; every other role records on its own sheet.
    pub recorder: Option<Recorder>,
}

#[derive(Deserialize, ToSchema)]
pub struct EntityId {
    pub id: i32,
}

#[derive(Deserialize, ToSchema)]
pub struct AccountQuery {
    pub account_number: String,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct UserFilter {
    pub role: Option<Role>,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct CareerFilter {
    pub career_id: Option<i32>,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct SubjectFilter {
    pub semester: Option<i32>,
    pub career_id: Option<i32>,
}

#[derive(Deserialize, ToSchema, Default, Debug, Clone)]
pub struct SlotFilter {
    pub teacher_id: Option<i32>,
    pub group_id: Option<i32>,
    pub day: Option<Day>,
}

#[derive(Deserialize, ToSchema)]
pub struct DateQuery {
    pub date: NaiveDate,
}

#[derive(Deserialize, ToSchema)]
pub struct DailyQuery {
    pub date: NaiveDate,
    pub building: Option<String>,
    pub recorder: Option<Recorder>,
}

#[derive(Deserialize, ToSchema)]
pub struct ReportQuery {
    pub teacher_id: i32,
    pub date: NaiveDate,
}

#[derive(ToSchema, Default, Deserialize, Debug, Validate)]
pub struct Credentials {
    #[validate(length(min = 1, message = "email is required"))]
    pub email: String,
    #[validate(length(min = 1, message = "password is required"))]
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_enums_parse_their_own_names() {
        for day in Day::ALL {
            assert_eq!(day.as_str().parse::<Day>(), Ok(day));
        }
        assert_eq!("group_leader".parse::<Role>(), Ok(Role::GroupLeader));
        assert_eq!("absent".parse::<AttendanceStatus>(), Ok(AttendanceStatus::Absent));
        assert!("saturday".parse::<Day>().is_err());
        assert!("Present".parse::<AttendanceStatus>().is_err());
    }

    #[test]
    fn day_of_date_skips_weekends() {
        let monday = NaiveDate::from_ymd_opt(2024, 11, 18).unwrap();
        assert_eq!(Day::of(monday), Some(Day::Monday));
        assert_eq!(Day::of(monday + chrono::Days::new(4)), Some(Day::Friday));
        assert_eq!(Day::of(monday + chrono::Days::new(5)), None);
        assert_eq!(Day::of(monday + chrono::Days::new(6)), None);
    }

    #[test]
    fn only_recording_roles_have_a_sheet() {
        assert_eq!(Role::Checker.recorder(), Some(Recorder::Checker));
        assert_eq!(Role::GroupLeader.recorder(), Some(Recorder::GroupLeader));
        assert_eq!(Role::Teacher.recorder(), Some(Recorder::Teacher));
        assert_eq!(Role::Administrator.recorder(), None);
        assert_eq!(Role::Student.recorder(), None);
    }

    #[test]
    fn slot_form_rejects_hours_outside_the_school_day() {
        let form = |hour| SlotForm {
            teacher_id: 1,
            subject_id: 1,
            group_id: 1,
            day: Day::Monday,
            hour,
        };
        assert!(form(7).validate().is_ok());
        assert!(form(19).validate().is_ok());
        assert!(form(6).validate().is_err());
        assert!(form(20).validate().is_err());
    }

    #[test]
    fn user_form_requires_name_email_and_password() {
        let user: NewUser = serde_json::from_value(serde_json::json!({
            "full_name": "",
            "email": "not-an-email",
            "password": "",
            "role": "student"
        }))
        .unwrap();
        let errors = user.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("full_name"));
        assert!(fields.contains_key("email"));
        assert!(fields.contains_key("password"));
    }
}
