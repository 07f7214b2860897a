//! Weekly timetable and attendance report assembly over already-loaded rows.

use std::collections::HashMap;

use chrono::{Datelike, Days, NaiveDate};
use diesel::Queryable;
use serde::Serialize;
use utoipa::ToSchema;

use crate::model::{AttendanceRecord, AttendanceStatus, Day, Recorder};

pub const FIRST_HOUR: i32 = 7;
pub const LAST_HOUR: i32 = 19;

/// A schedule slot joined with the names it refers to.
#[derive(ToSchema, Serialize, Queryable, Debug, Clone, PartialEq)]
pub struct SlotDetail {
    pub slot_id: i32,
    pub day: Day,
    pub hour: i32,
    pub attended: bool,
    pub teacher_id: i32,
    pub teacher_name: String,
    pub subject_name: String,
    pub group_id: i32,
    pub group_name: String,
    pub classroom: Option<String>,
    pub building: Option<String>,
}

impl SlotDetail {
    /// `"07:00 - 08:00"`
    pub fn period(&self) -> String {
        format!("{:02}:00 - {:02}:00", self.hour, self.hour + 1)
    }
}

#[derive(ToSchema, Serialize, Debug)]
pub struct TimetableEntry {
    pub period: String,
    #[serde(flatten)]
    pub slot: SlotDetail,
}

impl From<SlotDetail> for TimetableEntry {
    fn from(slot: SlotDetail) -> Self {
        Self {
            period: slot.period(),
            slot,
        }
    }
}

#[derive(ToSchema, Serialize, Debug)]
pub struct DaySchedule {
    pub day: Day,
    pub entries: Vec<TimetableEntry>,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct Timetable {
    /// First start hour that has a class.
    pub first_hour: i32,
    /// Last start hour that has a class.
    pub last_hour: i32,
    pub days: Vec<DaySchedule>,
}

/// Span of start hours with classes, or the whole school day when there are none.
pub fn hour_range(slots: &[SlotDetail]) -> (i32, i32) {
    let first = slots.iter().map(|s| s.hour).min();
    let last = slots.iter().map(|s| s.hour).max();
    match (first, last) {
        (Some(first), Some(last)) => (first, last),
        _ => (FIRST_HOUR, LAST_HOUR),
    }
}

/// Groups slots by day, Monday first, each day ordered by hour.
pub fn build_timetable(slots: Vec<SlotDetail>) -> Timetable {
    let (first_hour, last_hour) = hour_range(&slots);
    let mut by_day: HashMap<Day, Vec<SlotDetail>> = HashMap::new();
    for slot in slots {
        by_day.entry(slot.day).or_default().push(slot);
    }
    let days = Day::ALL
        .iter()
        .map(|day| {
            let mut slots = by_day.remove(day).unwrap_or_default();
            slots.sort_by_key(|s| s.hour);
            DaySchedule {
                day: *day,
                entries: slots.into_iter().map(TimetableEntry::from).collect(),
            }
        })
        .collect();
    Timetable {
        first_hour,
        last_hour,
        days,
    }
}

/// Monday and Friday of the week containing `date`.
pub fn week_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let from_monday = u64::from(date.weekday().num_days_from_monday());
    let monday = date - Days::new(from_monday);
    (monday, monday + Days::new(4))
}

pub fn date_of(week_start: NaiveDate, day: Day) -> NaiveDate {
    week_start + Days::new(day.offset())
}

fn status_of(
    records: &[AttendanceRecord],
    slot_id: i32,
    date: NaiveDate,
    recorder: Recorder,
) -> Option<&AttendanceRecord> {
    records
        .iter()
        .find(|r| r.slot_id == slot_id && r.record_date == date && r.recorder == recorder)
}

/// One row of a recorder's daily attendance sheet.
#[derive(ToSchema, Serialize, Debug)]
pub struct SheetEntry {
    pub record_id: Option<i32>,
    pub status: AttendanceStatus,
    #[serde(flatten)]
    pub entry: TimetableEntry,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct DailySheet {
    pub date: NaiveDate,
    pub day: Option<Day>,
    pub recorder: Recorder,
    pub entries: Vec<SheetEntry>,
}

/// Slots held on `date`, each with what `recorder` has recorded (pending if nothing).
pub fn daily_sheet(
    date: NaiveDate,
    recorder: Recorder,
    slots: Vec<SlotDetail>,
    records: &[AttendanceRecord],
) -> DailySheet {
    let day = Day::of(date);
    let mut entries: Vec<SheetEntry> = slots
        .into_iter()
        .filter(|slot| Some(slot.day) == day)
        .map(|slot| {
            let record = status_of(records, slot.slot_id, date, recorder);
            SheetEntry {
                record_id: record.map(|r| r.record_id),
                status: record.map(|r| r.status).unwrap_or_default(),
                entry: slot.into(),
            }
        })
        .collect();
    entries.sort_by(|a, b| {
        (a.entry.slot.hour, &a.entry.slot.group_name)
            .cmp(&(b.entry.slot.hour, &b.entry.slot.group_name))
    });
    DailySheet {
        date,
        day,
        recorder,
        entries,
    }
}

#[derive(ToSchema, Serialize, Debug)]
pub struct ReportEntry {
    pub checker: AttendanceStatus,
    pub group_leader: AttendanceStatus,
    pub teacher: AttendanceStatus,
    #[serde(flatten)]
    pub entry: TimetableEntry,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct ReportDay {
    pub day: Day,
    pub date: NaiveDate,
    pub entries: Vec<ReportEntry>,
}

#[derive(ToSchema, Serialize, Debug, Default, PartialEq, Eq)]
pub struct RecorderTotals {
    pub present: usize,
    pub absent: usize,
}

#[derive(ToSchema, Serialize, Debug, Default, PartialEq, Eq)]
pub struct WeekStats {
    /// Classes the teacher holds in the week.
    pub total: usize,
    pub checker: RecorderTotals,
    pub group_leader: RecorderTotals,
    pub teacher: RecorderTotals,
}

impl WeekStats {
    fn totals_mut(&mut self, recorder: Recorder) -> &mut RecorderTotals {
        match recorder {
            Recorder::Checker => &mut self.checker,
            Recorder::GroupLeader => &mut self.group_leader,
            Recorder::Teacher => &mut self.teacher,
        }
    }
}

#[derive(ToSchema, Serialize, Debug)]
pub struct WeeklyReport {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub days: Vec<ReportDay>,
    pub stats: WeekStats,
}

/// Lays a teacher's slots over the week containing `date`, with every recorder's status.
pub fn weekly_report(
    date: NaiveDate,
    slots: Vec<SlotDetail>,
    records: &[AttendanceRecord],
) -> WeeklyReport {
    let (week_start, week_end) = week_bounds(date);
    let mut stats = WeekStats {
        total: slots.len(),
        ..WeekStats::default()
    };
    let slot_ids: Vec<i32> = slots.iter().map(|s| s.slot_id).collect();
    for record in records.iter().filter(|r| {
        slot_ids.contains(&r.slot_id) && r.record_date >= week_start && r.record_date <= week_end
    }) {
        let totals = stats.totals_mut(record.recorder);
        match record.status {
            AttendanceStatus::Present => totals.present += 1,
            AttendanceStatus::Absent => totals.absent += 1,
            AttendanceStatus::Pending => {}
        }
    }

    let timetable = build_timetable(slots);
    let days = timetable
        .days
        .into_iter()
        .map(|day_schedule| {
            let date = date_of(week_start, day_schedule.day);
            let lookup = |slot_id, recorder| {
                status_of(records, slot_id, date, recorder)
                    .map(|r| r.status)
                    .unwrap_or_default()
            };
            ReportDay {
                day: day_schedule.day,
                date,
                entries: day_schedule
                    .entries
                    .into_iter()
                    .map(|entry| ReportEntry {
                        checker: lookup(entry.slot.slot_id, Recorder::Checker),
                        group_leader: lookup(entry.slot.slot_id, Recorder::GroupLeader),
                        teacher: lookup(entry.slot.slot_id, Recorder::Teacher),
                        entry,
                    })
                    .collect(),
            }
        })
        .collect();

    WeeklyReport {
        week_start,
        week_end,
        days,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(slot_id: i32, day: Day, hour: i32) -> SlotDetail {
        SlotDetail {
            slot_id,
            day,
            hour,
            attended: false,
            teacher_id: 3,
            teacher_name: "Luis Pérez".into(),
            subject_name: format!("Subject {slot_id}"),
            group_id: 10,
            group_name: "501".into(),
            classroom: Some("A-12".into()),
            building: Some("A".into()),
        }
    }

    fn record(slot_id: i32, date: NaiveDate, recorder: Recorder, status: AttendanceStatus) -> AttendanceRecord {
        AttendanceRecord {
            record_id: slot_id * 100,
            slot_id,
            record_date: date,
            recorder,
            status,
            updated_at: date.and_hms_opt(12, 0, 0).unwrap(),
        }
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn hour_range_covers_classes_or_the_whole_day() {
        assert_eq!(hour_range(&[]), (7, 19));
        let slots = vec![slot(1, Day::Monday, 11), slot(2, Day::Friday, 8), slot(3, Day::Monday, 14)];
        assert_eq!(hour_range(&slots), (8, 14));
    }

    #[test]
    fn timetable_groups_by_day_in_weekday_order() {
        let timetable = build_timetable(vec![
            slot(1, Day::Wednesday, 12),
            slot(2, Day::Monday, 9),
            slot(3, Day::Wednesday, 8),
        ]);
        let days: Vec<Day> = timetable.days.iter().map(|d| d.day).collect();
        assert_eq!(days, Day::ALL.to_vec());
        assert_eq!(timetable.days[0].entries.len(), 1);
        assert!(timetable.days[1].entries.is_empty());
        let wednesday: Vec<i32> = timetable.days[2].entries.iter().map(|e| e.slot.hour).collect();
        assert_eq!(wednesday, vec![8, 12]);
        assert_eq!(timetable.days[2].entries[0].period, "08:00 - 09:00");
        assert_eq!((timetable.first_hour, timetable.last_hour), (8, 12));
    }

    #[test]
    fn week_bounds_run_monday_to_friday() {
        // 2024-11-20 is a Wednesday.
        assert_eq!(week_bounds(ymd(2024, 11, 20)), (ymd(2024, 11, 18), ymd(2024, 11, 22)));
        assert_eq!(week_bounds(ymd(2024, 11, 18)), (ymd(2024, 11, 18), ymd(2024, 11, 22)));
        // Sunday belongs to the week that started the Monday before.
        assert_eq!(week_bounds(ymd(2024, 11, 24)), (ymd(2024, 11, 18), ymd(2024, 11, 22)));
    }

    #[test]
    fn daily_sheet_defaults_to_pending() {
        let tuesday = ymd(2024, 11, 19);
        let slots = vec![
            slot(1, Day::Tuesday, 10),
            slot(2, Day::Tuesday, 7),
            slot(3, Day::Thursday, 7),
        ];
        let records = vec![
            record(1, tuesday, Recorder::GroupLeader, AttendanceStatus::Present),
            record(2, tuesday, Recorder::Checker, AttendanceStatus::Absent),
        ];
        let sheet = daily_sheet(tuesday, Recorder::GroupLeader, slots, &records);
        assert_eq!(sheet.day, Some(Day::Tuesday));
        let rows: Vec<(i32, AttendanceStatus)> = sheet
            .entries
            .iter()
            .map(|e| (e.entry.slot.slot_id, e.status))
            .collect();
        assert_eq!(
            rows,
            vec![(2, AttendanceStatus::Pending), (1, AttendanceStatus::Present)]
        );
        assert_eq!(sheet.entries[1].record_id, Some(100));
    }

    #[test]
    fn daily_sheet_is_empty_on_weekends() {
        let saturday = ymd(2024, 11, 23);
        let sheet = daily_sheet(saturday, Recorder::Checker, vec![slot(1, Day::Friday, 9)], &[]);
        assert_eq!(sheet.day, None);
        assert!(sheet.entries.is_empty());
    }

    #[test]
    fn weekly_report_counts_each_recorder() {
        let monday = ymd(2024, 11, 18);
        let wednesday = ymd(2024, 11, 20);
        let slots = vec![slot(1, Day::Monday, 9), slot(2, Day::Wednesday, 9)];
        let records = vec![
            record(1, monday, Recorder::Checker, AttendanceStatus::Present),
            record(1, monday, Recorder::Teacher, AttendanceStatus::Present),
            record(2, wednesday, Recorder::Checker, AttendanceStatus::Absent),
            record(2, wednesday, Recorder::GroupLeader, AttendanceStatus::Pending),
            // previous week, outside the report
            record(1, ymd(2024, 11, 11), Recorder::Checker, AttendanceStatus::Absent),
        ];
        let report = weekly_report(ymd(2024, 11, 21), slots, &records);

        assert_eq!(report.week_start, monday);
        assert_eq!(report.week_end, ymd(2024, 11, 22));
        assert_eq!(
            report.stats,
            WeekStats {
                total: 2,
                checker: RecorderTotals { present: 1, absent: 1 },
                group_leader: RecorderTotals::default(),
                teacher: RecorderTotals { present: 1, absent: 0 },
            }
        );

        let monday_row = &report.days[0].entries[0];
        assert_eq!(report.days[0].date, monday);
        assert_eq!(monday_row.checker, AttendanceStatus::Present);
        assert_eq!(monday_row.group_leader, AttendanceStatus::Pending);
        assert_eq!(monday_row.teacher, AttendanceStatus::Present);

        let wednesday_row = &report.days[2].entries[0];
        assert_eq!(report.days[2].date, wednesday);
        assert_eq!(wednesday_row.checker, AttendanceStatus::Absent);
        assert!(report.days[1].entries.is_empty());
    }
}
