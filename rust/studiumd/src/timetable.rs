use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Day {
    pub const ALL: [Day; 7] = [
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
        Day::Saturday,
        Day::Sunday,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Day::Monday => "Monday",
            Day::Tuesday => "Tuesday",
            Day::Wednesday => "Wednesday",
            Day::Thursday => "Thursday",
            Day::Friday => "Friday",
            Day::Saturday => "Saturday",
            Day::Sunday => "Sunday",
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown day `{0}`")]
pub struct DayParseError(pub String);

impl FromStr for Day {
    type Err = DayParseError;

    /// Accepts full names ("Monday") and three-letter abbreviations ("mon").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        Day::ALL
            .into_iter()
            .find(|d| {
                let name = d.as_str();
                t.eq_ignore_ascii_case(name) || t.eq_ignore_ascii_case(&name[..3])
            })
            .ok_or_else(|| DayParseError(s.to_string()))
    }
}

impl Serialize for Day {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Day {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Time of day as minutes since midnight. `24:00` (1440) is the end of the
/// day; it can close a range but nothing can start there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeOfDay(u16);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid time `{0}`: expected HH:MM (24-hour)")]
pub struct TimeParseError(pub String);

impl TimeOfDay {
    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 || hour > 24 || (hour == 24 && minute != 0) {
            return None;
        }
        Some(Self(hour * 60 + minute))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || TimeParseError(s.to_string());
        let t = s.trim();
        // "9:30" is fine, "09:5" is not: the minute field is always two digits.
        let (h, m) = t.split_once(':').ok_or_else(bad)?;
        let digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
        if !(1..=2).contains(&h.len()) || m.len() != 2 || !digits(h) || !digits(m) {
            return Err(bad());
        }
        if t == "24:00" {
            return Ok(TimeOfDay(MINUTES_PER_DAY));
        }
        let parsed = NaiveTime::parse_from_str(t, "%H:%M").map_err(|_| bad())?;
        TimeOfDay::from_hm(parsed.hour() as u16, parsed.minute() as u16).ok_or_else(bad)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A classroom's availability window on one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySchedule {
    pub day: Day,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
}

impl DaySchedule {
    pub fn contains(&self, start: TimeOfDay, end: TimeOfDay) -> bool {
        start >= self.start_time && end <= self.end_time
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("Classroom schedule for {day} must end after it starts ({start}-{end}).")]
    InvalidWindow {
        day: Day,
        start: TimeOfDay,
        end: TimeOfDay,
    },
    #[error("Classroom schedule lists {day} more than once.")]
    DuplicateDay { day: Day },
}

/// Weekly availability of a classroom, at most one window per day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassroomSchedule {
    windows: Vec<DaySchedule>,
}

impl ClassroomSchedule {
    pub fn new(windows: Vec<DaySchedule>) -> Result<Self, ScheduleError> {
        for (i, w) in windows.iter().enumerate() {
            if w.end_time <= w.start_time {
                return Err(ScheduleError::InvalidWindow {
                    day: w.day,
                    start: w.start_time,
                    end: w.end_time,
                });
            }
            if windows[..i].iter().any(|prev| prev.day == w.day) {
                return Err(ScheduleError::DuplicateDay { day: w.day });
            }
        }
        Ok(Self { windows })
    }

    pub fn window(&self, day: Day) -> Option<&DaySchedule> {
        self.windows.iter().find(|w| w.day == day)
    }

    pub fn windows(&self) -> &[DaySchedule] {
        &self.windows
    }
}

/// One subject's proposed slot in a timetable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub subject: String,
    pub day: Day,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
}

impl SessionEntry {
    /// Half-open overlap: `[s1,t1)` and `[s2,t2)` intersect iff `s1 < t2 && s2 < t1`.
    pub fn overlaps(&self, other: &SessionEntry) -> bool {
        self.day == other.day
            && self.start_time < other.end_time
            && other.start_time < self.end_time
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("End time must be greater than start time for {subject} on {day}")]
    InvalidRange {
        index: usize,
        subject: String,
        day: Day,
        start: TimeOfDay,
        end: TimeOfDay,
    },
    #[error("Schedule for {day} is out of the classroom's scheduled days.")]
    DayNotScheduled {
        index: usize,
        subject: String,
        day: Day,
    },
    #[error("Schedule for {subject} on {day} is out of the classroom's time range.")]
    OutOfRange {
        index: usize,
        subject: String,
        day: Day,
        start: TimeOfDay,
        end: TimeOfDay,
        window: (TimeOfDay, TimeOfDay),
    },
    #[error("Schedules for {first_subject} and {second_subject} on {day} overlap.")]
    OverlapConflict {
        first_index: usize,
        first_subject: String,
        second_index: usize,
        second_subject: String,
        day: Day,
    },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidRange { .. } => "invalid_range",
            ValidationError::DayNotScheduled { .. } => "day_not_scheduled",
            ValidationError::OutOfRange { .. } => "out_of_range",
            ValidationError::OverlapConflict { .. } => "overlap_conflict",
        }
    }

    /// Structured context for the form layer, e.g. to highlight the offending rows.
    pub fn details(&self) -> serde_json::Value {
        match self {
            ValidationError::InvalidRange {
                index,
                subject,
                day,
                start,
                end,
            } => json!({
                "reason": self.code(),
                "index": index,
                "subject": subject,
                "day": day,
                "startTime": start,
                "endTime": end,
            }),
            ValidationError::DayNotScheduled {
                index,
                subject,
                day,
            } => json!({
                "reason": self.code(),
                "index": index,
                "subject": subject,
                "day": day,
            }),
            ValidationError::OutOfRange {
                index,
                subject,
                day,
                start,
                end,
                window,
            } => json!({
                "reason": self.code(),
                "index": index,
                "subject": subject,
                "day": day,
                "startTime": start,
                "endTime": end,
                "windowStart": window.0,
                "windowEnd": window.1,
            }),
            ValidationError::OverlapConflict {
                first_index,
                first_subject,
                second_index,
                second_subject,
                day,
            } => json!({
                "reason": self.code(),
                "day": day,
                "indexes": [first_index, second_index],
                "subjects": [first_subject, second_subject],
            }),
        }
    }
}

/// Checks a candidate timetable against a classroom's weekly windows.
///
/// Every entry is checked for ordering and containment first, in input
/// order; same-day pairs are then checked for overlap. The first failure
/// is returned.
pub fn validate(
    classroom: &ClassroomSchedule,
    candidate: &[SessionEntry],
) -> Result<(), ValidationError> {
    for (index, e) in candidate.iter().enumerate() {
        if e.end_time <= e.start_time {
            return Err(ValidationError::InvalidRange {
                index,
                subject: e.subject.clone(),
                day: e.day,
                start: e.start_time,
                end: e.end_time,
            });
        }
        let Some(window) = classroom.window(e.day) else {
            return Err(ValidationError::DayNotScheduled {
                index,
                subject: e.subject.clone(),
                day: e.day,
            });
        };
        if !window.contains(e.start_time, e.end_time) {
            return Err(ValidationError::OutOfRange {
                index,
                subject: e.subject.clone(),
                day: e.day,
                start: e.start_time,
                end: e.end_time,
                window: (window.start_time, window.end_time),
            });
        }
    }

    for (i, a) in candidate.iter().enumerate() {
        for (j, b) in candidate.iter().enumerate().skip(i + 1) {
            if a.overlaps(b) {
                return Err(ValidationError::OverlapConflict {
                    first_index: i,
                    first_subject: a.subject.clone(),
                    second_index: j,
                    second_subject: b.subject.clone(),
                    day: a.day,
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().expect("time")
    }

    fn window(day: Day, start: &str, end: &str) -> DaySchedule {
        DaySchedule {
            day,
            start_time: t(start),
            end_time: t(end),
        }
    }

    fn entry(subject: &str, day: Day, start: &str, end: &str) -> SessionEntry {
        SessionEntry {
            subject: subject.to_string(),
            day,
            start_time: t(start),
            end_time: t(end),
        }
    }

    fn monday_morning() -> ClassroomSchedule {
        ClassroomSchedule::new(vec![window(Day::Monday, "09:00", "12:00")]).expect("schedule")
    }

    #[test]
    fn accepts_contained_session() {
        let c = monday_morning();
        let r = validate(&c, &[entry("Math", Day::Monday, "09:00", "10:00")]);
        assert_eq!(r, Ok(()));
    }

    #[test]
    fn rejects_inverted_range() {
        let c = monday_morning();
        let err = validate(&c, &[entry("Math", Day::Monday, "10:00", "09:30")]).unwrap_err();
        assert_eq!(err.code(), "invalid_range");
        assert_eq!(
            err.to_string(),
            "End time must be greater than start time for Math on Monday"
        );
    }

    #[test]
    fn rejects_zero_length_range() {
        let c = monday_morning();
        let err = validate(&c, &[entry("Math", Day::Monday, "10:00", "10:00")]).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRange { index: 0, .. }));
    }

    #[test]
    fn rejects_unscheduled_day() {
        let c = monday_morning();
        let err = validate(&c, &[entry("Math", Day::Tuesday, "09:00", "10:00")]).unwrap_err();
        assert_eq!(err.code(), "day_not_scheduled");
        assert_eq!(
            err.to_string(),
            "Schedule for Tuesday is out of the classroom's scheduled days."
        );
    }

    #[test]
    fn rejects_session_starting_before_window() {
        let c = monday_morning();
        let err = validate(&c, &[entry("Math", Day::Monday, "08:00", "10:00")]).unwrap_err();
        assert_eq!(err.code(), "out_of_range");
        assert_eq!(
            err.to_string(),
            "Schedule for Math on Monday is out of the classroom's time range."
        );
        assert_eq!(err.details()["windowStart"], "09:00");
        assert_eq!(err.details()["windowEnd"], "12:00");
    }

    #[test]
    fn rejects_session_ending_after_window() {
        let c = monday_morning();
        let err = validate(&c, &[entry("Art", Day::Monday, "11:00", "12:01")]).unwrap_err();
        assert_eq!(err.code(), "out_of_range");
    }

    #[test]
    fn accepts_session_filling_whole_window() {
        let c = monday_morning();
        assert_eq!(
            validate(&c, &[entry("Math", Day::Monday, "09:00", "12:00")]),
            Ok(())
        );
    }

    #[test]
    fn rejects_overlapping_pair() {
        let c = monday_morning();
        let err = validate(
            &c,
            &[
                entry("Math", Day::Monday, "09:00", "10:00"),
                entry("Sci", Day::Monday, "09:30", "10:30"),
            ],
        )
        .unwrap_err();
        assert_eq!(err.code(), "overlap_conflict");
        assert_eq!(err.to_string(), "Schedules for Math and Sci on Monday overlap.");
        assert_eq!(err.details()["indexes"], json!([0, 1]));
    }

    #[test]
    fn accepts_touching_endpoints() {
        let c = monday_morning();
        let r = validate(
            &c,
            &[
                entry("Math", Day::Monday, "09:00", "10:00"),
                entry("Sci", Day::Monday, "10:00", "11:00"),
            ],
        );
        assert_eq!(r, Ok(()));
    }

    #[test]
    fn rejects_fully_nested_pair() {
        let c = monday_morning();
        let err = validate(
            &c,
            &[
                entry("Long", Day::Monday, "09:00", "12:00"),
                entry("Short", Day::Monday, "10:00", "10:30"),
            ],
        )
        .unwrap_err();
        assert_eq!(err.code(), "overlap_conflict");
    }

    #[test]
    fn same_times_on_different_days_do_not_conflict() {
        let c = ClassroomSchedule::new(vec![
            window(Day::Monday, "09:00", "12:00"),
            window(Day::Tuesday, "09:00", "12:00"),
        ])
        .expect("schedule");
        let r = validate(
            &c,
            &[
                entry("Math", Day::Monday, "09:00", "10:00"),
                entry("Math", Day::Tuesday, "09:00", "10:00"),
            ],
        );
        assert_eq!(r, Ok(()));
    }

    #[test]
    fn per_entry_checks_run_before_overlap_checks() {
        let c = monday_morning();
        let err = validate(
            &c,
            &[
                entry("Math", Day::Monday, "09:00", "10:00"),
                entry("Sci", Day::Monday, "09:30", "10:30"),
                entry("Art", Day::Friday, "09:00", "10:00"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::DayNotScheduled { index: 2, .. }));
    }

    #[test]
    fn empty_candidate_is_accepted() {
        assert_eq!(validate(&monday_morning(), &[]), Ok(()));
        assert_eq!(validate(&ClassroomSchedule::default(), &[]), Ok(()));
    }

    #[test]
    fn validation_is_repeatable() {
        let c = monday_morning();
        let cand = vec![
            entry("Math", Day::Monday, "09:00", "10:00"),
            entry("Sci", Day::Monday, "09:59", "10:30"),
        ];
        assert_eq!(validate(&c, &cand), validate(&c, &cand));
    }

    #[test]
    fn classroom_schedule_rejects_bad_windows() {
        let inverted = ClassroomSchedule::new(vec![window(Day::Monday, "12:00", "09:00")]);
        assert!(matches!(inverted, Err(ScheduleError::InvalidWindow { .. })));

        let dup = ClassroomSchedule::new(vec![
            window(Day::Monday, "09:00", "12:00"),
            window(Day::Monday, "13:00", "15:00"),
        ]);
        assert_eq!(dup, Err(ScheduleError::DuplicateDay { day: Day::Monday }));
    }

    #[test]
    fn time_parsing_normalizes_to_minutes() {
        assert_eq!(t("00:00").minutes(), 0);
        assert_eq!(t("9:05").minutes(), 545);
        assert_eq!(t("23:59").minutes(), 1439);
        assert_eq!(t("24:00").minutes(), MINUTES_PER_DAY);
        assert_eq!(t("24:00").to_string(), "24:00");
        assert_eq!(t(" 10:00 ").to_string(), "10:00");
        assert!(t("9:50") < t("10:00"));
        assert_eq!(TimeOfDay::from_minutes(MINUTES_PER_DAY + 1), None);
        assert_eq!(TimeOfDay::from_hm(24, 1), None);

        for bad in ["24:01", "25:00", "09:5", "9", "", "ab:cd", "12:60", "09:00:00", "-1:00"] {
            assert!(bad.parse::<TimeOfDay>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn evening_window_can_close_at_midnight() {
        let c = ClassroomSchedule::new(vec![window(Day::Friday, "18:00", "24:00")])
            .expect("schedule");
        assert_eq!(
            validate(&c, &[entry("Astronomy", Day::Friday, "22:00", "24:00")]),
            Ok(())
        );
        let r = validate(&c, &[entry("Late", Day::Friday, "24:00", "24:00")]);
        assert!(matches!(r, Err(ValidationError::InvalidRange { .. })));
    }

    #[test]
    fn day_parsing_accepts_names_and_abbreviations() {
        assert_eq!("Monday".parse::<Day>(), Ok(Day::Monday));
        assert_eq!("sun".parse::<Day>(), Ok(Day::Sunday));
        assert_eq!("WEDNESDAY".parse::<Day>(), Ok(Day::Wednesday));
        assert!("Funday".parse::<Day>().is_err());
        assert!("M".parse::<Day>().is_err());
    }

    #[test]
    fn session_entry_wire_shape() {
        let e: SessionEntry = serde_json::from_value(json!({
            "subject": "Math",
            "day": "Monday",
            "startTime": "09:00",
            "endTime": "10:00"
        }))
        .expect("entry");
        assert_eq!(e, entry("Math", Day::Monday, "09:00", "10:00"));
        assert_eq!(serde_json::to_value(&e).expect("json")["startTime"], "09:00");
    }

    fn span() -> impl Strategy<Value = (u16, u16)> {
        (0u16..MINUTES_PER_DAY).prop_flat_map(|s| (Just(s), (s + 1)..=MINUTES_PER_DAY))
    }

    fn tod(m: u16) -> TimeOfDay {
        TimeOfDay::from_minutes(m).expect("minute of day")
    }

    fn all_day(day: Day) -> ClassroomSchedule {
        ClassroomSchedule::new(vec![DaySchedule {
            day,
            start_time: tod(0),
            end_time: tod(MINUTES_PER_DAY),
        }])
        .expect("schedule")
    }

    proptest! {
        #[test]
        fn pair_verdict_matches_half_open_overlap(a in span(), b in span()) {
            let c = all_day(Day::Monday);
            let cand = vec![
                SessionEntry { subject: "A".into(), day: Day::Monday, start_time: tod(a.0), end_time: tod(a.1) },
                SessionEntry { subject: "B".into(), day: Day::Monday, start_time: tod(b.0), end_time: tod(b.1) },
            ];
            let intersects = a.0 < b.1 && b.0 < a.1;
            let r = validate(&c, &cand);
            prop_assert_eq!(r.is_err(), intersects);
            if let Err(e) = r {
                prop_assert_eq!(e.code(), "overlap_conflict");
            }
        }

        #[test]
        fn back_to_back_slots_inside_window_are_accepted(
            win in span(),
            cuts in proptest::collection::btree_set(0u16..MINUTES_PER_DAY, 0..12),
        ) {
            let c = ClassroomSchedule::new(vec![DaySchedule {
                day: Day::Thursday,
                start_time: tod(win.0),
                end_time: tod(win.1),
            }]).expect("schedule");
            let mut points = vec![win.0];
            points.extend(cuts.into_iter().filter(|m| *m > win.0 && *m < win.1));
            points.push(win.1);
            let cand: Vec<SessionEntry> = points
                .windows(2)
                .enumerate()
                .map(|(i, p)| SessionEntry {
                    subject: format!("S{i}"),
                    day: Day::Thursday,
                    start_time: tod(p[0]),
                    end_time: tod(p[1]),
                })
                .collect();
            prop_assert_eq!(validate(&c, &cand), Ok(()));
        }

        #[test]
        fn non_increasing_range_is_always_invalid(s in 0u16..MINUTES_PER_DAY, back in 0u16..120) {
            let c = all_day(Day::Saturday);
            let e = SessionEntry {
                subject: "X".into(),
                day: Day::Saturday,
                start_time: tod(s),
                end_time: tod(s.saturating_sub(back)),
            };
            let r = validate(&c, &[e]);
            prop_assert!(matches!(r, Err(ValidationError::InvalidRange { .. })), "got {:?}", r);
        }

        #[test]
        fn containment_matches_subset_test(win in span(), e in span()) {
            let c = ClassroomSchedule::new(vec![DaySchedule {
                day: Day::Friday,
                start_time: tod(win.0),
                end_time: tod(win.1),
            }]).expect("schedule");
            let cand = [SessionEntry { subject: "X".into(), day: Day::Friday, start_time: tod(e.0), end_time: tod(e.1) }];
            let inside = e.0 >= win.0 && e.1 <= win.1;
            let r = validate(&c, &cand);
            prop_assert_eq!(r.is_ok(), inside);
            prop_assert_eq!(validate(&c, &cand), r);
        }
    }
}
