use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type OwnerId = i64;
pub type ServiceId = i64;

/// Time-of-day layout used on every external surface ("HH:MM").
pub const TIME_LAYOUT: &str = "%H:%M";
/// Calendar date layout ("YYYY-MM-DD").
pub const DATE_LAYOUT: &str = "%Y-%m-%d";

pub fn parse_time_of_day(text: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), TIME_LAYOUT).ok()
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), DATE_LAYOUT).ok()
}

pub fn format_time(t: NaiveTime) -> String {
    t.format(TIME_LAYOUT).to_string()
}

/// Half-open time-of-day interval `[start, end)` within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn checked(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Exact boundary adjacency: one span ends where the other starts.
    pub fn touches(&self, other: &Span) -> bool {
        self.end == other.start || self.start == other.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_time(self.start), format_time(self.end))
    }
}

/// One owner's schedule for one calendar date. Every row lives in exactly one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DayKey {
    pub owner_id: OwnerId,
    pub date: NaiveDate,
}

impl DayKey {
    pub fn new(owner_id: OwnerId, date: NaiveDate) -> Self {
        Self { owner_id, date }
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner {} on {}", self.owner_id, self.date)
    }
}

/// A contiguous bookable span of an owner's day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeInterval {
    pub id: Ulid,
    pub owner_id: OwnerId,
    pub date: NaiveDate,
    pub span: Span,
}

impl FreeInterval {
    pub fn day(&self) -> DayKey {
        DayKey::new(self.owner_id, self.date)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub handle: Option<String>,
}

/// A confirmed booking. Once created it no longer references any free interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub owner_id: OwnerId,
    pub service_id: ServiceId,
    pub date: NaiveDate,
    pub span: Span,
    pub customer: Customer,
    pub created_at: DateTime<Utc>,
}

impl Appointment {
    pub fn day(&self) -> DayKey {
        DayKey::new(self.owner_id, self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub owner_id: OwnerId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct DayState {
    pub day: DayKey,
    /// Free intervals, sorted by `span.start`, pairwise non-overlapping.
    pub free: Vec<FreeInterval>,
    /// Appointments, sorted by `span.start`.
    pub appointments: Vec<Appointment>,
}

impl DayState {
    pub fn new(day: DayKey) -> Self {
        Self {
            day,
            free: Vec::new(),
            appointments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty() && self.appointments.is_empty()
    }

    /// Insert a free interval maintaining sort order by span.start.
    pub fn insert_free(&mut self, interval: FreeInterval) {
        let pos = self
            .free
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.free.insert(pos, interval);
    }

    pub fn remove_free(&mut self, id: Ulid) -> Option<FreeInterval> {
        let pos = self.free.iter().position(|i| i.id == id)?;
        Some(self.free.remove(pos))
    }

    /// Free intervals with `start <= span.start && end >= span.end`, earliest start first.
    pub fn containing(&self, span: &Span) -> impl Iterator<Item = &FreeInterval> {
        // Everything at index >= right_bound starts after span.start → can't contain it.
        let right_bound = self.free.partition_point(|i| i.span.start <= span.start);
        self.free[..right_bound]
            .iter()
            .filter(move |i| i.span.end >= span.end)
    }

    /// Free intervals whose end equals `span.start` or whose start equals `span.end`.
    pub fn adjacent(&self, span: &Span) -> impl Iterator<Item = &FreeInterval> {
        self.free.iter().filter(move |i| i.span.touches(span))
    }

    /// Free intervals sharing at least one instant with `span`.
    pub fn overlapping(&self, span: &Span) -> impl Iterator<Item = &FreeInterval> {
        let right_bound = self.free.partition_point(|i| i.span.start < span.end);
        self.free[..right_bound]
            .iter()
            .filter(move |i| i.span.end > span.start)
    }

    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }
}

/// Row-level change recorded by a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    InsertFree(FreeInterval),
    DeleteFree(Ulid),
    InsertAppointment(Appointment),
    DeleteAppointment(Ulid),
}

/// Which public operation produced a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnKind {
    SaveDay,
    Book,
    Cancel,
}

impl TxnKind {
    pub fn label(self) -> &'static str {
        match self {
            TxnKind::SaveDay => "save_day",
            TxnKind::Book => "book",
            TxnKind::Cancel => "cancel",
        }
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceRegistered {
        id: ServiceId,
        owner_id: OwnerId,
        name: String,
    },
    Committed {
        day: DayKey,
        kind: TxnKind,
        ops: Vec<Op>,
    },
    /// Full state of one day, written by WAL compaction.
    DaySnapshot {
        day: DayKey,
        free: Vec<FreeInterval>,
        appointments: Vec<Appointment>,
    },
}

impl Event {
    pub fn owner_id(&self) -> OwnerId {
        match self {
            Event::ServiceRegistered { owner_id, .. } => *owner_id,
            Event::Committed { day, .. } | Event::DaySnapshot { day, .. } => day.owner_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Free intervals per date for a window of days. Empty days are absent.
pub type ScheduleRange = BTreeMap<NaiveDate, Vec<FreeInterval>>;

/// One submitted `{"start": "HH:MM", "end": "HH:MM"}` pair, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeRangeInput {
    pub start: String,
    pub end: String,
}

impl TimeRangeInput {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub owner_id: OwnerId,
    pub service_id: ServiceId,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub customer: Customer,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn t(text: &str) -> NaiveTime {
        parse_time_of_day(text).unwrap()
    }

    pub(crate) fn span(start: &str, end: &str) -> Span {
        Span::new(t(start), t(end))
    }

    fn day() -> DayKey {
        DayKey::new(7, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap())
    }

    fn free(start: &str, end: &str) -> FreeInterval {
        FreeInterval {
            id: Ulid::new(),
            owner_id: 7,
            date: day().date,
            span: span(start, end),
        }
    }

    #[test]
    fn parses_hh_mm_only() {
        assert_eq!(t("09:30"), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert!(parse_time_of_day("24:00").is_none());
        assert!(parse_time_of_day("9am").is_none());
        assert!(parse_time_of_day("09:30:15").is_none());
        assert!(parse_time_of_day("").is_none());
        assert_eq!(format_time(t("07:05")), "07:05");
    }

    #[test]
    fn span_basics() {
        let s = span("09:00", "10:30");
        assert_eq!(s.minutes(), 90);
        assert_eq!(s.to_string(), "[09:00, 10:30)");
        assert!(Span::checked(t("10:00"), t("10:00")).is_none());
        assert!(Span::checked(t("11:00"), t("10:00")).is_none());
    }

    #[test]
    fn span_overlap_and_touch() {
        let a = span("09:00", "10:00");
        let b = span("09:30", "11:00");
        let c = span("10:00", "11:00");
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(a.touches(&c));
        assert!(c.touches(&a));
        assert!(!a.touches(&b));
    }

    #[test]
    fn span_contains_span() {
        let outer = span("09:00", "17:00");
        assert!(outer.contains_span(&span("10:00", "10:30")));
        assert!(outer.contains_span(&outer)); // self-containment
        assert!(!outer.contains_span(&span("08:30", "09:30")));
    }

    #[test]
    fn free_intervals_stay_sorted() {
        let mut ds = DayState::new(day());
        ds.insert_free(free("13:00", "17:00"));
        ds.insert_free(free("08:00", "09:00"));
        ds.insert_free(free("09:30", "12:00"));
        let starts: Vec<_> = ds.free.iter().map(|f| format_time(f.span.start)).collect();
        assert_eq!(starts, ["08:00", "09:30", "13:00"]);
    }

    #[test]
    fn containing_requires_full_cover() {
        let mut ds = DayState::new(day());
        ds.insert_free(free("09:00", "12:00"));
        ds.insert_free(free("13:00", "17:00"));

        let hits: Vec<_> = ds.containing(&span("09:00", "12:00")).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, span("09:00", "12:00"));

        assert_eq!(ds.containing(&span("11:30", "13:30")).count(), 0);
        assert_eq!(ds.containing(&span("12:00", "13:00")).count(), 0);
        assert_eq!(ds.containing(&span("16:00", "17:30")).count(), 0);
    }

    #[test]
    fn adjacent_is_exact_boundary_only() {
        let mut ds = DayState::new(day());
        ds.insert_free(free("09:00", "10:00"));
        ds.insert_free(free("10:30", "17:00"));
        ds.insert_free(free("08:00", "08:30"));

        let hits: Vec<_> = ds.adjacent(&span("10:00", "10:30")).map(|f| f.span).collect();
        assert_eq!(hits, vec![span("09:00", "10:00"), span("10:30", "17:00")]);

        // Overlap without a shared boundary is not adjacency.
        assert_eq!(ds.adjacent(&span("09:30", "10:15")).count(), 0);
    }

    #[test]
    fn overlapping_skips_touching() {
        let mut ds = DayState::new(day());
        ds.insert_free(free("09:00", "10:00"));
        ds.insert_free(free("11:00", "12:00"));
        assert_eq!(ds.overlapping(&span("10:00", "11:00")).count(), 0);
        assert_eq!(ds.overlapping(&span("09:59", "11:01")).count(), 2);
    }

    #[test]
    fn appointments_sorted_and_removable() {
        let mut ds = DayState::new(day());
        let mk = |start: &str, end: &str| Appointment {
            id: Ulid::new(),
            owner_id: 7,
            service_id: 1,
            date: day().date,
            span: span(start, end),
            customer: Customer::default(),
            created_at: Utc::now(),
        };
        let late = mk("15:00", "16:00");
        let early = mk("09:00", "09:30");
        let late_id = late.id;
        ds.insert_appointment(late);
        ds.insert_appointment(early);
        assert_eq!(ds.appointments[0].span, span("09:00", "09:30"));
        assert!(ds.appointments.iter().any(|a| a.id == late_id));
        assert!(ds.remove_appointment(late_id).is_some());
        assert!(ds.remove_appointment(late_id).is_none());
        assert_eq!(ds.appointments.len(), 1);
    }

    #[test]
    fn txn_kind_labels_are_distinct() {
        let labels = [TxnKind::SaveDay, TxnKind::Book, TxnKind::Cancel].map(TxnKind::label);
        assert_eq!(labels, ["save_day", "book", "cancel"]);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::Committed {
            day: day(),
            kind: TxnKind::SaveDay,
            ops: vec![Op::InsertFree(free("09:00", "17:00")), Op::DeleteFree(Ulid::new())],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.owner_id(), 7);
    }
}
