//! Clinic calendars: opening weekdays, public holidays and daily capacity.
//!
//! A [`CalendarFacility`] holds no date-specific state. Holidays come from a [`HolidaySource`]
//! that may be refreshed out-of-band, and capacity from a [`CapacityPolicy`], so every
//! `is_open` answer reflects the current holiday data.

use crate::constants::DEFAULT_SEARCH_WINDOW_MONTHS;
use crate::store::AppointmentStore;
use crate::{EdcError, EdcResult};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc, Weekday};
use edc_protocol::FacilityData;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, RwLock};

// ============================================================================
// HOLIDAYS
// ============================================================================

/// Supplies the calendar dates a facility is closed for.
pub trait HolidaySource: Send + Sync {
    fn is_holiday(&self, date: NaiveDate) -> bool;
}

/// A holiday source with no holidays.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHolidays;

impl HolidaySource for NoHolidays {
    fn is_holiday(&self, _date: NaiveDate) -> bool {
        false
    }
}

/// In-memory holiday set that can be replaced while facilities hold a reference to it.
#[derive(Debug, Default)]
pub struct Holidays {
    dates: RwLock<BTreeSet<NaiveDate>>,
}

impl Holidays {
    pub fn new(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            dates: RwLock::new(dates.into_iter().collect()),
        }
    }

    /// Swap in a fresh set of dates.
    pub fn replace(&self, dates: impl IntoIterator<Item = NaiveDate>) -> EdcResult<()> {
        let mut guard = self.dates.write().map_err(|_| EdcError::LockPoisoned)?;
        *guard = dates.into_iter().collect();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.dates.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HolidaySource for Holidays {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        // A poisoned lock still holds the last complete set.
        match self.dates.read() {
            Ok(dates) => dates.contains(&date),
            Err(poisoned) => poisoned.into_inner().contains(&date),
        }
    }
}

// ============================================================================
// CAPACITY
// ============================================================================

/// Decides whether a facility still has a free slot on a date.
pub trait CapacityPolicy: Send + Sync {
    fn has_capacity(&self, facility: &CalendarFacility, date: NaiveDate) -> bool;
}

/// Every open day has capacity.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unconstrained;

impl CapacityPolicy for Unconstrained {
    fn has_capacity(&self, _facility: &CalendarFacility, _date: NaiveDate) -> bool {
        true
    }
}

/// Counts appointments already booked at the facility against `slots_per_day`.
pub struct BookedSlots {
    appointments: Arc<dyn AppointmentStore>,
}

impl BookedSlots {
    pub fn new(appointments: Arc<dyn AppointmentStore>) -> Self {
        Self { appointments }
    }
}

impl CapacityPolicy for BookedSlots {
    fn has_capacity(&self, facility: &CalendarFacility, date: NaiveDate) -> bool {
        let Some(max) = facility.slots_per_day() else {
            return true;
        };
        match self.appointments.count_for_facility_on(facility.name(), date) {
            Ok(booked) => booked < max as usize,
            Err(e) => {
                tracing::warn!("capacity lookup failed for {} on {}: {}", facility.name(), date, e);
                false
            }
        }
    }
}

// ============================================================================
// CALENDAR FACILITY
// ============================================================================

/// A clinic's open weekdays, holidays and capacity.
#[derive(Clone)]
pub struct CalendarFacility {
    name: String,
    weekdays: Vec<Weekday>,
    slots_per_day: Option<u32>,
    default_search_months: u32,
    holidays: Arc<dyn HolidaySource>,
    capacity: Arc<dyn CapacityPolicy>,
}

impl fmt::Debug for CalendarFacility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalendarFacility")
            .field("name", &self.name)
            .field("weekdays", &self.weekdays)
            .field("slots_per_day", &self.slots_per_day)
            .finish_non_exhaustive()
    }
}

impl CalendarFacility {
    /// Create a facility open on `weekdays`, closed on the source's holidays, with unconstrained
    /// capacity.
    pub fn new(
        name: impl Into<String>,
        weekdays: impl IntoIterator<Item = Weekday>,
        holidays: Arc<dyn HolidaySource>,
    ) -> EdcResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EdcError::InvalidInput("facility name cannot be empty".into()));
        }

        let mut days: Vec<Weekday> = Vec::new();
        for day in weekdays {
            if !days.contains(&day) {
                days.push(day);
            }
        }
        if days.is_empty() {
            return Err(EdcError::InvalidInput(format!(
                "facility '{name}' must open on at least one weekday"
            )));
        }
        days.sort_by_key(|d| d.num_days_from_monday());

        Ok(Self {
            name,
            weekdays: days,
            slots_per_day: None,
            default_search_months: DEFAULT_SEARCH_WINDOW_MONTHS,
            holidays,
            capacity: Arc::new(Unconstrained),
        })
    }

    /// Build a facility from its protocol file entry.
    pub fn from_data(data: &FacilityData, holidays: Arc<dyn HolidaySource>) -> EdcResult<Self> {
        let mut facility = Self::new(data.name.as_str(), data.weekdays.iter().copied(), holidays)?;
        facility.slots_per_day = data.slots_per_day;
        Ok(facility)
    }

    pub fn with_slots_per_day(mut self, slots: u32) -> Self {
        self.slots_per_day = Some(slots);
        self
    }

    pub fn with_capacity_policy(mut self, capacity: Arc<dyn CapacityPolicy>) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_default_search_months(mut self, months: u32) -> Self {
        self.default_search_months = months.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weekdays(&self) -> &[Weekday] {
        &self.weekdays
    }

    pub fn slots_per_day(&self) -> Option<u32> {
        self.slots_per_day
    }

    /// True iff the date falls on an open weekday, is not a holiday, and has capacity.
    pub fn is_open(&self, date: NaiveDate) -> bool {
        self.weekdays.contains(&date.weekday())
            && !self.holidays.is_holiday(date)
            && self.capacity.has_capacity(self, date)
    }

    /// Walk forward a day at a time from `suggested`, keeping its time of day, until an open
    /// date is found.
    ///
    /// `search_window` bounds the walk (inclusive); `None` means the facility's default number of
    /// calendar months.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::NoAvailableSlot`] if no open date exists within the window.
    pub fn nearest_open_date(
        &self,
        suggested: DateTime<Utc>,
        search_window: Option<Duration>,
    ) -> EdcResult<DateTime<Utc>> {
        let until = match search_window {
            Some(window) => suggested.checked_add_signed(window),
            None => suggested.checked_add_months(Months::new(self.default_search_months)),
        }
        .ok_or_else(|| EdcError::InvalidInput(format!("search window overflows from {suggested}")))?;

        let mut candidate = Some(suggested);
        while let Some(day) = candidate.filter(|day| *day <= until) {
            if self.is_open(day.date_naive()) {
                return Ok(day);
            }
            candidate = day.checked_add_signed(Duration::days(1));
        }

        tracing::warn!(
            "no open slot at {} between {} and {}",
            self.name,
            suggested,
            until
        );
        Err(EdcError::NoAvailableSlot {
            facility: self.name.clone(),
            from: suggested,
            until,
        })
    }
}
