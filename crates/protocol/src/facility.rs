//! Facility and holiday files (`facilities.yaml`, `holidays.yaml`).

use crate::{ensure_unique, parse_yaml, read_file, ProtocolResult};
use chrono::{NaiveDate, Weekday};
use edc_types::NonEmptyText;
use serde::Deserialize;
use std::path::Path;

/// A clinic's opening days and capacity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FacilityData {
    pub name: NonEmptyText,
    pub weekdays: Vec<Weekday>,
    /// `None` means unconstrained.
    pub slots_per_day: Option<u32>,
    /// Country whose holidays close this facility.
    pub country: Option<NonEmptyText>,
}

/// One public holiday.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HolidayData {
    pub date: NaiveDate,
    pub label: String,
    pub country: NonEmptyText,
}

/// Parsed contents of a `facilities.yaml` file.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FacilitiesFile {
    pub facilities: Vec<FacilityData>,
}

impl FacilitiesFile {
    /// Parse facility definitions from YAML text.
    ///
    /// Weekdays are written as `Mon`..`Sun` (chrono's short or long English names). A facility
    /// without `weekdays` opens Monday to Friday.
    pub fn parse(yaml_text: &str) -> ProtocolResult<Self> {
        let wire: FacilitiesFileWire = parse_yaml("facilities", yaml_text)?;
        ensure_unique(
            "facility",
            wire.facilities.iter().map(|f| f.name.as_str()),
        )?;

        let facilities = wire
            .facilities
            .into_iter()
            .map(|f| FacilityData {
                name: f.name,
                weekdays: f.weekdays.unwrap_or_else(|| {
                    vec![
                        Weekday::Mon,
                        Weekday::Tue,
                        Weekday::Wed,
                        Weekday::Thu,
                        Weekday::Fri,
                    ]
                }),
                slots_per_day: f.slots_per_day,
                country: f.country,
            })
            .collect();

        Ok(Self { facilities })
    }

    pub fn load(path: &Path) -> ProtocolResult<Self> {
        Self::parse(&read_file(path)?)
    }
}

/// Parsed contents of a `holidays.yaml` file.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct HolidaysFile {
    pub holidays: Vec<HolidayData>,
}

impl HolidaysFile {
    pub fn parse(yaml_text: &str) -> ProtocolResult<Self> {
        let wire: HolidaysFileWire = parse_yaml("holidays", yaml_text)?;
        let holidays = wire
            .holidays
            .into_iter()
            .map(|h| HolidayData {
                date: h.date,
                label: h.label.unwrap_or_default(),
                country: h.country,
            })
            .collect();
        Ok(Self { holidays })
    }

    pub fn load(path: &Path) -> ProtocolResult<Self> {
        Self::parse(&read_file(path)?)
    }

    /// Dates of the holidays observed in `country` (case-insensitive).
    pub fn dates_for(&self, country: &str) -> Vec<NaiveDate> {
        self.holidays
            .iter()
            .filter(|h| h.country.as_str().eq_ignore_ascii_case(country))
            .map(|h| h.date)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FacilitiesFileWire {
    #[serde(default)]
    facilities: Vec<FacilityWire>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FacilityWire {
    name: NonEmptyText,
    #[serde(default)]
    weekdays: Option<Vec<Weekday>>,
    #[serde(default)]
    slots_per_day: Option<u32>,
    #[serde(default)]
    country: Option<NonEmptyText>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HolidaysFileWire {
    #[serde(default)]
    holidays: Vec<HolidayWire>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HolidayWire {
    date: NaiveDate,
    #[serde(default)]
    label: Option<String>,
    country: NonEmptyText,
}
