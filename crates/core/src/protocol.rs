//! Loading a trial protocol directory into registries and facilities.

use crate::config::EdcConfig;
use crate::facility::{CalendarFacility, HolidaySource, Holidays, NoHolidays};
use crate::metadata::RuleGroupRegistry;
use crate::schedule::ScheduleRegistry;
use crate::{EdcError, EdcResult};
use edc_protocol::{FacilitiesFile, HolidaysFile, RulesFile, SchedulesFile};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything defined by the protocol files.
///
/// `schedules.yaml` is required. `facilities.yaml`, `holidays.yaml` and `rules.yaml` are
/// optional; a missing file contributes nothing.
#[derive(Debug)]
pub struct Protocol {
    pub schedules: ScheduleRegistry,
    pub rules: RuleGroupRegistry,
    pub facilities: BTreeMap<String, CalendarFacility>,
}

impl Protocol {
    pub fn load(config: &EdcConfig) -> EdcResult<Self> {
        let schedules_path = config.schedules_file();
        let schedules = ScheduleRegistry::from_file(&SchedulesFile::load(&schedules_path)?)?;

        let rules_path = config.rules_file();
        let rules = if rules_path.exists() {
            RuleGroupRegistry::from_file(&RulesFile::load(&rules_path)?)?
        } else {
            RuleGroupRegistry::init()
        };

        let holidays_path = config.holidays_file();
        let holidays = if holidays_path.exists() {
            HolidaysFile::load(&holidays_path)?
        } else {
            HolidaysFile::default()
        };

        let mut facilities = BTreeMap::new();
        let facilities_path = config.facilities_file();
        if facilities_path.exists() {
            for data in FacilitiesFile::load(&facilities_path)?.facilities {
                let source: Arc<dyn HolidaySource> = match &data.country {
                    Some(country) => Arc::new(Holidays::new(holidays.dates_for(country.as_str()))),
                    None => Arc::new(NoHolidays),
                };
                let facility = CalendarFacility::from_data(&data, source)?
                    .with_default_search_months(config.default_search_window_months());
                facilities.insert(facility.name().to_string(), facility);
            }
        }

        tracing::info!(
            "loaded protocol from {}: {} schedules, {} rule groups, {} facilities",
            config.protocol_dir().display(),
            schedules.schedules().count(),
            rules.len(),
            facilities.len()
        );
        Ok(Self {
            schedules,
            rules,
            facilities,
        })
    }

    pub fn facility(&self, name: &str) -> EdcResult<&CalendarFacility> {
        self.facilities
            .get(name)
            .ok_or_else(|| EdcError::InvalidInput(format!("facility '{name}' is not defined")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Weekday};
    use std::fs;
    use tempfile::TempDir;

    const SCHEDULES: &str = r#"
schedules:
  - name: schedule1
    version: "1"
    onschedule_model: a.onschedule
    offschedule_model: a.offschedule
    visits:
      - code: "1000"
        timepoint: 0
        relative_offset: 0D
        lower_window: 0D
        upper_window: 0D
"#;

    const FACILITIES: &str = r#"
facilities:
  - name: gaborone
    weekdays: [Tue, Thu]
    country: botswana
  - name: mobile
"#;

    const HOLIDAYS: &str = r#"
holidays:
  - date: 2025-01-07
    label: New Year holiday
    country: botswana
"#;

    const RULES: &str = r#"
rule_groups:
  - app_label: trial_subject
    rules:
      - name: male_only
        predicate:
          field_equals: { field: gender, value: MALE }
        consequence: REQUIRED
        alternative: NOT_REQUIRED
        target_crfs: [prostate]
"#;

    fn config(dir: &TempDir) -> EdcConfig {
        EdcConfig::new(true, 2, dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_load_full_protocol() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("schedules.yaml"), SCHEDULES).unwrap();
        fs::write(dir.path().join("facilities.yaml"), FACILITIES).unwrap();
        fs::write(dir.path().join("holidays.yaml"), HOLIDAYS).unwrap();
        fs::write(dir.path().join("rules.yaml"), RULES).unwrap();

        let protocol = Protocol::load(&config(&dir)).unwrap();
        assert!(protocol.schedules.get("schedule1").is_ok());
        assert_eq!(protocol.rules.len(), 1);

        let gaborone = protocol.facility("gaborone").unwrap();
        assert_eq!(gaborone.weekdays(), &[Weekday::Tue, Weekday::Thu]);
        // Tuesday, but a holiday
        assert!(!gaborone.is_open(NaiveDate::from_ymd_opt(2025, 1, 7).unwrap()));
        assert!(gaborone.is_open(NaiveDate::from_ymd_opt(2025, 1, 9).unwrap()));

        let mobile = protocol.facility("mobile").unwrap();
        assert!(mobile.is_open(NaiveDate::from_ymd_opt(2025, 1, 7).unwrap()));
        assert!(protocol.facility("missing").is_err());
    }

    #[test]
    fn test_optional_files_may_be_missing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("schedules.yaml"), SCHEDULES).unwrap();

        let protocol = Protocol::load(&config(&dir)).unwrap();
        assert!(protocol.rules.is_empty());
        assert!(protocol.facilities.is_empty());
    }

    #[test]
    fn test_missing_schedules_file_fails() {
        let dir = TempDir::new().unwrap();
        let err = Protocol::load(&config(&dir)).expect_err("no schedules.yaml");
        assert!(matches!(err, EdcError::Protocol(_)));
    }
}
