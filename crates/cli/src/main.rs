use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use edc_core::config::{enforce_window_period_from_env_value, search_window_months_from_env_value};
use edc_core::constants::DEFAULT_PROTOCOL_DIR;
use edc_core::store::ConsentStore;
use edc_core::{
    AppointmentScheduler, Collaborators, ConsentDefinition, ConsentExtensionRecord, ConsentRecord,
    EdcConfig, FixedClock, InMemoryStore, Protocol, WindowCalculator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Parser)]
#[command(name = "edc")]
#[command(about = "EDC visit schedule and appointment window tools")]
struct Cli {
    /// Protocol directory (overrides EDC_PROTOCOL_DIR)
    #[arg(long, global = true)]
    protocol_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate every protocol file
    Validate,
    /// Print each visit's timepoint datetime and window
    Windows {
        /// Schedule name
        schedule: String,
        /// Baseline datetime (YYYY-MM-DD, "YYYY-MM-DD HH:MM" or RFC 3339)
        baseline: String,
    },
    /// Print the nearest open datetime at a facility
    NextOpen {
        /// Facility name
        facility: String,
        /// Suggested datetime
        datetime: String,
    },
    /// Enroll a subject into an in-memory store and print the appointments
    Simulate {
        /// Schedule name
        schedule: String,
        /// Facility name
        facility: String,
        /// Subject identifier
        subject: String,
        /// Baseline datetime
        baseline: String,
        /// Agree to this consent extension after enrolment
        #[arg(long)]
        extension: Option<String>,
        /// Print appointments as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("edc=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = resolve_config(cli.protocol_dir)?;

    match cli.command {
        Commands::Validate => {
            let protocol = Protocol::load(&config)?;
            println!(
                "Protocol OK: {} schedules, {} rule groups, {} facilities",
                protocol.schedules.schedules().count(),
                protocol.rules.len(),
                protocol.facilities.len()
            );
        }
        Commands::Windows { schedule, baseline } => {
            let protocol = Protocol::load(&config)?;
            let baseline = parse_datetime(&baseline)?;
            let schedule = protocol.schedules.get(&schedule)?;
            let calculator = WindowCalculator::new(&config);

            println!("{:<10} {:>9}  {:<16}  {:<16}  {:<16}", "visit", "timepoint", "ideal", "lower", "upper");
            for (visit, window) in schedule
                .timepoints_ordered()
                .zip(calculator.schedule_windows(&schedule, baseline))
            {
                println!(
                    "{:<10} {:>9}  {:<16}  {:<16}  {:<16}",
                    window.visit_code.as_str(),
                    visit.timepoint,
                    window.timepoint_datetime.format(DATETIME_FORMAT).to_string(),
                    window.lower.format(DATETIME_FORMAT).to_string(),
                    window.upper.format(DATETIME_FORMAT).to_string()
                );
            }
        }
        Commands::NextOpen { facility, datetime } => {
            let protocol = Protocol::load(&config)?;
            let suggested = parse_datetime(&datetime)?;
            let open = protocol.facility(&facility)?.nearest_open_date(suggested, None)?;
            println!("{}", open.format(DATETIME_FORMAT));
        }
        Commands::Simulate {
            schedule,
            facility,
            subject,
            baseline,
            extension,
            json,
        } => {
            let protocol = Protocol::load(&config)?;
            let baseline = parse_datetime(&baseline)?;
            let facility = protocol.facility(&facility)?.clone();
            let base = protocol.schedules.get(&schedule)?;

            let store = Arc::new(InMemoryStore::new());
            let definitions = protocol.schedules.consent_definitions_for(&base);
            if !definitions.is_empty() {
                let cdef = ConsentDefinition::resolve(&definitions, baseline)?;
                store.save_consent(ConsentRecord {
                    subject_identifier: subject.parse()?,
                    consent_definition: cdef.id(),
                    consent_datetime: baseline,
                })?;
            }

            let scheduler = AppointmentScheduler::new(
                &config,
                Arc::new(protocol.schedules),
                Arc::new(protocol.rules),
                Collaborators::in_memory(store.clone()),
                Arc::new(FixedClock::new(baseline)),
            );
            scheduler.enroll(&subject, &schedule, &facility, baseline)?;

            if let Some(extension) = extension {
                store.save_extension_record(ConsentExtensionRecord {
                    subject_identifier: subject.parse()?,
                    extension: extension.clone(),
                    report_datetime: baseline,
                    fields: [(
                        edc_core::constants::EXTENSION_AGREEMENT_FIELD.to_string(),
                        serde_json::Value::from(edc_core::constants::YES),
                    )]
                    .into_iter()
                    .collect(),
                })?;
                let outcome = scheduler
                    .refresh_for_consent_extension(&subject, &schedule, &extension, &facility)?;
                tracing::info!("extension {} added {} appointments", extension, outcome.created.len());
            }

            let appointments = scheduler.appointments(&subject, &schedule)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&appointments)?);
            } else {
                for appointment in appointments {
                    println!(
                        "{}.{}  tp={}  {}  {}",
                        appointment.visit_code(),
                        appointment.visit_code_sequence(),
                        appointment.timepoint(),
                        appointment.appt_datetime().format(DATETIME_FORMAT),
                        appointment.appt_status
                    );
                }
            }
        }
    }

    Ok(())
}

/// Resolve configuration from the environment once at startup.
///
/// # Environment Variables
/// - `EDC_PROTOCOL_DIR`: protocol directory (default: "protocol")
/// - `EDC_ENFORCE_WINDOW_PERIOD`: `true`/`false` (default: true)
/// - `EDC_SEARCH_WINDOW_MONTHS`: facility search window in months (default: 1)
fn resolve_config(protocol_dir: Option<PathBuf>) -> anyhow::Result<EdcConfig> {
    let protocol_dir = protocol_dir.unwrap_or_else(|| {
        std::env::var("EDC_PROTOCOL_DIR")
            .unwrap_or_else(|_| DEFAULT_PROTOCOL_DIR.into())
            .into()
    });
    let enforce = enforce_window_period_from_env_value(std::env::var("EDC_ENFORCE_WINDOW_PERIOD").ok())?;
    let months = search_window_months_from_env_value(std::env::var("EDC_SEARCH_WINDOW_MONTHS").ok())?;
    Ok(EdcConfig::new(enforce, months, protocol_dir)?)
}

/// Accepts `YYYY-MM-DD` (midnight UTC), `YYYY-MM-DD HH:MM` (UTC) or RFC 3339.
fn parse_datetime(input: &str) -> anyhow::Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(input, DATETIME_FORMAT) {
        return Ok(dt.and_utc());
    }
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .with_context(|| format!("invalid datetime '{input}'"))?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}
