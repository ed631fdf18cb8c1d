use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use serde::Deserialize;

use crate::calendar::{CalendarError, ClosedDate, Holiday, InMemoryCalendar};
use crate::catalog::{InMemoryCatalog, ServiceInfo, ServicePrice, VehicleTypeInfo};
use crate::engine::{BusinessHours, Settings};
use crate::ratelimit::RatePolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: {message}")]
    Invalid { var: &'static str, message: String },
    #[error("seed file {path}: {source}")]
    SeedRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("seed file {path}: {source}")]
    SeedParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("seed file: {0}")]
    SeedApply(#[from] CalendarError),
}

fn invalid(var: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        message: message.into(),
    }
}

/// Process configuration. See `from_env` for the variables read.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub seed_path: Option<PathBuf>,
    pub admin_token: Option<String>,
    pub hours: BusinessHours,
    pub weekend: [Weekday; 2],
    pub rate_policy: RatePolicy,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = RatePolicy::default();

        let default_hours = BusinessHours::default();
        let open = match get("WASHBAY_OPEN") {
            Some(s) => parse_hhmm("WASHBAY_OPEN", &s)?,
            None => default_hours.open,
        };
        let close = match get("WASHBAY_CLOSE") {
            Some(s) => parse_hhmm("WASHBAY_CLOSE", &s)?,
            None => default_hours.close,
        };
        let hours = BusinessHours::new(open, close).map_err(|e| invalid("WASHBAY_OPEN", e.to_string()))?;

        let weekend = match get("WASHBAY_WEEKEND") {
            Some(s) => parse_weekend(&s)?,
            None => [Weekday::Sat, Weekday::Sun],
        };

        Ok(Self {
            bind: get("WASHBAY_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: number(&get, "WASHBAY_PORT", 7480)?,
            data_dir: PathBuf::from(get("WASHBAY_DATA_DIR").unwrap_or_else(|| "./data".into())),
            seed_path: get("WASHBAY_SEED").map(PathBuf::from),
            admin_token: get("WASHBAY_ADMIN_TOKEN").filter(|t| !t.is_empty()),
            hours,
            weekend,
            rate_policy: RatePolicy {
                max_attempts: number(&get, "WASHBAY_RATE_MAX", defaults.max_attempts)?,
                window_ms: number(&get, "WASHBAY_RATE_WINDOW_MS", defaults.window_ms)?,
                lockout_ms: number(&get, "WASHBAY_RATE_LOCKOUT_MS", defaults.lockout_ms)?,
            },
            max_connections: number(&get, "WASHBAY_MAX_CONNECTIONS", 256)?,
            compact_threshold: number(&get, "WASHBAY_COMPACT_THRESHOLD", 1000)?,
            metrics_port: get("WASHBAY_METRICS_PORT")
                .map(|s| s.trim().parse().map_err(|_| invalid("WASHBAY_METRICS_PORT", format!("not a port: {s:?}"))))
                .transpose()?,
        })
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.journal")
    }

    pub fn settings(&self) -> Settings {
        Settings {
            hours: self.hours,
            rate_policy: self.rate_policy,
        }
    }
}

fn number<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        Some(s) => s
            .trim()
            .parse()
            .map_err(|_| invalid(var, format!("not a valid number: {s:?}"))),
        None => Ok(default),
    }
}

fn parse_hhmm(var: &'static str, s: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|_| invalid(var, format!("expected HH:MM, got {s:?}")))
}

fn parse_weekend(s: &str) -> Result<[Weekday; 2], ConfigError> {
    let days = s
        .split(',')
        .map(|d| {
            d.trim()
                .parse::<Weekday>()
                .map_err(|_| invalid("WASHBAY_WEEKEND", format!("unknown weekday {d:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    match days.as_slice() {
        [a, b] if a != b => Ok([*a, *b]),
        _ => Err(invalid("WASHBAY_WEEKEND", "expected two distinct weekdays, e.g. sat,sun")),
    }
}

// ── Seed data ────────────────────────────────────────────────────

/// Catalog and calendar content loaded at start-up.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub vehicle_types: Vec<VehicleTypeInfo>,
    #[serde(default)]
    pub services: Vec<ServiceInfo>,
    #[serde(default)]
    pub prices: Vec<ServicePrice>,
    #[serde(default)]
    pub holidays: Vec<Holiday>,
    #[serde(default)]
    pub closed_dates: Vec<ClosedDate>,
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::SeedRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::SeedParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply(self, catalog: &InMemoryCatalog, calendar: &InMemoryCalendar) -> Result<(), ConfigError> {
        for vt in self.vehicle_types {
            catalog.add_vehicle_type(vt);
        }
        for service in self.services {
            catalog.add_service(service);
        }
        for p in self.prices {
            catalog.set_price(p.service_id, p.vehicle_type_id, p.price);
        }
        for h in self.holidays {
            calendar.add_holiday(h)?;
        }
        for c in self.closed_dates {
            calendar.add_closure(c)?;
        }
        Ok(())
    }
}
