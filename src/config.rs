use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Weekday;

use crate::policy::Policy;
use crate::shop::ShopSettings;

#[derive(Debug)]
pub struct ConfigError(String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Server configuration, read once from `CHAIRBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub operators: Vec<String>,
    pub shop: ShopSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(&format!("CHAIRBOOK_{name}")).filter(|v| !v.trim().is_empty());
        let parsed = |name: &str| -> Result<Option<u64>, ConfigError> {
            get(name)
                .map(|v| {
                    v.trim().parse::<u64>().map_err(|_| {
                        ConfigError(format!("CHAIRBOOK_{name}={v:?} is not a non-negative integer"))
                    })
                })
                .transpose()
        };
        let num = |name: &str, default: u64| -> Result<u64, ConfigError> {
            Ok(parsed(name)?.unwrap_or(default))
        };
        let small = |name: &str, default: u32| -> Result<u32, ConfigError> {
            u32::try_from(num(name, default as u64)?)
                .map_err(|_| ConfigError(format!("CHAIRBOOK_{name} is out of range")))
        };

        let defaults = Policy::default();
        let open_weekdays = match get("OPEN_WEEKDAYS") {
            Some(list) => parse_weekdays(&list)?,
            None => defaults.open_weekdays.clone(),
        };
        let utc_offset_minutes = match get("UTC_OFFSET_MINUTES") {
            Some(v) => v.trim().parse::<i32>().map_err(|_| {
                ConfigError(format!("CHAIRBOOK_UTC_OFFSET_MINUTES={v:?} is not an integer"))
            })?,
            None => defaults.utc_offset_minutes,
        };

        let policy = Policy {
            cancel_lead_hours: small("CANCEL_LEAD_HOURS", defaults.cancel_lead_hours)?,
            modify_lead_hours: small("MODIFY_LEAD_HOURS", defaults.modify_lead_hours)?,
            max_modifications: small("MAX_MODIFICATIONS", defaults.max_modifications)?,
            max_active_per_owner: small("MAX_ACTIVE", defaults.max_active_per_owner)?,
            booking_horizon_days: small("HORIZON_DAYS", defaults.booking_horizon_days)?,
            slot_minutes: small("SLOT_MINUTES", defaults.slot_minutes)?,
            open_hour: small("OPEN_HOUR", defaults.open_hour)?,
            close_hour: small("CLOSE_HOUR", defaults.close_hour)?,
            open_weekdays,
            utc_offset_minutes,
            reminder_lead_hours: small("REMINDER_LEAD_HOURS", defaults.reminder_lead_hours)?,
        };
        policy.validate().map_err(ConfigError)?;

        let port = u16::try_from(num("PORT", 5433)?)
            .map_err(|_| ConfigError("CHAIRBOOK_PORT is out of range".into()))?;
        let metrics_port = parsed("METRICS_PORT")?
            .map(u16::try_from)
            .transpose()
            .map_err(|_| ConfigError("CHAIRBOOK_METRICS_PORT is out of range".into()))?;

        let operators = get("OPERATORS")
            .unwrap_or_else(|| "operator".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            port,
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").unwrap_or_else(|| "chairbook".into()),
            max_connections: num("MAX_CONNECTIONS", 256)? as usize,
            metrics_port,
            tls_cert: get("TLS_CERT"),
            tls_key: get("TLS_KEY"),
            operators,
            shop: ShopSettings {
                policy,
                compact_threshold: num("COMPACT_THRESHOLD", 1000)?,
                sweep_interval: Duration::from_secs(num("SWEEP_INTERVAL_SECS", 60)?.max(1)),
                cache_ttl: Duration::from_secs(num("CACHE_TTL_SECS", 300)?),
            },
        })
    }
}

/// Comma-separated weekday names, e.g. `tue,wed,thu,fri,sat`.
fn parse_weekdays(list: &str) -> Result<Vec<Weekday>, ConfigError> {
    let mut days = Vec::new();
    for part in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let day = Weekday::from_str(part)
            .map_err(|_| ConfigError(format!("unknown weekday {part:?} in CHAIRBOOK_OPEN_WEEKDAYS")))?;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Ok(days)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.password, "chairbook");
        assert_eq!(cfg.operators, vec!["operator".to_string()]);
        assert_eq!(cfg.shop.policy, Policy::default());
        assert_eq!(cfg.shop.cache_ttl, Duration::from_secs(300));
        assert!(cfg.metrics_port.is_none());
    }

    #[test]
    fn policy_knobs_are_read() {
        let cfg = config(&[
            ("CHAIRBOOK_MAX_ACTIVE", "5"),
            ("CHAIRBOOK_OPEN_WEEKDAYS", "mon, tue,Wednesday"),
            ("CHAIRBOOK_UTC_OFFSET_MINUTES", "60"),
            ("CHAIRBOOK_OPERATORS", "rosa, marta"),
        ])
        .unwrap();
        assert_eq!(cfg.shop.policy.max_active_per_owner, 5);
        assert_eq!(
            cfg.shop.policy.open_weekdays,
            vec![Weekday::Mon, Weekday::Tue, Weekday::Wed]
        );
        assert_eq!(cfg.shop.policy.utc_offset_minutes, 60);
        assert_eq!(cfg.operators, vec!["rosa".to_string(), "marta".to_string()]);
    }

    #[test]
    fn invalid_values_fail_startup() {
        assert!(config(&[("CHAIRBOOK_PORT", "http")]).is_err());
        assert!(config(&[("CHAIRBOOK_PORT", "70000")]).is_err());
        assert!(config(&[("CHAIRBOOK_OPEN_WEEKDAYS", "funday")]).is_err());
        assert!(config(&[("CHAIRBOOK_OPEN_HOUR", "19")]).is_err());
        assert!(config(&[("CHAIRBOOK_SLOT_MINUTES", "0")]).is_err());
    }
}
