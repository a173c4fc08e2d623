//! Engine configuration.
//!
//! Values resolve in three layers: built-in defaults, then the `ledger`
//! category of `local_settings`, then environment overrides. Only the first
//! two are persisted.

use chrono::FixedOffset;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db;
use crate::error::{LedgerError, LedgerResult};

const SETTINGS_CATEGORY: &str = "ledger";

pub const ENV_DEFAULT_LOCATION: &str = "SHOP_LEDGER_DEFAULT_LOCATION";
pub const ENV_UTC_OFFSET_MINUTES: &str = "SHOP_LEDGER_UTC_OFFSET_MINUTES";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Location used for order lines that do not name one.
    pub default_location_id: String,
    /// Shop's offset from UTC; business days run midnight to midnight here.
    pub utc_offset_minutes: i32,
    pub min_correction_reason_len: usize,
    /// Days of committed sales used for stock velocity.
    pub velocity_window_days: u32,
    pub critical_days_of_cover: Decimal,
    pub low_days_of_cover: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_location_id: "main".to_string(),
            utc_offset_minutes: 0,
            min_correction_reason_len: 5,
            velocity_window_days: 7,
            critical_days_of_cover: Decimal::ONE,
            low_days_of_cover: Decimal::from(3),
        }
    }
}

impl EngineConfig {
    /// Load persisted settings on top of the defaults.
    pub fn load(conn: &Connection) -> LedgerResult<Self> {
        let mut config = Self::default();

        if let Some(v) = db::get_setting(conn, SETTINGS_CATEGORY, "default_location_id") {
            config.default_location_id = v;
        }
        if let Some(v) = db::get_setting(conn, SETTINGS_CATEGORY, "utc_offset_minutes") {
            config.utc_offset_minutes = parse_setting("utc_offset_minutes", &v)?;
        }
        if let Some(v) = db::get_setting(conn, SETTINGS_CATEGORY, "min_correction_reason_len") {
            config.min_correction_reason_len = parse_setting("min_correction_reason_len", &v)?;
        }
        if let Some(v) = db::get_setting(conn, SETTINGS_CATEGORY, "velocity_window_days") {
            config.velocity_window_days = parse_setting("velocity_window_days", &v)?;
        }
        if let Some(v) = db::get_setting(conn, SETTINGS_CATEGORY, "critical_days_of_cover") {
            config.critical_days_of_cover = parse_setting("critical_days_of_cover", &v)?;
        }
        if let Some(v) = db::get_setting(conn, SETTINGS_CATEGORY, "low_days_of_cover") {
            config.low_days_of_cover = parse_setting("low_days_of_cover", &v)?;
        }

        config.validate()?;
        debug!(?config, "Loaded ledger configuration");
        Ok(config)
    }

    /// Persist every value into `local_settings`.
    pub fn save(&self, conn: &Connection) -> LedgerResult<()> {
        self.validate()?;
        let pairs = [
            ("default_location_id", self.default_location_id.clone()),
            ("utc_offset_minutes", self.utc_offset_minutes.to_string()),
            (
                "min_correction_reason_len",
                self.min_correction_reason_len.to_string(),
            ),
            ("velocity_window_days", self.velocity_window_days.to_string()),
            (
                "critical_days_of_cover",
                self.critical_days_of_cover.to_string(),
            ),
            ("low_days_of_cover", self.low_days_of_cover.to_string()),
        ];
        for (key, value) in pairs {
            db::set_setting(conn, SETTINGS_CATEGORY, key, &value)?;
        }
        info!("Saved ledger configuration");
        Ok(())
    }

    /// Apply `SHOP_LEDGER_*` environment variables.
    pub fn apply_env_overrides(mut self) -> LedgerResult<Self> {
        if let Ok(v) = std::env::var(ENV_DEFAULT_LOCATION) {
            let v = v.trim();
            if !v.is_empty() {
                self.default_location_id = v.to_string();
            }
        }
        if let Ok(v) = std::env::var(ENV_UTC_OFFSET_MINUTES) {
            self.utc_offset_minutes = parse_setting(ENV_UTC_OFFSET_MINUTES, &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.default_location_id.trim().is_empty() {
            return Err(LedgerError::Config(
                "default_location_id must not be empty".into(),
            ));
        }
        self.utc_offset()?;
        if self.velocity_window_days == 0 {
            return Err(LedgerError::Config(
                "velocity_window_days must be at least 1".into(),
            ));
        }
        if self.critical_days_of_cover.is_sign_negative()
            || self.low_days_of_cover < self.critical_days_of_cover
        {
            return Err(LedgerError::Config(format!(
                "days-of-cover thresholds must satisfy 0 <= critical ({}) <= low ({})",
                self.critical_days_of_cover, self.low_days_of_cover
            )));
        }
        Ok(())
    }

    pub fn utc_offset(&self) -> LedgerResult<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            LedgerError::Config(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            ))
        })
    }
}

fn parse_setting<T: std::str::FromStr>(key: &str, raw: &str) -> LedgerResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| LedgerError::Config(format!("invalid value for {key}: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serial_test::serial;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn
    }

    #[test]
    fn test_defaults_without_settings() {
        let conn = test_conn();
        let config = EngineConfig::load(&conn).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.default_location_id, "main");
        assert_eq!(config.min_correction_reason_len, 5);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let conn = test_conn();
        let config = EngineConfig {
            default_location_id: "godown".into(),
            utc_offset_minutes: 330,
            low_days_of_cover: dec!(4.5),
            ..EngineConfig::default()
        };
        config.save(&conn).unwrap();
        assert_eq!(EngineConfig::load(&conn).unwrap(), config);
    }

    #[test]
    fn test_invalid_setting_is_config_error() {
        let conn = test_conn();
        db::set_setting(&conn, "ledger", "utc_offset_minutes", "five-thirty").unwrap();
        let err = EngineConfig::load(&conn).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }

    #[test]
    fn test_offset_out_of_range_rejected() {
        let config = EngineConfig {
            utc_offset_minutes: 24 * 60,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let config = EngineConfig {
            critical_days_of_cover: dec!(5),
            low_days_of_cover: dec!(3),
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var(ENV_DEFAULT_LOCATION, "counter");
        std::env::set_var(ENV_UTC_OFFSET_MINUTES, "330");
        let config = EngineConfig::default().apply_env_overrides();
        std::env::remove_var(ENV_DEFAULT_LOCATION);
        std::env::remove_var(ENV_UTC_OFFSET_MINUTES);

        let config = config.unwrap();
        assert_eq!(config.default_location_id, "counter");
        assert_eq!(config.utc_offset_minutes, 330);
        assert_eq!(config.utc_offset().unwrap().local_minus_utc(), 330 * 60);
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_offset() {
        std::env::set_var(ENV_UTC_OFFSET_MINUTES, "not-a-number");
        let result = EngineConfig::default().apply_env_overrides();
        std::env::remove_var(ENV_UTC_OFFSET_MINUTES);
        assert!(matches!(result, Err(LedgerError::Config(_))));
    }
}
