use crate::error::{AppError, Result};
use chrono::NaiveTime;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_LOGIN_URL: &str = "https://monitor.byte-watt.com/login";
const DEFAULT_DATA_DIR: &str = "/data/power_data";
const DEFAULT_RESTART_TIMES: &str = "02:00,04:00,13:00,22:00";
const DEFAULT_ARCHIVE_TIME: &str = "23:56";

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttSettings,
    pub dashboard: DashboardSettings,
    pub browser: BrowserSettings,
    pub schedule: ScheduleSettings,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub topic_prefix: String,
    pub discovery_prefix: String,
}

impl MqttSettings {
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.topic_prefix)
    }
}

/// Upstream account and credentials for the monitoring dashboard.
#[derive(Debug, Clone)]
pub struct DashboardSettings {
    pub login_url: String,
    pub username: String,
    pub password: String,
    pub sys_sn: String,
    pub station_id: String,
    pub login_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct BrowserSettings {
    /// Explicit Chromium executable; chromiumoxide auto-detects when unset.
    pub chrome_path: Option<PathBuf>,
}

/// Cadences and daily times. The defaults are the values the bridge has
/// been running with; none of them are derived from anything upstream.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub poll_interval: Duration,
    pub reload_interval: Duration,
    pub restart_times: Vec<NaiveTime>,
    pub archive_time: NaiveTime,
}

impl Config {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let username = non_empty("MQTT_USERNAME");
        // An empty password is legitimate once a username is set.
        let password = username
            .as_ref()
            .map(|_| lookup("MQTT_PASSWORD").unwrap_or_default());

        let mqtt = MqttSettings {
            host: var("MQTT_BROKER", "localhost"),
            port: parse_number(&var("MQTT_PORT", "1883"), "MQTT_PORT")?,
            client_id: var("MQTT_CLIENT_ID", "homeassistant"),
            username,
            password,
            keep_alive_secs: parse_number(&var("MQTT_KEEP_ALIVE_SECS", "30"), "MQTT_KEEP_ALIVE_SECS")?,
            topic_prefix: var("MQTT_TOPIC_PREFIX", "bytewatt"),
            discovery_prefix: var("HA_DISCOVERY_PREFIX", "homeassistant"),
        };

        let dashboard = DashboardSettings {
            login_url: var("BYTEWATT_LOGIN_URL", DEFAULT_LOGIN_URL),
            username: var("BYTEWATT_USERNAME", ""),
            password: var("BYTEWATT_PASSWORD", ""),
            sys_sn: var("SYS_SN", ""),
            station_id: var("STATION_ID", ""),
            login_timeout: Duration::from_secs(parse_number(
                &var("LOGIN_TIMEOUT_SECS", "15"),
                "LOGIN_TIMEOUT_SECS",
            )?),
        };

        let browser = BrowserSettings {
            chrome_path: non_empty("CHROME_PATH").map(PathBuf::from),
        };

        let schedule = ScheduleSettings {
            poll_interval: Duration::from_secs(parse_number(
                &var("POLL_INTERVAL_SECS", "30"),
                "POLL_INTERVAL_SECS",
            )?),
            reload_interval: Duration::from_secs(
                60 * parse_number::<u64>(&var("RELOAD_INTERVAL_MINS", "30"), "RELOAD_INTERVAL_MINS")?,
            ),
            restart_times: parse_times(&var("RESTART_TIMES", DEFAULT_RESTART_TIMES))?,
            archive_time: parse_time(&var("ARCHIVE_TIME", DEFAULT_ARCHIVE_TIME))?,
        };

        let cfg = Self {
            mqtt,
            dashboard,
            browser,
            schedule,
            data_dir: PathBuf::from(var("DATA_DIR", DEFAULT_DATA_DIR)),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.topic_prefix.is_empty() {
            return Err(AppError::Config("MQTT_TOPIC_PREFIX cannot be empty".into()));
        }
        if self.schedule.poll_interval.is_zero() {
            return Err(AppError::Config("POLL_INTERVAL_SECS must be positive".into()));
        }
        if self.schedule.reload_interval.is_zero() {
            return Err(AppError::Config("RELOAD_INTERVAL_MINS must be positive".into()));
        }
        if self.dashboard.login_timeout.is_zero() {
            return Err(AppError::Config("LOGIN_TIMEOUT_SECS must be positive".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{key}: not a valid number: {raw:?}")))
}

/// Parse a wall-clock time in `HH:MM` or `HH:MM:SS` form.
pub fn parse_time(raw: &str) -> Result<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| AppError::Config(format!("invalid time of day: {raw:?}")))
}

/// Parse a comma-separated list of times; blank entries are skipped.
pub fn parse_times(raw: &str) -> Result<Vec<NaiveTime>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(parse_time)
        .collect()
}
