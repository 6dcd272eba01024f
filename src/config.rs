// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

//! Environment-variable configuration, loaded once at startup.
//!
//! Every field is read from `STREAMVAULT_*`; `.env` (via `dotenvy`) is
//! loaded first so a developer can keep secrets out of their shell history.
//! Validation failures are collected rather than returned on the first
//! error, so an operator sees every missing/invalid field in one pass.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// One field that failed to parse or was missing.
#[derive(Debug)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every field that failed, collected into a single report.
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration:{}", errors.iter().fold(String::new(), |mut s, e| {
    s.push_str("\n  - ");
    s.push_str(&e.to_string());
    s
}))]
pub struct ConfigError {
    pub errors: Vec<FieldError>,
}

impl From<ConfigError> for base::Error {
    fn from(e: ConfigError) -> base::Error {
        base::Error::wrap(base::ErrorKind::InvalidArgument, e)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QualityPreference {
    Best,
    Worst,
    MaxHeight(u32),
}

impl FromStr for QualityPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best" => Ok(QualityPreference::Best),
            "worst" => Ok(QualityPreference::Worst),
            _ => {
                let digits = s.strip_suffix('p').ok_or_else(|| {
                    format!("expected \"best\", \"worst\", or \"<N>p\", got {s:?}")
                })?;
                let n: u32 = digits
                    .parse()
                    .map_err(|_| format!("expected \"best\", \"worst\", or \"<N>p\", got {s:?}"))?;
                Ok(QualityPreference::MaxHeight(n))
            }
        }
    }
}

/// Full runtime configuration. See `# 6. EXTERNAL INTERFACES` for the field
/// list and validation rules this loader enforces.
#[derive(Clone, Debug)]
pub struct Config {
    pub upstream_frontend_url: url::Url,
    pub upstream_db_url: String,
    pub companion_url: url::Url,
    pub companion_shared_secret: String,
    pub videos_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub muxer_binary: PathBuf,

    pub listen_port: u16,
    pub single_user: Option<String>,
    pub quality_preference: QualityPreference,
    pub rate_limit_bytes_per_sec: u64,
    pub check_interval_minutes: u32,
    pub max_concurrent_downloads: u32,
    pub max_retry_attempts: u32,
    pub retry_base_delay_minutes: u32,
    pub cleanup_enabled: bool,
    pub cleanup_age_days: u32,
    pub cleanup_interval_hours: u32,
    pub throttle_speed_threshold_bytes_per_sec: u64,
    pub throttle_detection_window_seconds: u32,
    pub throttle_max_retries: u32,

    pub min_duration_seconds: u32,
    pub exclude_live: bool,
    pub exclude_premiere: bool,
    pub max_videos_per_check: u32,
}

struct Loader {
    errors: Vec<FieldError>,
}

impl Loader {
    fn new() -> Self {
        Loader { errors: Vec::new() }
    }

    fn fail(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field,
            message: message.into(),
        });
    }

    fn raw(&self, var: &str) -> Option<String> {
        std::env::var(var).ok().filter(|s| !s.is_empty())
    }

    fn required_string(&mut self, var: &str, field: &'static str) -> Option<String> {
        match self.raw(var) {
            Some(s) => Some(s),
            None => {
                self.fail(field, "required, not set");
                None
            }
        }
    }

    fn required_url(&mut self, var: &str, field: &'static str) -> Option<url::Url> {
        let s = self.required_string(var, field)?;
        match url::Url::parse(&s) {
            Ok(u) => Some(u),
            Err(e) => {
                self.fail(field, format!("invalid URL {s:?}: {e}"));
                None
            }
        }
    }

    fn positive_u32(&mut self, var: &str, field: &'static str, default: u32) -> u32 {
        match self.raw(var) {
            None => default,
            Some(s) => match s.parse::<u32>() {
                Ok(0) => {
                    self.fail(field, "must be positive, got 0");
                    default
                }
                Ok(n) => n,
                Err(_) => {
                    self.fail(field, format!("expected a positive integer, got {s:?}"));
                    default
                }
            },
        }
    }

    fn nonneg_u64(&mut self, var: &str, field: &'static str, default: u64) -> u64 {
        match self.raw(var) {
            None => default,
            Some(s) => match s.parse::<u64>() {
                Ok(n) => n,
                Err(_) => {
                    self.fail(field, format!("expected a non-negative integer, got {s:?}"));
                    default
                }
            },
        }
    }

    fn bool_flag(&self, var: &str, default: bool) -> bool {
        match self.raw(var) {
            None => default,
            Some(s) => matches!(s.as_str(), "1" | "true" | "yes" | "on"),
        }
    }
}

impl Config {
    /// Loads `.env` (if present) then reads the environment. Returns every
    /// failing field at once rather than stopping at the first.
    pub fn load() -> Result<Config, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) | Err(dotenvy::Error::Io(_)) => {}
            Err(e) => tracing::warn!(error = %e, "failed to parse .env, ignoring"),
        }
        Self::from_env()
    }

    fn from_env() -> Result<Config, ConfigError> {
        let mut l = Loader::new();

        let upstream_frontend_url =
            l.required_url("STREAMVAULT_UPSTREAM_FRONTEND_URL", "upstream frontend URL");
        let upstream_db_url =
            l.required_string("STREAMVAULT_UPSTREAM_DB_URL", "upstream DB URL");
        let companion_url = l.required_url("STREAMVAULT_COMPANION_URL", "companion URL");
        let companion_shared_secret = l.required_string(
            "STREAMVAULT_COMPANION_SHARED_SECRET",
            "companion shared secret",
        );
        let videos_dir = l
            .required_string("STREAMVAULT_VIDEOS_DIR", "videos directory")
            .map(PathBuf::from);
        let catalog_path = l
            .required_string("STREAMVAULT_CATALOG_PATH", "catalog database path")
            .map(PathBuf::from);
        let muxer_binary = l
            .raw("STREAMVAULT_MUXER_BINARY")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));

        let listen_port = match l.raw("STREAMVAULT_LISTEN_PORT") {
            None => 3001,
            Some(s) => match s.parse::<u32>() {
                Ok(p) if (1..=65535).contains(&p) => p as u16,
                Ok(p) => {
                    l.fail("listen port", format!("must be in 1..65535, got {p}"));
                    3001
                }
                Err(_) => {
                    l.fail("listen port", format!("expected an integer, got {s:?}"));
                    3001
                }
            },
        };

        let single_user = l.raw("STREAMVAULT_SINGLE_USER");

        let quality_preference = match l.raw("STREAMVAULT_QUALITY_PREFERENCE") {
            None => QualityPreference::Best,
            Some(s) => match s.parse() {
                Ok(q) => q,
                Err(e) => {
                    l.fail("quality preference", e);
                    QualityPreference::Best
                }
            },
        };

        let rate_limit_bytes_per_sec = l.nonneg_u64("STREAMVAULT_RATE_LIMIT_BYTES_PER_SEC", "rate limit", 0);
        let check_interval_minutes =
            l.positive_u32("STREAMVAULT_CHECK_INTERVAL_MINUTES", "check interval minutes", 5);
        let max_concurrent_downloads = l.positive_u32(
            "STREAMVAULT_MAX_CONCURRENT_DOWNLOADS",
            "max concurrent downloads",
            2,
        );
        let max_retry_attempts =
            l.positive_u32("STREAMVAULT_MAX_RETRY_ATTEMPTS", "max retry attempts", 3);
        let retry_base_delay_minutes = l.positive_u32(
            "STREAMVAULT_RETRY_BASE_DELAY_MINUTES",
            "retry base delay minutes",
            1,
        );
        let cleanup_enabled = l.bool_flag("STREAMVAULT_CLEANUP_ENABLED", true);
        let cleanup_age_days = l.positive_u32("STREAMVAULT_CLEANUP_AGE_DAYS", "cleanup age days", 30);
        let cleanup_interval_hours = l.positive_u32(
            "STREAMVAULT_CLEANUP_INTERVAL_HOURS",
            "cleanup interval hours",
            24,
        );
        let throttle_speed_threshold_bytes_per_sec = l.nonneg_u64(
            "STREAMVAULT_THROTTLE_SPEED_THRESHOLD_BYTES_PER_SEC",
            "throttle speed threshold",
            0,
        );
        let throttle_detection_window_seconds = l.positive_u32(
            "STREAMVAULT_THROTTLE_DETECTION_WINDOW_SECONDS",
            "throttle detection window seconds",
            30,
        );
        let throttle_max_retries =
            l.positive_u32("STREAMVAULT_THROTTLE_MAX_RETRIES", "throttle max retries", 3);

        let min_duration_seconds =
            l.nonneg_u64("STREAMVAULT_MIN_DURATION_SECONDS", "min duration seconds", 0) as u32;
        let exclude_live = l.bool_flag("STREAMVAULT_EXCLUDE_LIVE", true);
        let exclude_premiere = l.bool_flag("STREAMVAULT_EXCLUDE_PREMIERE", true);
        let max_videos_per_check =
            l.positive_u32("STREAMVAULT_MAX_VIDEOS_PER_CHECK", "max videos per check", 50);

        if !l.errors.is_empty() {
            return Err(ConfigError { errors: l.errors });
        }

        Ok(Config {
            upstream_frontend_url: upstream_frontend_url.unwrap(),
            upstream_db_url: upstream_db_url.unwrap(),
            companion_url: companion_url.unwrap(),
            companion_shared_secret: companion_shared_secret.unwrap(),
            videos_dir: videos_dir.unwrap(),
            catalog_path: catalog_path.unwrap(),
            muxer_binary,
            listen_port,
            single_user,
            quality_preference,
            rate_limit_bytes_per_sec,
            check_interval_minutes,
            max_concurrent_downloads,
            max_retry_attempts,
            retry_base_delay_minutes,
            cleanup_enabled,
            cleanup_age_days,
            cleanup_interval_hours,
            throttle_speed_threshold_bytes_per_sec,
            throttle_detection_window_seconds,
            throttle_max_retries,
            min_duration_seconds,
            exclude_live,
            exclude_premiere,
            max_videos_per_check,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for var in [
            "STREAMVAULT_UPSTREAM_FRONTEND_URL",
            "STREAMVAULT_UPSTREAM_DB_URL",
            "STREAMVAULT_COMPANION_URL",
            "STREAMVAULT_COMPANION_SHARED_SECRET",
            "STREAMVAULT_VIDEOS_DIR",
            "STREAMVAULT_CATALOG_PATH",
            "STREAMVAULT_MUXER_BINARY",
            "STREAMVAULT_LISTEN_PORT",
            "STREAMVAULT_QUALITY_PREFERENCE",
            "STREAMVAULT_CHECK_INTERVAL_MINUTES",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn missing_required_reports_every_field() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let err = Config::from_env().unwrap_err();
        assert_eq!(err.errors.len(), 6, "{:?}", err.errors);
    }

    #[test]
    fn zero_is_rejected_for_positive_fields() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("STREAMVAULT_UPSTREAM_FRONTEND_URL", "http://upstream.example");
        std::env::set_var("STREAMVAULT_UPSTREAM_DB_URL", "postgres://localhost/db");
        std::env::set_var("STREAMVAULT_COMPANION_URL", "http://companion.example");
        std::env::set_var("STREAMVAULT_COMPANION_SHARED_SECRET", "s3cr3t");
        std::env::set_var("STREAMVAULT_VIDEOS_DIR", "/tmp/videos");
        std::env::set_var("STREAMVAULT_CATALOG_PATH", "/tmp/videos/catalog.sqlite");
        std::env::set_var("STREAMVAULT_CHECK_INTERVAL_MINUTES", "0");
        let err = Config::from_env().unwrap_err();
        assert!(err.errors.iter().any(|e| e.field == "check interval minutes"));
        clear_all();
    }

    #[test]
    fn quality_preference_parses() {
        assert_eq!("best".parse(), Ok(QualityPreference::Best));
        assert_eq!("worst".parse(), Ok(QualityPreference::Worst));
        assert_eq!("720p".parse(), Ok(QualityPreference::MaxHeight(720)));
        assert!("bogus".parse::<QualityPreference>().is_err());
    }
}
