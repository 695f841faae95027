use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

const DEFAULT_SIGNING_SECRET: &str = "catechesis-development-signing-secret";

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub storage: StorageConfig,
    pub objects: ObjectStoreConfig,
    pub extraction: ExtractionConfig,
    pub intake: IntakeConfig,
    pub maintenance: MaintenanceConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));
        let storage = StorageConfig {
            data_dir: data_dir.clone(),
            pool_size: parse_var("STORE_POOL_SIZE", 20u32)?,
            busy_timeout: Duration::from_millis(parse_var("STORE_BUSY_TIMEOUT_MS", 5_000u64)?),
            busy_retries: parse_var("STORE_BUSY_RETRIES", 3u32)?,
        };
        if storage.pool_size == 0 {
            return Err(ConfigError::OutOfRange {
                variable: "STORE_POOL_SIZE",
                expected: "at least 1",
            });
        }

        let signing_secret = match env::var("OBJECT_SIGNING_SECRET") {
            Ok(secret) if !secret.trim().is_empty() => secret,
            _ if environment == AppEnvironment::Production => {
                return Err(ConfigError::MissingSecret("OBJECT_SIGNING_SECRET"))
            }
            _ => DEFAULT_SIGNING_SECRET.to_string(),
        };
        let objects = ObjectStoreConfig {
            root: env::var("OBJECT_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("objects")),
            signing_secret,
            reference_ttl: Duration::from_secs(15 * 60),
        };

        let confidence_threshold = parse_var("EXTRACTION_CONFIDENCE_THRESHOLD", 0.70f32)?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ConfigError::OutOfRange {
                variable: "EXTRACTION_CONFIDENCE_THRESHOLD",
                expected: "a value between 0 and 1",
            });
        }
        let extraction = ExtractionConfig {
            endpoint: env::var("OCR_ENDPOINT")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            timeout: nonzero_secs("EXTRACTION_TIMEOUT_SECS", 30)?,
            confidence_threshold,
            max_document_bytes: parse_var("DOCUMENT_MAX_BYTES", 10 * 1024 * 1024usize)?,
        };

        let intake = IntakeConfig {
            number_prefix: env::var("ENROLLMENT_NUMBER_PREFIX")
                .unwrap_or_else(|_| "CAT".to_string())
                .trim()
                .to_ascii_uppercase(),
            access_page_ttl: chrono::Duration::hours(parse_var("ACCESS_PAGE_TTL_HOURS", 72i64)?),
        };

        let audit_retention_days = parse_var("AUDIT_RETENTION_DAYS", 730i64)?;
        if audit_retention_days < 730 {
            return Err(ConfigError::OutOfRange {
                variable: "AUDIT_RETENTION_DAYS",
                expected: "at least 730 days",
            });
        }
        let extraction_stall = nonzero_secs("EXTRACTION_STALL_SECS", 600)?;
        if extraction_stall <= extraction.timeout * 2 {
            return Err(ConfigError::OutOfRange {
                variable: "EXTRACTION_STALL_SECS",
                expected: "more than twice EXTRACTION_TIMEOUT_SECS",
            });
        }
        let maintenance = MaintenanceConfig {
            sweep_interval: nonzero_secs("SWEEP_INTERVAL_SECS", 3_600)?,
            audit_retention: chrono::Duration::days(audit_retention_days),
            document_retention: chrono::Duration::days(parse_var(
                "DOCUMENT_RETENTION_DAYS",
                400i64,
            )?),
            extraction_stall: chrono::Duration::from_std(extraction_stall).map_err(|_| {
                ConfigError::OutOfRange {
                    variable: "EXTRACTION_STALL_SECS",
                    expected: "a representable duration",
                }
            })?,
        };

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            storage,
            objects,
            extraction,
            intake,
            maintenance,
        })
    }

    /// Development defaults rooted at `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            environment: AppEnvironment::Test,
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
            },
            objects: ObjectStoreConfig {
                root: data_dir.join("objects"),
                signing_secret: DEFAULT_SIGNING_SECRET.to_string(),
                reference_ttl: Duration::from_secs(15 * 60),
            },
            storage: StorageConfig::in_dir(data_dir),
            extraction: ExtractionConfig::default(),
            intake: IntakeConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { variable: name }),
        _ => Ok(default),
    }
}

fn nonzero_secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match parse_var(name, default)? {
        0 => Err(ConfigError::OutOfRange {
            variable: name,
            expected: "at least 1 second",
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Location and tuning of the three embedded stores.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub pool_size: u32,
    pub busy_timeout: Duration,
    pub busy_retries: u32,
}

impl StorageConfig {
    /// Settings for a throwaway directory, used by tests and local tooling.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            pool_size: 20,
            busy_timeout: Duration::from_secs(5),
            busy_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub root: PathBuf,
    pub signing_secret: String,
    pub reference_ttl: Duration,
}

/// Recognition endpoint and the limits applied to uploaded documents.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub endpoint: Option<String>,
    pub timeout: Duration,
    pub confidence_threshold: f32,
    pub max_document_bytes: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: Duration::from_secs(30),
            confidence_threshold: 0.70,
            max_document_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub number_prefix: String,
    pub access_page_ttl: chrono::Duration,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            number_prefix: "CAT".to_string(),
            access_page_ttl: chrono::Duration::hours(72),
        }
    }
}

/// Cadence and horizons of the periodic expiry sweeps.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub sweep_interval: Duration,
    pub audit_retention: chrono::Duration,
    pub document_retention: chrono::Duration,
    /// Age after which a `pending` or `running` extraction counts as lost.
    pub extraction_stall: chrono::Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3_600),
            audit_retention: chrono::Duration::days(730),
            document_retention: chrono::Duration::days(400),
            extraction_stall: chrono::Duration::minutes(10),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidValue { variable: &'static str },
    OutOfRange {
        variable: &'static str,
        expected: &'static str,
    },
    MissingSecret(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidValue { variable } => {
                write!(f, "{variable} could not be parsed")
            }
            ConfigError::OutOfRange { variable, expected } => {
                write!(f, "{variable} must be {expected}")
            }
            ConfigError::MissingSecret(variable) => {
                write!(f, "{variable} must be set in production")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for name in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "DATA_DIR",
            "STORE_POOL_SIZE",
            "STORE_BUSY_TIMEOUT_MS",
            "OBJECT_SIGNING_SECRET",
            "EXTRACTION_CONFIDENCE_THRESHOLD",
            "ENROLLMENT_NUMBER_PREFIX",
            "AUDIT_RETENTION_DAYS",
            "OCR_ENDPOINT",
            "SWEEP_INTERVAL_SECS",
            "EXTRACTION_TIMEOUT_SECS",
            "EXTRACTION_STALL_SECS",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.storage.pool_size, 20);
        assert_eq!(config.storage.busy_timeout, Duration::from_secs(5));
        assert!((config.extraction.confidence_threshold - 0.70).abs() < f32::EPSILON);
        assert!(config.extraction.endpoint.is_none());
        assert_eq!(config.intake.number_prefix, "CAT");
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }

    #[test]
    fn rejects_short_audit_retention() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("AUDIT_RETENTION_DAYS", "90");
        let err = AppConfig::load().expect_err("retention below two years rejected");
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                variable: "AUDIT_RETENTION_DAYS",
                ..
            }
        ));
        reset_env();
    }

    #[test]
    fn rejects_zero_intervals() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        for variable in ["SWEEP_INTERVAL_SECS", "EXTRACTION_TIMEOUT_SECS"] {
            reset_env();
            env::set_var(variable, "0");
            let err = AppConfig::load().expect_err("zero rejected");
            assert!(
                matches!(err, ConfigError::OutOfRange { variable: name, .. } if name == variable),
                "{variable}: {err}"
            );
        }

        reset_env();
        env::set_var("SWEEP_INTERVAL_SECS", "60");
        env::set_var("EXTRACTION_TIMEOUT_SECS", "5");
        let config = AppConfig::load().expect("positive values load");
        assert_eq!(config.maintenance.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.extraction.timeout, Duration::from_secs(5));
        assert_eq!(config.maintenance.extraction_stall, chrono::Duration::minutes(10));

        env::set_var("EXTRACTION_STALL_SECS", "8");
        let err = AppConfig::load().expect_err("stall shorter than two attempts");
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                variable: "EXTRACTION_STALL_SECS",
                ..
            }
        ));
        reset_env();
    }

    #[test]
    fn production_requires_signing_secret() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_ENV", "production");
        let err = AppConfig::load().expect_err("secret required");
        assert!(matches!(err, ConfigError::MissingSecret(_)));
        reset_env();
    }
}
