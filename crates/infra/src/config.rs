//! Configuration loading and representation.
//!
//! Everything comes from environment variables with defaults. Durations accept
//! `250ms`, `5s`, `2m`, `1h` or a bare number of seconds.

use std::str::FromStr;
use std::time::Duration;

use crate::breaker::BreakerSettings;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
    pub env: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
}

impl HttpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub url: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub max_conn_lifetime: Duration,
    pub max_conn_idle_time: Duration,
    pub connect_timeout: Duration,
    pub run_migrations: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub rps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownConfig {
    pub http_timeout: Duration,
    pub hard_period: Duration,
    pub readiness_drain: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub lease_timeout: Duration,
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app: AppInfo,
    pub log: LogSettings,
    pub http: HttpConfig,
    pub storage: StorageBackend,
    /// Present when `storage` is `Postgres`.
    pub postgres: Option<PostgresConfig>,
    pub worker_pool: WorkerPoolConfig,
    pub rate_limit: RateLimitConfig,
    /// `None` disables the rate limiter and the Redis readiness check.
    pub redis: Option<RedisConfig>,
    pub health: HealthConfig,
    pub circuit_breaker: BreakerSettings,
    pub shutdown: ShutdownConfig,
    pub reaper: ReaperConfig,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let storage = match env.string("TASK_STORE", "postgres").to_ascii_lowercase().as_str() {
            "postgres" => StorageBackend::Postgres,
            "memory" => StorageBackend::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    var: "TASK_STORE",
                    value: other.to_string(),
                    reason: "expected postgres or memory".to_string(),
                });
            }
        };

        let postgres = match storage {
            StorageBackend::Postgres => Some(PostgresConfig {
                url: env.required("DATABASE_URL")?,
                max_pool_size: env.parse("PG_MAX_POOL_SIZE", 10)?,
                min_pool_size: env.parse("PG_MIN_POOL_SIZE", 0)?,
                max_conn_lifetime: env.duration("PG_MAX_CONN_LIFETIME", Duration::from_secs(30 * 60))?,
                max_conn_idle_time: env.duration("PG_MAX_CONN_IDLE_TIME", Duration::from_secs(10 * 60))?,
                connect_timeout: env.duration("PG_CONNECT_TIMEOUT", Duration::from_secs(5))?,
                run_migrations: env.flag("PG_RUN_MIGRATIONS", true)?,
            }),
            StorageBackend::Memory => None,
        };

        let log_format = env.string("LOG_FORMAT", "json").to_ascii_lowercase();
        let json = match log_format.as_str() {
            "json" => true,
            "pretty" | "text" => false,
            other => {
                return Err(ConfigError::Invalid {
                    var: "LOG_FORMAT",
                    value: other.to_string(),
                    reason: "expected json or pretty".to_string(),
                });
            }
        };

        let max_workers: usize = env.parse("WORKER_POOL_MAX_WORKERS", 10)?;
        if max_workers == 0 {
            return Err(ConfigError::Invalid {
                var: "WORKER_POOL_MAX_WORKERS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            app: AppInfo {
                name: env.string("APP_NAME", "task-processor"),
                version: env.string("APP_VERSION", env!("CARGO_PKG_VERSION")),
                env: env.string("APP_ENV", "development"),
            },
            log: LogSettings {
                level: env.string("LOG_LEVEL", "info"),
                json,
            },
            http: HttpConfig {
                host: env.string("HTTP_HOST", "0.0.0.0"),
                port: env.parse("HTTP_PORT", 8080)?,
                request_timeout: env.duration("HTTP_REQUEST_TIMEOUT", Duration::from_secs(30))?,
            },
            storage,
            postgres,
            worker_pool: WorkerPoolConfig { max_workers },
            rate_limit: RateLimitConfig {
                rps: env.parse("RATE_LIMIT_RPS", 100)?,
            },
            redis: env.optional("REDIS_URL").map(|url| RedisConfig { url }),
            health: HealthConfig {
                timeout: env.duration("HEALTHCHECK_TIMEOUT", Duration::from_secs(2))?,
            },
            circuit_breaker: BreakerSettings {
                enabled: env.flag("CIRCUIT_BREAKER_ENABLED", true)?,
                max_requests: env.parse("CIRCUIT_BREAKER_MAX_REQUESTS", 1)?,
                interval: env.duration("CIRCUIT_BREAKER_INTERVAL", Duration::ZERO)?,
                timeout: env.duration("CIRCUIT_BREAKER_TIMEOUT", Duration::from_secs(30))?,
                consecutive_failures: env.parse("CIRCUIT_BREAKER_CONSECUTIVE_FAILURES", 5)?,
            }
            .normalized(),
            shutdown: ShutdownConfig {
                http_timeout: env.duration("SHUTDOWN_HTTP_TIMEOUT", Duration::from_secs(10))?,
                hard_period: env.duration("SHUTDOWN_HARD_PERIOD", Duration::from_secs(3))?,
                readiness_drain: env.duration("SHUTDOWN_READINESS_DRAIN", Duration::from_secs(5))?,
            },
            reaper: ReaperConfig {
                enabled: env.flag("REAPER_ENABLED", false)?,
                interval: env.positive_duration("REAPER_INTERVAL", Duration::from_secs(30))?,
                lease_timeout: env.duration("REAPER_LEASE_TIMEOUT", Duration::from_secs(5 * 60))?,
            },
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, var: &'static str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn string(&self, var: &'static str, default: &str) -> String {
        self.optional(var).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(var) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(var) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    value: raw,
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }

    fn duration(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.optional(var) {
            None => Ok(default),
            Some(raw) => parse_duration(&raw).ok_or_else(|| ConfigError::Invalid {
                var,
                value: raw,
                reason: "expected a duration such as 500ms, 5s, 2m or 1h".to_string(),
            }),
        }
    }

    fn positive_duration(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let value = self.duration(var, default)?;
        if value.is_zero() {
            return Err(ConfigError::Invalid {
                var,
                value: self.optional(var).unwrap_or_default(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }
}

/// Parse `250ms`, `1.5s`, `2m`, `1h` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let split_idx = trimmed
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(idx, _)| idx)?;
    let (number, unit) = trimmed.split_at(split_idx);
    let value: f64 = number.parse().ok()?;
    let millis_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
        "ms" => 1.0,
        "s" | "sec" | "secs" => 1_000.0,
        "m" | "min" | "mins" => 60_000.0,
        "h" | "hr" | "hrs" => 3_600_000.0,
        _ => return None,
    };
    let millis = value * millis_per_unit;
    if !millis.is_finite() || millis < 0.0 {
        return None;
    }
    Some(Duration::from_millis(millis.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn memory_backend_needs_no_database() {
        let cfg = load(&[("TASK_STORE", "memory")]).unwrap();
        assert_eq!(cfg.storage, StorageBackend::Memory);
        assert!(cfg.postgres.is_none());
        assert!(cfg.redis.is_none());
        assert_eq!(cfg.worker_pool.max_workers, 10);
        assert_eq!(cfg.http.bind_addr(), "0.0.0.0:8080");
        assert!(cfg.circuit_breaker.enabled);
        assert!(!cfg.reaper.enabled);
    }

    #[test]
    fn postgres_backend_requires_database_url() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::Missing("DATABASE_URL"));

        let cfg = load(&[
            ("DATABASE_URL", "postgres://localhost/tasks"),
            ("PG_MAX_POOL_SIZE", "25"),
            ("PG_CONNECT_TIMEOUT", "750ms"),
        ])
        .unwrap();
        let pg = cfg.postgres.unwrap();
        assert_eq!(pg.max_pool_size, 25);
        assert_eq!(pg.connect_timeout, Duration::from_millis(750));
        assert!(pg.run_migrations);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = load(&[("TASK_STORE", "memory"), ("HTTP_PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "HTTP_PORT", .. }));

        let err = load(&[("TASK_STORE", "memory"), ("SHUTDOWN_HTTP_TIMEOUT", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "SHUTDOWN_HTTP_TIMEOUT", .. }));

        let err = load(&[("TASK_STORE", "memory"), ("WORKER_POOL_MAX_WORKERS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WORKER_POOL_MAX_WORKERS", .. }));
    }

    #[test]
    fn zero_reaper_interval_is_rejected() {
        for raw in ["0", "0s", "0ms"] {
            let err = load(&[("TASK_STORE", "memory"), ("REAPER_ENABLED", "true"), ("REAPER_INTERVAL", raw)])
                .unwrap_err();
            assert_eq!(
                err,
                ConfigError::Invalid {
                    var: "REAPER_INTERVAL",
                    value: raw.to_string(),
                    reason: "must be greater than zero".to_string(),
                }
            );
        }
        let cfg = load(&[("TASK_STORE", "memory"), ("REAPER_INTERVAL", "250ms")]).unwrap();
        assert_eq!(cfg.reaper.interval, Duration::from_millis(250));
    }

    #[test]
    fn breaker_settings_are_normalized() {
        let cfg = load(&[
            ("TASK_STORE", "memory"),
            ("CIRCUIT_BREAKER_MAX_REQUESTS", "0"),
            ("CIRCUIT_BREAKER_TIMEOUT", "0s"),
        ])
        .unwrap();
        assert_eq!(cfg.circuit_breaker.max_requests, 1);
        assert_eq!(cfg.circuit_breaker.timeout, Duration::from_secs(60));
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_duration("later"), None);
        assert_eq!(parse_duration("5 fortnights"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn redis_url_enables_rate_limiting() {
        let cfg = load(&[("TASK_STORE", "memory"), ("REDIS_URL", "redis://localhost:6379")]).unwrap();
        assert_eq!(cfg.redis.unwrap().url, "redis://localhost:6379");
        assert_eq!(cfg.rate_limit.rps, 100);
    }
}
