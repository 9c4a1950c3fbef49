//! Environment-driven configuration
//!
//! Every option has a default; invalid values abort startup. The struct is
//! immutable after validation; components receive an `Arc<Config>`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;

/// Bus (MQTT) connection settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub ca_certs: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub tls_insecure: bool,
    /// Startup connect attempt budget before exit code 2
    pub connect_attempts: u32,
}

/// HTTP API bind + CORS posture
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cors: CorsConfig,
    /// When true, `/metrics` is served without authentication
    pub metrics_public: bool,
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// `None` means wildcard (`*`)
    pub origins: Option<Vec<String>>,
    pub allow_credentials: bool,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
}

/// Advisory service integration
#[derive(Debug, Clone)]
pub struct AdvisoryConfig {
    pub enabled: bool,
    pub url: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub min_samples: usize,
    pub max_in_flight: usize,
}

/// Rolling-window and liveness settings
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    pub window: Duration,
    pub max_data_points: usize,
    pub device_online_ttl: Duration,
    pub max_history: usize,
}

/// API-key authentication
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    pub hmi_key: Option<String>,
    pub monitoring_key: Option<String>,
    pub admin_key: Option<String>,
}

/// One token-bucket quota, e.g. `100/minute`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateQuota {
    pub count: u32,
    pub per_secs: u64,
}

impl RateQuota {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.per_secs)
    }
}

impl FromStr for RateQuota {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = s
            .split_once('/')
            .ok_or_else(|| format!("expected <n>/<unit>, got {s:?}"))?;
        let count: u32 = count
            .trim()
            .parse()
            .map_err(|_| format!("bad count in {s:?}"))?;
        if count == 0 {
            return Err("rate count must be > 0".into());
        }
        let per_secs = match unit.trim() {
            "second" => 1,
            "minute" => 60,
            "hour" => 3600,
            other => return Err(format!("unknown rate unit {other:?}")),
        };
        Ok(RateQuota { count, per_secs })
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default: RateQuota,
    pub write: RateQuota,
    pub export: RateQuota,
}

/// WebSocket fan-out limits
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub max_connections: usize,
    pub session_queue: usize,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub json: bool,
    pub level: String,
}

/// Full control-layer configuration, validated at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub api: ApiConfig,
    pub advisory: AdvisoryConfig,
    pub aggregation: AggregationConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub ws: WsConfig,
    pub log: LogConfig,
    pub audit_log_path: Option<PathBuf>,
    pub shutdown_grace: Duration,
    pub dev_mode: bool,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Tests inject a map here.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mqtt = MqttConfig {
            host: get("MQTT_BROKER_HOST").unwrap_or_else(|| "localhost".into()),
            port: parse_range(&get, "MQTT_BROKER_PORT", 1883, 1, 65535)? as u16,
            username: get("MQTT_USERNAME").filter(|s| !s.is_empty()),
            password: get("MQTT_PASSWORD").filter(|s| !s.is_empty()),
            use_tls: parse_bool(&get, "MQTT_USE_TLS", false)?,
            ca_certs: get("MQTT_CA_CERTS").map(PathBuf::from),
            certfile: get("MQTT_CERTFILE").map(PathBuf::from),
            keyfile: get("MQTT_KEYFILE").map(PathBuf::from),
            tls_insecure: parse_bool(&get, "MQTT_TLS_INSECURE", false)?,
            connect_attempts: parse_range(&get, "BUS_CONNECT_ATTEMPTS", 5, 1, 100)? as u32,
        };

        let dev_mode = parse_bool(&get, "MODAX_DEV_MODE", false)?;

        if mqtt.tls_insecure && !dev_mode {
            return Err(ConfigError::Invalid {
                field: "MQTT_TLS_INSECURE",
                reason: "only permitted when MODAX_DEV_MODE is set".into(),
            });
        }
        if mqtt.use_tls && mqtt.ca_certs.is_none() {
            return Err(ConfigError::Missing {
                field: "MQTT_CA_CERTS",
                reason: "required when MQTT_USE_TLS is enabled".into(),
            });
        }

        let cors = CorsConfig {
            origins: match get("CORS_ORIGINS").as_deref() {
                None | Some("*") | Some("") => None,
                Some(list) => Some(
                    list.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                ),
            },
            allow_credentials: parse_bool(&get, "CORS_ALLOW_CREDENTIALS", false)?,
            allow_methods: parse_list(
                &get,
                "CORS_ALLOW_METHODS",
                &["GET", "POST", "OPTIONS"],
            ),
            allow_headers: parse_list(
                &get,
                "CORS_ALLOW_HEADERS",
                &["content-type", "x-api-key", "x-request-id"],
            ),
        };
        if cors.allow_credentials && cors.origins.is_none() {
            return Err(ConfigError::Invalid {
                field: "CORS_ALLOW_CREDENTIALS",
                reason: "credentials cannot be combined with wildcard origins".into(),
            });
        }

        let api = ApiConfig {
            host: get("API_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_range(&get, "API_PORT", 8080, 1, 65535)? as u16,
            cors,
            metrics_public: parse_bool(&get, "METRICS_PUBLIC", false)?,
        };

        let advisory = AdvisoryConfig {
            enabled: parse_bool(&get, "AI_ENABLED", true)?,
            url: get("AI_LAYER_URL").unwrap_or_else(|| "http://localhost:8100/analyze".into()),
            timeout: Duration::from_secs(parse_range(&get, "AI_LAYER_TIMEOUT", 5, 1, 60)?),
            interval: Duration::from_secs(parse_range(
                &get,
                "AI_ANALYSIS_INTERVAL_SECONDS",
                60,
                5,
                3600,
            )?),
            min_samples: parse_range(&get, "MIN_SAMPLES_FOR_ANALYSIS", 5, 1, 1000)? as usize,
            max_in_flight: parse_range(&get, "ADVISORY_MAX_IN_FLIGHT", 8, 1, 64)? as usize,
        };

        let aggregation = AggregationConfig {
            window: Duration::from_secs(parse_range(
                &get,
                "AGGREGATION_WINDOW_SECONDS",
                10,
                1,
                600,
            )?),
            max_data_points: parse_range(&get, "MAX_DATA_POINTS", 1000, 10, 100_000)? as usize,
            device_online_ttl: Duration::from_secs(parse_range(
                &get,
                "DEVICE_ONLINE_TTL_SECONDS",
                30,
                1,
                3600,
            )?),
            max_history: parse_range(&get, "MAX_AGGREGATE_HISTORY", 10_080, 10, 1_000_000)?
                as usize,
        };

        let auth = AuthConfig {
            enabled: parse_bool(&get, "API_KEY_ENABLED", false)?,
            hmi_key: get("HMI_API_KEY").filter(|s| !s.is_empty()),
            monitoring_key: get("MONITORING_API_KEY").filter(|s| !s.is_empty()),
            admin_key: get("ADMIN_API_KEY").filter(|s| !s.is_empty()),
        };
        if auth.enabled {
            let keys = [
                ("HMI_API_KEY", &auth.hmi_key),
                ("MONITORING_API_KEY", &auth.monitoring_key),
                ("ADMIN_API_KEY", &auth.admin_key),
            ];
            if keys.iter().all(|(_, k)| k.is_none()) {
                return Err(ConfigError::Missing {
                    field: "HMI_API_KEY",
                    reason: "at least one API key is required when API_KEY_ENABLED".into(),
                });
            }
            for (field, key) in keys {
                if let Some(k) = key {
                    if k.len() < 32 {
                        return Err(ConfigError::Invalid {
                            field,
                            reason: format!("key too short ({} chars, need >= 32)", k.len()),
                        });
                    }
                }
            }
        }

        let rate_limit = RateLimitConfig {
            enabled: parse_bool(&get, "RATE_LIMIT_ENABLED", true)?,
            default: parse_quota(&get, "RATE_LIMIT_DEFAULT", "100/minute")?,
            write: parse_quota(&get, "RATE_LIMIT_WRITE", "30/minute")?,
            export: parse_quota(&get, "RATE_LIMIT_EXPORT", "10/minute")?,
        };

        let ws = WsConfig {
            max_connections: parse_range(&get, "WS_MAX_CONNECTIONS", 256, 1, 100_000)? as usize,
            session_queue: parse_range(&get, "WS_SESSION_QUEUE", 256, 8, 100_000)? as usize,
        };

        let log = LogConfig {
            json: parse_bool(&get, "USE_JSON_LOGS", false)?,
            level: get("LOG_LEVEL").unwrap_or_else(|| "info".into()),
        };

        Ok(Config {
            mqtt,
            api,
            advisory,
            aggregation,
            auth,
            rate_limit,
            ws,
            log,
            audit_log_path: get("AUDIT_LOG_PATH").filter(|s| !s.is_empty()).map(PathBuf::from),
            shutdown_grace: Duration::from_secs(parse_range(
                &get,
                "SHUTDOWN_GRACE_SECONDS",
                30,
                1,
                30,
            )?),
            dev_mode,
        })
    }

    /// Advisory cache TTL: one analysis interval, but never below 10 s.
    pub fn advisory_cache_ttl(&self) -> Duration {
        self.advisory.interval.max(Duration::from_secs(10))
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => Err(ConfigError::Invalid {
                field: key,
                reason: format!("not a boolean: {other:?}"),
            }),
        },
    }
}

fn parse_range(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let value = match get(key) {
        None => default,
        Some(raw) => raw.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
            field: key,
            reason: format!("not an integer: {raw:?}"),
        })?,
    };
    if value < min || value > max {
        return Err(ConfigError::Invalid {
            field: key,
            reason: format!("{value} outside [{min}, {max}]"),
        });
    }
    Ok(value)
}

fn parse_list(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &[&str],
) -> Vec<String> {
    match get(key) {
        None => default.iter().map(|s| s.to_string()).collect(),
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

fn parse_quota(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<RateQuota, ConfigError> {
    let raw = get(key).unwrap_or_else(|| default.to_string());
    raw.parse().map_err(|reason| ConfigError::Invalid {
        field: key,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = from_map(&[]).unwrap();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.api.port, 8080);
        assert_eq!(cfg.advisory.timeout, Duration::from_secs(5));
        assert_eq!(cfg.aggregation.window, Duration::from_secs(10));
        assert_eq!(cfg.aggregation.max_data_points, 1000);
        assert_eq!(cfg.rate_limit.default, RateQuota { count: 100, per_secs: 60 });
        assert!(!cfg.auth.enabled);
    }

    #[test]
    fn out_of_range_window_rejected() {
        let err = from_map(&[("AGGREGATION_WINDOW_SECONDS", "601")]).unwrap_err();
        assert!(err.to_string().contains("AGGREGATION_WINDOW_SECONDS"));
    }

    #[test]
    fn bad_port_rejected() {
        assert!(from_map(&[("MQTT_BROKER_PORT", "0")]).is_err());
        assert!(from_map(&[("MQTT_BROKER_PORT", "70000")]).is_err());
        assert!(from_map(&[("MQTT_BROKER_PORT", "abc")]).is_err());
    }

    #[test]
    fn short_api_key_rejected() {
        let err = from_map(&[
            ("API_KEY_ENABLED", "true"),
            ("HMI_API_KEY", "tooshort"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("HMI_API_KEY"));
    }

    #[test]
    fn auth_enabled_requires_some_key() {
        assert!(from_map(&[("API_KEY_ENABLED", "true")]).is_err());
        let cfg = from_map(&[
            ("API_KEY_ENABLED", "true"),
            ("ADMIN_API_KEY", "0123456789abcdef0123456789abcdef"),
        ])
        .unwrap();
        assert!(cfg.auth.enabled);
    }

    #[test]
    fn tls_insecure_needs_dev_mode() {
        assert!(from_map(&[("MQTT_TLS_INSECURE", "true")]).is_err());
        let cfg = from_map(&[
            ("MQTT_TLS_INSECURE", "true"),
            ("MODAX_DEV_MODE", "true"),
        ])
        .unwrap();
        assert!(cfg.mqtt.tls_insecure);
    }

    #[test]
    fn rate_quota_parses() {
        assert_eq!(
            "3/minute".parse::<RateQuota>().unwrap(),
            RateQuota { count: 3, per_secs: 60 }
        );
        assert_eq!(
            "10/second".parse::<RateQuota>().unwrap(),
            RateQuota { count: 10, per_secs: 1 }
        );
        assert!("0/minute".parse::<RateQuota>().is_err());
        assert!("fast".parse::<RateQuota>().is_err());
    }

    #[test]
    fn cors_origin_list_parses() {
        let cfg = from_map(&[("CORS_ORIGINS", "http://a.example, http://b.example")]).unwrap();
        assert_eq!(
            cfg.api.cors.origins.unwrap(),
            vec!["http://a.example".to_string(), "http://b.example".to_string()]
        );

        let wild = from_map(&[("CORS_ORIGINS", "*")]).unwrap();
        assert!(wild.api.cors.origins.is_none());
    }

    #[test]
    fn credentials_with_wildcard_rejected() {
        assert!(from_map(&[("CORS_ALLOW_CREDENTIALS", "true")]).is_err());
    }

    #[test]
    fn advisory_cache_ttl_floors_at_ten_seconds() {
        let cfg = from_map(&[("AI_ANALYSIS_INTERVAL_SECONDS", "5")]).unwrap();
        assert_eq!(cfg.advisory_cache_ttl(), Duration::from_secs(10));
        let cfg = from_map(&[("AI_ANALYSIS_INTERVAL_SECONDS", "120")]).unwrap();
        assert_eq!(cfg.advisory_cache_ttl(), Duration::from_secs(120));
    }
}
