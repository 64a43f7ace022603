use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub rate_limit: RateLimitConfig,
    pub email: EmailConfig,
    pub sms: SmsConfig,
    pub push: PushConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origin. Any origin is allowed when unset.
    pub cors_origin: Option<String>,
    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// Shared secret used by the auth service to sign access tokens.
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP), replenishment rate.
    pub per_second: u64,
    /// Burst size per IP.
    pub burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    /// SendGrid API key. The email channel is disabled unless it looks like `SG.*`.
    pub sendgrid_api_key: Option<String>,
    pub default_from: String,
    pub api_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub api_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Contact for the VAPID `sub` claim (without the `mailto:` prefix).
    pub vapid_email: Option<String>,
    /// Base64url-encoded uncompressed P-256 public key, sent in the `k=` parameter.
    pub vapid_public_key: Option<String>,
    /// PEM-encoded EC private key used to sign VAPID tokens.
    pub vapid_private_key_pem: Option<String>,
    /// Time-to-live (seconds) requested from the push service.
    pub ttl_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Attempts allowed per record before it is terminally failed.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each following retry.
    pub base_delay_ms: u64,
    /// Ceiling for the retry delay.
    pub max_delay_ms: u64,
    /// Per-call timeout for a channel provider; a timeout counts as a transient failure.
    pub send_timeout_seconds: u64,
    /// Maximum concurrently in-flight provider calls for one bulk dispatch.
    pub bulk_concurrency: usize,
    /// How often the sweeper looks for orphaned pending records.
    pub sweep_interval_seconds: u64,
    /// How long an attempt lease is held before another worker may take over.
    pub lease_seconds: u64,
    /// Whether the background sweeper re-drives orphaned pending records.
    pub sweeper_enabled: bool,
}

impl DispatchConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_seconds)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Read an optional numeric variable, falling back to `default` when unset and
/// rejecting values that do not parse.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env_parse("PORT", defaults.server.port)?,
                cors_origin: env_opt("CORS_ORIGIN"),
                json_logs: env::var("LOG_FORMAT")
                    .map(|v| v.eq_ignore_ascii_case("json"))
                    .unwrap_or(false),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: env_parse(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            jwt: JwtConfig {
                secret: env_opt("JWT_SECRET")
                    .ok_or_else(|| ConfigError::MissingEnv("JWT_SECRET".to_string()))?,
            },
            rate_limit: RateLimitConfig {
                per_second: env_parse("RATE_LIMIT_PER_SECOND", defaults.rate_limit.per_second)?,
                burst: env_parse("RATE_LIMIT_BURST", defaults.rate_limit.burst)?,
            },
            email: EmailConfig {
                sendgrid_api_key: env_opt("SENDGRID_API_KEY"),
                default_from: env::var("DEFAULT_FROM_EMAIL").unwrap_or(defaults.email.default_from),
                api_url: env::var("SENDGRID_API_URL").unwrap_or(defaults.email.api_url),
            },
            sms: SmsConfig {
                account_sid: env_opt("TWILIO_ACCOUNT_SID"),
                auth_token: env_opt("TWILIO_AUTH_TOKEN"),
                from_number: env_opt("TWILIO_PHONE_NUMBER"),
                api_url: env::var("TWILIO_API_URL").unwrap_or(defaults.sms.api_url),
            },
            push: PushConfig {
                vapid_email: env_opt("VAPID_EMAIL"),
                vapid_public_key: env_opt("VAPID_PUBLIC_KEY"),
                vapid_private_key_pem: env_opt("VAPID_PRIVATE_KEY_PEM"),
                ttl_seconds: env_parse("PUSH_TTL_SECONDS", defaults.push.ttl_seconds)?,
            },
            dispatch: DispatchConfig {
                max_retries: env_parse("DISPATCH_MAX_RETRIES", defaults.dispatch.max_retries)?,
                base_delay_ms: env_parse("DISPATCH_BASE_DELAY_MS", defaults.dispatch.base_delay_ms)?,
                max_delay_ms: env_parse("DISPATCH_MAX_DELAY_MS", defaults.dispatch.max_delay_ms)?,
                send_timeout_seconds: env_parse(
                    "DISPATCH_SEND_TIMEOUT_SECONDS",
                    defaults.dispatch.send_timeout_seconds,
                )?,
                bulk_concurrency: env_parse(
                    "DISPATCH_BULK_CONCURRENCY",
                    defaults.dispatch.bulk_concurrency,
                )?,
                sweep_interval_seconds: env_parse(
                    "DISPATCH_SWEEP_INTERVAL_SECONDS",
                    defaults.dispatch.sweep_interval_seconds,
                )?,
                lease_seconds: env_parse("DISPATCH_LEASE_SECONDS", defaults.dispatch.lease_seconds)?,
                sweeper_enabled: match env::var("DISPATCH_SWEEPER_ENABLED") {
                    Ok(v) => parse_bool(&v).unwrap_or(true),
                    Err(_) => true,
                },
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the dispatcher cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "DATABASE_MAX_CONNECTIONS".to_string(),
            ));
        }
        let d = &self.dispatch;
        if d.max_retries == 0 {
            return Err(ConfigError::InvalidValue("DISPATCH_MAX_RETRIES".to_string()));
        }
        if d.bulk_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "DISPATCH_BULK_CONCURRENCY".to_string(),
            ));
        }
        if d.max_delay_ms < d.base_delay_ms {
            return Err(ConfigError::InvalidValue("DISPATCH_MAX_DELAY_MS".to_string()));
        }
        if d.lease_seconds <= d.send_timeout_seconds {
            return Err(ConfigError::InvalidValue("DISPATCH_LEASE_SECONDS".to_string()));
        }
        if self.rate_limit.per_second == 0 || self.rate_limit.burst == 0 {
            return Err(ConfigError::InvalidValue("RATE_LIMIT_PER_SECOND".to_string()));
        }
        Ok(())
    }

    /// Whether the SMTP-less email channel has usable credentials.
    pub fn email_enabled(&self) -> bool {
        self.email
            .sendgrid_api_key
            .as_deref()
            .map(|k| k.starts_with("SG."))
            .unwrap_or(false)
    }

    pub fn sms_enabled(&self) -> bool {
        self.sms.account_sid.is_some()
            && self.sms.auth_token.is_some()
            && self.sms.from_number.is_some()
    }

    pub fn push_enabled(&self) -> bool {
        self.push.vapid_email.is_some()
            && self.push.vapid_public_key.is_some()
            && self.push.vapid_private_key_pem.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3003,
                cors_origin: None,
                json_logs: false,
            },
            database: DatabaseConfig {
                url: "sqlite://data/notifications.db".to_string(),
                max_connections: 5,
            },
            jwt: JwtConfig {
                secret: String::new(),
            },
            rate_limit: RateLimitConfig {
                per_second: 1,
                burst: 100,
            },
            email: EmailConfig {
                sendgrid_api_key: None,
                default_from: "no-reply@localhost".to_string(),
                api_url: "https://api.sendgrid.com/v3/mail/send".to_string(),
            },
            sms: SmsConfig {
                account_sid: None,
                auth_token: None,
                from_number: None,
                api_url: "https://api.twilio.com/2010-04-01".to_string(),
            },
            push: PushConfig {
                vapid_email: None,
                vapid_public_key: None,
                vapid_private_key_pem: None,
                ttl_seconds: 86_400,
            },
            dispatch: DispatchConfig {
                max_retries: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                send_timeout_seconds: 10,
                bulk_concurrency: 8,
                sweep_interval_seconds: 5,
                lease_seconds: 60,
                sweeper_enabled: true,
            },
        }
    }
}
