//! Environment-driven configuration.
//!
//! Every setting has a default; unparseable or out-of-range values fall back
//! to it instead of failing. [`GatewayConfig::validate`] then rejects the
//! combinations the gateway cannot run with.

use std::{str::FromStr, time::Duration};

use crate::{ClientOptions, LogConfig, RetryPolicy, SecurityHeaders};

const VALID_COEP: &[&str] = &["", "require-corp", "credentialless"];
const VALID_COOP: &[&str] = &["", "same-origin", "same-origin-allow-popups", "unsafe-none"];
const VALID_CORP: &[&str] = &["", "same-origin", "same-site", "cross-origin"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {name} value '{value}', allowed values: {allowed}")]
    InvalidPolicy {
        name: &'static str,
        value: String,
        allowed: String,
    },
    #[error("METADATA_MAX_RETRIES must be at least 1")]
    NoAttempts,
    #[error("METADATA_MAX_RETRY_DELAY ({max:?}) is shorter than METADATA_BASE_RETRY_DELAY ({base:?})")]
    DelayBounds { base: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: String,
    /// First path segment of every route, without slashes.
    pub prefix: String,
    /// Bound on reading a request head.
    pub read_timeout: Duration,
    /// Bound on producing a response once the request is read.
    pub write_timeout: Duration,
    /// Keep-alive connections with no traffic for this long are closed.
    pub idle_timeout: Duration,
    pub shutdown_timeout: Duration,
}

/// Cross-origin policies for the API routes and for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityConfig {
    pub default_coep: String,
    pub default_coop: String,
    pub default_corp: String,
    pub api_coep: String,
    pub api_coop: String,
    pub api_corp: String,
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_policy("DefaultCOEP", &self.default_coep, VALID_COEP)?;
        validate_policy("DefaultCOOP", &self.default_coop, VALID_COOP)?;
        validate_policy("DefaultCORP", &self.default_corp, VALID_CORP)?;
        validate_policy("APICOEP", &self.api_coep, VALID_COEP)?;
        validate_policy("APICOOP", &self.api_coop, VALID_COOP)?;
        validate_policy("APICORP", &self.api_corp, VALID_CORP)
    }

    pub fn api_headers(&self, server: &str) -> SecurityHeaders {
        SecurityHeaders::custom(server, &self.api_coep, &self.api_coop, &self.api_corp)
    }

    pub fn default_headers(&self, server: &str) -> SecurityHeaders {
        SecurityHeaders::custom(
            server,
            &self.default_coep,
            &self.default_coop,
            &self.default_corp,
        )
    }
}

fn validate_policy(name: &'static str, value: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    if allowed.contains(&value) {
        return Ok(());
    }
    Err(ConfigError::InvalidPolicy {
        name,
        value: value.to_owned(),
        allowed: allowed.join(", "),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub metadata: ClientOptions,
    pub logging: LogConfig,
    pub security: SecurityConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl GatewayConfig {
    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, applying defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = RetryPolicy::default();

        Self {
            server: ServerConfig {
                port: env.string("PORT", "8080"),
                prefix: env.string("SERVICE_PREFIX", "istio-test").trim_matches('/').to_owned(),
                read_timeout: env.duration("SERVER_READ_TIMEOUT", Duration::from_secs(5)),
                write_timeout: env.duration("SERVER_WRITE_TIMEOUT", Duration::from_secs(10)),
                idle_timeout: env.duration("SERVER_IDLE_TIMEOUT", Duration::from_secs(60)),
                shutdown_timeout: env.duration("SHUTDOWN_TIMEOUT", Duration::from_secs(5)),
            },
            metadata: ClientOptions {
                timeout: env.duration("METADATA_HTTP_TIMEOUT", Duration::from_secs(10)),
                retry: RetryPolicy {
                    max_attempts: env.parsed("METADATA_MAX_RETRIES", defaults.max_attempts, |_| true),
                    base_delay: env.duration("METADATA_BASE_RETRY_DELAY", defaults.base_delay),
                    max_delay: env.duration("METADATA_MAX_RETRY_DELAY", defaults.max_delay),
                    multiplier: env.parsed("METADATA_RETRY_MULTIPLIER", defaults.multiplier, |m| {
                        m.is_finite() && *m > 0.0
                    }),
                },
            },
            logging: LogConfig {
                level: env.string("LOG_LEVEL", "info"),
                pii_redaction: env.bool("ENABLE_PII_REDACTION", false),
            },
            security: SecurityConfig {
                default_coep: env.string("SECURITY_DEFAULT_COEP", "require-corp"),
                default_coop: env.string("SECURITY_DEFAULT_COOP", "same-origin"),
                default_corp: env.string("SECURITY_DEFAULT_CORP", "same-origin"),
                api_coep: env.string("SECURITY_API_COEP", ""),
                api_coop: env.string("SECURITY_API_COOP", "same-origin-allow-popups"),
                api_corp: env.string("SECURITY_API_CORP", "cross-origin"),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.security.validate()?;

        let retry = &self.metadata.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if retry.max_delay < retry.base_delay {
            return Err(ConfigError::DelayBounds {
                base: retry.base_delay,
                max: retry.max_delay,
            });
        }
        Ok(())
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_owned())
    }

    fn parsed<T, P>(&self, key: &str, default: T, accept: P) -> T
    where
        T: FromStr,
        P: Fn(&T) -> bool,
    {
        self.raw(key)
            .and_then(|value| value.trim().parse::<T>().ok())
            .filter(|value| accept(value))
            .unwrap_or(default)
    }

    /// Durations are humantime strings (`250ms`, `2s`, `1m`) and must be non-zero.
    fn duration(&self, key: &str, default: Duration) -> Duration {
        self.raw(key)
            .and_then(|value| humantime::parse_duration(value.trim()).ok())
            .filter(|duration| !duration.is_zero())
            .unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.raw(key)
            .and_then(|value| parse_bool(&value))
            .unwrap_or(default)
    }
}

/// `1`, `t`, `true` and their `0`, `f`, `false` counterparts, in the usual casings.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
