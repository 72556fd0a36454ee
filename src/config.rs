//! Configuration loading and validation.
//!
//! Armitage is configured from the process environment (optionally seeded
//! from a `.env` file). The set of variables is fixed; anything critical
//! that is missing in production fails startup instead of limping along
//! with a default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    /// Local development: relaxed validation, ephemeral keys allowed.
    Development,
    /// Production: critical secrets are mandatory.
    Production,
}

impl AppEnv {
    fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(anyhow::anyhow!("unknown APP_ENV: {other:?}")),
        }
    }

    /// Label used in health output and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

/// Identity provider settings.
#[derive(Debug, Clone)]
pub struct IdpSettings {
    /// Expected `iss` claim.
    pub issuer: String,
    /// Expected `aud` claim.
    pub audience: String,
    /// URL publishing the provider's signing keys (JSON key set).
    pub key_url: Option<String>,
    /// Static hex-encoded Ed25519 public key, used when no key URL is set.
    pub public_key_hex: Option<String>,
}

/// Budget ledger settings. All monetary values are integer micro-units.
#[derive(Debug, Clone)]
pub struct BudgetSettings {
    /// Daily cap per user, in micro-units.
    pub daily_limit_micros: i64,
    /// How long a reservation may stay pending before auto-refund.
    pub reserve_grace: Duration,
    /// How far an actual cost may exceed its reservation before clamping.
    pub commit_slack_micros: i64,
    /// Conservative lower bound for a server-side cost estimate.
    pub floor_estimate_micros: i64,
    /// Estimated price per 1000 tokens, in micro-units.
    pub micros_per_1k_tokens: i64,
}

/// Telemetry queue and worker settings.
#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    /// Bounded channel capacity; producers drop on overflow.
    pub queue_capacity: usize,
    /// Number of background persister workers.
    pub workers: usize,
    /// Maximum write attempts before dead-lettering a record.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub base_backoff: Duration,
    /// How long shutdown may spend draining the queue.
    pub shutdown_grace: Duration,
}

/// Inference proxy settings.
#[derive(Debug, Clone)]
pub struct InferenceSettings {
    /// Base URL of the OpenAI-compatible upstream endpoint.
    pub base_url: String,
    /// Per-call deadline for the upstream model.
    pub deadline: Duration,
    /// Seed injected when the caller does not supply one.
    pub default_seed: u64,
}

/// The full, fixed configuration set.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Deployment environment.
    pub env: AppEnv,
    /// Debug flag (enables verbose surfaces, never weakens governance).
    pub debug: bool,
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// SQLite database URL (e.g. `sqlite://armitage.db`).
    pub database_url: String,
    /// Directory for rotated JSON log files.
    pub log_dir: PathBuf,
    /// Whether a TLS-terminating ingress fronts this process. Required for
    /// any non-loopback bind; plaintext HTTP is refused otherwise.
    pub tls_terminated: bool,
    /// 32-byte hex master encryption key for the vault.
    pub master_key_hex: Option<String>,
    /// Enterprise license flag.
    pub enterprise_license: bool,
    /// Identity provider settings.
    pub idp: IdpSettings,
    /// Budget ledger settings.
    pub budget: BudgetSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
    /// Inference settings.
    pub inference: InferenceSettings,
    /// Draft lock time-to-live.
    pub lock_ttl: Duration,
}

impl Settings {
    /// Load settings from the process environment.
    ///
    /// A `.env` file in the working directory is honored when present but
    /// never required.
    ///
    /// # Errors
    ///
    /// Returns an error when a variable is present but unparseable, or when
    /// [`Settings::validate`] rejects the combination.
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let env = AppEnv::parse(&var_or("APP_ENV", "development"))?;
        let settings = Self {
            env,
            debug: parse_bool("DEBUG", false)?,
            host: var_or("HOST", "127.0.0.1"),
            port: parse_num("PORT", 8000)?,
            database_url: var_or("DATABASE_URL", "sqlite://armitage.db"),
            log_dir: PathBuf::from(var_or("LOG_DIR", "logs")),
            tls_terminated: parse_bool("TLS_TERMINATED", false)?,
            master_key_hex: optional_var("MASTER_KEY_HEX"),
            enterprise_license: parse_bool("ENTERPRISE_LICENSE", false)?,
            idp: IdpSettings {
                issuer: var_or("IDP_ISSUER", "https://idp.invalid/"),
                audience: var_or("IDP_AUDIENCE", "armitage"),
                key_url: optional_var("IDP_KEY_URL"),
                public_key_hex: optional_var("IDP_PUBLIC_KEY_HEX"),
            },
            budget: BudgetSettings {
                daily_limit_micros: parse_num::<i64>("DAILY_BUDGET_LIMIT", 50)?
                    .saturating_mul(1_000_000),
                reserve_grace: Duration::from_secs(parse_num("BUDGET_RESERVE_GRACE_SECS", 120)?),
                commit_slack_micros: parse_num("BUDGET_COMMIT_SLACK_MICROS", 500_000)?,
                floor_estimate_micros: parse_num("BUDGET_FLOOR_ESTIMATE_MICROS", 10_000)?,
                micros_per_1k_tokens: parse_num("BUDGET_MICROS_PER_1K_TOKENS", 15_000)?,
            },
            telemetry: TelemetrySettings {
                queue_capacity: parse_num("TELEMETRY_QUEUE_CAPACITY", 1024)?,
                workers: parse_num("TELEMETRY_WORKERS", 2)?,
                max_attempts: parse_num("TELEMETRY_MAX_ATTEMPTS", 5)?,
                base_backoff: Duration::from_millis(parse_num(
                    "TELEMETRY_BASE_BACKOFF_MS",
                    100,
                )?),
                shutdown_grace: Duration::from_secs(parse_num(
                    "TELEMETRY_SHUTDOWN_GRACE_SECS",
                    5,
                )?),
            },
            inference: InferenceSettings {
                base_url: var_or("INFERENCE_BASE_URL", "https://api.openai.com/v1"),
                deadline: Duration::from_secs(parse_num("INFERENCE_DEADLINE_SECS", 120)?),
                default_seed: parse_num("INFERENCE_DEFAULT_SEED", 42)?,
            },
            lock_ttl: Duration::from_secs(parse_num("WORKBENCH_LOCK_TTL_SECS", 30)?),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations that must never reach a running server.
    ///
    /// # Errors
    ///
    /// Returns an error when production is missing critical secrets or when
    /// a non-loopback bind lacks TLS termination.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.env == AppEnv::Production {
            if self.master_key_hex.is_none() {
                anyhow::bail!("MASTER_KEY_HEX is required in production");
            }
            if self.idp.key_url.is_none() && self.idp.public_key_hex.is_none() {
                anyhow::bail!("IDP_KEY_URL or IDP_PUBLIC_KEY_HEX is required in production");
            }
        }
        if let Some(hex_key) = &self.master_key_hex {
            let bytes = hex::decode(hex_key).context("MASTER_KEY_HEX is not valid hex")?;
            if bytes.len() != 32 {
                anyhow::bail!(
                    "MASTER_KEY_HEX must decode to 32 bytes, got {}",
                    bytes.len()
                );
            }
        }
        if !self.is_loopback_bind() && !self.tls_terminated {
            anyhow::bail!(
                "refusing plaintext bind on {}: set TLS_TERMINATED=true behind a TLS ingress \
                 or bind to loopback",
                self.host
            );
        }
        if self.budget.daily_limit_micros <= 0 {
            anyhow::bail!("DAILY_BUDGET_LIMIT must be positive");
        }
        if self.telemetry.workers == 0 || self.telemetry.queue_capacity == 0 {
            anyhow::bail!("telemetry workers and queue capacity must be non-zero");
        }
        Ok(())
    }

    /// Decode the master encryption key.
    ///
    /// # Errors
    ///
    /// Returns an error when the key is absent or malformed.
    pub fn master_key(&self) -> anyhow::Result<[u8; 32]> {
        let hex_key = self
            .master_key_hex
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("MASTER_KEY_HEX is not configured"))?;
        let bytes = hex::decode(hex_key).context("MASTER_KEY_HEX is not valid hex")?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("MASTER_KEY_HEX must decode to 32 bytes"))?;
        Ok(arr)
    }

    /// Whether the configured bind host is a loopback address.
    pub fn is_loopback_bind(&self) -> bool {
        match self.host.parse::<std::net::IpAddr>() {
            Ok(addr) => addr.is_loopback(),
            Err(_) => self.host == "localhost",
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn optional_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            other => Err(anyhow::anyhow!("{key} must be a boolean, got {other:?}")),
        },
    }
}

fn parse_num<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} is not a valid number: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        Settings {
            env: AppEnv::Development,
            debug: false,
            host: "127.0.0.1".to_owned(),
            port: 8000,
            database_url: "sqlite://:memory:".to_owned(),
            log_dir: PathBuf::from("logs"),
            tls_terminated: false,
            master_key_hex: None,
            enterprise_license: false,
            idp: IdpSettings {
                issuer: "https://idp.test/".to_owned(),
                audience: "armitage".to_owned(),
                key_url: None,
                public_key_hex: None,
            },
            budget: BudgetSettings {
                daily_limit_micros: 50_000_000,
                reserve_grace: Duration::from_secs(120),
                commit_slack_micros: 500_000,
                floor_estimate_micros: 10_000,
                micros_per_1k_tokens: 15_000,
            },
            telemetry: TelemetrySettings {
                queue_capacity: 16,
                workers: 1,
                max_attempts: 3,
                base_backoff: Duration::from_millis(10),
                shutdown_grace: Duration::from_secs(1),
            },
            inference: InferenceSettings {
                base_url: "http://127.0.0.1:9/v1".to_owned(),
                deadline: Duration::from_secs(5),
                default_seed: 42,
            },
            lock_ttl: Duration::from_secs(30),
        }
    }

    #[test]
    fn development_without_master_key_is_valid() {
        assert!(base_settings().validate().is_ok());
    }

    #[test]
    fn production_requires_master_key() {
        let mut s = base_settings();
        s.env = AppEnv::Production;
        s.idp.public_key_hex = Some("ab".repeat(32));
        assert!(s.validate().is_err());
        s.master_key_hex = Some("00".repeat(32));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn production_requires_idp_key_source() {
        let mut s = base_settings();
        s.env = AppEnv::Production;
        s.master_key_hex = Some("00".repeat(32));
        assert!(s.validate().is_err());
    }

    #[test]
    fn master_key_must_be_32_bytes() {
        let mut s = base_settings();
        s.master_key_hex = Some("abcd".to_owned());
        assert!(s.validate().is_err());
    }

    #[test]
    fn non_loopback_plaintext_bind_is_refused() {
        let mut s = base_settings();
        s.host = "0.0.0.0".to_owned();
        assert!(s.validate().is_err());
        s.tls_terminated = true;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn master_key_roundtrip() {
        let mut s = base_settings();
        s.master_key_hex = Some("11".repeat(32));
        assert_eq!(s.master_key().expect("decode"), [0x11u8; 32]);
    }
}
