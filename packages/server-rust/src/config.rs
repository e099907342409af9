//! Command-line and environment configuration.
//!
//! Every option is a `--flag` with an environment fallback. Durations use the
//! `300ms` / `1.5s` / `1h30m` syntax.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use crate::bus::PulsarConfig;
use crate::network::{DispatchConfig, NetworkConfig, TlsConfig};

/// Gateway that turns request/response calls into bus tasks and back.
#[derive(Debug, Clone, Parser)]
#[command(name = "taskgate", version, about)]
pub struct Cli {
    /// Pulsar service URL (`pulsar://` or `pulsar+ssl://`).
    #[arg(long, env = "PULSAR_URL")]
    pub pulsar_url: String,

    /// JWT presented to the broker with token auth.
    #[arg(long, env = "PULSAR_TOKEN", hide_env_values = true)]
    pub pulsar_token: Option<String>,

    #[arg(long, env = "PULSAR_TENANT", default_value = "public")]
    pub pulsar_tenant: String,

    #[arg(long, env = "PULSAR_NAMESPACE", default_value = "default")]
    pub pulsar_namespace: String,

    /// Deadline for non-streaming results. Invalid values keep the default.
    #[arg(long, env = "TIMEOUT")]
    pub timeout: Option<String>,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Bind address.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Host name workers use to reach this instance. Defaults to the machine
    /// hostname.
    #[arg(long, env = "ADVERTISE_HOST")]
    pub advertise_host: Option<String>,

    /// Any non-empty value enables human-readable debug logging.
    #[arg(long, env = "DEBUG", num_args = 0..=1, default_missing_value = "1")]
    pub debug: Option<String>,

    /// Silence after which a stream gets a keep-alive comment.
    #[arg(long, env = "KEEPALIVE_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub keepalive_interval: Duration,

    /// Time without a chunk before a stream is cut off. `0s` disables.
    #[arg(long, env = "STREAM_IDLE_TIMEOUT", default_value = "10m", value_parser = parse_duration)]
    pub stream_idle_timeout: Duration,

    /// Total lifetime cap for a stream. `0s` disables.
    #[arg(long, env = "STREAM_MAX_DURATION", default_value = "1h", value_parser = parse_duration)]
    pub stream_max_duration: Duration,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    #[arg(long, env = "TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Comma-separated allowed origins; `*` allows any.
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    pub cors_origins: Vec<String>,
}

/// Fully resolved settings for one gateway process.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bus: PulsarConfig,
    pub network: NetworkConfig,
    pub dispatch: DispatchConfig,
    pub debug: bool,
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.debug.as_deref().is_some_and(|v| !v.is_empty())
    }

    /// Resolves the parsed arguments into component configs.
    ///
    /// # Errors
    ///
    /// Fails when the bus URL is blank or the keep-alive interval is zero.
    pub fn into_config(self) -> anyhow::Result<GatewayConfig> {
        if self.pulsar_url.trim().is_empty() {
            anyhow::bail!("PULSAR_URL must not be empty");
        }
        if self.keepalive_interval.is_zero() {
            anyhow::bail!("KEEPALIVE_INTERVAL must be greater than zero");
        }
        let debug = self.debug_enabled();

        let defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            result_timeout: lenient_timeout(self.timeout.as_deref(), defaults.result_timeout),
            keepalive_interval: self.keepalive_interval,
            stream_idle_timeout: limit(self.stream_idle_timeout),
            stream_max_duration: limit(self.stream_max_duration),
            ..defaults
        };

        let tls = match (self.tls_cert, self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path,
                key_path,
            }),
            _ => None,
        };

        let network = NetworkConfig {
            host: self.host,
            port: self.port,
            advertise_host: self.advertise_host.filter(|h| !h.trim().is_empty()),
            tls,
            cors_origins: self
                .cors_origins
                .into_iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            ..NetworkConfig::default()
        };

        let bus = PulsarConfig {
            token: self.pulsar_token.filter(|t| !t.trim().is_empty()),
            tenant: self.pulsar_tenant,
            namespace: self.pulsar_namespace,
            ..PulsarConfig::new(self.pulsar_url.trim())
        };

        Ok(GatewayConfig {
            bus,
            network,
            dispatch,
            debug,
            metrics_addr: self.metrics_addr,
        })
    }
}

/// Parses the result deadline, falling back to `default` with a warning.
#[must_use]
pub fn lenient_timeout(raw: Option<&str>, default: Duration) -> Duration {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return default;
    };
    match parse_duration(raw) {
        Ok(timeout) if !timeout.is_zero() => timeout,
        Ok(_) => {
            warn!(value = raw, ?default, "TIMEOUT must be positive, using default");
            default
        }
        Err(err) => {
            warn!(value = raw, error = %err, ?default, "Could not parse TIMEOUT, using default");
            default
        }
    }
}

fn limit(value: Duration) -> Option<Duration> {
    (!value.is_zero()).then_some(value)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationParseError {
    #[error("empty duration")]
    Empty,
    #[error("negative duration {0:?}")]
    Negative(String),
    #[error("invalid duration {0:?}")]
    Invalid(String),
    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),
    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },
    #[error("duration {0:?} is too large")]
    Overflow(String),
}

/// Parses a duration such as `300ms`, `1.5s`, `2m` or `1h30m`.
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `0` is accepted.
///
/// # Errors
///
/// Returns [`DurationParseError`] for empty, negative, unit-less or
/// malformed input and for values beyond `u64` nanoseconds.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    let invalid = || DurationParseError::Invalid(input.to_string());
    let overflow = || DurationParseError::Overflow(input.to_string());

    let s = s.strip_prefix('+').unwrap_or(s);
    if s.is_empty() {
        return Err(DurationParseError::Empty);
    }
    if let Some(rest) = s.strip_prefix('-') {
        if rest == "0" {
            return Ok(Duration::ZERO);
        }
        return Err(DurationParseError::Negative(input.to_string()));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..number_len];
        rest = &rest[number_len..];
        if number.is_empty() || number == "." || number.matches('.').count() > 1 {
            return Err(invalid());
        }

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scale: u128 = match unit {
            "" => return Err(DurationParseError::MissingUnit(input.to_string())),
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            other => {
                return Err(DurationParseError::UnknownUnit {
                    unit: other.to_string(),
                    input: input.to_string(),
                })
            }
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| overflow())?
        };
        let mut nanos = whole.checked_mul(scale).ok_or_else(overflow)?;

        let mut place = scale;
        for digit in fraction.bytes() {
            place /= 10;
            if place == 0 {
                break;
            }
            nanos += u128::from(digit - b'0') * place;
        }

        total = total.checked_add(nanos).ok_or_else(overflow)?;
    }

    let nanos = u64::try_from(total).map_err(|_| overflow())?;
    Ok(Duration::from_nanos(nanos))
}
