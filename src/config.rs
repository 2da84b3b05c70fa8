use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

pub const DEFAULT_HOLD_MINUTES: u32 = 10;

/// Whether confirm/release check the caller against the user recorded on a hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HoldOwnership {
    /// Anyone who names the seats can confirm or release them.
    #[default]
    Unenforced,
    /// Only holds whose user id equals the caller's count (absent matches absent).
    Enforced,
}

impl HoldOwnership {
    pub fn permits(&self, holder: Option<&str>, caller: Option<&str>) -> bool {
        match self {
            HoldOwnership::Unenforced => true,
            HoldOwnership::Enforced => holder == caller,
        }
    }
}

/// Settings each tenant engine runs with.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub hold_minutes: u32,
    /// Longest a request waits for a busy `(trip, date)` before failing retryably.
    pub lock_wait: Duration,
    pub ownership: HoldOwnership,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_minutes: DEFAULT_HOLD_MINUTES,
            lock_wait: Duration::from_secs(5),
            ownership: HoldOwnership::Unenforced,
        }
    }
}

impl EngineConfig {
    pub fn hold_ttl_ms(&self) -> i64 {
        i64::from(self.hold_minutes) * 60_000
    }
}

#[derive(Debug)]
pub struct ConfigError {
    var: &'static str,
    message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.var, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Process settings, read once from `SEATLOCK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Zero disables the background reaper; expiry stays lazy.
    pub reaper_interval: Duration,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "seatlock".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            reaper_interval: Duration::ZERO,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables take defaults; set but
    /// unparseable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Config::default();
        let engine = EngineConfig {
            hold_minutes: parse_or(&lookup, "SEATLOCK_HOLD_MINUTES", d.engine.hold_minutes)?,
            lock_wait: Duration::from_millis(parse_or(
                &lookup,
                "SEATLOCK_LOCK_WAIT_MS",
                d.engine.lock_wait.as_millis() as u64,
            )?),
            ownership: if parse_or(&lookup, "SEATLOCK_ENFORCE_HOLD_OWNER", false)? {
                HoldOwnership::Enforced
            } else {
                HoldOwnership::Unenforced
            },
        };
        if engine.hold_minutes == 0 {
            return Err(ConfigError {
                var: "SEATLOCK_HOLD_MINUTES",
                message: "must be at least 1".into(),
            });
        }

        let tls_cert = lookup("SEATLOCK_TLS_CERT");
        let tls_key = lookup("SEATLOCK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError {
                var: "SEATLOCK_TLS_CERT",
                message: "SEATLOCK_TLS_CERT and SEATLOCK_TLS_KEY must be set together".into(),
            });
        }

        Ok(Self {
            bind: lookup("SEATLOCK_BIND").unwrap_or(d.bind),
            port: parse_or(&lookup, "SEATLOCK_PORT", d.port)?,
            data_dir: lookup("SEATLOCK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("SEATLOCK_PASSWORD").unwrap_or(d.password),
            max_connections: parse_or(&lookup, "SEATLOCK_MAX_CONNECTIONS", d.max_connections)?,
            compact_threshold: parse_or(&lookup, "SEATLOCK_COMPACT_THRESHOLD", d.compact_threshold)?,
            metrics_port: parse_opt(&lookup, "SEATLOCK_METRICS_PORT")?,
            tls_cert,
            tls_key,
            reaper_interval: Duration::from_secs(parse_or(&lookup, "SEATLOCK_REAPER_INTERVAL_SECS", 0)?),
            engine,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// TLS acceptor from the configured PEM files, or `None` when TLS is off.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("no private key in {key_path}")))?;

        let mut server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        server.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(server))))
    }
}

fn parse_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError {
            var,
            message: format!("cannot parse {raw:?}: {e}"),
        }),
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    Ok(parse_opt(lookup, var)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.engine.hold_minutes, 10);
        assert_eq!(cfg.engine.hold_ttl_ms(), 600_000);
        assert_eq!(cfg.engine.ownership, HoldOwnership::Unenforced);
        assert_eq!(cfg.reaper_interval, Duration::ZERO);
        assert!(cfg.metrics_port.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = from_pairs(&[
            ("SEATLOCK_PORT", "6000"),
            ("SEATLOCK_HOLD_MINUTES", "3"),
            ("SEATLOCK_LOCK_WAIT_MS", "250"),
            ("SEATLOCK_ENFORCE_HOLD_OWNER", "true"),
            ("SEATLOCK_REAPER_INTERVAL_SECS", "30"),
            ("SEATLOCK_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.engine.hold_minutes, 3);
        assert_eq!(cfg.engine.lock_wait, Duration::from_millis(250));
        assert_eq!(cfg.engine.ownership, HoldOwnership::Enforced);
        assert_eq!(cfg.reaper_interval, Duration::from_secs(30));
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn garbage_number_is_an_error() {
        let err = from_pairs(&[("SEATLOCK_PORT", "not-a-port")]).unwrap_err();
        assert!(err.to_string().starts_with("SEATLOCK_PORT"));
    }

    #[test]
    fn zero_hold_minutes_rejected() {
        assert!(from_pairs(&[("SEATLOCK_HOLD_MINUTES", "0")]).is_err());
    }

    #[test]
    fn tls_needs_both_files() {
        assert!(from_pairs(&[("SEATLOCK_TLS_CERT", "/tmp/cert.pem")]).is_err());
        let cfg = from_pairs(&[]).unwrap();
        assert!(cfg.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn ownership_policy() {
        assert!(HoldOwnership::Unenforced.permits(Some("a"), Some("b")));
        assert!(HoldOwnership::Enforced.permits(Some("a"), Some("a")));
        assert!(HoldOwnership::Enforced.permits(None, None));
        assert!(!HoldOwnership::Enforced.permits(Some("a"), None));
        assert!(!HoldOwnership::Enforced.permits(Some("a"), Some("b")));
    }
}
