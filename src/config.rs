use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::engine::OverlapPolicy;
use crate::trigger::RetryPolicy;
use crate::venue::VenueOptions;

/// Server settings, read once at startup from `SLOTLEDGER_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub staff_password: String,
    /// Kiosk logins are refused when unset.
    pub kiosk_password: Option<String>,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub venue: VenueOptions,
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; unparsable numbers are an error rather
    /// than a silent default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let overlap_policy = match get("SLOTLEDGER_OVERLAP_POLICY") {
            None => OverlapPolicy::Enforce,
            Some(raw) => OverlapPolicy::parse(&raw).ok_or_else(|| {
                io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("SLOTLEDGER_OVERLAP_POLICY must be enforce or advisory, got {raw:?}"),
                )
            })?,
        };
        let award_attempts: u32 = parse_or(&get, "SLOTLEDGER_AWARD_RETRIES", 3)?;
        let sweep_secs: u64 = parse_or(&get, "SLOTLEDGER_SWEEP_SECS", 30)?;
        if sweep_secs == 0 {
            return Err(io::Error::new(ErrorKind::InvalidInput, "SLOTLEDGER_SWEEP_SECS must be positive"));
        }

        Ok(Self {
            port: parse_or(&get, "SLOTLEDGER_PORT", 5433)?,
            bind: get("SLOTLEDGER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("SLOTLEDGER_DATA_DIR").unwrap_or_else(|| "./data".into())),
            staff_password: get("SLOTLEDGER_STAFF_PASSWORD").unwrap_or_else(|| "slotledger".into()),
            kiosk_password: get("SLOTLEDGER_KIOSK_PASSWORD"),
            max_connections: parse_or(&get, "SLOTLEDGER_MAX_CONNECTIONS", 256)?,
            metrics_port: get("SLOTLEDGER_METRICS_PORT")
                .map(|raw| parse_value("SLOTLEDGER_METRICS_PORT", &raw))
                .transpose()?,
            tls_cert: get("SLOTLEDGER_TLS_CERT"),
            tls_key: get("SLOTLEDGER_TLS_KEY"),
            venue: VenueOptions {
                compact_threshold: parse_or(&get, "SLOTLEDGER_COMPACT_THRESHOLD", 1000)?,
                overlap_policy,
                award_retry: RetryPolicy { attempts: award_attempts.max(1), ..RetryPolicy::default() },
                sweep_every: Duration::from_secs(sweep_secs),
            },
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> io::Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, format!("{key}: cannot parse {raw:?}")))
}

fn parse_or<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> io::Result<T> {
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

pub fn load_tls_acceptor(cert_path: Option<&str>, key_path: Option<&str>) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both SLOTLEDGER_TLS_CERT and SLOTLEDGER_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?)).collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> io::Result<Config> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.data_dir, PathBuf::from("./data"));
        assert_eq!(c.max_connections, 256);
        assert!(c.kiosk_password.is_none());
        assert!(c.metrics_port.is_none());
        assert_eq!(c.venue.compact_threshold, 1000);
        assert_eq!(c.venue.overlap_policy, OverlapPolicy::Enforce);
        assert_eq!(c.venue.award_retry.attempts, 3);
        assert_eq!(c.venue.sweep_every, Duration::from_secs(30));
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("SLOTLEDGER_PORT", "6000"),
            ("SLOTLEDGER_OVERLAP_POLICY", "Advisory"),
            ("SLOTLEDGER_KIOSK_PASSWORD", "lobby"),
            ("SLOTLEDGER_METRICS_PORT", "9100"),
            ("SLOTLEDGER_AWARD_RETRIES", "0"),
        ])
        .unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.venue.overlap_policy, OverlapPolicy::Advisory);
        assert_eq!(c.kiosk_password.as_deref(), Some("lobby"));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.venue.award_retry.attempts, 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(config(&[("SLOTLEDGER_PORT", "lots")]).is_err());
        assert!(config(&[("SLOTLEDGER_OVERLAP_POLICY", "sometimes")]).is_err());
        assert!(config(&[("SLOTLEDGER_SWEEP_SECS", "0")]).is_err());
    }

    #[test]
    fn tls_needs_both_files() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
        let err = load_tls_acceptor(Some("cert.pem"), None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
