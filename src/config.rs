//! Environment-driven settings for the dispatch engine

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

use crate::dispatch::models::NodeConfig;

/// Checker address used when no node list is configured
pub const DEFAULT_CHECKER_ADDR: &str = "localhost:50051";

/// Tag for the fallback node
pub const DEFAULT_NODE_TAG: &str = "default";

/// Parse `addr:tag,addr:tag` into node configs
///
/// The last `:`-separated part of each entry is the tag and the rest is the
/// address, so `10.0.0.5:50051:eu` is address `10.0.0.5:50051` with tag `eu`.
/// Entries without a tag are skipped.
pub fn parse_checker_nodes(raw: &str) -> Vec<NodeConfig> {
    raw.split(',')
        .filter_map(|entry| {
            let (addr, tag) = entry.trim().rsplit_once(':')?;
            Some(NodeConfig::new(addr, tag))
        })
        .collect()
}

/// Node list from `raw`, or the single fallback node when it yields nothing
pub fn resolve_checker_nodes(raw: Option<&str>, fallback_addr: &str, fallback_tag: &str) -> Vec<NodeConfig> {
    let nodes = raw.map(parse_checker_nodes).unwrap_or_default();
    if nodes.is_empty() {
        vec![NodeConfig::new(fallback_addr, fallback_tag)]
    } else {
        nodes
    }
}

/// Parse a duration such as `500ms`, `30s`, `5m`, `1h 30m` or bare seconds
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration {:?}: {}", s, e))
}

/// Certificate files for TLS to checker nodes
#[derive(Debug, Clone, Default)]
pub struct TlsFiles {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

impl TlsFiles {
    /// Build a client TLS config, or `None` when TLS is not configured
    ///
    /// A CA file turns TLS on. Client certificate and key are optional but
    /// must be given together.
    pub fn load(&self) -> Result<Option<ClientTlsConfig>> {
        let identity = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some(Identity::from_pem(read_pem(cert)?, read_pem(key)?)),
            (None, None) => None,
            _ => bail!("GRPC_TLS_CERT_FILE and GRPC_TLS_KEY_FILE must be set together"),
        };

        let Some(ca_file) = &self.ca_file else {
            if identity.is_some() {
                bail!("GRPC_TLS_CA_FILE is required when a client certificate is configured");
            }
            return Ok(None);
        };

        let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(read_pem(ca_file)?));
        if let Some(identity) = identity {
            tls = tls.identity(identity);
        }
        Ok(Some(tls))
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nodes_uses_last_colon_for_tag() {
        let nodes = parse_checker_nodes("localhost:50051:node1, 10.0.0.2:50052:node2");
        assert_eq!(
            nodes,
            vec![
                NodeConfig::new("localhost:50051", "node1"),
                NodeConfig::new("10.0.0.2:50052", "node2"),
            ]
        );
    }

    #[test]
    fn test_parse_nodes_skips_entries_without_tag() {
        let nodes = parse_checker_nodes("checker,host:1:a,");
        assert_eq!(nodes, vec![NodeConfig::new("host:1", "a")]);
    }

    #[test]
    fn test_resolve_falls_back_to_single_node() {
        let nodes = resolve_checker_nodes(None, DEFAULT_CHECKER_ADDR, DEFAULT_NODE_TAG);
        assert_eq!(nodes, vec![NodeConfig::new("localhost:50051", "default")]);

        let nodes = resolve_checker_nodes(Some("garbage"), "svc:9000", "solo");
        assert_eq!(nodes, vec![NodeConfig::new("svc:9000", "solo")]);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration(" 45 ").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("18446744073709551615").unwrap(), Duration::from_secs(u64::MAX));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("1.5").is_err());
    }

    #[test]
    fn test_tls_disabled_without_files() {
        assert!(TlsFiles::default().load().unwrap().is_none());
    }

    #[test]
    fn test_tls_requires_cert_and_key_together() {
        let files = TlsFiles {
            cert_file: Some(PathBuf::from("client.pem")),
            ..Default::default()
        };
        assert!(files.load().is_err());
    }

    #[test]
    fn test_tls_missing_ca_file_is_reported() {
        let files = TlsFiles {
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        let err = files.load().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }
}
