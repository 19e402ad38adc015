//! gRPC transport for checker nodes
//!
//! [`GrpcConnector`] opens tonic channels and [`GrpcChannel`] maps the wire
//! messages of the `checker.ConfigChecker` service into dispatch types.

pub mod proto;

use std::collections::HashMap;
use std::time::Duration;

use chrono::DateTime;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::debug;

use crate::dispatch::engine::{DispatchEngine, EngineConfig};
use crate::dispatch::models::{CheckRequest, NodeResponse, NodeStats, RemoteStatus};
use crate::dispatch::transport::{CheckerChannel, Connector, ResponseStream};
use crate::error::{DispatchError, Result};

use self::proto::{ApiKeyInterceptor, ConfigCheckerClient};

/// Largest message accepted or sent, in bytes
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Channel settings shared by every node connection
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Interval between HTTP/2 keep-alive pings
    pub keep_alive_interval: Duration,
    /// Time to wait for a ping acknowledgement
    pub keep_alive_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_message_size: usize,
    pub api_key: Option<AsciiMetadataValue>,
    /// Switches the channel to `https` when set
    pub tls: Option<ClientTlsConfig>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            max_message_size: MAX_MESSAGE_SIZE,
            api_key: None,
            tls: None,
        }
    }
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `api_key` with every call; an empty key disables the header
    pub fn with_api_key(mut self, api_key: &str) -> Result<Self> {
        if api_key.is_empty() {
            self.api_key = None;
            return Ok(self);
        }
        let value = api_key
            .parse::<AsciiMetadataValue>()
            .map_err(|_| DispatchError::config("API key contains characters not allowed in metadata"))?;
        self.api_key = Some(value);
        Ok(self)
    }

    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }
}

/// Opens tonic channels to checker nodes
#[derive(Debug, Clone, Default)]
pub struct GrpcConnector {
    options: TransportOptions,
}

impl GrpcConnector {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Endpoint for `addr`, adding a scheme when the address has none
    pub fn endpoint(&self, addr: &str) -> Result<Endpoint> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else if self.options.tls.is_some() {
            format!("https://{}", addr)
        } else {
            format!("http://{}", addr)
        };

        let mut endpoint = Channel::from_shared(uri)
            .map_err(|e| DispatchError::connection(addr, format!("invalid endpoint: {}", e)))?
            .connect_timeout(self.options.connect_timeout)
            .http2_keep_alive_interval(self.options.keep_alive_interval)
            .keep_alive_timeout(self.options.keep_alive_timeout)
            .keep_alive_while_idle(true);

        if let Some(tls) = &self.options.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| DispatchError::connection(addr, format!("TLS config error: {}", e)))?;
        }

        Ok(endpoint)
    }
}

impl Connector for GrpcConnector {
    type Channel = GrpcChannel;

    async fn connect(&self, addr: &str) -> Result<GrpcChannel> {
        let channel = self
            .endpoint(addr)?
            .connect()
            .await
            .map_err(|e| DispatchError::connection(addr, e.to_string()))?;

        debug!(addr, tls = self.options.tls.is_some(), "Opened gRPC channel");

        let client = ConfigCheckerClient::new(channel, ApiKeyInterceptor::new(self.options.api_key.clone()))
            .max_decoding_message_size(self.options.max_message_size)
            .max_encoding_message_size(self.options.max_message_size);
        Ok(GrpcChannel { client })
    }
}

/// Open gRPC channel to one checker node
#[derive(Debug, Clone)]
pub struct GrpcChannel {
    client: ConfigCheckerClient,
}

impl CheckerChannel for GrpcChannel {
    async fn check(&self, requests: ReceiverStream<CheckRequest>) -> Result<ResponseStream> {
        let outbound = requests.map(proto::CheckRequest::from);
        let inbound = self.client.check_configs(outbound).await?;
        Ok(inbound
            .map(|next| next.map(NodeResponse::from).map_err(DispatchError::from))
            .boxed())
    }

    async fn health(&self) -> Result<()> {
        let response = self.client.health().await?;
        debug!(healthy = response.healthy, version = %response.version, "Checker node health");
        Ok(())
    }

    async fn stats(&self) -> Result<NodeStats> {
        Ok(self.client.get_stats().await?.into())
    }
}

impl DispatchEngine<GrpcConnector> {
    /// Connect to the configured nodes over gRPC
    pub async fn connect(config: EngineConfig, options: TransportOptions) -> Result<Self> {
        Self::new(config, GrpcConnector::new(options)).await
    }
}

impl From<CheckRequest> for proto::CheckRequest {
    fn from(request: CheckRequest) -> Self {
        let metadata = HashMap::from([
            ("index".to_string(), request.index.to_string()),
            ("total".to_string(), request.total.to_string()),
        ]);
        Self {
            job_id: request.job_id,
            config: request.item,
            timeout_seconds: i32::try_from(request.timeout.as_secs()).unwrap_or(i32::MAX),
            metadata,
        }
    }
}

impl From<proto::CheckResponse> for NodeResponse {
    fn from(response: proto::CheckResponse) -> Self {
        let timestamp = response.timestamp.and_then(|ts| {
            let nanos = u32::try_from(ts.nanos).unwrap_or_default();
            DateTime::from_timestamp(ts.seconds, nanos)
        });
        Self {
            job_id: response.job_id,
            item: response.config,
            is_valid: response.is_valid,
            latency_ms: response.latency_ms,
            error: response.error_message,
            protocol: response.protocol,
            server: response.server,
            country_code: response.country_code,
            remark: response.remark,
            status: remote_status(response.status),
            timestamp,
            node_tag: response.node_tag,
        }
    }
}

impl From<proto::StatsResponse> for NodeStats {
    fn from(stats: proto::StatsResponse) -> Self {
        Self {
            total_checks: stats.total_checks,
            successful_checks: stats.successful_checks,
            failed_checks: stats.failed_checks,
            success_rate: stats.success_rate,
            uptime_seconds: stats.uptime_seconds,
        }
    }
}

/// Map a wire status code, keeping unknown codes as failures
fn remote_status(code: i32) -> RemoteStatus {
    match proto::CheckStatus::try_from(code) {
        Ok(proto::CheckStatus::Pending) => RemoteStatus::Pending,
        Ok(proto::CheckStatus::Checking) => RemoteStatus::Checking,
        Ok(proto::CheckStatus::Success) => RemoteStatus::Success,
        Ok(proto::CheckStatus::Timeout) => RemoteStatus::Timeout,
        Ok(proto::CheckStatus::Failed | proto::CheckStatus::Error) | Err(_) => RemoteStatus::Failed(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(remote_status(0), RemoteStatus::Pending);
        assert_eq!(remote_status(1), RemoteStatus::Checking);
        assert_eq!(remote_status(2), RemoteStatus::Success);
        assert_eq!(remote_status(3), RemoteStatus::Failed(3));
        assert_eq!(remote_status(4), RemoteStatus::Timeout);
        assert_eq!(remote_status(5), RemoteStatus::Failed(5));
        assert_eq!(remote_status(99), RemoteStatus::Failed(99));
        assert!(!remote_status(0).is_terminal());
        assert!(remote_status(99).is_terminal());
    }

    #[test]
    fn test_request_carries_batch_position() {
        let request = proto::CheckRequest::from(CheckRequest {
            job_id: "grpc-1-wa".to_string(),
            item: "vless://abc".to_string(),
            timeout: Duration::from_secs(10),
            index: 2,
            total: 5,
        });
        assert_eq!(request.config, "vless://abc");
        assert_eq!(request.timeout_seconds, 10);
        assert_eq!(request.metadata["index"], "2");
        assert_eq!(request.metadata["total"], "5");
    }

    #[test]
    fn test_response_conversion() {
        let response = NodeResponse::from(proto::CheckResponse {
            job_id: "job".to_string(),
            config: "trojan://x".to_string(),
            is_valid: true,
            latency_ms: 87,
            protocol: "trojan".to_string(),
            status: proto::CheckStatus::Success as i32,
            timestamp: Some(prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 5,
            }),
            node_tag: "eu".to_string(),
            ..Default::default()
        });
        assert!(response.is_success());
        assert_eq!(response.item, "trojan://x");
        assert_eq!(response.latency_ms, 87);
        assert_eq!(response.node_tag, "eu");
        assert_eq!(response.timestamp.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_negative_nanos_do_not_panic() {
        let response = NodeResponse::from(proto::CheckResponse {
            timestamp: Some(prost_types::Timestamp { seconds: 10, nanos: -1 }),
            ..Default::default()
        });
        assert_eq!(response.timestamp.unwrap().timestamp(), 10);
    }

    #[test]
    fn test_endpoint_scheme() {
        let connector = GrpcConnector::default();
        let endpoint = connector.endpoint("checker-1:50051").unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(endpoint.uri().authority().unwrap().as_str(), "checker-1:50051");

        let endpoint = connector.endpoint("https://checker-2:443").unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("https"));
    }

    #[test]
    fn test_invalid_endpoint_is_connection_error() {
        let connector = GrpcConnector::default();
        let err = connector.endpoint("bad host:1").unwrap_err();
        assert!(matches!(err, DispatchError::Connection { .. }));
    }

    #[test]
    fn test_api_key_validation() {
        let options = TransportOptions::new().with_api_key("k-123").unwrap();
        assert!(options.api_key.is_some());

        let options = TransportOptions::new().with_api_key("").unwrap();
        assert!(options.api_key.is_none());

        let err = TransportOptions::new().with_api_key("line\nbreak").unwrap_err();
        assert!(matches!(err, DispatchError::Config { .. }));
    }

    #[test]
    fn test_default_transport_options() {
        let options = TransportOptions::default();
        assert_eq!(options.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(options.keep_alive_timeout, Duration::from_secs(3));
        assert_eq!(options.max_message_size, 10 * 1024 * 1024);
        assert!(options.tls.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_to_connect() {
        let connector = GrpcConnector::new(
            TransportOptions::new().with_connect_timeout(Duration::from_millis(200)),
        );
        let err = connector.connect("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, DispatchError::Connection { ref addr, .. } if addr == "127.0.0.1:1"));
    }
}
