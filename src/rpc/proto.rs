//! Wire types and client for the `checker.ConfigChecker` service
//!
//! Mirrors `proto/checker.proto`. Tag numbers must match for wire
//! compatibility.

use std::collections::HashMap;

use futures::Stream;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::Channel;
use tonic::{Request, Status, Streaming};

/// Metadata header carrying the API key
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CheckStatus {
    Pending = 0,
    Checking = 1,
    Success = 2,
    Failed = 3,
    Timeout = 4,
    Error = 5,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckRequest {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(string, tag = "2")]
    pub config: String,
    #[prost(int32, tag = "3")]
    pub timeout_seconds: i32,
    /// Position of the item in its batch (`index`, `total`)
    #[prost(map = "string, string", tag = "4")]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckResponse {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(string, tag = "2")]
    pub config: String,
    #[prost(bool, tag = "3")]
    pub is_valid: bool,
    #[prost(int64, tag = "4")]
    pub latency_ms: i64,
    #[prost(string, tag = "5")]
    pub error_message: String,
    #[prost(string, tag = "6")]
    pub protocol: String,
    #[prost(string, tag = "7")]
    pub server: String,
    #[prost(string, tag = "8")]
    pub country_code: String,
    #[prost(string, tag = "9")]
    pub remark: String,
    #[prost(enumeration = "CheckStatus", tag = "10")]
    pub status: i32,
    #[prost(message, optional, tag = "11")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(string, tag = "12")]
    pub node_tag: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthResponse {
    #[prost(bool, tag = "1")]
    pub healthy: bool,
    #[prost(string, tag = "2")]
    pub version: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatsRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatsResponse {
    #[prost(int64, tag = "1")]
    pub total_checks: i64,
    #[prost(int64, tag = "2")]
    pub successful_checks: i64,
    #[prost(int64, tag = "3")]
    pub failed_checks: i64,
    #[prost(double, tag = "4")]
    pub success_rate: f64,
    #[prost(int64, tag = "5")]
    pub uptime_seconds: i64,
}

/// Adds the API key header to every call when one is configured
#[derive(Clone, Default)]
pub struct ApiKeyInterceptor {
    api_key: Option<AsciiMetadataValue>,
}

impl ApiKeyInterceptor {
    pub fn new(api_key: Option<AsciiMetadataValue>) -> Self {
        Self { api_key }
    }
}

impl Interceptor for ApiKeyInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(api_key) = &self.api_key {
            request.metadata_mut().insert(API_KEY_HEADER, api_key.clone());
        }
        Ok(request)
    }
}

type InnerGrpc = tonic::client::Grpc<InterceptedService<Channel, ApiKeyInterceptor>>;

/// Client for one checker node
#[derive(Clone)]
pub struct ConfigCheckerClient {
    inner: InnerGrpc,
}

impl std::fmt::Debug for ConfigCheckerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigCheckerClient")
            .field("transport", &"gRPC/tonic")
            .finish()
    }
}

impl ConfigCheckerClient {
    pub fn new(channel: Channel, interceptor: ApiKeyInterceptor) -> Self {
        Self {
            inner: tonic::client::Grpc::new(InterceptedService::new(channel, interceptor)),
        }
    }

    /// Limit decoded message size in bytes
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.inner = self.inner.max_decoding_message_size(limit);
        self
    }

    /// Limit encoded message size in bytes
    pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
        self.inner = self.inner.max_encoding_message_size(limit);
        self
    }

    /// Open the bidirectional check stream
    pub async fn check_configs<S>(&self, requests: S) -> Result<Streaming<CheckResponse>, Status>
    where
        S: Stream<Item = CheckRequest> + Send + 'static,
    {
        let mut client = self.ready().await?;
        let path = PathAndQuery::from_static("/checker.ConfigChecker/CheckConfigs");
        let response = client
            .streaming(Request::new(requests), path, ProstCodec::default())
            .await?;
        Ok(response.into_inner())
    }

    pub async fn health(&self) -> Result<HealthResponse, Status> {
        let mut client = self.ready().await?;
        let path = PathAndQuery::from_static("/checker.ConfigChecker/Health");
        let response = client
            .unary(Request::new(HealthRequest {}), path, ProstCodec::default())
            .await?;
        Ok(response.into_inner())
    }

    pub async fn get_stats(&self) -> Result<StatsResponse, Status> {
        let mut client = self.ready().await?;
        let path = PathAndQuery::from_static("/checker.ConfigChecker/GetStats");
        let response = client
            .unary(Request::new(StatsRequest {}), path, ProstCodec::default())
            .await?;
        Ok(response.into_inner())
    }

    async fn ready(&self) -> Result<InnerGrpc, Status> {
        let mut client = self.inner.clone();
        client
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("channel not ready: {}", e)))?;
        Ok(client)
    }
}
