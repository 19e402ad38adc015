//! Dispatch error types

use thiserror::Error;

/// Errors raised while talking to checker nodes
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Node could not be reached or its channel failed
    #[error("failed to connect to checker node {addr}: {message}")]
    Connection { addr: String, message: String },

    /// Another task is already re-establishing this node's channel
    #[error("already reconnecting to checker node {addr}")]
    AlreadyReconnecting { addr: String },

    /// Mid-stream or unary call failure reported by the transport
    #[error("stream error{}: {message}", code_suffix(.code))]
    Stream {
        code: Option<tonic::Code>,
        message: String,
    },

    /// Job deadline elapsed first
    #[error("deadline exceeded: {message}")]
    Timeout { message: String },

    /// Node closed its stream without a terminal verdict
    #[error("no result received")]
    NoResult,

    /// No usable checker node
    #[error("no available checker clients")]
    PoolExhausted,

    /// Invalid connection or engine option
    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl DispatchError {
    pub fn connection(addr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            addr: addr.into(),
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the failure means the node's channel is no longer usable
    pub fn is_channel_failure(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Stream { code, .. } => matches!(code, Some(tonic::Code::Unavailable)),
            _ => false,
        }
    }
}

impl From<tonic::Status> for DispatchError {
    fn from(status: tonic::Status) -> Self {
        Self::Stream {
            code: Some(status.code()),
            message: status.message().to_string(),
        }
    }
}

fn code_suffix(code: &Option<tonic::Code>) -> String {
    code.map(|c| format!(" ({c:?})")).unwrap_or_default()
}

/// Result alias
pub type Result<T> = std::result::Result<T, DispatchError>;
