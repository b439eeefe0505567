mod client;
mod path;
mod proto;

pub use client::*;
pub use path::*;
pub use proto::*;

use dfs_rpc::{RpcError, RpcFault};
use thiserror::Error;

/// Well-known naming server ports. Clients and storage servers bootstrap by
/// these values; everything else is discovered through registration.
pub const NAMING_SERVICE_PORT: u16 = 6000;
pub const NAMING_REGISTRATION_PORT: u16 = 6001;

/// Shared-lock count at which a file becomes a replication candidate.
pub const REPLICATION_THRESHOLD: u64 = 20;

/// Transfer unit for storage-to-storage copies. Bounded so a copy never
/// materializes more than one chunk of a file in memory.
pub const COPY_CHUNK_SIZE: u64 = 8 * 1024;

#[derive(Error, Debug, Clone)]
pub enum DfsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type DfsResult<T> = std::result::Result<T, DfsError>;

impl DfsError {
    /// Stable tag used to carry the error kind across the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            DfsError::InvalidArgument(_) => "invalid_argument",
            DfsError::NotFound(_) => "not_found",
            DfsError::AlreadyExists(_) => "already_exists",
            DfsError::InvalidState(_) => "invalid_state",
            DfsError::IoError(_) => "io",
            DfsError::Rpc(_) => "rpc",
            DfsError::Cancelled(_) => "cancelled",
            DfsError::Internal(_) => "internal",
        }
    }

    pub fn from_fault(fault: &RpcFault) -> Self {
        let message = fault.message.clone();
        match fault.kind.as_str() {
            "invalid_argument" => DfsError::InvalidArgument(message),
            "not_found" => DfsError::NotFound(message),
            "already_exists" => DfsError::AlreadyExists(message),
            "invalid_state" => DfsError::InvalidState(message),
            "io" => DfsError::IoError(message),
            "cancelled" => DfsError::Cancelled(message),
            "internal" => DfsError::Internal(message),
            _ => DfsError::Rpc(message),
        }
    }

    pub fn to_fault(&self) -> RpcFault {
        RpcFault::new(self.kind(), self.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DfsError::NotFound(_))
    }
}

impl From<std::io::Error> for DfsError {
    fn from(err: std::io::Error) -> Self {
        DfsError::IoError(err.to_string())
    }
}

impl From<RpcError> for DfsError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(fault) => DfsError::from_fault(&fault),
            other => DfsError::Rpc(other.to_string()),
        }
    }
}
