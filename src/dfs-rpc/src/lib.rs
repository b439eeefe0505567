mod proto;
mod skeleton;
mod stub;

#[cfg(test)]
mod skeleton_tests;

pub use proto::*;
pub use skeleton::*;
pub use stub::*;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("bad remote interface: {0}")]
    BadInterface(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("connect failed: {0}")]
    ConnectError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("remote fault [{}]: {}", .0.kind, .0.message)]
    Remote(RpcFault),
}

impl RpcError {
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote(_))
    }

    pub fn remote_fault(&self) -> Option<&RpcFault> {
        match self {
            RpcError::Remote(fault) => Some(fault),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::IoError(err.to_string())
    }
}

