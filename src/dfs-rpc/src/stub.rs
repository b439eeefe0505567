use crate::{read_message, write_message, RpcError, RpcRequest, RpcResponse, RpcResult, ServiceDesc};
use log::debug;
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;

/// How long a stub waits for the TCP connect to succeed. There is no
/// per-call read deadline: operations such as a contended lock acquisition
/// legitimately block for an unbounded time.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static CALL_SEQ: AtomicU64 = AtomicU64::new(1);

/// Client-side proxy for one remote interface at one endpoint. Each call
/// opens a fresh connection, exchanges a single framed request/reply pair
/// and closes.
#[derive(Debug, Clone)]
pub struct RpcStub {
    desc: ServiceDesc,
    endpoint: SocketAddr,
}

impl RpcStub {
    pub fn new(desc: ServiceDesc, endpoint: SocketAddr) -> Result<Self, RpcError> {
        desc.validate()?;
        Ok(Self { desc, endpoint })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn desc(&self) -> &ServiceDesc {
        &self.desc
    }

    /// Performs one remote call. A fault reply is re-raised as
    /// `RpcError::Remote`; everything else that goes wrong on the way is a
    /// transport error.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let method_desc = self.desc.method(method).ok_or_else(|| {
            RpcError::BadInterface(format!("no method {}.{}", self.desc.name, method))
        })?;

        let req = RpcRequest {
            method: method.to_string(),
            param_types: method_desc
                .param_types
                .iter()
                .map(|t| t.to_string())
                .collect(),
            params,
            seq: CALL_SEQ.fetch_add(1, Ordering::Relaxed),
        };

        debug!("stub {}: call {} seq={}", self, method, req.seq);

        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.endpoint))
            .await
            .map_err(|_| {
                RpcError::ConnectError(format!("connect to {} timed out", self.endpoint))
            })?
            .map_err(|e| RpcError::ConnectError(format!("connect to {}: {}", self.endpoint, e)))?;

        write_message(&mut stream, &req).await?;
        let response: RpcResponse = read_message(&mut stream).await?;

        match response.result {
            RpcResult::Ok(value) => Ok(value),
            RpcResult::Fault(fault) => Err(RpcError::Remote(fault)),
        }
    }
}

impl PartialEq for RpcStub {
    fn eq(&self, other: &Self) -> bool {
        self.desc.name == other.desc.name && self.endpoint == other.endpoint
    }
}

impl Eq for RpcStub {}

impl Hash for RpcStub {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.desc.name.hash(state);
        self.endpoint.hash(state);
    }
}

impl fmt::Display for RpcStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.desc.name, self.endpoint)
    }
}
