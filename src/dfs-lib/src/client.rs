use crate::{
    CopyArgs, DfsError, DfsPath, DfsResult, LockArgs, PathArgs, ReadArgs, RegisterArgs,
    StorageId, WriteArgs, NAMING_REGISTRATION_DESC, NAMING_SERVICE_DESC, STORAGE_COMMAND_DESC,
    STORAGE_DATA_DESC,
};
use dfs_rpc::RpcStub;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;

fn encode<T: Serialize>(args: &T) -> DfsResult<Value> {
    serde_json::to_value(args).map_err(|e| DfsError::Internal(format!("encode args: {}", e)))
}

fn decode<T: DeserializeOwned>(value: Value) -> DfsResult<T> {
    serde_json::from_value(value).map_err(|e| DfsError::Rpc(format!("malformed reply: {}", e)))
}

/// Client proxy for the naming server's client service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamingStub {
    rpc: RpcStub,
}

impl NamingStub {
    pub fn new(endpoint: SocketAddr) -> DfsResult<Self> {
        Ok(Self {
            rpc: RpcStub::new(NAMING_SERVICE_DESC, endpoint)?,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.rpc.endpoint()
    }

    pub async fn lock(&self, path: &DfsPath, exclusive: bool) -> DfsResult<()> {
        let args = LockArgs {
            path: path.clone(),
            exclusive,
        };
        self.rpc.call("lock", encode(&args)?).await?;
        Ok(())
    }

    pub async fn unlock(&self, path: &DfsPath, exclusive: bool) -> DfsResult<()> {
        let args = LockArgs {
            path: path.clone(),
            exclusive,
        };
        self.rpc.call("unlock", encode(&args)?).await?;
        Ok(())
    }

    pub async fn is_directory(&self, path: &DfsPath) -> DfsResult<bool> {
        let args = PathArgs { path: path.clone() };
        decode(self.rpc.call("is_directory", encode(&args)?).await?)
    }

    pub async fn list(&self, path: &DfsPath) -> DfsResult<Vec<String>> {
        let args = PathArgs { path: path.clone() };
        decode(self.rpc.call("list", encode(&args)?).await?)
    }

    pub async fn create_file(&self, path: &DfsPath) -> DfsResult<bool> {
        let args = PathArgs { path: path.clone() };
        decode(self.rpc.call("create_file", encode(&args)?).await?)
    }

    pub async fn create_directory(&self, path: &DfsPath) -> DfsResult<bool> {
        let args = PathArgs { path: path.clone() };
        decode(self.rpc.call("create_directory", encode(&args)?).await?)
    }

    pub async fn delete(&self, path: &DfsPath) -> DfsResult<bool> {
        let args = PathArgs { path: path.clone() };
        decode(self.rpc.call("delete", encode(&args)?).await?)
    }

    pub async fn get_storage(&self, path: &DfsPath) -> DfsResult<StorageId> {
        let args = PathArgs { path: path.clone() };
        decode(self.rpc.call("get_storage", encode(&args)?).await?)
    }
}

/// Client proxy for the naming server's registration interface. Used by
/// storage servers only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationStub {
    rpc: RpcStub,
}

impl RegistrationStub {
    pub fn new(endpoint: SocketAddr) -> DfsResult<Self> {
        Ok(Self {
            rpc: RpcStub::new(NAMING_REGISTRATION_DESC, endpoint)?,
        })
    }

    /// Announces a storage node and its initial file set. Returns the paths
    /// the naming server already knows about; the caller must delete those
    /// from its local store.
    pub async fn register(
        &self,
        data: SocketAddr,
        command: SocketAddr,
        files: Vec<DfsPath>,
    ) -> DfsResult<Vec<DfsPath>> {
        let args = RegisterArgs {
            data,
            command,
            files,
        };
        decode(self.rpc.call("register", encode(&args)?).await?)
    }
}

/// Client proxy for a storage node's data interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageDataStub {
    rpc: RpcStub,
}

impl StorageDataStub {
    pub fn new(endpoint: SocketAddr) -> DfsResult<Self> {
        Ok(Self {
            rpc: RpcStub::new(STORAGE_DATA_DESC, endpoint)?,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.rpc.endpoint()
    }

    pub async fn size(&self, path: &DfsPath) -> DfsResult<u64> {
        let args = PathArgs { path: path.clone() };
        decode(self.rpc.call("size", encode(&args)?).await?)
    }

    pub async fn read(&self, path: &DfsPath, offset: u64, length: u64) -> DfsResult<Vec<u8>> {
        let args = ReadArgs {
            path: path.clone(),
            offset,
            length,
        };
        decode(self.rpc.call("read", encode(&args)?).await?)
    }

    pub async fn write(&self, path: &DfsPath, offset: u64, data: Vec<u8>) -> DfsResult<()> {
        let args = WriteArgs {
            path: path.clone(),
            offset,
            data,
        };
        self.rpc.call("write", encode(&args)?).await?;
        Ok(())
    }
}

/// Client proxy for a storage node's command interface. Used by the naming
/// server only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageCommandStub {
    rpc: RpcStub,
}

impl StorageCommandStub {
    pub fn new(endpoint: SocketAddr) -> DfsResult<Self> {
        Ok(Self {
            rpc: RpcStub::new(STORAGE_COMMAND_DESC, endpoint)?,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.rpc.endpoint()
    }

    pub async fn create(&self, path: &DfsPath) -> DfsResult<bool> {
        let args = PathArgs { path: path.clone() };
        decode(self.rpc.call("create", encode(&args)?).await?)
    }

    pub async fn delete(&self, path: &DfsPath) -> DfsResult<bool> {
        let args = PathArgs { path: path.clone() };
        decode(self.rpc.call("delete", encode(&args)?).await?)
    }

    /// Asks the node to pull `path` from another node's data endpoint.
    pub async fn copy(&self, path: &DfsPath, source: SocketAddr) -> DfsResult<bool> {
        let args = CopyArgs {
            path: path.clone(),
            source,
        };
        decode(self.rpc.call("copy", encode(&args)?).await?)
    }
}
