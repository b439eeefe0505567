use crate::DfsPath;
use dfs_rpc::{MethodDesc, ServiceDesc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Identity of a storage node: the pair of endpoints it serves. The data
/// endpoint answers size/read/write, the command endpoint answers
/// create/delete/copy. Two registrations are the same node iff both
/// endpoints match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageId {
    pub data: SocketAddr,
    pub command: SocketAddr,
}

impl StorageId {
    pub fn new(data: SocketAddr, command: SocketAddr) -> Self {
        Self { data, command }
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage(data={}, command={})", self.data, self.command)
    }
}

// ==================== Interface descriptors ====================

pub const NAMING_SERVICE_DESC: ServiceDesc = ServiceDesc {
    name: "naming.service",
    methods: &[
        MethodDesc {
            name: "lock",
            param_types: &["path", "bool"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "unlock",
            param_types: &["path", "bool"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "is_directory",
            param_types: &["path"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "list",
            param_types: &["path"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "create_file",
            param_types: &["path"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "create_directory",
            param_types: &["path"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "delete",
            param_types: &["path"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "get_storage",
            param_types: &["path"],
            throws_rpc: true,
        },
    ],
};

pub const NAMING_REGISTRATION_DESC: ServiceDesc = ServiceDesc {
    name: "naming.registration",
    methods: &[MethodDesc {
        name: "register",
        param_types: &["endpoint", "endpoint", "path[]"],
        throws_rpc: true,
    }],
};

pub const STORAGE_DATA_DESC: ServiceDesc = ServiceDesc {
    name: "storage.data",
    methods: &[
        MethodDesc {
            name: "size",
            param_types: &["path"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "read",
            param_types: &["path", "u64", "u64"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "write",
            param_types: &["path", "u64", "bytes"],
            throws_rpc: true,
        },
    ],
};

pub const STORAGE_COMMAND_DESC: ServiceDesc = ServiceDesc {
    name: "storage.command",
    methods: &[
        MethodDesc {
            name: "create",
            param_types: &["path"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "delete",
            param_types: &["path"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "copy",
            param_types: &["path", "endpoint"],
            throws_rpc: true,
        },
    ],
};

// ==================== Request payloads ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathArgs {
    pub path: DfsPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockArgs {
    pub path: DfsPath,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadArgs {
    pub path: DfsPath,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteArgs {
    pub path: DfsPath,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyArgs {
    pub path: DfsPath,
    pub source: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterArgs {
    pub data: SocketAddr,
    pub command: SocketAddr,
    pub files: Vec<DfsPath>,
}
