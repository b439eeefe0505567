use async_trait::async_trait;
use dfs_lib::{
    CopyArgs, DfsError, DfsPath, DfsResult, PathArgs, ReadArgs, RegistrationStub,
    StorageDataStub, WriteArgs, COPY_CHUNK_SIZE, STORAGE_COMMAND_DESC, STORAGE_DATA_DESC,
};
use dfs_rpc::{RpcFault, RpcRequest, RpcService, Skeleton};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

struct StorageState {
    root: PathBuf,
}

impl StorageState {
    /// Maps a filesystem path under the local root. Components that would
    /// climb out of the root are refused outright.
    fn local_path(&self, path: &DfsPath) -> DfsResult<PathBuf> {
        let mut local = self.root.clone();
        for component in path.iter() {
            if component == "." || component == ".." {
                return Err(DfsError::InvalidArgument(format!(
                    "path {} escapes the storage root",
                    path
                )));
            }
            local.push(component);
        }
        Ok(local)
    }

    async fn file_len(&self, path: &DfsPath) -> DfsResult<u64> {
        let local = self.local_path(path)?;
        match fs::metadata(&local).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(DfsError::NotFound(format!("{} is a directory", path))),
            Err(_) => Err(DfsError::NotFound(path.to_string())),
        }
    }

    // ==================== Data interface ====================

    async fn size(&self, path: &DfsPath) -> DfsResult<u64> {
        self.file_len(path).await
    }

    async fn read(&self, path: &DfsPath, offset: u64, length: u64) -> DfsResult<Vec<u8>> {
        let len = self.file_len(path).await?;
        if offset == len {
            // Reading from the end of the file yields nothing, whatever the
            // requested length.
            return Ok(Vec::new());
        }
        if offset > len || length > len - offset {
            return Err(DfsError::InvalidArgument(format!(
                "read of {} bytes at {} past the end of {} ({} bytes)",
                length, offset, path, len
            )));
        }

        let local = self.local_path(path)?;
        let mut file = fs::File::open(&local)
            .await
            .map_err(|e| DfsError::IoError(format!("open {}: {}", path, e)))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| DfsError::IoError(format!("seek {}: {}", path, e)))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| DfsError::IoError(format!("read {}: {}", path, e)))?;
        Ok(buf)
    }

    async fn write(&self, path: &DfsPath, offset: u64, data: &[u8]) -> DfsResult<()> {
        // Existence and kind are checked up front so a directory reports
        // NotFound rather than a platform-specific open failure.
        self.file_len(path).await?;

        let local = self.local_path(path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .open(&local)
            .await
            .map_err(|e| DfsError::IoError(format!("open {} for write: {}", path, e)))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| DfsError::IoError(format!("seek {}: {}", path, e)))?;
        file.write_all(data)
            .await
            .map_err(|e| DfsError::IoError(format!("write {}: {}", path, e)))?;
        file.flush()
            .await
            .map_err(|e| DfsError::IoError(format!("flush {}: {}", path, e)))?;
        Ok(())
    }

    // ==================== Command interface ====================

    async fn create(&self, path: &DfsPath) -> DfsResult<bool> {
        if path.is_root() {
            return Ok(false);
        }
        let local = self.local_path(path)?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DfsError::IoError(format!("create parents of {}: {}", path, e)))?;
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&local)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(DfsError::IoError(format!("create {}: {}", path, e))),
        }
    }

    async fn delete(&self, path: &DfsPath) -> DfsResult<bool> {
        if path.is_root() {
            return Ok(false);
        }
        let local = self.local_path(path)?;
        let meta = match fs::metadata(&local).await {
            Ok(meta) => meta,
            Err(_) => return Ok(false),
        };
        let removed = if meta.is_dir() {
            fs::remove_dir_all(&local).await
        } else {
            fs::remove_file(&local).await
        };
        match removed {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("delete {} failed: {}", path, e);
                Ok(false)
            }
        }
    }

    /// Pulls `path` from another node's data endpoint in bounded chunks,
    /// replacing any local copy.
    async fn copy(&self, path: &DfsPath, source: SocketAddr) -> DfsResult<bool> {
        let source_stub = StorageDataStub::new(source)?;
        let total = source_stub.size(path).await?;

        let local = self.local_path(path)?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DfsError::IoError(format!("create parents of {}: {}", path, e)))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&local)
            .await
            .map_err(|e| DfsError::IoError(format!("open {} for copy: {}", path, e)))?;

        let mut offset = 0u64;
        while offset < total {
            let chunk = COPY_CHUNK_SIZE.min(total - offset);
            let data = source_stub.read(path, offset, chunk).await?;
            if data.is_empty() {
                return Err(DfsError::Rpc(format!(
                    "source returned no data for {} at offset {}",
                    path, offset
                )));
            }
            file.write_all(&data)
                .await
                .map_err(|e| DfsError::IoError(format!("write {}: {}", path, e)))?;
            offset += data.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| DfsError::IoError(format!("flush {}: {}", path, e)))?;
        debug!("copied {} ({} bytes) from {}", path, total, source);
        Ok(true)
    }
}

// ==================== RPC adapters ====================

fn decode_args<T: DeserializeOwned>(params: Value) -> DfsResult<T> {
    serde_json::from_value(params)
        .map_err(|e| DfsError::InvalidArgument(format!("bad arguments: {}", e)))
}

fn to_value<T: serde::Serialize>(value: T) -> DfsResult<Value> {
    serde_json::to_value(value).map_err(|e| DfsError::Internal(format!("encode reply: {}", e)))
}

struct DataAdapter {
    state: Arc<StorageState>,
}

#[async_trait]
impl RpcService for DataAdapter {
    async fn dispatch(&self, req: RpcRequest) -> Result<Value, RpcFault> {
        let result: DfsResult<Value> = match req.method.as_str() {
            "size" => match decode_args::<PathArgs>(req.params) {
                Ok(args) => self.state.size(&args.path).await.and_then(to_value),
                Err(e) => Err(e),
            },
            "read" => match decode_args::<ReadArgs>(req.params) {
                Ok(args) => self
                    .state
                    .read(&args.path, args.offset, args.length)
                    .await
                    .and_then(to_value),
                Err(e) => Err(e),
            },
            "write" => match decode_args::<WriteArgs>(req.params) {
                Ok(args) => self
                    .state
                    .write(&args.path, args.offset, &args.data)
                    .await
                    .map(|()| Value::Null),
                Err(e) => Err(e),
            },
            other => Err(DfsError::Rpc(format!("unknown method {}", other))),
        };
        result.map_err(|e| e.to_fault())
    }
}

struct CommandAdapter {
    state: Arc<StorageState>,
}

#[async_trait]
impl RpcService for CommandAdapter {
    async fn dispatch(&self, req: RpcRequest) -> Result<Value, RpcFault> {
        let result: DfsResult<Value> = match req.method.as_str() {
            "create" => match decode_args::<PathArgs>(req.params) {
                Ok(args) => self.state.create(&args.path).await.and_then(to_value),
                Err(e) => Err(e),
            },
            "delete" => match decode_args::<PathArgs>(req.params) {
                Ok(args) => self.state.delete(&args.path).await.and_then(to_value),
                Err(e) => Err(e),
            },
            "copy" => match decode_args::<CopyArgs>(req.params) {
                Ok(args) => self
                    .state
                    .copy(&args.path, args.source)
                    .await
                    .and_then(to_value),
                Err(e) => Err(e),
            },
            other => Err(DfsError::Rpc(format!("unknown method {}", other))),
        };
        result.map_err(|e| e.to_fault())
    }
}

// ==================== Server ====================

/// A storage server rooted at a local directory. Serves byte ranges to
/// clients on the data interface and obeys the naming server on the command
/// interface. Pulls itself into the system by registering on start.
pub struct StorageServer {
    state: Arc<StorageState>,
    pub(crate) data: Skeleton,
    pub(crate) command: Skeleton,
}

impl StorageServer {
    /// Creates the server without starting it. `data_addr`/`command_addr`
    /// may use port 0 to let the system pick.
    pub fn new(
        root: PathBuf,
        data_addr: SocketAddr,
        command_addr: SocketAddr,
    ) -> DfsResult<Self> {
        let state = Arc::new(StorageState { root });
        let data = Skeleton::new(
            STORAGE_DATA_DESC,
            Arc::new(DataAdapter {
                state: state.clone(),
            }),
            data_addr,
        )?;
        let command = Skeleton::new(
            STORAGE_COMMAND_DESC,
            Arc::new(CommandAdapter {
                state: state.clone(),
            }),
            command_addr,
        )?;
        Ok(Self {
            state,
            data,
            command,
        })
    }

    pub async fn data_addr(&self) -> Option<SocketAddr> {
        self.data.local_addr().await
    }

    pub async fn command_addr(&self) -> Option<SocketAddr> {
        self.command.local_addr().await
    }

    /// Starts both interfaces and registers with the naming server.
    /// `hostname` is the externally routable address the registered
    /// endpoints carry. Files the naming server already knows about are
    /// deleted locally, then empty directories are pruned.
    pub async fn start(&self, hostname: IpAddr, registration: SocketAddr) -> DfsResult<()> {
        let root = &self.state.root;
        if !root.is_dir() {
            return Err(DfsError::NotFound(format!(
                "storage root {} is not a directory",
                root.display()
            )));
        }

        self.data.start().await?;
        self.command.start().await?;

        let result = self.register_and_prune(hostname, registration).await;
        if result.is_err() {
            self.data.stop().await;
            self.command.stop().await;
        }
        result
    }

    async fn register_and_prune(
        &self,
        hostname: IpAddr,
        registration: SocketAddr,
    ) -> DfsResult<()> {
        let data_port = self
            .data
            .local_addr()
            .await
            .ok_or_else(|| DfsError::InvalidState("data interface not started".to_string()))?
            .port();
        let command_port = self
            .command
            .local_addr()
            .await
            .ok_or_else(|| DfsError::InvalidState("command interface not started".to_string()))?
            .port();
        let data_addr = SocketAddr::new(hostname, data_port);
        let command_addr = SocketAddr::new(hostname, command_port);

        let files = list_local_files(&self.state.root)?;
        info!(
            "registering storage (data={}, command={}) offering {} files",
            data_addr,
            command_addr,
            files.len()
        );

        let stub = RegistrationStub::new(registration)?;
        let duplicates = stub.register(data_addr, command_addr, files).await?;

        for path in &duplicates {
            debug!("dropping duplicate {}", path);
            let _ = self.state.delete(path).await;
        }
        prune_empty_dirs(&self.state.root)?;
        info!("storage registered; {} duplicates pruned", duplicates.len());
        Ok(())
    }

    pub async fn stop(&self) {
        self.data.stop().await;
        self.command.stop().await;
        info!("storage server stopped");
    }
}

/// Relative paths of every regular file under `root`, the initial file set
/// offered at registration.
fn list_local_files(root: &Path) -> DfsResult<Vec<DfsPath>> {
    fn walk(dir: &Path, prefix: &DfsPath, out: &mut Vec<DfsPath>) -> DfsResult<()> {
        for entry in std::fs::read_dir(dir)
            .map_err(|e| DfsError::IoError(format!("list {}: {}", dir.display(), e)))?
        {
            let entry =
                entry.map_err(|e| DfsError::IoError(format!("list {}: {}", dir.display(), e)))?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!("skipping non-unicode entry {:?}", raw);
                    continue;
                }
            };
            let path = prefix.child(&name)?;
            let file_type = entry
                .file_type()
                .map_err(|e| DfsError::IoError(format!("stat {}: {}", name, e)))?;
            if file_type.is_dir() {
                walk(&entry.path(), &path, out)?;
            } else if file_type.is_file() {
                out.push(path);
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(root, &DfsPath::root(), &mut files)?;
    Ok(files)
}

/// Removes directories left empty after duplicate pruning, bottom-up. The
/// root itself always stays.
fn prune_empty_dirs(root: &Path) -> DfsResult<()> {
    fn prune(dir: &Path, keep: bool) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                prune(&entry.path(), false)?;
            }
        }
        if !keep && std::fs::read_dir(dir)?.next().is_none() {
            std::fs::remove_dir(dir)?;
        }
        Ok(())
    }

    prune(root, true).map_err(|e| DfsError::IoError(format!("prune {}: {}", root.display(), e)))
}
