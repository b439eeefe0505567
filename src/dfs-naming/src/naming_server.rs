use crate::{
    spawn_maintenance_worker, DirTree, FsNode, MaintenanceExecutor, MaintenanceKind,
    MaintenanceQueue, MaintenanceTask, NodeKind, PathLockTable, RegisterOutcome,
};
use async_trait::async_trait;
use dfs_lib::{
    DfsError, DfsPath, DfsResult, LockArgs, PathArgs, RegisterArgs, StorageCommandStub,
    StorageId, NAMING_REGISTRATION_DESC, NAMING_REGISTRATION_PORT, NAMING_SERVICE_DESC,
    NAMING_SERVICE_PORT, REPLICATION_THRESHOLD,
};
use dfs_rpc::{RpcFault, RpcRequest, RpcService, Skeleton};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub service_addr: SocketAddr,
    pub registration_addr: SocketAddr,
    pub replication_threshold: u64,
    pub maintenance_poll_ms: u64,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            service_addr: SocketAddr::from(([0, 0, 0, 0], NAMING_SERVICE_PORT)),
            registration_addr: SocketAddr::from(([0, 0, 0, 0], NAMING_REGISTRATION_PORT)),
            replication_threshold: REPLICATION_THRESHOLD,
            maintenance_poll_ms: 20,
        }
    }
}

fn choose<T: Clone>(items: &[T]) -> Option<T> {
    items.choose(&mut rand::thread_rng()).cloned()
}

/// Shared state of the naming server: the directory tree, the storage-node
/// registry, the per-path lock table and the shared-access counters that
/// drive replica maintenance. Passed explicitly to everything that needs
/// it; there is no process-global instance.
pub struct NamingState {
    tree: Mutex<DirTree>,
    registry: Mutex<Vec<StorageId>>,
    locks: PathLockTable,
    counters: Mutex<HashMap<DfsPath, u64>>,
    tasks: Arc<MaintenanceQueue>,
    shutdown: CancellationToken,
    replication_threshold: u64,
}

impl NamingState {
    fn new(replication_threshold: u64) -> Arc<Self> {
        Arc::new(Self {
            tree: Mutex::new(DirTree::new()),
            registry: Mutex::new(Vec::new()),
            locks: PathLockTable::new(),
            counters: Mutex::new(HashMap::new()),
            tasks: Arc::new(MaintenanceQueue::new()),
            shutdown: CancellationToken::new(),
            replication_threshold,
        })
    }

    pub(crate) fn tree(&self) -> MutexGuard<'_, DirTree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<DfsPath, u64>> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every registered storage identity.
    pub fn registered(&self) -> Vec<StorageId> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn node_kind(&self, path: &DfsPath) -> Option<NodeKind> {
        self.tree().node_kind(path)
    }

    /// Current replica set of a file, mostly for inspection and tests.
    pub fn file_replicas(&self, path: &DfsPath) -> Option<Vec<StorageId>> {
        self.tree().replicas(path)
    }

    pub fn access_count(&self, path: &DfsPath) -> u64 {
        self.counters().get(path).copied().unwrap_or(0)
    }

    fn set_counter(&self, path: &DfsPath, value: u64) {
        self.counters().insert(path.clone(), value);
    }

    // ==================== Client service ====================

    /// Acquires the lock chain for `path`: shared on every ancestor,
    /// `exclusive` deciding the mode on `path` itself. Returns without
    /// holding anything when the wait is interrupted by shutdown.
    pub async fn lock(&self, path: &DfsPath, exclusive: bool) -> DfsResult<()> {
        if !self.tree().contains(path) {
            return Err(DfsError::NotFound(format!("cannot lock {}", path)));
        }
        match self.locks.lock_chain(path, exclusive, &self.shutdown).await {
            Ok(()) => {}
            Err(DfsError::Cancelled(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.after_lock(path, exclusive);
        Ok(())
    }

    /// Replica-maintenance hook, fired once the chain is held. Shared
    /// accesses of a file bump its counter and queue a replication once the
    /// counter reaches the threshold; an exclusive access clears the counter
    /// and queues an invalidation of stale replicas.
    fn after_lock(&self, path: &DfsPath, exclusive: bool) {
        if self.node_kind(path) != Some(NodeKind::File) {
            return;
        }
        if exclusive {
            self.set_counter(path, 0);
            self.tasks.push(MaintenanceTask {
                kind: MaintenanceKind::Invalidate,
                path: path.clone(),
                trigger_count: 0,
            });
        } else {
            let count = {
                let mut counters = self.counters();
                let count = counters.entry(path.clone()).or_insert(0);
                *count += 1;
                *count
            };
            if count >= self.replication_threshold {
                self.tasks.push(MaintenanceTask {
                    kind: MaintenanceKind::Replicate,
                    path: path.clone(),
                    trigger_count: count,
                });
            }
        }
    }

    pub fn unlock(&self, path: &DfsPath, exclusive: bool) -> DfsResult<()> {
        if !self.tree().contains(path) {
            return Err(DfsError::InvalidArgument(format!("cannot unlock {}", path)));
        }
        self.locks.unlock_chain(path, exclusive);
        Ok(())
    }

    pub fn is_directory(&self, path: &DfsPath) -> DfsResult<bool> {
        match self.node_kind(path) {
            Some(kind) => Ok(kind == NodeKind::Directory),
            None => Err(DfsError::NotFound(path.to_string())),
        }
    }

    /// Child names of a directory, snapshotted under a shared lock.
    pub async fn list(&self, path: &DfsPath) -> DfsResult<Vec<String>> {
        if self.node_kind(path) != Some(NodeKind::Directory) {
            return Err(DfsError::NotFound(format!("no directory at {}", path)));
        }
        self.locks.lock_chain(path, false, &self.shutdown).await?;
        let names = self.tree().children(path);
        self.locks.unlock_chain(path, false);
        names.ok_or_else(|| DfsError::NotFound(format!("no directory at {}", path)))
    }

    /// Creates an empty file on one randomly chosen storage node and
    /// records it in the tree. `false` when anything already exists at
    /// `path` (the root included).
    pub async fn create_file(&self, path: &DfsPath) -> DfsResult<bool> {
        if path.is_root() {
            return Ok(false);
        }
        let parent = path
            .parent()
            .ok_or_else(|| DfsError::Internal(format!("no parent for {}", path)))?;
        if self.node_kind(&parent) != Some(NodeKind::Directory) {
            return Err(DfsError::NotFound(format!("no directory at {}", parent)));
        }
        if self.tree().contains(path) {
            return Ok(false);
        }

        let target = choose(&self.registered()).ok_or_else(|| {
            DfsError::InvalidState("no storage servers registered".to_string())
        })?;
        let created = StorageCommandStub::new(target.command)?.create(path).await?;
        if !created {
            debug!("storage {} already held {}", target, path);
        }

        match self.tree().insert(path, FsNode::new_file(target)) {
            Ok(()) => Ok(true),
            // A concurrent creation won the race; the object exists.
            Err(DfsError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn create_directory(&self, path: &DfsPath) -> DfsResult<bool> {
        if path.is_root() {
            return Ok(false);
        }
        let parent = path
            .parent()
            .ok_or_else(|| DfsError::Internal(format!("no parent for {}", path)))?;

        let mut tree = self.tree();
        if tree.node_kind(&parent) != Some(NodeKind::Directory) {
            return Err(DfsError::NotFound(format!("no directory at {}", parent)));
        }
        if tree.contains(path) {
            return Ok(false);
        }
        tree.insert(path, FsNode::new_dir())?;
        Ok(true)
    }

    /// Deletes `path` under an exclusive lock. Directories cascade: the
    /// delete command goes to every registered storage node rather than
    /// walking the subtree for hosts. The tree entry is removed even when a
    /// storage node fails; the returned flag is the conjunction of the
    /// storage acks.
    pub async fn delete(&self, path: &DfsPath) -> DfsResult<bool> {
        if path.is_root() {
            return Ok(false);
        }
        let kind = self
            .node_kind(path)
            .ok_or_else(|| DfsError::NotFound(path.to_string()))?;

        self.locks.lock_chain(path, true, &self.shutdown).await?;
        let result = self.delete_locked(path, kind).await;
        // The chain is released directly: `unlock` would refuse the path
        // now that the tree entry is gone.
        self.locks.unlock_chain(path, true);
        result
    }

    async fn delete_locked(&self, path: &DfsPath, kind: NodeKind) -> DfsResult<bool> {
        let targets = match kind {
            NodeKind::Directory => self.registered(),
            NodeKind::File => self.tree().replicas(path).unwrap_or_default(),
        };

        let mut status = true;
        for id in targets {
            match storage_delete(&id, path).await {
                Ok(acked) => status &= acked,
                Err(e) => {
                    warn!("delete {} on {} failed: {}", path, id, e);
                    status = false;
                }
            }
        }

        let removed = self.tree().remove(path).is_some();
        self.counters().remove(path);
        if !removed {
            // Vanished while we waited for the lock.
            return Err(DfsError::NotFound(path.to_string()));
        }
        Ok(status)
    }

    /// One hosting storage identity of a file, chosen uniformly at random.
    pub fn get_storage(&self, path: &DfsPath) -> DfsResult<StorageId> {
        let replicas = self
            .tree()
            .replicas(path)
            .ok_or_else(|| DfsError::NotFound(format!("no file at {}", path)))?;
        choose(&replicas)
            .ok_or_else(|| DfsError::Internal(format!("file {} has no replicas", path)))
    }

    // ==================== Registration ====================

    /// Admits a storage node and reconciles its offered files against the
    /// tree. Returns the paths the node must delete locally. Each file's
    /// duplicate decision is atomic: the check and the insert happen under
    /// one tree-lock acquisition.
    pub fn register(
        &self,
        data: SocketAddr,
        command: SocketAddr,
        files: Vec<DfsPath>,
    ) -> DfsResult<Vec<DfsPath>> {
        let id = StorageId::new(data, command);
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if registry.contains(&id) {
                return Err(DfsError::InvalidState(format!("{} already registered", id)));
            }
            registry.push(id);
        }
        info!("registered {} offering {} files", id, files.len());

        let mut duplicates = Vec::new();
        for file in files {
            if file.is_root() {
                continue;
            }
            match self.tree().register_file(&file, id) {
                RegisterOutcome::Inserted => {}
                RegisterOutcome::Duplicate => duplicates.push(file),
            }
        }
        Ok(duplicates)
    }

    // ==================== Replica maintenance ====================

    async fn replicate(&self, path: &DfsPath, trigger_count: u64) -> Result<(), String> {
        if trigger_count < self.replication_threshold {
            self.set_counter(path, 0);
            return Ok(());
        }
        if self
            .locks
            .lock_chain(path, false, &self.shutdown)
            .await
            .is_err()
        {
            return Ok(());
        }
        let result = self.replicate_locked(path, trigger_count).await;
        self.locks.unlock_chain(path, false);
        result
    }

    async fn replicate_locked(&self, path: &DfsPath, trigger_count: u64) -> Result<(), String> {
        // Deleted (or replaced by a directory) between trigger and lock.
        let Some(replicas) = self.tree().replicas(path) else {
            return Ok(());
        };
        let candidates: Vec<StorageId> = self
            .registered()
            .into_iter()
            .filter(|id| !replicas.contains(id))
            .collect();
        let Some(target) = choose(&candidates) else {
            // Fully replicated already; the demand is satisfied.
            self.set_counter(path, 0);
            return Ok(());
        };
        let Some(source) = choose(&replicas) else {
            return Ok(());
        };

        let copied = async {
            StorageCommandStub::new(target.command)?
                .copy(path, source.data)
                .await
        }
        .await;

        match copied {
            Ok(true) => {
                self.tree().add_replica(path, target);
                self.set_counter(path, 0);
                info!("replicated {} onto {}", path, target);
                Ok(())
            }
            Ok(false) => {
                self.set_counter(path, trigger_count);
                Err(format!("{} refused to copy {}", target, path))
            }
            Err(e) => {
                self.set_counter(path, trigger_count);
                Err(format!("copy of {} to {} failed: {}", path, target, e))
            }
        }
    }

    async fn invalidate(&self, path: &DfsPath) -> Result<(), String> {
        if self
            .locks
            .lock_chain(path, true, &self.shutdown)
            .await
            .is_err()
        {
            return Ok(());
        }
        let result = self.invalidate_locked(path).await;
        self.locks.unlock_chain(path, true);
        result
    }

    async fn invalidate_locked(&self, path: &DfsPath) -> Result<(), String> {
        let Some(replicas) = self.tree().replicas(path) else {
            return Ok(());
        };
        if replicas.len() > 1 {
            let Some(keep) = choose(&replicas) else {
                return Ok(());
            };
            for id in replicas.iter().filter(|id| **id != keep) {
                // Best effort: a node that cannot be reached loses its copy
                // from the tree's point of view either way.
                if let Err(e) = storage_delete(id, path).await {
                    warn!("invalidate {} on {} failed: {}", path, id, e);
                }
                self.tree().remove_replica(path, id);
            }
            info!("invalidated {} down to {}", path, keep);
        }
        self.set_counter(path, 0);
        Ok(())
    }
}

async fn storage_delete(id: &StorageId, path: &DfsPath) -> DfsResult<bool> {
    StorageCommandStub::new(id.command)?.delete(path).await
}

#[async_trait]
impl MaintenanceExecutor for NamingState {
    async fn execute(&self, task: MaintenanceTask) -> Result<(), String> {
        match task.kind {
            MaintenanceKind::Replicate => self.replicate(&task.path, task.trigger_count).await,
            MaintenanceKind::Invalidate => self.invalidate(&task.path).await,
        }
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

struct ClientServiceAdapter {
    state: Arc<NamingState>,
}

impl ClientServiceAdapter {
    async fn dispatch_inner(&self, req: RpcRequest) -> DfsResult<Value> {
        match req.method.as_str() {
            "lock" => {
                let args: LockArgs = decode_args(req.params)?;
                self.state.lock(&args.path, args.exclusive).await?;
                Ok(Value::Null)
            }
            "unlock" => {
                let args: LockArgs = decode_args(req.params)?;
                self.state.unlock(&args.path, args.exclusive)?;
                Ok(Value::Null)
            }
            "is_directory" => {
                let args: PathArgs = decode_args(req.params)?;
                to_value(self.state.is_directory(&args.path)?)
            }
            "list" => {
                let args: PathArgs = decode_args(req.params)?;
                to_value(self.state.list(&args.path).await?)
            }
            "create_file" => {
                let args: PathArgs = decode_args(req.params)?;
                to_value(self.state.create_file(&args.path).await?)
            }
            "create_directory" => {
                let args: PathArgs = decode_args(req.params)?;
                to_value(self.state.create_directory(&args.path)?)
            }
            "delete" => {
                let args: PathArgs = decode_args(req.params)?;
                to_value(self.state.delete(&args.path).await?)
            }
            "get_storage" => {
                let args: PathArgs = decode_args(req.params)?;
                to_value(self.state.get_storage(&args.path)?)
            }
            other => Err(DfsError::Rpc(format!("unknown method {}", other))),
        }
    }
}

#[async_trait]
impl RpcService for ClientServiceAdapter {
    async fn dispatch(&self, req: RpcRequest) -> Result<Value, RpcFault> {
        self.dispatch_inner(req).await.map_err(|e| e.to_fault())
    }
}

struct RegistrationAdapter {
    state: Arc<NamingState>,
}

#[async_trait]
impl RpcService for RegistrationAdapter {
    async fn dispatch(&self, req: RpcRequest) -> Result<Value, RpcFault> {
        let result: DfsResult<Value> = match req.method.as_str() {
            "register" => decode_args::<RegisterArgs>(req.params).and_then(|args| {
                let dupes = self.state.register(args.data, args.command, args.files)?;
                to_value(dupes)
            }),
            other => Err(DfsError::Rpc(format!("unknown method {}", other))),
        };
        result.map_err(|e| e.to_fault())
    }
}

// ==================== Server ====================

/// The naming server: one process-wide instance owning the directory tree
/// and both remote interfaces. Not restartable once stopped; shutdown
/// interrupts every pending lock wait.
pub struct NamingServer {
    state: Arc<NamingState>,
    service: Skeleton,
    registration: Skeleton,
    worker: Mutex<Option<JoinHandle<()>>>,
    maintenance_poll: Duration,
}

impl NamingServer {
    pub fn new(config: NamingConfig) -> DfsResult<Self> {
        let state = NamingState::new(config.replication_threshold);
        let service = Skeleton::new(
            NAMING_SERVICE_DESC,
            Arc::new(ClientServiceAdapter {
                state: state.clone(),
            }),
            config.service_addr,
        )?;
        let registration = Skeleton::new(
            NAMING_REGISTRATION_DESC,
            Arc::new(RegistrationAdapter {
                state: state.clone(),
            }),
            config.registration_addr,
        )?;
        Ok(Self {
            state,
            service,
            registration,
            worker: Mutex::new(None),
            maintenance_poll: Duration::from_millis(config.maintenance_poll_ms.max(1)),
        })
    }

    pub fn state(&self) -> &Arc<NamingState> {
        &self.state
    }

    pub async fn service_addr(&self) -> Option<SocketAddr> {
        self.service.local_addr().await
    }

    pub async fn registration_addr(&self) -> Option<SocketAddr> {
        self.registration.local_addr().await
    }

    pub async fn start(&self) -> DfsResult<()> {
        self.service.start().await?;
        if let Err(e) = self.registration.start().await {
            self.service.stop().await;
            return Err(e.into());
        }
        let worker = spawn_maintenance_worker(
            self.state.tasks.clone(),
            self.state.clone(),
            self.maintenance_poll,
            self.state.shutdown.clone(),
        );
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);
        info!("naming server started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.state.shutdown.cancel();
        self.service.stop().await;
        self.registration.stop().await;
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        info!("naming server stopped");
    }
}
