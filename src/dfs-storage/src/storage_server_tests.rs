use crate::StorageServer;
use async_trait::async_trait;
use dfs_lib::{
    DfsError, DfsPath, RegisterArgs, StorageCommandStub, StorageDataStub, COPY_CHUNK_SIZE,
    NAMING_REGISTRATION_DESC,
};
use dfs_rpc::{RpcFault, RpcRequest, RpcService, Skeleton};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn p(s: &str) -> DfsPath {
    DfsPath::parse(s).unwrap()
}

const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1));

async fn start_storage(root: &TempDir) -> (StorageServer, StorageDataStub, StorageCommandStub) {
    let server = StorageServer::new(
        root.path().to_path_buf(),
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:0".parse().unwrap(),
    )
    .unwrap();
    // Start the interfaces without the registration dance.
    server.data.start().await.unwrap();
    server.command.start().await.unwrap();
    let data = StorageDataStub::new(server.data_addr().await.unwrap()).unwrap();
    let command = StorageCommandStub::new(server.command_addr().await.unwrap()).unwrap();
    (server, data, command)
}

// ==================== Data interface ====================

#[tokio::test]
async fn test_size_read_write_round_trip() {
    let root = TempDir::new().unwrap();
    let (server, data, command) = start_storage(&root).await;

    assert!(command.create(&p("/f")).await.unwrap());
    assert_eq!(data.size(&p("/f")).await.unwrap(), 0);

    data.write(&p("/f"), 0, b"hello world".to_vec()).await.unwrap();
    assert_eq!(data.size(&p("/f")).await.unwrap(), 11);
    assert_eq!(data.read(&p("/f"), 0, 11).await.unwrap(), b"hello world");
    assert_eq!(data.read(&p("/f"), 6, 5).await.unwrap(), b"world");

    // Overwrite in place.
    data.write(&p("/f"), 6, b"earth".to_vec()).await.unwrap();
    assert_eq!(data.read(&p("/f"), 0, 11).await.unwrap(), b"hello earth");

    server.stop().await;
}

#[tokio::test]
async fn test_read_boundaries() {
    let root = TempDir::new().unwrap();
    let (server, data, command) = start_storage(&root).await;
    command.create(&p("/f")).await.unwrap();
    data.write(&p("/f"), 0, b"0123456789".to_vec()).await.unwrap();

    // Reading exactly at the end returns empty regardless of length.
    assert_eq!(data.read(&p("/f"), 10, 5).await.unwrap(), Vec::<u8>::new());
    assert_eq!(data.read(&p("/f"), 10, 0).await.unwrap(), Vec::<u8>::new());
    // Zero-length reads inside the file are fine.
    assert_eq!(data.read(&p("/f"), 3, 0).await.unwrap(), Vec::<u8>::new());

    // Past-the-end requests are refused.
    assert!(matches!(
        data.read(&p("/f"), 11, 1).await.unwrap_err(),
        DfsError::InvalidArgument(_)
    ));
    assert!(matches!(
        data.read(&p("/f"), 5, 6).await.unwrap_err(),
        DfsError::InvalidArgument(_)
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_write_extends_and_grows() {
    let root = TempDir::new().unwrap();
    let (server, data, command) = start_storage(&root).await;
    command.create(&p("/f")).await.unwrap();

    data.write(&p("/f"), 0, b"abc".to_vec()).await.unwrap();
    // Appending at exactly the current size extends by the payload length.
    data.write(&p("/f"), 3, b"def".to_vec()).await.unwrap();
    assert_eq!(data.size(&p("/f")).await.unwrap(), 6);
    assert_eq!(data.read(&p("/f"), 0, 6).await.unwrap(), b"abcdef");

    // Writing past the end grows the file.
    data.write(&p("/f"), 10, b"x".to_vec()).await.unwrap();
    assert_eq!(data.size(&p("/f")).await.unwrap(), 11);

    server.stop().await;
}

#[tokio::test]
async fn test_data_errors_for_missing_and_directories() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir(root.path().join("d")).unwrap();
    let (server, data, _command) = start_storage(&root).await;

    assert!(data.size(&p("/missing")).await.unwrap_err().is_not_found());
    assert!(data.size(&p("/d")).await.unwrap_err().is_not_found());
    assert!(data.read(&p("/d"), 0, 1).await.unwrap_err().is_not_found());
    assert!(data
        .write(&p("/missing"), 0, b"x".to_vec())
        .await
        .unwrap_err()
        .is_not_found());

    // Paths that try to climb out of the root are refused.
    let escape = DfsPath::root().child("..").unwrap();
    assert!(matches!(
        data.size(&escape).await.unwrap_err(),
        DfsError::InvalidArgument(_)
    ));

    server.stop().await;
}

// ==================== Command interface ====================

#[tokio::test]
async fn test_create_and_delete() {
    let root = TempDir::new().unwrap();
    let (server, _data, command) = start_storage(&root).await;

    assert!(!command.create(&p("/")).await.unwrap());
    assert!(command.create(&p("/a/b/f")).await.unwrap());
    assert!(root.path().join("a/b/f").is_file());
    // Second creation collides.
    assert!(!command.create(&p("/a/b/f")).await.unwrap());

    // Directory deletion is recursive.
    assert!(command.delete(&p("/a")).await.unwrap());
    assert!(!root.path().join("a").exists());

    assert!(!command.delete(&p("/a")).await.unwrap());
    assert!(!command.delete(&p("/")).await.unwrap());

    server.stop().await;
}

#[tokio::test]
async fn test_copy_between_storage_servers() {
    let src_root = TempDir::new().unwrap();
    let dst_root = TempDir::new().unwrap();
    let (src, src_data, src_command) = start_storage(&src_root).await;
    let (dst, dst_data, dst_command) = start_storage(&dst_root).await;

    // More than one transfer chunk, with a non-aligned tail.
    let payload: Vec<u8> = (0..3 * COPY_CHUNK_SIZE + 100)
        .map(|i| (i % 251) as u8)
        .collect();
    src_command.create(&p("/big/blob")).await.unwrap();
    src_data
        .write(&p("/big/blob"), 0, payload.clone())
        .await
        .unwrap();

    assert!(dst_command
        .copy(&p("/big/blob"), src_data.endpoint())
        .await
        .unwrap());
    assert_eq!(
        dst_data.size(&p("/big/blob")).await.unwrap(),
        payload.len() as u64
    );
    assert_eq!(
        dst_data
            .read(&p("/big/blob"), 0, payload.len() as u64)
            .await
            .unwrap(),
        payload
    );

    // Copy overwrites an existing longer file.
    dst_data
        .write(&p("/big/blob"), 0, vec![0xFF; 64])
        .await
        .unwrap();
    src_command.delete(&p("/big/blob")).await.unwrap();
    src_command.create(&p("/big/blob")).await.unwrap();
    src_data.write(&p("/big/blob"), 0, b"tiny".to_vec()).await.unwrap();
    assert!(dst_command
        .copy(&p("/big/blob"), src_data.endpoint())
        .await
        .unwrap());
    assert_eq!(dst_data.size(&p("/big/blob")).await.unwrap(), 4);

    // Copying a file the source does not have propagates its error.
    assert!(dst_command
        .copy(&p("/no/such"), src_data.endpoint())
        .await
        .unwrap_err()
        .is_not_found());

    src.stop().await;
    dst.stop().await;
}

// ==================== Registration dance ====================

struct MockRegistration {
    offered: Arc<Mutex<Vec<DfsPath>>>,
    duplicates: Vec<DfsPath>,
}

#[async_trait]
impl RpcService for MockRegistration {
    async fn dispatch(&self, req: RpcRequest) -> Result<Value, RpcFault> {
        assert_eq!(req.method, "register");
        let args: RegisterArgs = serde_json::from_value(req.params)
            .map_err(|e| RpcFault::new("invalid_argument", e.to_string()))?;
        *self.offered.lock().unwrap() = args.files;
        Ok(json!(self.duplicates))
    }
}

#[tokio::test]
async fn test_start_offers_files_and_prunes_duplicates() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("a/b")).unwrap();
    std::fs::write(root.path().join("a/b/dupe.txt"), b"stale").unwrap();
    std::fs::write(root.path().join("keep.txt"), b"fresh").unwrap();

    let offered = Arc::new(Mutex::new(Vec::new()));
    let registration = Skeleton::new(
        NAMING_REGISTRATION_DESC,
        Arc::new(MockRegistration {
            offered: offered.clone(),
            duplicates: vec![p("/a/b/dupe.txt")],
        }),
        "127.0.0.1:0".parse().unwrap(),
    )
    .unwrap();
    registration.start().await.unwrap();
    let registration_addr = registration.local_addr().await.unwrap();

    let server = StorageServer::new(
        root.path().to_path_buf(),
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:0".parse().unwrap(),
    )
    .unwrap();
    server.start(LOCALHOST, registration_addr).await.unwrap();

    let mut announced = offered.lock().unwrap().clone();
    announced.sort();
    assert_eq!(announced, vec![p("/a/b/dupe.txt"), p("/keep.txt")]);

    // The duplicate is gone and the now-empty directories with it.
    assert!(!root.path().join("a").exists());
    assert!(root.path().join("keep.txt").is_file());

    server.stop().await;
    registration.stop().await;
}

#[tokio::test]
async fn test_start_requires_existing_root() {
    let root = TempDir::new().unwrap();
    let missing = root.path().join("nope");
    let server = StorageServer::new(
        missing,
        "127.0.0.1:0".parse().unwrap(),
        "127.0.0.1:0".parse().unwrap(),
    )
    .unwrap();
    let err = server
        .start(LOCALHOST, "127.0.0.1:1".parse().unwrap())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
