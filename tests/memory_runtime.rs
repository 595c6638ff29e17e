//! End-to-end injection behaviour against the in-memory runtime.
//!
//! These tests drive the public container handle the same way callers do and
//! inspect the resulting container filesystem directly.

use ctr_inject::container::{Container, ContainerRequest, MemoryNode, MemoryRuntime};
use ctr_inject::inject::tarball::{CHUNK_QUEUE_DEPTH, CHUNK_SIZE};
use ctr_inject::inject::{ArchiveCompression, CopyContext, CopyOptions, CopySpec, InjectError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn testdata() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("testdata")
}

fn request(files: Vec<CopySpec>) -> ContainerRequest {
    ContainerRequest::builder()
        .image("docker.io/bash:5.2.26")
        .files(files)
        .started(true)
        .build()
        .unwrap()
}

async fn running(runtime: &Arc<MemoryRuntime>, files: Vec<CopySpec>) -> Container {
    Container::create(runtime.clone(), request(files), &CopyContext::new())
        .await
        .unwrap()
}

/// `(path, mode)` for every node under `root`.
async fn snapshot(runtime: &MemoryRuntime, id: &str, root: &str) -> Vec<(String, u32)> {
    let mut nodes = Vec::new();
    for path in runtime.tree(id, root).await {
        let node = runtime.node(id, &path).await.unwrap();
        nodes.push((path, node.mode()));
    }
    nodes
}

#[tokio::test]
async fn test_copied_file_is_byte_identical() {
    let temp_dir = TempDir::new().unwrap();
    let blob: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let host = temp_dir.path().join("blob.bin");
    fs::write(&host, &blob).unwrap();

    let runtime = Arc::new(MemoryRuntime::new());
    let container = running(&runtime, Vec::new()).await;
    let ctx = CopyContext::new();

    let placed = container
        .copy_file_to_container(&ctx, &host, "/tmp/blob.bin", 0o640)
        .await
        .unwrap();
    assert_eq!(placed.as_str(), "/tmp/blob.bin");

    match runtime.node(container.id(), "/tmp/blob.bin").await {
        Some(MemoryNode::File { mode, content }) => {
            assert_eq!(mode, 0o640);
            assert_eq!(content.as_ref(), blob.as_slice());
        }
        other => panic!("Expected a file, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pre_created_script_is_executable() {
    let runtime = Arc::new(MemoryRuntime::new());
    let container = running(
        &runtime,
        vec![CopySpec::new(testdata().join("hello.sh"), "/hello.sh", 0o700)],
    )
    .await;
    let ctx = CopyContext::new();

    let test = container.exec(&ctx, ["test", "-x", "/hello.sh"]).await.unwrap();
    assert!(test.success());

    let stat = container
        .exec(&ctx, ["stat", "-c", "%a", "/hello.sh"])
        .await
        .unwrap();
    assert_eq!(stat.stdout.trim(), "700");

    let cat = container.exec(&ctx, ["cat", "/hello.sh"]).await.unwrap();
    let expected = fs::read_to_string(testdata().join("hello.sh")).unwrap();
    assert_eq!(cat.stdout, expected);
}

#[tokio::test]
async fn test_directory_tree_is_reproduced() {
    let temp_dir = TempDir::new().unwrap();
    let tree = temp_dir.path().join("tree");
    fs::create_dir_all(tree.join("nested").join("deeper")).unwrap();
    fs::write(tree.join("a.txt"), "a").unwrap();
    fs::write(tree.join("nested").join("b.txt"), "b").unwrap();
    fs::write(tree.join("nested").join("deeper").join("c.txt"), "c").unwrap();

    let runtime = Arc::new(MemoryRuntime::new());
    let container = running(&runtime, Vec::new()).await;

    let root = container
        .copy_dir_to_container(&CopyContext::new(), &tree, "/tmp", 0o600)
        .await
        .unwrap();
    assert_eq!(root.as_str(), "/tmp/tree");

    assert_eq!(
        snapshot(&runtime, container.id(), "/tmp/tree").await,
        vec![
            ("/tmp/tree/a.txt".to_string(), 0o600),
            ("/tmp/tree/nested".to_string(), 0o700),
            ("/tmp/tree/nested/b.txt".to_string(), 0o600),
            ("/tmp/tree/nested/deeper".to_string(), 0o700),
            ("/tmp/tree/nested/deeper/c.txt".to_string(), 0o600),
        ]
    );
    assert_eq!(
        runtime
            .node(container.id(), "/tmp/tree")
            .await
            .map(|n| n.mode()),
        Some(0o700)
    );
}

#[tokio::test]
async fn test_directory_copy_is_idempotent() {
    let runtime = Arc::new(MemoryRuntime::new());
    let container = running(&runtime, Vec::new()).await;
    let ctx = CopyContext::new();

    container
        .copy_dir_to_container(&ctx, testdata(), "/tmp", 0o700)
        .await
        .unwrap();
    let first = snapshot(&runtime, container.id(), "/").await;

    container
        .copy_dir_to_container(&ctx, testdata(), "/tmp", 0o700)
        .await
        .unwrap();
    let second = snapshot(&runtime, container.id(), "/").await;

    assert_eq!(first, second);
    assert_eq!(runtime.upload_count(), 2);
}

#[tokio::test]
async fn test_file_into_existing_directory_keeps_directory() {
    let runtime = Arc::new(MemoryRuntime::new());
    let container = running(&runtime, Vec::new()).await;

    let placed = container
        .copy_file_to_container(&CopyContext::new(), testdata().join("hello.sh"), "/tmp", 0o755)
        .await
        .unwrap();
    assert_eq!(placed.as_str(), "/tmp/hello.sh");

    assert!(matches!(
        runtime.node(container.id(), "/tmp").await,
        Some(MemoryNode::Directory { .. })
    ));
    assert!(matches!(
        runtime.node(container.id(), "/tmp/hello.sh").await,
        Some(MemoryNode::File { mode: 0o755, .. })
    ));
}

#[tokio::test]
async fn test_directory_lands_by_name_inside_prepared_destination() {
    let runtime = Arc::new(MemoryRuntime::new());
    let container = running(&runtime, Vec::new()).await;
    let ctx = CopyContext::new();

    let mkdir = container
        .exec(&ctx, ["mkdir", "-p", "/scripts"])
        .await
        .unwrap();
    assert!(mkdir.success());

    let root = container
        .copy_dir_to_container(&ctx, testdata(), "/scripts", 0o700)
        .await
        .unwrap();
    assert_eq!(root.as_str(), "/scripts/testdata");

    assert_eq!(
        runtime.tree(container.id(), "/scripts").await,
        vec![
            "/scripts/testdata",
            "/scripts/testdata/hello.sh",
            "/scripts/testdata/waitForHello.sh",
        ]
    );
    assert!(runtime.node(container.id(), "/scripts/hello.sh").await.is_none());
}

#[tokio::test]
async fn test_copy_file_with_directory_source_copies_tree() {
    let runtime = Arc::new(MemoryRuntime::new());
    let container = running(&runtime, Vec::new()).await;
    let ctx = CopyContext::new();

    container
        .exec(&ctx, ["mkdir", "-p", "/scripts"])
        .await
        .unwrap();
    let root = container
        .copy_file_to_container(&ctx, testdata(), "/scripts", 0o700)
        .await
        .unwrap();
    assert_eq!(root.as_str(), "/scripts/testdata");

    let test = container
        .exec(&ctx, ["test", "-x", "/scripts/testdata/waitForHello.sh"])
        .await
        .unwrap();
    assert!(test.success());
}

#[tokio::test]
async fn test_pre_create_directory_into_root() {
    let runtime = Arc::new(MemoryRuntime::new());
    let container = running(&runtime, vec![CopySpec::new(testdata(), "/", 0o700)]).await;

    assert!(matches!(
        runtime.node(container.id(), "/testdata").await,
        Some(MemoryNode::Directory { mode: 0o700 })
    ));
    assert!(matches!(
        runtime.node(container.id(), "/testdata/hello.sh").await,
        Some(MemoryNode::File { mode: 0o700, .. })
    ));
}

#[tokio::test]
async fn test_pre_create_ordering_law() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("x");
    fs::create_dir(&dir).unwrap();
    let file = temp_dir.path().join("payload");
    fs::write(&file, "payload").unwrap();

    let in_order = vec![
        CopySpec::new(&dir, "/", 0o755),
        CopySpec::new(&file, "/x/y", 0o644),
    ];
    let runtime = Arc::new(MemoryRuntime::new());
    let container = running(&runtime, in_order.clone()).await;
    assert!(matches!(
        runtime.node(container.id(), "/x/y").await,
        Some(MemoryNode::File { .. })
    ));

    let reversed: Vec<CopySpec> = in_order.into_iter().rev().collect();
    let runtime = Arc::new(MemoryRuntime::new());
    let err = Container::create(runtime.clone(), request(reversed), &CopyContext::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, InjectError::InvalidDestination(_)),
        "Expected InvalidDestination, got {:?}",
        err
    );
    assert!(runtime.container_ids().await.is_empty());
}

#[tokio::test]
async fn test_missing_host_path_aborts_creation() {
    let runtime = Arc::new(MemoryRuntime::new());
    let files = vec![CopySpec::new("/definitely/not/here.sh", "/here.sh", 0o700)];

    let err = Container::create(runtime.clone(), request(files), &CopyContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, InjectError::NotFound(_)));
    assert!(runtime.container_ids().await.is_empty());
    assert_eq!(runtime.upload_count(), 0);
}

#[tokio::test]
async fn test_live_copy_requires_running_container() {
    let runtime = Arc::new(MemoryRuntime::new());
    let request = ContainerRequest::builder()
        .image("docker.io/bash:5.2.26")
        .started(false)
        .build()
        .unwrap();
    let container = Container::create(runtime.clone(), request, &CopyContext::new())
        .await
        .unwrap();

    let err = container
        .copy_file_to_container(&CopyContext::new(), testdata().join("hello.sh"), "/tmp", 0o700)
        .await
        .unwrap_err();
    match err {
        InjectError::ContainerNotRunning { id, state } => {
            assert_eq!(id, container.id());
            assert_eq!(state, "created");
        }
        other => panic!("Expected ContainerNotRunning, got {:?}", other),
    }
    assert_eq!(runtime.upload_count(), 0);
}

#[tokio::test]
async fn test_missing_parent_on_live_copy() {
    let runtime = Arc::new(MemoryRuntime::new());
    let container = running(&runtime, Vec::new()).await;

    let err = container
        .copy_file_to_container(
            &CopyContext::new(),
            testdata().join("hello.sh"),
            "/scripts/hello.sh",
            0o700,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, InjectError::DestinationNotFound(_)));
}

#[tokio::test]
async fn test_missing_parent_created_when_enabled() {
    let runtime = Arc::new(MemoryRuntime::new());
    let request = ContainerRequest::builder()
        .image("docker.io/bash:5.2.26")
        .copy_options(CopyOptions {
            create_missing_parents: true,
            ..CopyOptions::default()
        })
        .started(true)
        .build()
        .unwrap();
    let container = Container::create(runtime.clone(), request, &CopyContext::new())
        .await
        .unwrap();

    let placed = container
        .copy_file_to_container(
            &CopyContext::new(),
            testdata().join("hello.sh"),
            "/scripts/hello.sh",
            0o700,
        )
        .await
        .unwrap();
    assert_eq!(placed.as_str(), "/scripts/hello.sh");
    assert!(matches!(
        runtime.node(container.id(), "/scripts").await,
        Some(MemoryNode::Directory { mode: 0o700 })
    ));
}

#[tokio::test]
async fn test_expired_deadline_cancels_live_copy() {
    let runtime = Arc::new(MemoryRuntime::new().with_upload_delay(Duration::from_millis(500)));
    let container = running(&runtime, Vec::new()).await;

    let ctx = CopyContext::with_timeout(Duration::from_millis(50));
    let err = container
        .copy_dir_to_container(&ctx, testdata(), "/tmp", 0o700)
        .await
        .unwrap_err();
    assert!(matches!(err, InjectError::Canceled));
    assert_eq!(runtime.upload_count(), 0);
}

#[tokio::test]
async fn test_cancelled_creation_leaves_no_container() {
    let runtime = Arc::new(MemoryRuntime::new().with_upload_delay(Duration::from_millis(500)));
    let ctx = CopyContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let files = vec![CopySpec::new(testdata().join("hello.sh"), "/hello.sh", 0o700)];
    let err = Container::create(runtime.clone(), request(files), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, InjectError::Canceled));
    assert!(runtime.container_ids().await.is_empty());
}

#[tokio::test]
async fn test_deadline_during_slow_create_removes_container() {
    let runtime = Arc::new(MemoryRuntime::new().with_create_delay(Duration::from_millis(300)));
    let ctx = CopyContext::with_timeout(Duration::from_millis(50));

    let files = vec![CopySpec::new(testdata().join("hello.sh"), "/hello.sh", 0o700)];
    let err = Container::create(runtime.clone(), request(files), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, InjectError::Canceled));
    assert!(runtime.container_ids().await.is_empty());
}

/// Running container whose copies send plain, uncompressed tar.
async fn running_uncompressed(runtime: &Arc<MemoryRuntime>) -> Container {
    let request = ContainerRequest::builder()
        .image("docker.io/bash:5.2.26")
        .copy_options(CopyOptions {
            compression: ArchiveCompression::None,
            ..CopyOptions::default()
        })
        .started(true)
        .build()
        .unwrap();
    Container::create(runtime.clone(), request, &CopyContext::new())
        .await
        .unwrap()
}

/// Host tree several times larger than the encoder's chunk queue.
fn large_tree() -> (TempDir, Vec<u8>) {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("bulk");
    fs::create_dir_all(&root).unwrap();
    let blob: Vec<u8> = (0..CHUNK_SIZE * CHUNK_QUEUE_DEPTH * 2)
        .map(|i| (i * 7 % 253) as u8)
        .collect();
    for name in ["a.bin", "b.bin", "c.bin", "d.bin"] {
        fs::write(root.join(name), &blob).unwrap();
    }
    (temp_dir, blob)
}

#[tokio::test]
async fn test_large_tree_streams_through_bounded_queue() {
    let (temp_dir, blob) = large_tree();
    let runtime = Arc::new(MemoryRuntime::new());
    let container = running_uncompressed(&runtime).await;
    let ctx = CopyContext::new();

    let placed = container
        .copy_dir_to_container(&ctx, temp_dir.path().join("bulk"), "/srv", 0o644)
        .await
        .unwrap();
    assert_eq!(placed.as_str(), "/srv/bulk");

    for name in ["a.bin", "b.bin", "c.bin", "d.bin"] {
        match runtime.node(container.id(), &format!("/srv/bulk/{}", name)).await {
            Some(MemoryNode::File { content, .. }) => assert_eq!(&content[..], &blob[..]),
            other => panic!("unexpected node for {}: {:?}", name, other),
        }
    }
    assert!(runtime.bytes_received() > (4 * blob.len()) as u64);
}

#[tokio::test]
async fn test_deadline_mid_stream_cancels_upload() {
    let (temp_dir, blob) = large_tree();
    let runtime = Arc::new(MemoryRuntime::new().with_chunk_delay(Duration::from_millis(20)));
    let container = running_uncompressed(&runtime).await;

    let ctx = CopyContext::with_timeout(Duration::from_millis(150));
    let err = container
        .copy_dir_to_container(&ctx, temp_dir.path().join("bulk"), "/srv", 0o644)
        .await
        .unwrap_err();
    assert!(matches!(err, InjectError::Canceled));

    let received = runtime.bytes_received();
    assert!(received > 0, "upload never started");
    assert!(received < (4 * blob.len()) as u64);
    assert_eq!(runtime.upload_count(), 0);
    assert!(runtime.node(container.id(), "/srv/bulk").await.is_none());
}

#[tokio::test]
async fn test_transport_failure_is_retryable() {
    let runtime = Arc::new(MemoryRuntime::new());
    let container = running(&runtime, Vec::new()).await;
    let ctx = CopyContext::new();

    runtime.fail_next_upload();
    let err = container
        .copy_file_to_container(&ctx, testdata().join("hello.sh"), "/tmp/hello.sh", 0o700)
        .await
        .unwrap_err();
    assert!(matches!(err, InjectError::TransportFailure(_)));
    assert!(err.is_retryable());

    container
        .copy_file_to_container(&ctx, testdata().join("hello.sh"), "/tmp/hello.sh", 0o700)
        .await
        .unwrap();
    assert!(runtime.node(container.id(), "/tmp/hello.sh").await.is_some());
}

#[tokio::test]
async fn test_transport_failure_during_creation_leaves_no_container() {
    let runtime = Arc::new(MemoryRuntime::new());
    runtime.fail_next_upload();

    let files = vec![CopySpec::new(testdata().join("hello.sh"), "/hello.sh", 0o700)];
    let err = Container::create(runtime.clone(), request(files), &CopyContext::new())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(runtime.container_ids().await.is_empty());
}

#[tokio::test]
async fn test_readonly_rootfs_denies_writes() {
    let runtime = Arc::new(MemoryRuntime::new());
    let request = ContainerRequest::builder()
        .image("docker.io/bash:5.2.26")
        .readonly_rootfs(true)
        .started(true)
        .build()
        .unwrap();
    let container = Container::create(runtime.clone(), request, &CopyContext::new())
        .await
        .unwrap();

    let err = container
        .copy_file_to_container(&CopyContext::new(), testdata().join("hello.sh"), "/tmp", 0o700)
        .await
        .unwrap_err();
    assert!(matches!(err, InjectError::PermissionDenied(_)));
    assert!(!err.is_retryable());
}
