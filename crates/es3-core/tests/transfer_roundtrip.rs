//! End-to-end transfers against the stub server: simple upload with
//! metadata, download round-trip, zero-byte objects, and the mtime/size
//! short-circuit.

mod common;

use common::fake_s3::FakeS3;
use common::{test_agenda, test_context};
use es3_core::download::FileDownloader;
use es3_core::path::RemotePath;
use es3_core::storage;
use es3_core::upload::FileUploader;

fn remote(bucket: &str, key: &str) -> RemotePath {
    RemotePath::parse(&format!("s3://{}/{}", bucket, key)).unwrap()
}

#[test]
fn simple_upload_stores_bytes_and_metadata() {
    let server = FakeS3::start();
    let scratch = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let ctx = test_context(&server, scratch.path(), false);

    let source = work.path().join("payload.bin");
    let body: Vec<u8> = (0u8..=255).cycle().take(5 * 1024 * 1024).collect();
    std::fs::write(&source, &body).unwrap();
    storage::apply_mtime(&source, 1_600_000_000).unwrap();
    storage::apply_mode(&source, 0o640).unwrap();

    let agenda = test_agenda(&ctx);
    agenda.schedule(Box::new(FileUploader::new(&ctx, source, remote("data", "dir/payload.bin"))));
    assert_eq!(agenda.run(), 0);

    let object = server.object("data", "dir/payload.bin").expect("object stored");
    assert_eq!(object.data, body);
    assert_eq!(object.meta.get("x-amz-meta-mtime").map(String::as_str), Some("1600000000"));
    assert_eq!(object.meta.get("x-amz-meta-mode").map(String::as_str), Some("640"));
    assert!(object.meta.get("x-amz-meta-compressed").is_none());
    assert_eq!(object.content_type, "application/octet-stream");
    assert_eq!(agenda.stat_counter("uploaded"), body.len() as u64);
}

#[test]
fn download_restores_bytes_mtime_and_mode() {
    let server = FakeS3::start();
    let scratch = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let ctx = test_context(&server, scratch.path(), false);

    let source = work.path().join("up.bin");
    let body = b"round trip contents ".repeat(100_000);
    std::fs::write(&source, &body).unwrap();
    storage::apply_mtime(&source, 1_555_555_555).unwrap();
    storage::apply_mode(&source, 0o600).unwrap();

    let agenda = test_agenda(&ctx);
    agenda.schedule(Box::new(FileUploader::new(&ctx, source, remote("data", "up.bin"))));
    assert_eq!(agenda.run(), 0);

    let target = work.path().join("down.bin");
    let agenda = test_agenda(&ctx);
    agenda.schedule(Box::new(FileDownloader::new(&ctx, target.clone(), remote("data", "up.bin"))));
    assert_eq!(agenda.run(), 0);

    assert_eq!(std::fs::read(&target).unwrap(), body);
    let meta = std::fs::metadata(&target).unwrap();
    assert_eq!(storage::local_mtime(&meta), 1_555_555_555);
    #[cfg(unix)]
    assert_eq!(storage::local_mode(&meta), 0o600);
    assert_eq!(agenda.stat_counter("downloaded"), body.len() as u64);
}

#[test]
fn zero_byte_files_round_trip() {
    let server = FakeS3::start();
    let scratch = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let ctx = test_context(&server, scratch.path(), true);

    let source = work.path().join("empty");
    std::fs::write(&source, b"").unwrap();

    let agenda = test_agenda(&ctx);
    agenda.schedule(Box::new(FileUploader::new(&ctx, source, remote("data", "empty"))));
    assert_eq!(agenda.run(), 0);
    assert_eq!(server.object("data", "empty").unwrap().data, b"");

    let target = work.path().join("empty-down");
    let agenda = test_agenda(&ctx);
    agenda.schedule(Box::new(FileDownloader::new(&ctx, target.clone(), remote("data", "empty"))));
    assert_eq!(agenda.run(), 0);
    assert_eq!(std::fs::read(&target).unwrap(), b"");
}

#[test]
fn matching_mtime_and_size_skip_the_body() {
    let server = FakeS3::start();
    let scratch = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let ctx = test_context(&server, scratch.path(), false);

    let path = work.path().join("steady.bin");
    let body = b"stable bytes".repeat(50_000);
    std::fs::write(&path, &body).unwrap();
    storage::apply_mtime(&path, 1_500_000_000).unwrap();

    let agenda = test_agenda(&ctx);
    agenda.schedule(Box::new(FileUploader::new(&ctx, path.clone(), remote("data", "steady.bin"))));
    assert_eq!(agenda.run(), 0);
    let puts_after_upload = server.put_attempt_count();
    let gets_after_upload = server.body_get_count();

    // Same mtime and size on both sides: the downloader must stop at HEAD.
    let agenda = test_agenda(&ctx);
    agenda.schedule(Box::new(FileDownloader::new(&ctx, path.clone(), remote("data", "steady.bin"))));
    assert_eq!(agenda.run(), 0);
    assert_eq!(server.body_get_count(), gets_after_upload, "no body GET issued");
    assert_eq!(agenda.stat_counter("downloaded"), 0);

    // And the uploader must schedule no second PUT.
    let agenda = test_agenda(&ctx);
    agenda.schedule(Box::new(FileUploader::new(&ctx, path, remote("data", "steady.bin"))));
    assert_eq!(agenda.run(), 0);
    assert_eq!(server.put_attempt_count(), puts_after_upload, "no re-upload");
}
