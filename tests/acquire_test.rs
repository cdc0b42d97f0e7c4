//! Integration tests for image acquisition
//!
//! Downloads are served by a mock HTTP server; the cache lives in a temp dir.
//! Covers digest verification with bounded attempts, reuse of verified
//! entries, single-download deduplication and resumption of partial files.

mod common;

use common::{bootable_image, descriptor, part_path, serve_image, sha256_hex, TestHome};
use tokio_util::sync::CancellationToken;
use weirding::core::acquire::{AcquireOptions, ImageAcquirer, ImageCache, VerificationState};
use weirding::error::ProvisionError;
use weirding::infra::download::DownloadManager;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn acquirer(home: &TestHome, attempts: u32) -> ImageAcquirer {
    ImageAcquirer::new(
        ImageCache::new(home.images_dir()),
        DownloadManager::with_config(1, 1, 5),
    )
    .with_max_attempts(attempts)
}

#[tokio::test]
async fn test_download_is_verified_and_cached() {
    let home = TestHome::new();
    let image = bootable_image(64 * 1024);
    let digest = sha256_hex(&image);
    let server = serve_image(image.clone(), 1).await;
    let url = format!("{}/image.iso", server.uri());
    let descriptor = descriptor(&url, &digest, image.len() as u64);

    let entry = acquirer(&home, 3)
        .acquire(&descriptor, AcquireOptions::default(), &CancellationToken::new(), None)
        .await
        .expect("acquire");

    assert_eq!(entry.state(), VerificationState::Verified);
    assert_eq!(entry.size_bytes(), image.len() as u64);
    assert_eq!(std::fs::read(entry.path()).unwrap(), image);
    assert!(!part_path(&home.images_dir(), &digest).exists());

    let verified = entry.into_verified().expect("verified entry");
    assert_eq!(verified.digest().as_str(), digest);
}

#[tokio::test]
async fn test_digest_mismatch_exhausts_attempts_and_leaves_nothing_usable() {
    let home = TestHome::new();
    let served = bootable_image(32 * 1024);
    let pinned = sha256_hex(b"the image the catalog actually pinned");
    let server = serve_image(served.clone(), 3).await;
    let url = format!("{}/image.iso", server.uri());
    let descriptor = descriptor(&url, &pinned, served.len() as u64);
    let acquirer = acquirer(&home, 3);

    let err = acquirer
        .acquire(&descriptor, AcquireOptions::default(), &CancellationToken::new(), None)
        .await
        .unwrap_err();

    match err {
        ProvisionError::IntegrityMismatch {
            expected,
            actual,
            attempts,
            ..
        } => {
            assert_eq!(expected, pinned);
            assert_eq!(actual, sha256_hex(&served));
            assert_eq!(attempts, 3);
        }
        other => panic!("expected IntegrityMismatch, got {other:?}"),
    }

    let digest = descriptor.digest.clone();
    assert!(!acquirer.cache().image_path(&digest).exists());
    assert!(!part_path(&home.images_dir(), &pinned).exists());
    assert!(acquirer
        .cache()
        .lookup(&digest)
        .map_or(true, |e| e.state() != VerificationState::Verified));
}

#[tokio::test]
async fn test_verified_entry_is_reused_without_download() {
    let home = TestHome::new();
    let image = bootable_image(16 * 1024);
    let digest = sha256_hex(&image);
    let server = serve_image(image.clone(), 1).await;
    let url = format!("{}/image.iso", server.uri());
    let descriptor = descriptor(&url, &digest, image.len() as u64);
    let acquirer = acquirer(&home, 1);
    let cancel = CancellationToken::new();

    let first = acquirer
        .acquire(&descriptor, AcquireOptions::default(), &cancel, None)
        .await
        .unwrap();
    let second = acquirer
        .acquire(&descriptor, AcquireOptions::default(), &cancel, None)
        .await
        .unwrap();

    assert_eq!(first.path(), second.path());
    assert_eq!(second.state(), VerificationState::Verified);
}

#[tokio::test]
async fn test_reverify_replaces_a_corrupted_cache_entry() {
    let home = TestHome::new();
    let image = bootable_image(16 * 1024);
    let digest = sha256_hex(&image);
    let server = serve_image(image.clone(), 2).await;
    let url = format!("{}/image.iso", server.uri());
    let descriptor = descriptor(&url, &digest, image.len() as u64);
    let acquirer = acquirer(&home, 1);
    let cancel = CancellationToken::new();

    let entry = acquirer
        .acquire(&descriptor, AcquireOptions::default(), &cancel, None)
        .await
        .unwrap();

    // Same size, one flipped byte
    let mut damaged = image.clone();
    damaged[4096] ^= 0xFF;
    std::fs::write(entry.path(), &damaged).unwrap();

    let repaired = acquirer
        .acquire(&descriptor, AcquireOptions { reverify: true }, &cancel, None)
        .await
        .unwrap();

    assert_eq!(repaired.state(), VerificationState::Verified);
    assert_eq!(std::fs::read(repaired.path()).unwrap(), image);
}

#[tokio::test]
async fn test_concurrent_acquisitions_download_once() {
    let home = TestHome::new();
    let image = bootable_image(256 * 1024);
    let digest = sha256_hex(&image);
    let server = serve_image(image.clone(), 1).await;
    let url = format!("{}/image.iso", server.uri());
    let descriptor = descriptor(&url, &digest, image.len() as u64);
    let first = acquirer(&home, 1);
    let second = acquirer(&home, 1);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        first.acquire(&descriptor, AcquireOptions::default(), &cancel, None),
        second.acquire(&descriptor, AcquireOptions::default(), &cancel, None),
    );

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.path(), b.path());
    assert_eq!(a.state(), VerificationState::Verified);
    assert_eq!(b.state(), VerificationState::Verified);
}

#[tokio::test]
async fn test_partial_download_is_resumed() {
    let home = TestHome::new();
    let image = bootable_image(100 * 1024);
    let digest = sha256_hex(&image);
    let split = 40_000;

    std::fs::create_dir_all(home.images_dir()).unwrap();
    std::fs::write(part_path(&home.images_dir(), &digest), &image[..split]).unwrap();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/image.iso"))
        .and(header("range", format!("bytes={split}-").as_str()))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(image[split..].to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    let url = format!("{}/image.iso", server.uri());
    let descriptor = descriptor(&url, &digest, image.len() as u64);

    let entry = acquirer(&home, 1)
        .acquire(&descriptor, AcquireOptions::default(), &CancellationToken::new(), None)
        .await
        .expect("resumed acquire");

    assert_eq!(entry.state(), VerificationState::Verified);
    assert_eq!(std::fs::read(entry.path()).unwrap(), image);
}

#[tokio::test]
async fn test_cancelled_token_stops_acquisition() {
    let home = TestHome::new();
    let image = bootable_image(8 * 1024);
    let digest = sha256_hex(&image);
    let server = serve_image(image.clone(), 0).await;
    let url = format!("{}/image.iso", server.uri());
    let descriptor = descriptor(&url, &digest, image.len() as u64);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = acquirer(&home, 3)
        .acquire(&descriptor, AcquireOptions::default(), &cancel, None)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Cancelled { .. }), "{err:?}");
}

#[tokio::test]
async fn test_server_error_is_a_download_failure() {
    let home = TestHome::new();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/image.iso"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let digest = sha256_hex(b"missing");
    let descriptor = descriptor(&format!("{}/image.iso", server.uri()), &digest, 0);

    let err = acquirer(&home, 3)
        .acquire(&descriptor, AcquireOptions::default(), &CancellationToken::new(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::DownloadFailed { .. }), "{err:?}");
    assert!(err.is_retryable());
}
