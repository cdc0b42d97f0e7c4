//! Common test utilities and helpers
//!
//! Shared setup for the integration tests: an isolated directory layout,
//! bootable test images and a mock image server.

#![allow(dead_code)]

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;
use weirding::core::catalog::{ImageDescriptor, Sha256Digest};
use weirding::infra::dirs::{ENV_CACHE_DIR, ENV_CONFIG_DIR, ENV_RUNTIME_DIR};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Isolated cache, config and runtime directories
pub struct TestHome {
    pub dir: TempDir,
}

impl TestHome {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.dir.path().join("config")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.cache_dir().join("images")
    }

    /// Write `config.toml`
    pub fn write_config(&self, content: &str) {
        std::fs::create_dir_all(self.config_dir()).expect("Failed to create config dir");
        std::fs::write(self.config_dir().join("config.toml"), content)
            .expect("Failed to write config");
    }

    /// Run the weirding binary with this home's directories
    pub fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().expect("Failed to execute weirding")
    }

    /// Run the binary with this home's `bin/` shims ahead of the real `PATH`
    pub fn run_with_shims(&self, args: &[&str]) -> Output {
        let system_path = std::env::var_os("PATH").unwrap_or_default();
        let mut paths = vec![self.bin_dir()];
        paths.extend(std::env::split_paths(&system_path));
        self.command(args)
            .env("PATH", std::env::join_paths(paths).expect("joinable PATH"))
            .output()
            .expect("Failed to execute weirding")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.dir.path().join("bin")
    }

    /// Install an executable shell script named `tool` into [`Self::bin_dir`]
    pub fn install_shim(&self, tool: &str, script: &str) {
        use std::os::unix::fs::PermissionsExt;

        std::fs::create_dir_all(self.bin_dir()).expect("Failed to create bin dir");
        let path = self.bin_dir().join(tool);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("Failed to write shim");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to make shim executable");
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_weirding"));
        command
            .args(args)
            .env(ENV_CACHE_DIR, self.cache_dir())
            .env(ENV_CONFIG_DIR, self.config_dir())
            .env(ENV_RUNTIME_DIR, self.dir.path().join("run"))
            .env_remove("RUST_LOG");
        command
    }
}

impl Default for TestHome {
    fn default() -> Self {
        Self::new()
    }
}

/// Config that keeps the CLI off the network
pub const OFFLINE_CONFIG: &str = r#"
[catalog]
index_url = ""
static_fallback = true
"#;

/// An image carrying an MBR boot signature, filled with a repeating pattern
pub fn bootable_image(len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    data[510] = 0x55;
    data[511] = 0xAA;
    data
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Descriptor for an image served at `url` with the given pinned digest
pub fn descriptor(url: &str, digest: &str, size_bytes: u64) -> ImageDescriptor {
    ImageDescriptor {
        os_family: "ubuntu".to_string(),
        version: "24.04.2".to_string(),
        variant: "server".to_string(),
        architecture: "amd64".to_string(),
        name: "Ubuntu 24.04.2 LTS Server".to_string(),
        url: url.to_string(),
        digest: Sha256Digest::parse(digest).expect("valid digest"),
        size_bytes,
        tags: Vec::new(),
    }
}

/// Serve `body` at `/image.iso`, expecting exactly `hits` downloads
pub async fn serve_image(body: Vec<u8>, hits: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/image.iso"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(hits)
        .mount(&server)
        .await;
    server
}

/// Partial-download path used by the image cache
pub fn part_path(images_dir: &Path, digest: &str) -> PathBuf {
    images_dir.join(format!("{digest}.img.part"))
}
