//! Default configuration values

/// Maximum number of image acquisition attempts (download + verify)
pub const MAX_ACQUIRE_ATTEMPTS: u32 = 3;

/// Maximum number of network retries inside a single acquisition attempt
pub const MAX_DOWNLOAD_RETRIES: u32 = 3;

/// Base delay for download retry backoff (milliseconds)
pub const DOWNLOAD_BASE_DELAY_MS: u64 = 1000;

/// Connect timeout for HTTP requests (seconds)
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Read timeout between body chunks (seconds)
pub const READ_TIMEOUT_SECS: u64 = 120;

/// Cache TTL for the live image index (in seconds)
pub const CATALOG_CACHE_TTL: u64 = 3600; // 1 hour

/// Smallest device accepted for a module (32 GiB)
pub const MIN_DEVICE_SIZE_BYTES: u64 = 32 * 1024 * 1024 * 1024;

/// Raw write chunk size (4 MiB)
pub const WRITE_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Bytes written between forced device syncs (64 MiB)
pub const SYNC_INTERVAL_BYTES: u64 = 64 * 1024 * 1024;

/// Read size used while hashing cached images (1 MiB)
pub const HASH_BLOCK_SIZE: usize = 1024 * 1024;

/// Head region compared during read-back verification (64 KiB)
pub const VERIFY_HEAD_BYTES: u64 = 64 * 1024;

/// Tail region compared during read-back verification (4 KiB)
pub const VERIFY_TAIL_BYTES: u64 = 4 * 1024;

/// Default module name written into the manifest
pub const DEFAULT_MODULE_NAME: &str = "weirding";

/// Manifest schema version
pub const MANIFEST_SCHEMA_VERSION: &str = "1.0";

/// Manifest file name at the root of the data partition
pub const MANIFEST_FILE_NAME: &str = "weirding.json";

/// Ubuntu releases read from the mirror, newest first
pub const UBUNTU_LTS_RELEASES: &[&str] = &["24.04", "22.04"];

/// Default operating system family
pub const DEFAULT_OS_FAMILY: &str = "ubuntu";

/// Longest filesystem label accepted by relabel-drive
pub const MAX_LABEL_LEN: usize = 11;

/// Services declared in a fresh manifest: (name, port)
pub const DEFAULT_SERVICES: &[(&str, u16)] = &[("ollama", 11434), ("jupyter", 8888), ("ssh", 22)];

/// Minimum proptest iterations
pub const MIN_PROPTEST_ITERATIONS: u32 = 100;
