//! Image catalog and release URLs

/// Ubuntu release mirror; its release directories are the default live index
pub const UBUNTU_RELEASES: &str = "https://releases.ubuntu.com";
