// SPDX-License-Identifier: Apache-2.0

use crate::logging::LogLevel;

const DEFAULT_STATE_DIR: &str = "/run/systemd/network/links";
const DEFAULT_LEASE_DIR: &str = "/run/systemd/network/leases";

/// Process-wide, read-only configuration. Owned by the `Manager`
/// (spec.md §9 "Global state"), never ambient/thread-local.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: std::path::PathBuf,
    pub lease_dir: std::path::PathBuf,
    pub log_level: LogLevel,
    /// spec.md §4.3: "if not inside a container, it defers
    /// initialization until the device enumerator reports the device
    /// ready". Containers have no udev, so the check is skipped there.
    pub in_container: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: DEFAULT_STATE_DIR.into(),
            lease_dir: DEFAULT_LEASE_DIR.into(),
            log_level: LogLevel::Info,
            in_container: detect_container(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("LINKD_STATE_DIR") {
            cfg.state_dir = v.into();
        }
        if let Ok(v) = std::env::var("LINKD_LEASE_DIR") {
            cfg.lease_dir = v.into();
        }
        if let Ok(v) = std::env::var("LINKD_LOG_LEVEL")
            && let Ok(level) = v.parse()
        {
            cfg.log_level = level;
        }
        cfg
    }
}

/// systemd uses `sd_booted()`/`running_in_chroot()`-style probes; we use
/// the well known container marker file, which is sufficient for our
/// purpose of gating the udev wait.
fn detect_container() -> bool {
    std::path::Path::new("/run/systemd/container").exists()
        || std::path::Path::new("/.dockerenv").exists()
}
