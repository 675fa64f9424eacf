// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::{ErrorKind, LinkError};

/// Collapsed form of [`crate::link::LinkState`] for the state file
/// (spec.md §4.3 "State strings").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistState {
    Configuring,
    Configured,
    Failed,
}

impl PersistState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Configuring => "configuring",
            Self::Configured => "configured",
            Self::Failed => "failed",
        }
    }
}

/// Writes the per-link status file atomically (spec.md §4.3). One
/// instance is owned by the [`crate::manager::Manager`] and shared
/// across Links, the way the resolver/hostname collaborators are
/// process-wide (spec.md §9 "Global state").
#[derive(Debug, Clone)]
pub struct StatePersister {
    state_dir: PathBuf,
    lease_dir: PathBuf,
}

impl StatePersister {
    pub fn new(state_dir: PathBuf, lease_dir: PathBuf) -> Self {
        Self { state_dir, lease_dir }
    }

    pub fn state_path(&self, ifindex: u32) -> PathBuf {
        self.state_dir.join(ifindex.to_string())
    }

    pub fn lease_path(&self, ifindex: u32) -> PathBuf {
        self.lease_dir.join(ifindex.to_string())
    }

    /// Writes `STATE=` and, if `lease_held`, `DHCP_LEASE=` to the
    /// target path via temp-file-then-rename; unlinks both on error
    /// (spec.md §4.3).
    pub fn persist(
        &self,
        ifindex: u32,
        state: PersistState,
        lease_held: bool,
    ) -> Result<(), LinkError> {
        let target = self.state_path(ifindex);
        let tmp = tmp_path_for(&target);
        let mut contents = String::new();
        contents.push_str("# This is private data. Do not parse.\n");
        contents.push_str(&format!("STATE={}\n", state.as_str()));
        if lease_held {
            contents.push_str(&format!(
                "DHCP_LEASE={}\n",
                self.lease_path(ifindex).display()
            ));
        }
        if let Err(e) = write_atomic(&tmp, &target, contents.as_bytes()) {
            let _ = std::fs::remove_file(&tmp);
            let _ = std::fs::remove_file(&target);
            return Err(LinkError::new(
                ErrorKind::Kernel,
                format!(
                    "failed to persist state for ifindex {ifindex}: {e}"
                ),
            ));
        }
        Ok(())
    }
}

fn tmp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

fn write_atomic(
    tmp: &Path,
    target: &Path,
    contents: &[u8],
) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(tmp)?;
    file.write_all(contents)?;
    file.set_permissions(std::fs::Permissions::from_mode(0o644))?;
    file.flush()?;
    file.sync_all()?;
    std::fs::rename(tmp, target)?;
    Ok(())
}
