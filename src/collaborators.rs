// SPDX-License-Identifier: Apache-2.0

//! The collaborators spec.md §6 treats as external: hostname setter,
//! resolver updater, and device enumerator. All three are process-wide
//! (spec.md §9 "Global state") — owned by the
//! [`crate::manager::Manager`], passed by reference into Link
//! operations, never ambient.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::PathBuf;

use crate::{ErrorKind, LinkError};

/// Asynchronous system-bus hostname client (spec.md §6). Fire-and-forget
/// from the link state machine's point of view.
#[async_trait::async_trait]
pub trait HostnameSetter: Send + Sync + std::fmt::Debug {
    async fn set_hostname(&self, name: &str) -> Result<(), LinkError>;
}

const HOSTNAME1_DBUS_IFACE: &str = "org.freedesktop.hostname1";
const HOSTNAME1_DBUS_PATH: &str = "/org/freedesktop/hostname1";

#[zbus::proxy(
    interface = "org.freedesktop.hostname1",
    default_service = "org.freedesktop.hostname1",
    default_path = "/org/freedesktop/hostname1"
)]
trait Hostname1 {
    #[zbus(name = "SetHostname")]
    fn set_hostname(
        &self,
        hostname: &str,
        interactive: bool,
    ) -> zbus::Result<()>;
}

/// Talks to `systemd-hostnamed` over the system bus, the same pattern
/// `nipart`'s wpa_supplicant proxy uses for its own system-bus client.
#[derive(Debug)]
pub struct DbusHostnameSetter {
    connection: zbus::Connection,
}

impl DbusHostnameSetter {
    pub async fn new() -> Result<Self, LinkError> {
        let connection = zbus::Connection::system().await.map_err(|e| {
            LinkError::new(
                ErrorKind::Bug,
                format!("failed to connect to system DBUS: {e}"),
            )
        })?;
        Ok(Self { connection })
    }
}

#[async_trait::async_trait]
impl HostnameSetter for DbusHostnameSetter {
    async fn set_hostname(&self, name: &str) -> Result<(), LinkError> {
        let proxy = Hostname1Proxy::new(&self.connection).await.map_err(|e| {
            LinkError::new(
                ErrorKind::Bug,
                format!("failed to build {HOSTNAME1_DBUS_IFACE} proxy: {e}"),
            )
        })?;
        proxy.set_hostname(name, false).await.map_err(|e| {
            LinkError::new(
                ErrorKind::Bug,
                format!("SetHostname({name}) at {HOSTNAME1_DBUS_PATH}: {e}"),
            )
        })
    }
}

/// Idempotent `/etc/resolv.conf` writer (spec.md §6
/// `update_resolv_conf`). Callers must serialize updates across Links
/// themselves (spec.md §5 "Shared resources") — this type holds no
/// lock of its own.
pub trait ResolverUpdater: Send + Sync + std::fmt::Debug {
    fn update_resolv_conf(
        &self,
        nameservers: &[std::net::Ipv4Addr],
    ) -> Result<(), LinkError>;
}

#[derive(Debug, Clone)]
pub struct FileResolverUpdater {
    path: PathBuf,
}

impl FileResolverUpdater {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Default for FileResolverUpdater {
    fn default() -> Self {
        Self::new(PathBuf::from("/etc/resolv.conf"))
    }
}

impl ResolverUpdater for FileResolverUpdater {
    fn update_resolv_conf(
        &self,
        nameservers: &[std::net::Ipv4Addr],
    ) -> Result<(), LinkError> {
        let mut contents = String::new();
        for ns in nameservers {
            contents.push_str(&format!("nameserver {ns}\n"));
        }
        let existing = std::fs::read_to_string(&self.path).unwrap_or_default();
        if existing == contents {
            return Ok(());
        }
        let mut file = std::fs::File::create(&self.path).map_err(|e| {
            LinkError::new(
                ErrorKind::Kernel,
                format!("failed to write {}: {e}", self.path.display()),
            )
        })?;
        file.write_all(contents.as_bytes()).map_err(|e| {
            LinkError::new(
                ErrorKind::Kernel,
                format!("failed to write {}: {e}", self.path.display()),
            )
        })
    }
}

/// Resolves an ifindex to a device record and a stable per-device seed
/// for IPv4LL address selection (spec.md §6 "Device enumerator").
pub trait DeviceEnumerator: Send + Sync + std::fmt::Debug {
    fn is_initialized(&self, ifindex: u32) -> bool;
    fn address_seed(&self, ifindex: u32, mac: [u8; 6]) -> [u8; 8];
}

/// Backed by `nispor`, the same crate the teacher's plugin uses to
/// query interface state.
#[derive(Debug, Clone, Default)]
pub struct NisporDeviceEnumerator;

impl DeviceEnumerator for NisporDeviceEnumerator {
    fn is_initialized(&self, ifindex: u32) -> bool {
        // A full udev-backed implementation would consult the
        // enumerator's device records; `nispor` only confirms the
        // interface is present in the kernel; anything more belongs to
        // the device-enumeration source spec.md §1 places out of scope.
        match nispor::NetState::retrieve() {
            Ok(state) => state.ifaces.values().any(|iface| iface.index == ifindex),
            Err(e) => {
                log::warn!("nispor query for ifindex {ifindex} failed: {e}");
                false
            }
        }
    }

    fn address_seed(&self, ifindex: u32, mac: [u8; 6]) -> [u8; 8] {
        let mut hasher = DefaultHasher::new();
        ifindex.hash(&mut hasher);
        mac.hash(&mut hasher);
        hasher.finish().to_be_bytes()
    }
}
