// SPDX-License-Identifier: Apache-2.0

use std::os::fd::AsRawFd;

use mozim::{DhcpV4Client, DhcpV4Config, DhcpV4Lease};
use tokio::{io::unix::AsyncFd, sync::mpsc::Sender, task::JoinHandle};

use crate::{
    event::{DhcpEvent, LinkEvent},
    lease::Lease,
    LinkError,
};

const MOZIM_NO_BLOCKING_TIMEOUT: u32 = 0;
/// DHCP option 26, Interface MTU (spec.md §6).
pub const DHCP_OPTION_INTERFACE_MTU: u8 = 26;

/// Per-link DHCPv4 client handle, the surface the link state machine
/// drives (spec.md §6 "DHCP client"). Events flow back asynchronously
/// over the shared [`LinkEvent`] bus rather than through a callback, the
/// same shape `nipart-plugin-mozim`'s worker reports leases to its
/// daemon.
pub trait DhcpV4Handle: Send + std::fmt::Debug {
    fn start(&mut self) -> Result<(), LinkError>;
    fn stop(&mut self);
    fn set_mac(&mut self, mac: [u8; 6]);
    fn set_index(&mut self, ifindex: u32);
    fn get_lease(&self) -> Option<Lease>;
    fn set_request_option(&mut self, code: u8);
}

pub trait DhcpV4Factory: Send + Sync + std::fmt::Debug {
    fn spawn(
        &self,
        iface: String,
        ifindex: u32,
        to_manager: Sender<LinkEvent>,
    ) -> Box<dyn DhcpV4Handle>;
}

#[derive(Debug, Clone, Default)]
struct MozimDhcpConfig {
    hostname: Option<String>,
    requested_options: Vec<u8>,
}

#[derive(Debug)]
pub struct MozimDhcpV4Handle {
    iface: String,
    ifindex: u32,
    mac: [u8; 6],
    config: MozimDhcpConfig,
    lease: Option<Lease>,
    thread_handler: Option<JoinHandle<()>>,
    to_manager: Sender<LinkEvent>,
}

impl Drop for MozimDhcpV4Handle {
    fn drop(&mut self) {
        if let Some(handler) = &self.thread_handler {
            handler.abort();
        }
    }
}

impl MozimDhcpV4Handle {
    pub fn new(
        iface: String,
        ifindex: u32,
        to_manager: Sender<LinkEvent>,
    ) -> Self {
        Self {
            iface,
            ifindex,
            mac: [0; 6],
            config: MozimDhcpConfig::default(),
            lease: None,
            thread_handler: None,
            to_manager,
        }
    }

    fn gen_mozim_config(&self) -> DhcpV4Config {
        let mut mozim_config = DhcpV4Config::new(self.iface.as_str());
        if let Some(hostname) = self.config.hostname.as_ref() {
            mozim_config.set_host_name(hostname);
            mozim_config.use_host_name_as_client_id();
        }
        if self
            .config
            .requested_options
            .contains(&DHCP_OPTION_INTERFACE_MTU)
        {
            log::debug!(
                "Requesting DHCP option {DHCP_OPTION_INTERFACE_MTU} \
                 (Interface MTU) for {}",
                self.iface
            );
        }
        mozim_config
    }
}

impl DhcpV4Handle for MozimDhcpV4Handle {
    fn start(&mut self) -> Result<(), LinkError> {
        if let Some(handler) = &self.thread_handler {
            log::debug!(
                "Stopping existing DHCP thread for {} before restart",
                self.iface
            );
            handler.abort();
        }
        let mozim_config = self.gen_mozim_config();
        let cli = DhcpV4Client::init(mozim_config, None).map_err(|e| {
            LinkError::new(
                crate::ErrorKind::InvalidArgument,
                format!("Failed to start DHCP client on {}: {e}", self.iface),
            )
        })?;
        let iface = self.iface.clone();
        let ifindex = self.ifindex;
        let to_manager = self.to_manager.clone();
        self.thread_handler = Some(tokio::task::spawn(async move {
            mozim_worker_loop(iface, ifindex, cli, to_manager).await;
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handler) = self.thread_handler.take() {
            handler.abort();
        }
        let ifindex = self.ifindex;
        let to_manager = self.to_manager.clone();
        // The link state machine waits for the sub-protocol to report
        // lease-loss before tearing down (spec.md §4.1 "Carrier
        // reaction"); a caller-initiated stop must still surface that
        // event.
        tokio::spawn(async move {
            let _ = to_manager
                .send(LinkEvent::Dhcp { ifindex, event: DhcpEvent::Stop })
                .await;
        });
    }

    fn set_mac(&mut self, mac: [u8; 6]) {
        self.mac = mac;
    }

    fn set_index(&mut self, ifindex: u32) {
        self.ifindex = ifindex;
    }

    fn get_lease(&self) -> Option<Lease> {
        self.lease.clone()
    }

    fn set_request_option(&mut self, code: u8) {
        if !self.config.requested_options.contains(&code) {
            self.config.requested_options.push(code);
        }
    }
}

async fn mozim_worker_loop(
    iface: String,
    ifindex: u32,
    mut client: DhcpV4Client,
    to_manager: Sender<LinkEvent>,
) {
    let fd = match AsyncFd::new(client.as_raw_fd()) {
        Ok(fd) => fd,
        Err(e) => {
            log::error!("DHCP worker for {iface}: AsyncFd::new() failed: {e}");
            return;
        }
    };
    let mut held_lease: Option<DhcpV4Lease> = None;
    loop {
        match fd.readable().await {
            Ok(mut guard) => guard.clear_ready(),
            Err(e) => {
                log::error!(
                    "DHCP worker for {iface}: AsyncFd::readable() failed: {e}"
                );
                return;
            }
        }
        let events = match client.poll(MOZIM_NO_BLOCKING_TIMEOUT) {
            Ok(e) => e,
            Err(e) => {
                log::error!("DHCP worker for {iface}: poll() failed: {e}");
                if !emit(
                    &to_manager,
                    ifindex,
                    DhcpEvent::Error(nix::libc::EIO),
                )
                .await
                {
                    return;
                }
                continue;
            }
        };
        for event in events {
            match client.process(event) {
                Ok(Some(lease)) => {
                    let dhcp_event = if held_lease.as_ref() == Some(&lease) {
                        continue;
                    } else if held_lease.is_none() {
                        DhcpEvent::IpAcquire(mozim_lease_to_linkd(&lease))
                    } else {
                        DhcpEvent::IpChange(mozim_lease_to_linkd(&lease))
                    };
                    held_lease = Some(lease);
                    if !emit(&to_manager, ifindex, dhcp_event).await {
                        return;
                    }
                }
                Ok(None) => (),
                Err(e) => {
                    log::error!(
                        "DHCP worker for {iface}: process() failed: {e}"
                    );
                    let dhcp_event = if held_lease.take().is_some() {
                        DhcpEvent::Expired
                    } else {
                        DhcpEvent::NoLease
                    };
                    if !emit(&to_manager, ifindex, dhcp_event).await {
                        return;
                    }
                }
            }
        }
    }
}

async fn emit(
    to_manager: &Sender<LinkEvent>,
    ifindex: u32,
    event: DhcpEvent,
) -> bool {
    to_manager
        .send(LinkEvent::Dhcp { ifindex, event })
        .await
        .is_ok()
}

fn mozim_lease_to_linkd(lease: &DhcpV4Lease) -> Lease {
    Lease {
        address: lease.yiaddr,
        netmask: lease.subnet_mask,
        router: lease.gateways.as_ref().and_then(|g| g.first().copied()),
        mtu: lease.mtu,
        hostname: lease.host_name.clone(),
        dns: lease.dns_srvs.clone().unwrap_or_default(),
    }
}

#[derive(Debug, Default)]
pub struct MozimDhcpV4Factory;

impl DhcpV4Factory for MozimDhcpV4Factory {
    fn spawn(
        &self,
        iface: String,
        ifindex: u32,
        to_manager: Sender<LinkEvent>,
    ) -> Box<dyn DhcpV4Handle> {
        Box::new(MozimDhcpV4Handle::new(iface, ifindex, to_manager))
    }
}
