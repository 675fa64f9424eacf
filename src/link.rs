// SPDX-License-Identifier: Apache-2.0

//! The per-interface link state machine (spec.md C5, §4.1), the core
//! of this crate. A [`Link`] owns exactly the state spec.md §3
//! describes; all process-wide collaborators (kernel driver, DHCP/
//! IPv4LL factories, hostname/resolver, persister, device enumerator)
//! are passed in by reference through a [`LinkCtx`] built fresh by the
//! [`crate::manager::Manager`] for each event, mirroring spec.md §9
//! ("Model as a Manager owned by the event loop; pass it by
//! non-owning reference into Link operations").

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::{
    address::{self, AddressSpec, Lifetime, Scope},
    collaborators::{DeviceEnumerator, HostnameSetter, ResolverUpdater},
    dhcp::{DhcpV4Factory, DhcpV4Handle},
    event::{CompletionKind, DhcpEvent, Ipv4LlEvent, LinkEvent, NewLinkInfo},
    ipv4ll::{Ipv4LlFactory, Ipv4LlHandle},
    kernel::KernelDriver,
    lease::Lease,
    network::Network,
    persist::{PersistState, StatePersister},
    route::RouteSpec,
};

const IFF_UP: u32 = 0x1;
const IFF_LOWER_UP: u32 = 0x1_0000;
const IFF_DORMANT: u32 = 0x2_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Initializing,
    Enslaving,
    SettingAddresses,
    SettingRoutes,
    Configured,
    Failed,
}

/// The process-wide collaborators a [`Link`] needs for one event,
/// assembled by the [`crate::manager::Manager`]. None of these are
/// owned by the `Link` itself (spec.md §9).
pub struct LinkCtx<'a> {
    pub kernel: &'a dyn KernelDriver,
    pub dhcp_factory: &'a dyn DhcpV4Factory,
    pub ipv4ll_factory: &'a dyn Ipv4LlFactory,
    pub hostname: &'a Arc<dyn HostnameSetter>,
    pub resolver: &'a dyn ResolverUpdater,
    pub persister: &'a StatePersister,
    pub device_enumerator: &'a dyn DeviceEnumerator,
    pub event_tx: tokio::sync::mpsc::Sender<LinkEvent>,
    /// Resolves a virtual-parent interface name to its ifindex, backed
    /// by the registry's ifname table (spec.md §1 leaves rule-based
    /// matching/naming out of scope; resolving a name already seen in
    /// an RTM_NEWLINK is the minimum the enslave step needs). Boxed
    /// because it closes over the registry by reference; a bare `&dyn
    /// Fn` can't be built from a closure without naming a binding that
    /// outlives the `LinkCtx` itself.
    pub resolve_ifindex: Box<dyn Fn(&str) -> Option<u32> + 'a>,
}

/// One per interface index (spec.md §3). Sub-client handles are
/// exclusively owned here; dropping a `Link` drops them, cancelling
/// any pending callbacks (spec.md §9 "Cyclic references").
#[derive(Debug)]
pub struct Link {
    ifindex: u32,
    ifname: String,
    mac: [u8; 6],
    flags: u32,
    original_mtu: Option<u32>,
    state: LinkState,
    network: Option<Network>,
    enslaving_pending: u32,
    addr_pending: u32,
    route_pending: u32,
    dhcp_client: Option<Box<dyn DhcpV4Handle>>,
    dhcp_lease: Option<Lease>,
    dhcp_mtu_applied: bool,
    dhcp_hostname_applied: bool,
    ipv4ll: Option<Box<dyn Ipv4LlHandle>>,
    ipv4ll_bound_addr: Option<Ipv4Addr>,
    state_file_path: PathBuf,
}

impl Link {
    pub fn new(
        ifindex: u32,
        ifname: String,
        mac: [u8; 6],
        flags: u32,
        state_file_path: PathBuf,
    ) -> Self {
        Self {
            ifindex,
            ifname,
            mac,
            flags,
            original_mtu: None,
            state: LinkState::Initializing,
            network: None,
            enslaving_pending: 0,
            addr_pending: 0,
            route_pending: 0,
            dhcp_client: None,
            dhcp_lease: None,
            dhcp_mtu_applied: false,
            dhcp_hostname_applied: false,
            ipv4ll: None,
            ipv4ll_bound_addr: None,
            state_file_path,
        }
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn network(&self) -> Option<&Network> {
        self.network.as_ref()
    }

    pub fn dhcp_lease(&self) -> Option<&Lease> {
        self.dhcp_lease.as_ref()
    }

    pub fn state_file_path(&self) -> &std::path::Path {
        &self.state_file_path
    }

    fn has_carrier(&self) -> bool {
        self.flags & IFF_LOWER_UP != 0 && self.flags & IFF_DORMANT == 0
    }

    /// Updates the Link's copy of the kernel-reported attributes.
    /// Captures `original_mtu` at most once (spec.md §4.1 "MTU rule",
    /// invariant 6) and routes the flag word through
    /// [`Self::link_update_flags`] so carrier transitions are always
    /// diffed consistently, including on first sighting.
    pub fn on_new_link(&mut self, info: &NewLinkInfo, ctx: &LinkCtx) {
        self.ifname = info.ifname.clone();
        self.mac = info.mac;
        if let Some(mtu) = info.mtu
            && self.original_mtu.is_none()
        {
            self.original_mtu = Some(mtu);
        }
        self.link_update_flags(info.flags, ctx);
    }

    /// Matches the profile once, at INITIALIZING→ENSLAVING (spec.md
    /// §3 "Profile match happens once").
    pub fn begin_configuration(&mut self, network: Network, ctx: &LinkCtx) {
        if self.state != LinkState::Initializing {
            log::debug!(
                target: self.ifname.as_str(),
                "begin_configuration called outside INITIALIZING, ignoring"
            );
            return;
        }
        self.network = Some(network);
        self.start_enslaving(ctx);
    }

    fn start_enslaving(&mut self, ctx: &LinkCtx) {
        self.state = LinkState::Enslaving;
        let parents = self
            .network
            .as_ref()
            .map(Network::virtual_parents)
            .unwrap_or_default();
        if parents.is_empty() {
            self.link_enslaved(ctx);
            return;
        }
        let mut master_indices = Vec::with_capacity(parents.len());
        for name in &parents {
            match (ctx.resolve_ifindex)(name) {
                Some(idx) => master_indices.push(idx),
                None => {
                    log::error!(
                        target: self.ifname.as_str(),
                        "virtual parent {name} has no known ifindex yet"
                    );
                    self.enter_failed(ctx);
                    return;
                }
            }
        }
        self.enslaving_pending = master_indices.len() as u32;
        for master_ifindex in master_indices {
            ctx.kernel.link_enslave(self.ifindex, master_ifindex);
        }
    }

    fn link_enslaved(&mut self, ctx: &LinkCtx) {
        if self.flags & IFF_UP == 0 {
            ctx.kernel.link_set_up(self.ifindex);
            return;
        }
        self.after_link_up(ctx);
    }

    fn after_link_up(&mut self, ctx: &LinkCtx) {
        let wants_dynamic = self
            .network
            .as_ref()
            .map(Network::wants_dhcp_or_ipv4ll)
            .unwrap_or(false);
        if wants_dynamic && self.has_carrier() {
            self.link_acquire_conf(ctx);
        }
        self.enter_setting_addresses(ctx);
    }

    /// Starts DHCP and/or IPv4LL if the profile wants them and they
    /// are not already running (spec.md §4.1 "Carrier reaction").
    fn link_acquire_conf(&mut self, ctx: &LinkCtx) {
        let Some(network) = self.network.clone() else {
            return;
        };
        if network.dhcp && self.dhcp_client.is_none() {
            let mut handle = ctx.dhcp_factory.spawn(
                self.ifname.clone(),
                self.ifindex,
                ctx.event_tx.clone(),
            );
            handle.set_mac(self.mac);
            handle.set_index(self.ifindex);
            if network.dhcp_mtu {
                handle.set_request_option(
                    crate::dhcp::DHCP_OPTION_INTERFACE_MTU,
                );
            }
            if let Err(e) = handle.start() {
                log::error!(
                    target: self.ifname.as_str(),
                    "failed to start DHCP client: {e}"
                );
            }
            self.dhcp_client = Some(handle);
        }
        if network.ipv4ll && self.ipv4ll.is_none() {
            self.start_ipv4ll(ctx);
        }
    }

    fn start_ipv4ll(&mut self, ctx: &LinkCtx) {
        let mut handle = ctx.ipv4ll_factory.spawn(
            self.ifname.clone(),
            self.ifindex,
            ctx.event_tx.clone(),
        );
        handle.set_mac(self.mac);
        handle.set_index(self.ifindex);
        handle.set_address_seed(
            ctx.device_enumerator.address_seed(self.ifindex, self.mac),
        );
        handle.start();
        self.ipv4ll = Some(handle);
    }

    fn compute_address_specs(&self) -> Vec<AddressSpec> {
        let mut specs = Vec::new();
        if let Some(network) = &self.network {
            specs.extend(network.addresses.iter().cloned());
        }
        if self.dhcp_lease.is_none()
            && let Some(addr) = self.ipv4ll_bound_addr
        {
            specs.push(
                AddressSpec::new(addr, address::IPV4LL_PREFIX_LEN)
                    .with_scope(Scope::Link),
            );
        }
        if let Some(lease) = &self.dhcp_lease {
            let broadcast = address::broadcast_of(lease.address, lease.netmask);
            specs.push(
                AddressSpec::new(lease.address, lease.prefix_len())
                    .with_broadcast(broadcast),
            );
        }
        specs
    }

    fn compute_route_specs(&self) -> Vec<RouteSpec> {
        let mut specs = Vec::new();
        if let Some(network) = &self.network {
            specs.extend(network.routes.iter().cloned());
        }
        if self.dhcp_lease.is_none() && self.ipv4ll_bound_addr.is_some() {
            specs.push(RouteSpec::ipv4ll_route());
        }
        if let Some(lease) = &self.dhcp_lease
            && let Some(gateway) = lease.router
        {
            // Host route first: the gateway may live outside the
            // leased subnet (spec.md §4.1 SETTING_ROUTES).
            specs.push(RouteSpec::host_route(gateway));
            specs.push(RouteSpec::default_route(gateway));
        }
        specs
    }

    fn enter_setting_addresses(&mut self, ctx: &LinkCtx) {
        self.state = LinkState::SettingAddresses;
        let specs = self.compute_address_specs();
        self.addr_pending = specs.len() as u32;
        for spec in specs {
            ctx.kernel.address_configure(self.ifindex, spec);
        }
        self.persist(ctx);
        if self.addr_pending == 0 {
            self.enter_setting_routes(ctx);
        }
    }

    fn enter_setting_routes(&mut self, ctx: &LinkCtx) {
        self.state = LinkState::SettingRoutes;
        let specs = self.compute_route_specs();
        self.route_pending = specs.len() as u32;
        for spec in specs {
            ctx.kernel.route_configure(self.ifindex, spec);
        }
        self.persist(ctx);
        if self.route_pending == 0 {
            self.enter_configured(ctx);
        }
    }

    fn enter_configured(&mut self, ctx: &LinkCtx) {
        self.state = LinkState::Configured;
        self.persist(ctx);
    }

    fn enter_failed(&mut self, ctx: &LinkCtx) {
        if self.state == LinkState::Failed {
            return;
        }
        log::error!(target: self.ifname.as_str(), "link entering FAILED");
        self.state = LinkState::Failed;
        self.persist(ctx);
    }

    fn persist(&self, ctx: &LinkCtx) {
        let persist_state = match self.state {
            LinkState::Initializing
            | LinkState::Enslaving
            | LinkState::SettingAddresses
            | LinkState::SettingRoutes => PersistState::Configuring,
            LinkState::Configured => PersistState::Configured,
            LinkState::Failed => PersistState::Failed,
        };
        if let Err(e) = ctx.persister.persist(
            self.ifindex,
            persist_state,
            self.dhcp_lease.is_some(),
        ) {
            log::error!(
                target: self.ifname.as_str(),
                "failed to persist state to {}: {e}",
                self.state_file_path.display()
            );
        }
    }

    /// spec.md §4.1 "Carrier reaction".
    pub fn link_update_flags(&mut self, new_flags: u32, ctx: &LinkCtx) {
        let old_flags = self.flags;
        self.flags = new_flags;

        let old_lower_up = old_flags & IFF_LOWER_UP != 0;
        let old_dormant = old_flags & IFF_DORMANT != 0;
        let new_lower_up = new_flags & IFF_LOWER_UP != 0;
        let new_dormant = new_flags & IFF_DORMANT != 0;

        let added_lower_up = !old_lower_up && new_lower_up;
        let removed_dormant = old_dormant && !new_dormant;
        let carrier_gained =
            (added_lower_up && !new_dormant) || (removed_dormant && new_lower_up);

        let removed_lower_up = old_lower_up && !new_lower_up;
        let added_dormant = !old_dormant && new_dormant;
        let carrier_lost = (old_lower_up && !old_dormant)
            && (removed_lower_up || added_dormant);

        if carrier_gained {
            let wants_dynamic = self
                .network
                .as_ref()
                .map(Network::wants_dhcp_or_ipv4ll)
                .unwrap_or(false);
            if wants_dynamic {
                self.link_acquire_conf(ctx);
            }
        }
        if carrier_lost {
            if let Some(dhcp) = self.dhcp_client.as_mut() {
                dhcp.stop();
            }
            if let Some(ipv4ll) = self.ipv4ll.as_mut() {
                ipv4ll.stop();
            }
        }
    }

    pub fn handle_kernel_completion(
        &mut self,
        kind: CompletionKind,
        errno: i32,
        ctx: &LinkCtx,
    ) {
        match kind {
            CompletionKind::Enslave => {
                self.enslaving_pending =
                    self.enslaving_pending.saturating_sub(1);
                if self.state == LinkState::Failed {
                    return;
                }
                if errno != 0 {
                    log::error!(
                        target: self.ifname.as_str(),
                        "enslave failed, errno={errno}"
                    );
                    self.enter_failed(ctx);
                    return;
                }
                if self.enslaving_pending == 0 {
                    self.link_enslaved(ctx);
                }
            }
            CompletionKind::LinkUp => {
                if self.state == LinkState::Failed {
                    return;
                }
                if errno != 0 {
                    log::error!(
                        target: self.ifname.as_str(),
                        "SETLINK bring-up failed, errno={errno}"
                    );
                    self.enter_failed(ctx);
                    return;
                }
                self.flags |= IFF_UP;
                self.after_link_up(ctx);
            }
            CompletionKind::Mtu => {
                if errno != 0 {
                    log::debug!(
                        target: self.ifname.as_str(),
                        "MTU set/restore failed, errno={errno}"
                    );
                }
            }
            CompletionKind::AddressConfigure => {
                self.addr_pending = self.addr_pending.saturating_sub(1);
                if errno != 0 {
                    if kind.tolerates(errno) {
                        log::debug!(
                            target: self.ifname.as_str(),
                            "address already present (EEXIST)"
                        );
                    } else {
                        log::warn!(
                            target: self.ifname.as_str(),
                            "address configure failed, errno={errno} \
                             (non-fatal)"
                        );
                    }
                }
                if self.addr_pending == 0
                    && self.state == LinkState::SettingAddresses
                {
                    self.enter_setting_routes(ctx);
                }
            }
            CompletionKind::AddressUpdate => {
                if errno != 0 {
                    log::debug!(
                        target: self.ifname.as_str(),
                        "address deprecate/re-approve failed, errno={errno}"
                    );
                }
            }
            CompletionKind::AddressDrop => {
                if errno != 0 && !kind.tolerates(errno) {
                    log::debug!(
                        target: self.ifname.as_str(),
                        "address drop failed, errno={errno}"
                    );
                }
            }
            CompletionKind::RouteConfigure => {
                self.route_pending = self.route_pending.saturating_sub(1);
                if self.state != LinkState::Failed
                    && errno != 0
                    && !kind.tolerates(errno)
                {
                    log::error!(
                        target: self.ifname.as_str(),
                        "route configure failed, errno={errno}"
                    );
                    self.enter_failed(ctx);
                    return;
                }
                if self.route_pending == 0
                    && self.state == LinkState::SettingRoutes
                {
                    self.enter_configured(ctx);
                }
            }
            CompletionKind::RouteDrop => {
                if errno != 0 && !kind.tolerates(errno) {
                    log::debug!(
                        target: self.ifname.as_str(),
                        "route drop failed, errno={errno}"
                    );
                }
            }
        }
    }

    fn dhcp_critical_blocks(&self) -> bool {
        let critical =
            self.network.as_ref().map(|n| n.dhcp_critical).unwrap_or(false);
        if critical {
            log::warn!(
                target: self.ifname.as_str(),
                "dhcp_critical set, ignoring DHCP lease-loss event"
            );
        }
        critical
    }

    pub fn handle_dhcp_event(&mut self, event: DhcpEvent, ctx: &LinkCtx) {
        if self.state == LinkState::Failed {
            return;
        }
        match event {
            DhcpEvent::NoLease => {
                log::debug!(
                    target: self.ifname.as_str(),
                    "DHCP reports no lease available"
                );
            }
            DhcpEvent::Error(errno) => {
                log::warn!(
                    target: self.ifname.as_str(),
                    "DHCP client error, errno={errno}"
                );
            }
            DhcpEvent::IpAcquire(lease) => {
                self.lease_acquire(lease, ctx);
            }
            DhcpEvent::IpChange(lease) => {
                if self.dhcp_critical_blocks() {
                    return;
                }
                self.reconfigure_on_lease_loss(false, ctx);
                self.lease_acquire(lease, ctx);
            }
            DhcpEvent::Expired => {
                if self.dhcp_critical_blocks() {
                    return;
                }
                self.reconfigure_on_lease_loss(true, ctx);
            }
            DhcpEvent::Stop => {
                if self.dhcp_critical_blocks() {
                    return;
                }
                self.reconfigure_on_lease_loss(false, ctx);
            }
        }
    }

    fn reconfigure_on_lease_loss(&mut self, expired: bool, ctx: &LinkCtx) {
        if self.dhcp_lease.is_some() {
            self.lease_lost_cleanup(ctx);
        }
        if expired {
            let ipv4ll_enabled =
                self.network.as_ref().map(|n| n.ipv4ll).unwrap_or(false);
            if ipv4ll_enabled {
                self.reapprove_or_start_ipv4ll(ctx);
            }
        }
    }

    /// spec.md §4.1 "Lease-acquire".
    fn lease_acquire(&mut self, lease: Lease, ctx: &LinkCtx) {
        self.arbitrate_ipv4ll_against_dhcp(ctx);

        if let Some(network) = self.network.clone() {
            if network.dhcp_mtu
                && let Some(mtu) = lease.mtu
                && self.original_mtu.is_some()
            {
                ctx.kernel.link_set_mtu(self.ifindex, u32::from(mtu));
                self.dhcp_mtu_applied = true;
            }
            if network.dhcp_hostname
                && let Some(hostname) = lease.hostname.clone()
            {
                let setter = ctx.hostname.clone();
                tokio::spawn(async move {
                    let _ = setter.set_hostname(&hostname).await;
                });
                self.dhcp_hostname_applied = true;
            }
            if network.dhcp_dns && !lease.dns.is_empty() {
                if let Err(e) = ctx.resolver.update_resolv_conf(&lease.dns) {
                    log::warn!(
                        target: self.ifname.as_str(),
                        "failed to update resolv.conf: {e}"
                    );
                }
            }
        }

        self.dhcp_lease = Some(lease);
        self.enter_setting_addresses(ctx);
    }

    /// spec.md §4.1 "Arbitration between DHCP and IPv4LL", DHCP-acquire
    /// side.
    fn arbitrate_ipv4ll_against_dhcp(&mut self, ctx: &LinkCtx) {
        match self.ipv4ll_bound_addr {
            Some(addr) => {
                let spec = AddressSpec::new(addr, address::IPV4LL_PREFIX_LEN)
                    .with_scope(Scope::Link)
                    .with_preferred_lifetime(Lifetime::Zero);
                ctx.kernel.address_update(self.ifindex, spec);
            }
            None => {
                if let Some(ipv4ll) = self.ipv4ll.as_mut() {
                    ipv4ll.stop();
                }
            }
        }
    }

    /// spec.md §4.1 "Arbitration...", DHCP-expire side.
    fn reapprove_or_start_ipv4ll(&mut self, ctx: &LinkCtx) {
        match self.ipv4ll_bound_addr {
            Some(addr) => {
                let spec = AddressSpec::new(addr, address::IPV4LL_PREFIX_LEN)
                    .with_scope(Scope::Link)
                    .with_preferred_lifetime(Lifetime::Forever);
                ctx.kernel.address_update(self.ifindex, spec);
            }
            None => match self.ipv4ll.as_mut() {
                Some(handle) if !handle.is_running() => handle.start(),
                None => self.start_ipv4ll(ctx),
                _ => (),
            },
        }
    }

    /// spec.md §4.1 "lease-lost cleanup".
    fn lease_lost_cleanup(&mut self, ctx: &LinkCtx) {
        let Some(lease) = self.dhcp_lease.take() else {
            return;
        };
        let broadcast = address::broadcast_of(lease.address, lease.netmask);
        let addr_spec = AddressSpec::new(lease.address, lease.prefix_len())
            .with_broadcast(broadcast);
        ctx.kernel.address_drop(self.ifindex, addr_spec);
        if let Some(gateway) = lease.router {
            ctx.kernel
                .route_drop(self.ifindex, RouteSpec::host_route(gateway));
            ctx.kernel
                .route_drop(self.ifindex, RouteSpec::default_route(gateway));
        }
        if self.dhcp_mtu_applied {
            if let Some(original) = self.original_mtu {
                ctx.kernel.link_set_mtu(self.ifindex, original);
            }
            self.dhcp_mtu_applied = false;
        }
        if self.dhcp_hostname_applied {
            let setter = ctx.hostname.clone();
            tokio::spawn(async move {
                let _ = setter.set_hostname("").await;
            });
            self.dhcp_hostname_applied = false;
        }
    }

    pub fn handle_ipv4ll_event(&mut self, event: Ipv4LlEvent, ctx: &LinkCtx) {
        if self.state == LinkState::Failed {
            return;
        }
        match event {
            Ipv4LlEvent::Bind(addr) => {
                self.ipv4ll_bound_addr = Some(addr);
                self.enter_setting_addresses(ctx);
            }
            Ipv4LlEvent::Stop | Ipv4LlEvent::Conflict => {
                self.drop_ipv4ll_address(ctx);
            }
            Ipv4LlEvent::Error(errno) => {
                log::warn!(
                    target: self.ifname.as_str(),
                    "IPv4LL client error, errno={errno}"
                );
            }
        }
    }

    fn drop_ipv4ll_address(&mut self, ctx: &LinkCtx) {
        let Some(addr) = self.ipv4ll_bound_addr.take() else {
            return;
        };
        let spec = AddressSpec::new(addr, address::IPV4LL_PREFIX_LEN)
            .with_scope(Scope::Link);
        ctx.kernel.address_drop(self.ifindex, spec);
        ctx.kernel
            .route_drop(self.ifindex, RouteSpec::ipv4ll_route());
    }
}
