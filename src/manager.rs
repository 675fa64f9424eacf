// SPDX-License-Identifier: Apache-2.0

//! Owns the registry and every process-wide collaborator, and runs the
//! single-threaded cooperative event loop (spec.md §5) that all of
//! them report back to. Grounded on `nipart`'s daemon/commander loop:
//! one `mpsc` channel, one `tokio::select!`, collaborators never block
//! it — they enqueue work and report completion as another message on
//! the same bus.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};

use crate::{
    collaborators::{DeviceEnumerator, HostnameSetter, ResolverUpdater},
    config::Config,
    dhcp::DhcpV4Factory,
    event::LinkEvent,
    ipv4ll::Ipv4LlFactory,
    kernel::KernelDriver,
    link::LinkCtx,
    network::ProfileMatcher,
    persist::StatePersister,
    registry::LinkRegistry,
};

/// Builds a [`LinkCtx`] from plain field references rather than a
/// `&self` method. `dispatch` needs a mutable borrow of `self.registry`
/// in the same scope, and a `self.ctx()`-style method would borrow all
/// of `self` opaquely and make that impossible; a free function taking
/// the individual fields lets the borrow checker see they're disjoint.
#[allow(clippy::too_many_arguments)]
fn build_ctx<'a>(
    kernel: &'a dyn KernelDriver,
    dhcp_factory: &'a dyn DhcpV4Factory,
    ipv4ll_factory: &'a dyn Ipv4LlFactory,
    hostname: &'a Arc<dyn HostnameSetter>,
    resolver: &'a dyn ResolverUpdater,
    persister: &'a StatePersister,
    device_enumerator: &'a dyn DeviceEnumerator,
    event_tx: Sender<LinkEvent>,
    ifname_index: HashMap<String, u32>,
) -> LinkCtx<'a> {
    LinkCtx {
        kernel,
        dhcp_factory,
        ipv4ll_factory,
        hostname,
        resolver,
        persister,
        device_enumerator,
        event_tx,
        resolve_ifindex: Box::new(move |name: &str| ifname_index.get(name).copied()),
    }
}

/// Everything the event loop needs beyond the registry itself. Built
/// once at startup and borrowed from for the lifetime of the loop.
pub struct Manager {
    registry: LinkRegistry,
    config: Config,
    kernel: Arc<dyn KernelDriver>,
    dhcp_factory: Box<dyn DhcpV4Factory>,
    ipv4ll_factory: Box<dyn Ipv4LlFactory>,
    hostname: Arc<dyn HostnameSetter>,
    resolver: Box<dyn ResolverUpdater>,
    persister: StatePersister,
    device_enumerator: Box<dyn DeviceEnumerator>,
    matcher: Box<dyn ProfileMatcher>,
    event_tx: Sender<LinkEvent>,
    event_rx: Receiver<LinkEvent>,
}

#[allow(clippy::too_many_arguments)]
impl Manager {
    pub fn new(
        config: Config,
        kernel: Arc<dyn KernelDriver>,
        dhcp_factory: Box<dyn DhcpV4Factory>,
        ipv4ll_factory: Box<dyn Ipv4LlFactory>,
        hostname: Arc<dyn HostnameSetter>,
        resolver: Box<dyn ResolverUpdater>,
        device_enumerator: Box<dyn DeviceEnumerator>,
        matcher: Box<dyn ProfileMatcher>,
        event_tx: Sender<LinkEvent>,
        event_rx: Receiver<LinkEvent>,
    ) -> Self {
        let persister =
            StatePersister::new(config.state_dir.clone(), config.lease_dir.clone());
        Self {
            registry: LinkRegistry::new(),
            config,
            kernel,
            dhcp_factory,
            ipv4ll_factory,
            hostname,
            resolver,
            persister,
            device_enumerator,
            matcher,
            event_tx,
            event_rx,
        }
    }

    pub fn sender(&self) -> Sender<LinkEvent> {
        self.event_tx.clone()
    }

    /// spec.md §4.3: containers have no udev, so the enumerator-ready
    /// check is skipped there and the link configures immediately.
    fn device_ready(&self, ifindex: u32) -> bool {
        self.config.in_container || self.device_enumerator.is_initialized(ifindex)
    }

    /// The event loop (spec.md §5). Runs until the bus closes, which
    /// only happens once every sender (the monitor task, every
    /// sub-client, the kernel driver) has been dropped.
    pub async fn run(&mut self) {
        while let Some(event) = self.event_rx.recv().await {
            self.dispatch(event);
        }
        log::info!("linkd: event bus closed, shutting down");
    }

    fn dispatch(&mut self, event: LinkEvent) {
        let ctx = build_ctx(
            self.kernel.as_ref(),
            self.dhcp_factory.as_ref(),
            self.ipv4ll_factory.as_ref(),
            &self.hostname,
            self.resolver.as_ref(),
            &self.persister,
            self.device_enumerator.as_ref(),
            self.event_tx.clone(),
            self.registry.ifname_index_snapshot(),
        );
        match event {
            LinkEvent::NewLink(info) => {
                self.registry.observe_new_link(&info, &self.persister, &ctx);
                let ready = self.device_ready(info.ifindex);
                self.registry.try_begin_configuration(
                    info.ifindex,
                    self.matcher.as_ref(),
                    ready,
                    &ctx,
                );
            }
            LinkEvent::DelLink { ifindex } => {
                self.registry.remove(ifindex);
            }
            LinkEvent::DeviceReady { ifindex } => {
                self.registry.try_begin_configuration(
                    ifindex,
                    self.matcher.as_ref(),
                    true,
                    &ctx,
                );
            }
            LinkEvent::KernelCompletion { ifindex, kind, errno } => {
                if let Some(link) = self.registry.get_mut(ifindex) {
                    link.handle_kernel_completion(kind, errno, &ctx);
                }
            }
            LinkEvent::Dhcp { ifindex, event } => {
                if let Some(link) = self.registry.get_mut(ifindex) {
                    link.handle_dhcp_event(event, &ctx);
                }
            }
            LinkEvent::Ipv4Ll { ifindex, event } => {
                if let Some(link) = self.registry.get_mut(ifindex) {
                    link.handle_ipv4ll_event(event, &ctx);
                }
            }
        }
    }
}
