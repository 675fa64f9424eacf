// SPDX-License-Identifier: Apache-2.0

//! Owns every known [`Link`], keyed by ifindex (spec.md C6). Also keeps
//! the ifname→ifindex table the ENSLAVING step needs to resolve
//! virtual parents (spec.md §4.1) — name resolution isn't part of any
//! single collaborator's contract, so the registry, which already sees
//! every `RTM_NEWLINK`, is the natural place for it.

use std::collections::HashMap;

use crate::event::NewLinkInfo;
use crate::link::{Link, LinkCtx, LinkState};
use crate::network::{MatchContext, ProfileMatcher};
use crate::persist::StatePersister;

#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: HashMap<u32, Link>,
    ifname_to_index: HashMap<String, u32>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ifindex: u32) -> Option<&Link> {
        self.links.get(&ifindex)
    }

    pub fn get_mut(&mut self, ifindex: u32) -> Option<&mut Link> {
        self.links.get_mut(&ifindex)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Link> {
        self.links.values_mut()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn resolve_ifindex(&self, name: &str) -> Option<u32> {
        self.ifname_to_index.get(name).copied()
    }

    /// A cloned snapshot of the ifname table, small enough to hand to
    /// a `LinkCtx` by value instead of by reference — the event loop
    /// needs a mutable borrow of the registry at the same time a
    /// `Link` operation wants to resolve a virtual parent's name, and
    /// those two borrows can't coexist (spec.md §9 "Global state").
    pub fn ifname_index_snapshot(&self) -> HashMap<String, u32> {
        self.ifname_to_index.clone()
    }

    /// Creates the `Link` on first sight and forwards the attribute
    /// update either way (spec.md §3 Lifecycle).
    pub fn observe_new_link(
        &mut self,
        info: &NewLinkInfo,
        persister: &StatePersister,
        ctx: &LinkCtx,
    ) {
        self.ifname_to_index.insert(info.ifname.clone(), info.ifindex);
        let link = self.links.entry(info.ifindex).or_insert_with(|| {
            Link::new(
                info.ifindex,
                info.ifname.clone(),
                info.mac,
                0,
                persister.state_path(info.ifindex),
            )
        });
        link.on_new_link(info, ctx);
    }

    /// spec.md §3 Lifecycle: an `RTM_DELLINK` frees the `Link`,
    /// dropping its sub-clients and cancelling any in-flight
    /// completions (spec.md §9 "Cyclic references").
    pub fn remove(&mut self, ifindex: u32) {
        if self.links.remove(&ifindex).is_some() {
            self.ifname_to_index.retain(|_, v| *v != ifindex);
        }
    }

    /// Matches a profile and starts configuration once the device
    /// enumerator reports the interface ready (spec.md §4.3 "deferred
    /// initialization"). A no-op once the Link has left INITIALIZING,
    /// so it is safe to call again on every `DeviceReady` event.
    pub fn try_begin_configuration(
        &mut self,
        ifindex: u32,
        matcher: &dyn ProfileMatcher,
        device_ready: bool,
        ctx: &LinkCtx,
    ) {
        if !device_ready {
            return;
        }
        let Some(link) = self.links.get_mut(&ifindex) else {
            return;
        };
        if link.state() != LinkState::Initializing {
            return;
        }
        let match_ctx =
            MatchContext { ifname: link.ifname().to_string(), mac: link.mac() };
        if let Some(network) = matcher.match_profile(&match_ctx) {
            link.begin_configuration(network, ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NewLinkInfo;

    fn sample_info(ifindex: u32, ifname: &str) -> NewLinkInfo {
        NewLinkInfo {
            ifindex,
            ifname: ifname.to_string(),
            mac: [0; 6],
            flags: 0,
            mtu: Some(1500),
        }
    }

    #[test]
    fn test_remove_clears_ifname_lookup() {
        let mut registry = LinkRegistry::new();
        // Populate the ifname table directly; Link construction itself
        // is exercised through the full Manager/Link tests instead of
        // here, since observe_new_link needs a LinkCtx.
        registry.ifname_to_index.insert("eth0".into(), 3);
        registry
            .links
            .insert(3, Link::new(3, "eth0".into(), [0; 6], 0, "/tmp/3".into()));
        assert_eq!(registry.resolve_ifindex("eth0"), Some(3));
        registry.remove(3);
        assert_eq!(registry.resolve_ifindex("eth0"), None);
        assert!(registry.get(3).is_none());
    }

    #[test]
    fn test_sample_info_roundtrip_ifname() {
        let info = sample_info(5, "eth5");
        assert_eq!(info.ifindex, 5);
        assert_eq!(info.ifname, "eth5");
    }
}
