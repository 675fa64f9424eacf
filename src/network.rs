// SPDX-License-Identifier: Apache-2.0

use crate::{address::AddressSpec, route::RouteSpec};

/// The `.network`/`.netdev` profile matched to a link. Consumed, not
/// owned, by the [`crate::link::Link`] (spec.md §3). Parsing the config
/// files and rule-based matching that produce a `Network` are out of
/// scope (spec.md §1) and live behind [`ProfileMatcher`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Network {
    pub addresses: Vec<AddressSpec>,
    pub routes: Vec<RouteSpec>,
    pub dhcp: bool,
    pub ipv4ll: bool,
    pub dhcp_mtu: bool,
    pub dhcp_dns: bool,
    pub dhcp_hostname: bool,
    pub dhcp_critical: bool,
    pub bridge: Option<String>,
    pub bond: Option<String>,
    pub vlans: Vec<String>,
    pub macvlans: Vec<String>,
}

impl Network {
    /// The virtual parents this link should be enslaved to before link
    /// activation (spec.md §4.1 ENSLAVING).
    pub fn virtual_parents(&self) -> Vec<String> {
        let mut parents = Vec::new();
        if let Some(bridge) = &self.bridge {
            parents.push(bridge.clone());
        }
        if let Some(bond) = &self.bond {
            parents.push(bond.clone());
        }
        parents.extend(self.vlans.iter().cloned());
        parents.extend(self.macvlans.iter().cloned());
        parents
    }

    pub fn wants_dhcp_or_ipv4ll(&self) -> bool {
        self.dhcp || self.ipv4ll
    }
}

/// A snapshot of the information a [`ProfileMatcher`] needs: device
/// record, current interface name, and MAC address.
#[derive(Debug, Clone)]
pub struct MatchContext {
    pub ifname: String,
    pub mac: [u8; 6],
}

/// Rule-based matching of an interface to a [`Network`] profile. Out of
/// scope per spec.md §1; the core only consumes this trait.
pub trait ProfileMatcher: Send + Sync {
    fn match_profile(&self, ctx: &MatchContext) -> Option<Network>;
}

/// A matcher that always returns the same profile, useful for hosts
/// with a single interface or in tests.
#[derive(Debug, Clone)]
pub struct StaticProfileMatcher(pub Option<Network>);

impl ProfileMatcher for StaticProfileMatcher {
    fn match_profile(&self, _ctx: &MatchContext) -> Option<Network> {
        self.0.clone()
    }
}
