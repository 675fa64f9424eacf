// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;

/// Kernel address scope, as used on `RTA_SCOPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Link,
    Host,
}

/// `IFA_CACHEINFO` preferred/valid lifetimes. `Zero` is how an address is
/// "deprecated" without removing it (spec.md glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    Forever,
    Zero,
    Seconds(u32),
}

/// An immutable-after-build address specification submitted to the
/// kernel driver (spec.md C1). Built once via [`AddressSpec::new`] and
/// never mutated in place; a changed address is a new `AddressSpec`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct AddressSpec {
    address: Ipv4Addr,
    prefix_len: u8,
    broadcast: Option<Ipv4Addr>,
    scope: Scope,
    preferred_lifetime: Lifetime,
    valid_lifetime: Lifetime,
}

impl AddressSpec {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
            broadcast: None,
            scope: Scope::Global,
            preferred_lifetime: Lifetime::Forever,
            valid_lifetime: Lifetime::Forever,
        }
    }

    pub fn with_broadcast(mut self, broadcast: Ipv4Addr) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_preferred_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.preferred_lifetime = lifetime;
        self
    }

    /// Returns a copy of this address with its preferred lifetime
    /// replaced, used to deprecate/re-approve an IPv4LL address
    /// (spec.md §4.1 "Arbitration") without touching anything else.
    pub fn with_new_preferred_lifetime(&self, lifetime: Lifetime) -> Self {
        let mut new = self.clone();
        new.preferred_lifetime = lifetime;
        new
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn broadcast(&self) -> Option<Ipv4Addr> {
        self.broadcast
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn preferred_lifetime(&self) -> Lifetime {
        self.preferred_lifetime
    }

    pub fn valid_lifetime(&self) -> Lifetime {
        self.valid_lifetime
    }

    pub fn is_deprecated(&self) -> bool {
        self.preferred_lifetime == Lifetime::Zero
    }
}

/// Computes the broadcast address for a leased address/netmask pair:
/// `addr | ~netmask` (spec.md §4.1 SETTING_ADDRESSES).
pub fn broadcast_of(address: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let addr = u32::from_be_bytes(address.octets());
    let mask = u32::from_be_bytes(netmask.octets());
    Ipv4Addr::from((addr | !mask).to_be_bytes())
}

/// Derives the CIDR prefix length from a dotted-decimal netmask.
pub fn prefix_len_of(netmask: Ipv4Addr) -> u8 {
    u32::from_be_bytes(netmask.octets()).count_ones() as u8
}

/// The well known IPv4LL block, 169.254.0.0/16 (RFC 3927).
pub const IPV4LL_PREFIX_LEN: u8 = 16;
