// SPDX-License-Identifier: Apache-2.0

use crate::lease::Lease;
use std::net::Ipv4Addr;

/// DHCPv4 client events (spec.md §6). A closed tagged union: negative
/// errno values are a distinct error variant, never conflated with a
/// valid enumerator (spec.md §9 "Sum types for events").
#[derive(Debug, Clone, PartialEq)]
pub enum DhcpEvent {
    IpAcquire(Lease),
    Expired,
    Stop,
    IpChange(Lease),
    NoLease,
    Error(i32),
}

/// IPv4LL client events (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4LlEvent {
    Bind(Ipv4Addr),
    Stop,
    Conflict,
    Error(i32),
}

/// Which stage (if any) a kernel completion gates. `Enslave`,
/// `LinkUp`, `AddressConfigure` and `RouteConfigure` drain a pending
/// counter and may advance the state machine (spec.md §4.1 "Stale-ack
/// discipline"). The others are ancillary: fire-and-forget operations
/// whose errno is only logged (MTU set/restore, IPv4LL
/// deprecate/re-approve, and the teardown drops issued outside of a
/// configure pass).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Enslave,
    LinkUp,
    Mtu,
    AddressConfigure,
    AddressUpdate,
    AddressDrop,
    RouteConfigure,
    RouteDrop,
}

impl CompletionKind {
    /// EEXIST on configure / ENOENT on drop are tolerated transient
    /// errors (spec.md §7); everything else is surfaced.
    pub fn tolerates(&self, errno: i32) -> bool {
        match self {
            Self::AddressConfigure | Self::RouteConfigure => errno == nix::libc::EEXIST,
            Self::AddressDrop | Self::RouteDrop => errno == nix::libc::ENOENT,
            Self::Enslave | Self::LinkUp | Self::Mtu | Self::AddressUpdate => false,
        }
    }
}

/// Raw `RTM_NEWLINK` attributes relevant to the state machine (spec.md
/// §3 Link). The netlink message codec itself is out of scope (spec.md
/// §1); this is what survives decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLinkInfo {
    pub ifindex: u32,
    pub ifname: String,
    pub mac: [u8; 6],
    pub flags: u32,
    pub mtu: Option<u32>,
}

/// The single-threaded event bus the [`crate::manager::Manager`] selects
/// on (spec.md §5). Every asynchronous collaborator — kernel driver,
/// DHCP client, IPv4LL client, link monitor — reports back on this bus
/// instead of blocking the caller, the way `nipart`'s plugins report
/// back to the daemon over `NipartEvent`.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    NewLink(NewLinkInfo),
    DelLink { ifindex: u32 },
    DeviceReady { ifindex: u32 },
    KernelCompletion {
        ifindex: u32,
        kind: CompletionKind,
        errno: i32,
    },
    Dhcp {
        ifindex: u32,
        event: DhcpEvent,
    },
    Ipv4Ll {
        ifindex: u32,
        event: Ipv4LlEvent,
    },
}
