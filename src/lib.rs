// SPDX-License-Identifier: Apache-2.0

//! Per-interface network-configuration engine for Linux hosts (spec.md
//! §1 Overview). A single in-process event bus carries every
//! completion — netlink, DHCP, IPv4LL — back to one [`manager::Manager`]
//! loop that drives each [`link::Link`] through its state machine.

mod address;
mod collaborators;
mod config;
mod dhcp;
mod error;
mod event;
mod ipv4ll;
mod kernel;
mod lease;
mod link;
mod logging;
mod manager;
mod monitor;
mod network;
mod persist;
mod registry;
mod route;

pub use crate::address::{AddressSpec, Lifetime, Scope};
pub use crate::collaborators::{
    DbusHostnameSetter, DeviceEnumerator, FileResolverUpdater, HostnameSetter,
    NisporDeviceEnumerator, ResolverUpdater,
};
pub use crate::config::Config;
pub use crate::dhcp::{DhcpV4Factory, DhcpV4Handle, MozimDhcpV4Factory};
pub use crate::error::{ErrorKind, LinkError};
pub use crate::event::{
    CompletionKind, DhcpEvent, Ipv4LlEvent, LinkEvent, NewLinkInfo,
};
pub use crate::ipv4ll::{Ipv4LlEngineFactory, Ipv4LlFactory, Ipv4LlHandle};
pub use crate::kernel::{KernelDriver, RtNetlinkDriver};
pub use crate::lease::Lease;
pub use crate::link::{Link, LinkCtx, LinkState};
pub use crate::logging::{init_logging, LogLevel};
pub use crate::manager::Manager;
pub use crate::network::{MatchContext, Network, ProfileMatcher, StaticProfileMatcher};
pub use crate::persist::{PersistState, StatePersister};
pub use crate::registry::LinkRegistry;
pub use crate::route::RouteSpec;

pub use monitor::run as run_monitor;
