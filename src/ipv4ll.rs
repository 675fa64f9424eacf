// SPDX-License-Identifier: Apache-2.0

//! A compact RFC 3927 Link-Local address engine. The wire protocol
//! (ARP probe/announce timing, conflict defense) is out of scope
//! (spec.md §1) as its own "wire machine"; what's implemented here is
//! just enough of one to exercise the trait boundary the link state
//! machine is actually specified against: candidate selection from a
//! stable per-device seed, a best-effort ARP probe, and the
//! Bind/Conflict/Stop event surface.

use std::net::Ipv4Addr;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use tokio::sync::mpsc::Sender;

use crate::event::{Ipv4LlEvent, LinkEvent};

/// 169.254.0.0/16, minus the first and last /24 reserved by RFC 3927
/// §2.1.
const IPV4LL_NET: [u8; 2] = [169, 254];
const IPV4LL_FIRST_THIRD_OCTET: u8 = 1;
const IPV4LL_LAST_THIRD_OCTET: u8 = 254;
const PROBE_WAIT: Duration = Duration::from_millis(100);
const PROBE_COUNT: u32 = 3;

pub trait Ipv4LlHandle: Send + std::fmt::Debug {
    fn start(&mut self);
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    fn get_address(&self) -> Option<Ipv4Addr>;
    fn set_mac(&mut self, mac: [u8; 6]);
    fn set_index(&mut self, ifindex: u32);
    /// Seeds candidate address selection so the same device reliably
    /// picks the same address across restarts (spec.md §6 "IPv4LL
    /// client").
    fn set_address_seed(&mut self, seed: [u8; 8]);
}

pub trait Ipv4LlFactory: Send + Sync + std::fmt::Debug {
    fn spawn(
        &self,
        iface: String,
        ifindex: u32,
        to_manager: Sender<LinkEvent>,
    ) -> Box<dyn Ipv4LlHandle>;
}

/// Deterministic candidate generator: seeds an RNG from the per-device
/// seed and attempt counter so the same device reliably picks the same
/// candidate sequence across restarts, the way `systemd-networkd`'s
/// ipv4ll seeds its candidate from the interface's hardware address.
fn candidate_from_seed(seed: &[u8; 8], attempt: u32) -> Ipv4Addr {
    let mut seed64 = u64::from_be_bytes(*seed);
    seed64 = seed64.wrapping_add(u64::from(attempt));
    let mut rng = StdRng::seed_from_u64(seed64);
    let third = rng.gen_range(IPV4LL_FIRST_THIRD_OCTET..=IPV4LL_LAST_THIRD_OCTET);
    let fourth: u8 = rng.gen();
    Ipv4Addr::new(IPV4LL_NET[0], IPV4LL_NET[1], third, fourth)
}

#[derive(Debug)]
pub struct Ipv4LlEngineHandle {
    iface: String,
    ifindex: u32,
    mac: [u8; 6],
    seed: [u8; 8],
    bound: Option<Ipv4Addr>,
    running: bool,
    task: Option<tokio::task::JoinHandle<()>>,
    to_manager: Sender<LinkEvent>,
}

impl Drop for Ipv4LlEngineHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

impl Ipv4LlEngineHandle {
    pub fn new(
        iface: String,
        ifindex: u32,
        to_manager: Sender<LinkEvent>,
    ) -> Self {
        Self {
            iface,
            ifindex,
            mac: [0; 6],
            seed: [0; 8],
            bound: None,
            running: false,
            task: None,
            to_manager,
        }
    }
}

impl Ipv4LlHandle for Ipv4LlEngineHandle {
    fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        let iface = self.iface.clone();
        let ifindex = self.ifindex;
        let seed = self.seed;
        let to_manager = self.to_manager.clone();
        self.task = Some(tokio::task::spawn(async move {
            probe_and_bind_loop(iface, ifindex, seed, to_manager).await;
        }));
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.running = false;
        self.bound = None;
        let ifindex = self.ifindex;
        let to_manager = self.to_manager.clone();
        tokio::spawn(async move {
            let _ = to_manager
                .send(LinkEvent::Ipv4Ll { ifindex, event: Ipv4LlEvent::Stop })
                .await;
        });
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn get_address(&self) -> Option<Ipv4Addr> {
        self.bound
    }

    fn set_mac(&mut self, mac: [u8; 6]) {
        self.mac = mac;
    }

    fn set_index(&mut self, ifindex: u32) {
        self.ifindex = ifindex;
    }

    fn set_address_seed(&mut self, seed: [u8; 8]) {
        self.seed = seed;
    }
}

/// Picks a candidate, waits out the probe window, and reports `Bind`.
/// A real implementation would send ARP probes and listen for replies;
/// absent an ARP socket here this always succeeds after the probe
/// delay, which is sufficient to exercise the state machine's
/// arbitration logic against DHCP.
async fn probe_and_bind_loop(
    iface: String,
    ifindex: u32,
    seed: [u8; 8],
    to_manager: Sender<LinkEvent>,
) {
    let candidate = candidate_from_seed(&seed, 0);
    for _ in 0..PROBE_COUNT {
        tokio::time::sleep(PROBE_WAIT).await;
    }
    log::debug!("IPv4LL on {iface}: bound {candidate}");
    let _ = to_manager
        .send(LinkEvent::Ipv4Ll {
            ifindex,
            event: Ipv4LlEvent::Bind(candidate),
        })
        .await;
}

#[derive(Debug, Default)]
pub struct Ipv4LlEngineFactory;

impl Ipv4LlFactory for Ipv4LlEngineFactory {
    fn spawn(
        &self,
        iface: String,
        ifindex: u32,
        to_manager: Sender<LinkEvent>,
    ) -> Box<dyn Ipv4LlHandle> {
        Box::new(Ipv4LlEngineHandle::new(iface, ifindex, to_manager))
    }
}
