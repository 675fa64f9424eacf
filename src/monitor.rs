// SPDX-License-Identifier: Apache-2.0

//! Turns `RTM_NEWLINK`/`RTM_DELLINK` netlink traffic into
//! [`LinkEvent::NewLink`]/[`LinkEvent::DelLink`] on the shared bus, the
//! way `nipart`'s monitor worker turns the same traffic into
//! `NipartLinkEvent`. Runs as its own task; the initial `RTM_GETLINK`
//! dump seeds the bus with every interface present at startup before
//! the multicast stream takes over.

use std::collections::HashMap;

use futures_util::stream::StreamExt;
use rtnetlink::packet_core::NetlinkPayload;
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    link::{LinkAttribute, LinkMessage},
};
use tokio::sync::mpsc::Sender;

use crate::event::{LinkEvent, NewLinkInfo};

/// Decodes the attributes the state machine cares about out of a raw
/// `LinkMessage` (spec.md §3 "Link" / §1 "netlink message codec is out
/// of scope" — this is the minimum that survives decoding).
fn parse_link_msg(link_msg: &LinkMessage) -> Option<NewLinkInfo> {
    let ifname = link_msg.attributes.iter().find_map(|attr| {
        if let LinkAttribute::IfName(name) = attr {
            Some(name.clone())
        } else {
            None
        }
    })?;
    let mac = link_msg
        .attributes
        .iter()
        .find_map(|attr| {
            if let LinkAttribute::Address(bytes) = attr {
                <[u8; 6]>::try_from(bytes.as_slice()).ok()
            } else {
                None
            }
        })
        .unwrap_or([0; 6]);
    let mtu = link_msg.attributes.iter().find_map(|attr| {
        if let LinkAttribute::Mtu(mtu) = attr {
            Some(*mtu)
        } else {
            None
        }
    });
    Some(NewLinkInfo {
        ifindex: link_msg.header.index,
        ifname,
        mac,
        flags: link_msg.header.flags.bits(),
        mtu,
    })
}

/// Drives the netlink multicast socket and the one-shot startup dump.
/// Only forwards a `NewLink` when it actually differs from the last
/// one seen for that ifindex — the kernel re-broadcasts unrelated
/// updates we have no use for, and forwarding them unconditionally
/// would spam the bus with events that can't change any state-machine
/// decision.
pub async fn run(to_manager: Sender<LinkEvent>) {
    let (conn, handle, mut msg_rx) = match rtnetlink::new_multicast_connection(
        &[rtnetlink::MulticastGroup::Link],
    ) {
        Ok(v) => v,
        Err(e) => {
            log::error!("failed to open netlink monitor socket: {e}");
            return;
        }
    };
    tokio::spawn(conn);

    let mut last_seen: HashMap<u32, NewLinkInfo> = HashMap::new();

    let mut initial = handle.link().get().execute();
    while let Some(Ok(link_msg)) = initial.next().await {
        emit_if_changed(&link_msg, &to_manager, &mut last_seen).await;
    }

    while let Some((nl_msg, _addr)) = msg_rx.next().await {
        if let NetlinkPayload::InnerMessage(inner) = nl_msg.payload {
            match inner {
                RouteNetlinkMessage::NewLink(link_msg) => {
                    emit_if_changed(&link_msg, &to_manager, &mut last_seen)
                        .await;
                }
                RouteNetlinkMessage::DelLink(link_msg) => {
                    if let Some(info) = parse_link_msg(&link_msg) {
                        last_seen.remove(&info.ifindex);
                        let _ = to_manager
                            .send(LinkEvent::DelLink { ifindex: info.ifindex })
                            .await;
                    }
                }
                _ => {}
            }
        }
    }
}

async fn emit_if_changed(
    link_msg: &LinkMessage,
    to_manager: &Sender<LinkEvent>,
    last_seen: &mut HashMap<u32, NewLinkInfo>,
) {
    let Some(info) = parse_link_msg(link_msg) else {
        return;
    };
    if last_seen.get(&info.ifindex) == Some(&info) {
        return;
    }
    last_seen.insert(info.ifindex, info.clone());
    if to_manager.send(LinkEvent::NewLink(info)).await.is_err() {
        log::debug!("link monitor: manager gone, stopping");
    }
}
