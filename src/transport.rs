// Copyright (C) 2024 the icepath authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The socket interface between the ICE core and the media transport.

use crate::candidate::TransportAddress;

/// Which of a stream's sockets a packet relates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Rtp,
    Rtcp,
}

impl SocketKind {
    /// The ICE component id carried by this socket (RTP = 1, RTCP = 2).
    pub fn component_id(self) -> u16 {
        match self {
            SocketKind::Rtp => 1,
            SocketKind::Rtcp => 2,
        }
    }

    pub fn from_component_id(component_id: u16) -> Option<SocketKind> {
        match component_id {
            1 => Some(SocketKind::Rtp),
            2 => Some(SocketKind::Rtcp),
            _ => None,
        }
    }
}

impl std::fmt::Display for SocketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketKind::Rtp => f.pad("RTP"),
            SocketKind::Rtcp => f.pad("RTCP"),
        }
    }
}

/// An opaque handle to a socket owned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketHandle(pub usize);

/// The transport operations the ICE core needs from the embedding media
/// stream.  Sockets stay owned by the transport; the core only ever sends
/// through them and is told which socket a packet arrived on.
pub trait IceTransport {
    /// The socket used for RTP (component 1), if allocated.
    fn rtp_socket(&mut self) -> Option<SocketHandle>;

    /// The socket used for RTCP (component 2), if allocated.
    fn rtcp_socket(&mut self) -> Option<SocketHandle>;

    /// The local port packets are received on for the given socket.
    fn recv_port(&self, kind: SocketKind) -> Option<u16>;

    /// Send a datagram.  Failures are the transport's to report; the core
    /// treats sending as fire and forget.
    fn send_packet(&mut self, socket: SocketHandle, data: &[u8], dest: &TransportAddress);
}

/// A single STUN datagram delivered to the core by the transport.
#[derive(Debug)]
pub struct StunPacketEvent<'data> {
    /// The socket the packet arrived on.
    pub socket: SocketKind,
    /// The raw STUN payload.
    pub data: &'data [u8],
    /// The sender's transport address.
    pub source: TransportAddress,
    /// The local interface address the packet was received on.
    pub local_ip: String,
}
