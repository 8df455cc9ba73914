// Copyright (C) 2024 the icepath authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! ICE candidates.

use std::error::Error;
use std::net::{AddrParseError, SocketAddr};
use std::str::FromStr;

/// A transport address as exchanged in candidate lines.
///
/// Equality is case-sensitive string equality on the address part plus
/// numeric equality on the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportAddress {
    pub ip: String,
    pub port: u16,
}

impl TransportAddress {
    pub fn new(ip: &str, port: u16) -> Self {
        Self {
            ip: ip.to_owned(),
            port,
        }
    }

    /// Resolve to a [`SocketAddr`] for use at the STUN codec boundary.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        Ok(SocketAddr::new(self.ip.parse()?, self.port))
    }
}

impl From<SocketAddr> for TransportAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl std::fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// The type of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    /// The candidate is a local network interface
    Host,
    /// The candidate was discovered by asking an external server (STUN/TURN)
    ServerReflexive,
    /// The candidate was discovered from incoming data
    PeerReflexive,
    /// The candidate will relay all data through an external server (TURN)
    Relayed,
}

impl CandidateType {
    // RFC 5245 4.1.2.1. recommended type preference values
    pub(crate) fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }
}

/// Errors when parsing the candidate type
#[derive(Debug)]
pub enum ParseCandidateTypeError {
    /// The value provided is not recognised
    UnknownCandidateType,
}

impl Error for ParseCandidateTypeError {}

impl std::fmt::Display for ParseCandidateTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.pad(&format!("{self:?}"))
    }
}

impl FromStr for CandidateType {
    type Err = ParseCandidateTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relayed),
            _ => Err(ParseCandidateTypeError::UnknownCandidateType),
        }
    }
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match &self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relayed => "relay",
        })
    }
}

/// Index of a candidate within its check list's candidate sequence.
pub type CandidateId = usize;

/// One potential transport endpoint for a stream component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The type of the candidate
    pub candidate_type: CandidateType,
    /// The advertised transport address
    pub taddr: TransportAddress,
    /// The component the candidate belongs to (1 = RTP, 2 = RTCP)
    pub component_id: u16,
    /// The candidate priority
    pub priority: u32,
    /// The (shared) foundation
    pub foundation: String,
    /// The candidate used as the send origin.  Host and relayed candidates
    /// are self-based; server-reflexive candidates point at the host
    /// candidate they derive from; peer-reflexive candidates point at
    /// whichever local candidate the successful check used.
    pub base: Option<CandidateId>,
    /// Whether this is the default candidate for its component
    pub is_default: bool,
}

impl Candidate {
    /// Calculate the priority of a candidate as defined in RFC 5245 4.1.2.1.
    pub fn calculate_priority(ctype: CandidateType, component_id: u16) -> u32 {
        // Local preference recommended for non-multihomed hosts.
        let local_preference: u32 = 65535;
        (ctype.type_preference() << 24)
            | (local_preference << 8)
            | (256 - component_id as u32)
    }
}
