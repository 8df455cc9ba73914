// Copyright (C) 2024 the icepath authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! ICE connectivity establishment for media streams.
//!
//! The crate implements the core of an RFC 5245 ICE agent: candidate
//! pairing, connectivity check scheduling, STUN binding request/response
//! handling, and the nomination/conclusion state machine.  STUN
//! encoding/decoding is delegated to [`stun_proto`] and socket I/O to an
//! [`IceTransport`](transport::IceTransport) provided by the embedding
//! media pipeline.

#[macro_use]
extern crate tracing;

pub mod agent;
pub mod candidate;
pub mod conncheck;
pub mod transport;
