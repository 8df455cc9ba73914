// Copyright (C) 2024 the icepath authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The ICE session: agent-wide negotiation state shared by all media
//! streams.

use std::error::Error;
use std::fmt::Display;
use std::net::AddrParseError;
use std::time::Duration;

use rand::prelude::*;
use stun_proto::types::message::StunWriteError;

use crate::conncheck::CheckList;

/// The default minimum time between two outbound connectivity checks.
pub const DEFAULT_TA: Duration = Duration::from_millis(20);
/// The default (and minimum) keepalive interval once a check list completes.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);
/// The default cap on the length of a check list.
pub const DEFAULT_MAX_CONNECTIVITY_CHECKS: usize = 100;

/// Errors that can be returned as a result of agent operations.
#[derive(Debug)]
pub enum AgentError {
    /// The operation is not permitted in the current session state.
    InvalidState,
    /// The candidate sequence is already at capacity.
    TooManyCandidates,
    /// Could not find the specified resource.
    ResourceNotFound,
    /// An address could not be interpreted.
    BadAddress,
    /// Writing a STUN message failed.
    StunWrite,
}

impl Error for AgentError {}

impl Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<AddrParseError> for AgentError {
    fn from(_: AddrParseError) -> Self {
        AgentError::BadAddress
    }
}

impl From<StunWriteError> for AgentError {
    fn from(_: StunWriteError) -> Self {
        AgentError::StunWrite
    }
}

/// The agent role for the negotiation.  The role may flip when a role
/// conflict is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controlling,
    Controlled,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Controlling => Role::Controlled,
            Role::Controlled => Role::Controlling,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Controlling => f.pad("Controlling"),
            Role::Controlled => f.pad("Controlled"),
        }
    }
}

/// The overall state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Running,
    Completed,
    Failed,
}

fn generate_random_ice_string(length: usize) -> String {
    let alphabet =
        "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+/".as_bytes();
    let mut rng = thread_rng();
    String::from_utf8(
        (0..length)
            .map(|_| *alphabet.choose(&mut rng).unwrap())
            .collect(),
    )
    .unwrap()
}

/// A builder for a [`Session`].
#[derive(Debug, Default)]
pub struct SessionBuilder {
    controlling: bool,
    tie_breaker: Option<u64>,
    ta: Option<Duration>,
    keepalive_timeout: Option<u8>,
    max_connectivity_checks: Option<u8>,
}

impl SessionBuilder {
    /// The initial role of the agent.  The role may change during the
    /// negotiation when a role conflict is repaired.
    pub fn controlling(mut self, controlling: bool) -> Self {
        self.controlling = controlling;
        self
    }

    /// The 64-bit value arbitrating role conflicts.  Randomly generated
    /// when not provided.
    pub fn tie_breaker(mut self, tie_breaker: u64) -> Self {
        self.tie_breaker = Some(tie_breaker);
        self
    }

    /// The minimum gap between two outbound connectivity checks.
    pub fn ta(mut self, ta: Duration) -> Self {
        self.ta = Some(ta);
        self
    }

    /// The keepalive interval in seconds, lower bounded at 15.
    pub fn keepalive_timeout(mut self, secs: u8) -> Self {
        self.keepalive_timeout = Some(secs);
        self
    }

    /// The cap on the length of each stream's check list.
    pub fn max_connectivity_checks(mut self, max: u8) -> Self {
        self.max_connectivity_checks = Some(max);
        self
    }

    /// Construct the [`Session`].
    pub fn build(self) -> Session {
        let tie_breaker = self
            .tie_breaker
            .unwrap_or_else(|| thread_rng().gen::<u64>());
        let mut session = Session {
            streams: vec![],
            role: if self.controlling {
                Role::Controlling
            } else {
                Role::Controlled
            },
            state: SessionState::Stopped,
            tie_breaker,
            local_ufrag: generate_random_ice_string(8),
            local_pwd: generate_random_ice_string(24),
            remote_ufrag: None,
            remote_pwd: None,
            ta: self.ta.unwrap_or(DEFAULT_TA),
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            max_connectivity_checks: self
                .max_connectivity_checks
                .map(usize::from)
                .unwrap_or(DEFAULT_MAX_CONNECTIVITY_CHECKS),
        };
        if let Some(secs) = self.keepalive_timeout {
            session.set_keepalive_timeout(secs);
        }
        session
    }
}

/// Agent-wide state for one ICE negotiation spanning any number of media
/// streams.  Each stream owns a [`CheckList`]; the session carries the
/// role, the tie-breaker, the short-term credentials and the pacing
/// parameters they all share.
pub struct Session {
    pub(crate) streams: Vec<CheckList>,
    pub(crate) role: Role,
    pub(crate) state: SessionState,
    pub(crate) tie_breaker: u64,
    pub(crate) local_ufrag: String,
    pub(crate) local_pwd: String,
    pub(crate) remote_ufrag: Option<String>,
    pub(crate) remote_pwd: Option<String>,
    pub(crate) ta: Duration,
    pub(crate) keepalive_timeout: Duration,
    pub(crate) max_connectivity_checks: usize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("tie_breaker", &self.tie_breaker)
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::builder().build()
    }
}

impl Session {
    /// Create a new [`SessionBuilder`].
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// The current role of the agent.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the agent currently has the controlling role.
    pub fn controlling(&self) -> bool {
        self.role == Role::Controlling
    }

    /// The session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The tie-breaker arbitrating role conflicts.
    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    /// The session-wide local username fragment.
    pub fn local_ufrag(&self) -> &str {
        &self.local_ufrag
    }

    /// The session-wide local password.
    pub fn local_pwd(&self) -> &str {
        &self.local_pwd
    }

    /// The session-wide remote username fragment, when known.
    pub fn remote_ufrag(&self) -> Option<&str> {
        self.remote_ufrag.as_deref()
    }

    /// The session-wide remote password, when known.
    pub fn remote_pwd(&self) -> Option<&str> {
        self.remote_pwd.as_deref()
    }

    /// Change the agent role.  Pair priorities depend on the role, so the
    /// priority of every formed pair is recomputed and the check and valid
    /// lists are reordered before any further check is issued.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_role(&mut self, role: Role) {
        if self.role != role {
            info!(old_role = %self.role, new_role = %role, "switching role");
            self.role = role;
            for cl in self.streams.iter_mut() {
                cl.recompute_pair_priorities(role);
            }
        }
    }

    /// Replace the session-wide local credentials.  Only permitted while
    /// the session is stopped.
    pub fn set_local_credentials(&mut self, ufrag: &str, pwd: &str) -> Result<(), AgentError> {
        if self.state != SessionState::Stopped {
            return Err(AgentError::InvalidState);
        }
        self.local_ufrag = ufrag.to_owned();
        self.local_pwd = pwd.to_owned();
        Ok(())
    }

    /// Replace the session-wide remote credentials, normally on receipt of
    /// an offer or answer.
    pub fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) {
        self.remote_ufrag = Some(ufrag.to_owned());
        self.remote_pwd = Some(pwd.to_owned());
    }

    /// Cap the length of each stream's check list.
    pub fn set_max_connectivity_checks(&mut self, max: u8) {
        self.max_connectivity_checks = usize::from(max);
    }

    /// Set the keepalive interval in seconds.  Values below 15 are clamped
    /// to 15.
    pub fn set_keepalive_timeout(&mut self, secs: u8) {
        let secs = secs.max(15);
        self.keepalive_timeout = Duration::from_secs(secs.into());
    }

    /// The configured keepalive interval.
    pub fn keepalive_timeout(&self) -> Duration {
        self.keepalive_timeout
    }

    /// Add a new stream to the session and return its id.
    pub fn add_check_list(&mut self) -> usize {
        let stream_id = self.streams.len();
        self.streams.push(CheckList::new(stream_id));
        stream_id
    }

    /// Get a stream's [`CheckList`] by id.
    pub fn check_list(&self, stream_id: usize) -> Option<&CheckList> {
        self.streams.get(stream_id)
    }

    /// Get a stream's [`CheckList`] mutably by id.
    pub fn mut_check_list(&mut self, stream_id: usize) -> Option<&mut CheckList> {
        self.streams.get_mut(stream_id)
    }

    /// Assign a foundation to every local candidate of every stream.
    /// Candidates of the same type deriving from the same base address
    /// share a foundation.
    pub fn compute_candidates_foundations(&mut self) {
        for cl in self.streams.iter_mut() {
            cl.compute_candidates_foundations();
        }
    }

    /// Mark the default candidate for each component of each stream,
    /// preferring relayed over server-reflexive over host candidates.
    pub fn choose_default_candidates(&mut self) {
        for cl in self.streams.iter_mut() {
            cl.choose_default_candidates();
        }
    }

    /// Point every server-reflexive local candidate at the host candidate
    /// it derives from.
    pub fn set_base_for_srflx_candidates(&mut self) {
        for cl in self.streams.iter_mut() {
            cl.set_base_for_srflx_candidates();
        }
    }

    /// Form and prune the candidate pairs of every stream, build the
    /// prioritised check lists, and unfreeze the initial pair of the first
    /// stream.  The session switches to the running state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn pair_candidates(&mut self) {
        let role = self.role;
        let max_checks = self.max_connectivity_checks;
        for (idx, cl) in self.streams.iter_mut().enumerate() {
            cl.pair_candidates(role, max_checks, idx == 0);
        }
        self.state = SessionState::Running;
    }

    /// Render the session state into the log at debug level.
    pub fn dump_session(&self) {
        debug!(
            role = %self.role,
            tie_breaker = format_args!("{:016x}", self.tie_breaker),
            local_ufrag = %self.local_ufrag,
            local_pwd = %self.local_pwd,
            remote_ufrag = ?self.remote_ufrag,
            remote_pwd = ?self.remote_pwd,
            "session"
        );
    }

    pub(crate) fn stream_remote_credentials(&self, stream_id: usize) -> Option<(String, String)> {
        let cl = self.streams.get(stream_id)?;
        let ufrag = cl
            .remote_ufrag()
            .map(str::to_owned)
            .or_else(|| self.remote_ufrag.clone())?;
        let pwd = cl
            .remote_pwd()
            .map(str::to_owned)
            .or_else(|| self.remote_pwd.clone())?;
        Some((ufrag, pwd))
    }

    /// After a check list reaches a terminal state, derive the session
    /// state from its streams.
    pub(crate) fn update_session_state(&mut self) {
        use crate::conncheck::CheckListState;
        if self.state != SessionState::Running {
            return;
        }
        if self.streams.is_empty() {
            return;
        }
        let mut any_completed = false;
        for cl in self.streams.iter() {
            match cl.state() {
                CheckListState::Running => return,
                CheckListState::Completed => any_completed = true,
                CheckListState::Failed => (),
            }
        }
        self.state = if any_completed {
            SessionState::Completed
        } else {
            SessionState::Failed
        };
        info!(state = ?self.state, "all check lists terminal");
    }
}
