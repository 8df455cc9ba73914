// Copyright (C) 2024 the icepath authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Connectivity check handling: candidate pair formation, the check
//! scheduler, STUN binding request/response processing and the
//! nomination/conclusion state machine.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::prelude::*;
use stun_proto::types::attribute::*;
use stun_proto::types::message::*;

use crate::agent::{AgentError, Role, Session, SessionState};
use crate::candidate::{Candidate, CandidateId, CandidateType, TransportAddress};
use crate::transport::{IceTransport, SocketHandle, SocketKind, StunPacketEvent};

/// Upper bound on the number of candidates of either side of a check list.
pub const ICE_MAX_CANDIDATES: usize = 10;
/// A check fails once its request has been retransmitted this many times.
pub const ICE_MAX_RETRANSMISSIONS: u32 = 7;
/// The initial per-pair retransmission timeout.
const DEFAULT_RTO: Duration = Duration::from_millis(100);

/// Index of a pair within its check list's pair sequence.
pub type PairId = usize;

/// The connectivity check state of a candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
    Frozen,
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            PairState::Waiting => "Waiting",
            PairState::InProgress => "In-Progress",
            PairState::Succeeded => "Succeeded",
            PairState::Failed => "Failed",
            PairState::Frozen => "Frozen",
        })
    }
}

/// The overall state of a [`CheckList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckListState {
    Running,
    Completed,
    Failed,
}

/// A (local, remote) candidate tuple subject to a connectivity check.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub(crate) local: CandidateId,
    pub(crate) remote: CandidateId,
    pub(crate) priority: u64,
    pub(crate) state: PairState,
    pub(crate) role: Role,
    pub(crate) is_default: bool,
    pub(crate) is_nominated: bool,
    pub(crate) transaction_id: Option<TransactionId>,
    pub(crate) rto: Duration,
    pub(crate) retransmissions: u32,
    pub(crate) transmission_time: Option<Instant>,
    pub(crate) wait_transaction_timeout: bool,
}

impl CandidatePair {
    /// The pair priority as defined in RFC 5245 5.7.2, where G is the
    /// priority of the controlling side's candidate and D the other side's.
    pub fn compute_priority(local_priority: u32, remote_priority: u32, role: Role) -> u64 {
        let (g, d) = match role {
            Role::Controlling => (local_priority as u64, remote_priority as u64),
            Role::Controlled => (remote_priority as u64, local_priority as u64),
        };
        (g.min(d) << 32) | (g.max(d) << 1) | u64::from(g > d)
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    pub fn is_nominated(&self) -> bool {
        self.is_nominated
    }

    pub fn priority(&self) -> u64 {
        self.priority
    }
}

/// A pair that produced a successful check, together with the pair whose
/// check generated it.  The entry carries its own nominated flag: marking
/// the generating pair for nomination only schedules the USE-CANDIDATE
/// check, while the entry is nominated once that check (or the peer's)
/// succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidPair {
    pub(crate) valid: PairId,
    pub(crate) generated_from: PairId,
    pub(crate) is_nominated: bool,
}

/// The distinct (local, remote) foundation combinations of a check list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairFoundation {
    pub local: String,
    pub remote: String,
}

/// The remote transport addresses selected by the nominated valid pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMediaAddress {
    pub addr: String,
    pub rtp_port: u16,
    pub rtcp_port: Option<u16>,
}

type SuccessCb = Box<dyn FnMut(&CheckList) + Send>;

/// The connectivity check state for one media stream: the candidates, the
/// formed pairs, the prioritised check list, the triggered check queue and
/// the valid list.
pub struct CheckList {
    stream_id: usize,
    state: CheckListState,
    component_ids: Vec<u16>,
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    pairs: Vec<CandidatePair>,
    check_list: Vec<PairId>,
    triggered: VecDeque<PairId>,
    valid_list: Vec<ValidPair>,
    foundations: Vec<PairFoundation>,
    remote_ufrag: Option<String>,
    remote_pwd: Option<String>,
    ta_time: Option<Instant>,
    keepalive_time: Option<Instant>,
    foundation_generator: u32,
    success_cb: Option<SuccessCb>,
    completion_pending: bool,
}

impl std::fmt::Debug for CheckList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckList")
            .field("stream_id", &self.stream_id)
            .field("state", &self.state)
            .field("local_candidates", &self.local_candidates.len())
            .field("remote_candidates", &self.remote_candidates.len())
            .field("pairs", &self.pairs.len())
            .field("check_list", &self.check_list.len())
            .field("valid_list", &self.valid_list.len())
            .finish()
    }
}

fn candidate_is_duplicate(a: &Candidate, b: &Candidate) -> bool {
    a.candidate_type == b.candidate_type
        && a.taddr == b.taddr
        && a.component_id == b.component_id
        && a.priority == b.priority
}

impl CheckList {
    pub(crate) fn new(stream_id: usize) -> Self {
        Self {
            stream_id,
            state: CheckListState::Running,
            component_ids: vec![],
            local_candidates: vec![],
            remote_candidates: vec![],
            pairs: vec![],
            check_list: vec![],
            triggered: VecDeque::new(),
            valid_list: vec![],
            foundations: vec![],
            remote_ufrag: None,
            remote_pwd: None,
            ta_time: None,
            keepalive_time: None,
            foundation_generator: 1,
            success_cb: None,
            completion_pending: false,
        }
    }

    /// The stream this check list belongs to.
    pub fn stream_id(&self) -> usize {
        self.stream_id
    }

    /// The state of the check list.
    pub fn state(&self) -> CheckListState {
        self.state
    }

    /// The local candidates currently configured for this check list.
    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    /// The remote candidates currently configured for this check list.
    pub fn remote_candidates(&self) -> &[Candidate] {
        &self.remote_candidates
    }

    /// The per-stream remote username fragment, when set.
    pub fn remote_ufrag(&self) -> Option<&str> {
        self.remote_ufrag.as_deref()
    }

    /// The per-stream remote password, when set.
    pub fn remote_pwd(&self) -> Option<&str> {
        self.remote_pwd.as_deref()
    }

    /// Set stream-specific remote credentials overriding the session-wide
    /// ones.
    pub fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) {
        self.remote_ufrag = Some(ufrag.to_owned());
        self.remote_pwd = Some(pwd.to_owned());
    }

    /// Register a callback invoked once when the check list completes.
    pub fn register_success_cb<F>(&mut self, cb: F)
    where
        F: FnMut(&CheckList) + Send + 'static,
    {
        self.success_cb = Some(Box::new(cb));
    }

    /// The default local candidate for the RTP component, when chosen.
    pub fn default_local_candidate(&self) -> Option<&Candidate> {
        self.local_candidates
            .iter()
            .find(|c| c.component_id == 1 && c.is_default)
    }

    /// Add a local candidate.  Host and relayed candidates are self-based;
    /// a server-reflexive candidate may name the host candidate it derives
    /// from, or be resolved later with
    /// [`Session::set_base_for_srflx_candidates`](crate::agent::Session::set_base_for_srflx_candidates).
    #[tracing::instrument(level = "debug", skip(self), fields(stream_id = self.stream_id))]
    pub fn add_local_candidate(
        &mut self,
        candidate_type: CandidateType,
        ip: &str,
        port: u16,
        component_id: u16,
        base: Option<CandidateId>,
    ) -> Result<CandidateId, AgentError> {
        if self.local_candidates.len() >= ICE_MAX_CANDIDATES {
            error!(
                "candidate list limited to {} candidates",
                ICE_MAX_CANDIDATES
            );
            return Err(AgentError::TooManyCandidates);
        }
        let idx = self.local_candidates.len();
        let base = match candidate_type {
            CandidateType::Host | CandidateType::Relayed => Some(idx),
            _ => base,
        };
        let candidate = Candidate {
            candidate_type,
            taddr: TransportAddress::new(ip, port),
            component_id,
            priority: Candidate::calculate_priority(candidate_type, component_id),
            foundation: String::new(),
            base,
            is_default: false,
        };
        info!("adding local {:?}", candidate);
        self.local_candidates.push(candidate);
        self.add_component_id(component_id);
        Ok(idx)
    }

    /// Add a remote candidate.  A zero priority is replaced by the locally
    /// computed value.
    #[tracing::instrument(level = "debug", skip(self), fields(stream_id = self.stream_id))]
    pub fn add_remote_candidate(
        &mut self,
        candidate_type: CandidateType,
        ip: &str,
        port: u16,
        component_id: u16,
        priority: u32,
        foundation: &str,
    ) -> Result<CandidateId, AgentError> {
        if self.remote_candidates.len() >= ICE_MAX_CANDIDATES {
            error!(
                "candidate list limited to {} candidates",
                ICE_MAX_CANDIDATES
            );
            return Err(AgentError::TooManyCandidates);
        }
        let idx = self.remote_candidates.len();
        let base = match candidate_type {
            CandidateType::Host | CandidateType::Relayed => Some(idx),
            _ => None,
        };
        let priority = if priority == 0 {
            Candidate::calculate_priority(candidate_type, component_id)
        } else {
            priority
        };
        let candidate = Candidate {
            candidate_type,
            taddr: TransportAddress::new(ip, port),
            component_id,
            priority,
            foundation: foundation.to_owned(),
            base,
            is_default: false,
        };
        info!("adding remote {:?}", candidate);
        self.remote_candidates.push(candidate);
        Ok(idx)
    }

    fn add_component_id(&mut self, component_id: u16) {
        if !self.component_ids.contains(&component_id) {
            self.component_ids.push(component_id);
        }
    }

    /// Assign a foundation to every local candidate.  Candidates of the
    /// same type deriving from the same base address share a foundation.
    pub(crate) fn compute_candidates_foundations(&mut self) {
        for idx in 0..self.local_candidates.len() {
            self.compute_candidate_foundation(idx);
        }
    }

    pub(crate) fn compute_candidate_foundation(&mut self, idx: CandidateId) {
        let (ctype, base_ip) = {
            let candidate = &self.local_candidates[idx];
            (
                candidate.candidate_type,
                candidate
                    .base
                    .map(|b| self.local_candidates[b].taddr.ip.clone()),
            )
        };
        if let Some(base_ip) = base_ip {
            let shared = self.local_candidates.iter().enumerate().find_map(|(i, other)| {
                if i == idx || other.candidate_type != ctype || other.foundation.is_empty() {
                    return None;
                }
                let other_base = other.base?;
                (self.local_candidates[other_base].taddr.ip == base_ip)
                    .then(|| other.foundation.clone())
            });
            if let Some(foundation) = shared {
                self.local_candidates[idx].foundation = foundation;
                return;
            }
        }
        let foundation = self.foundation_generator.to_string();
        self.foundation_generator += 1;
        self.local_candidates[idx].foundation = foundation;
    }

    /// Generate a foundation different from the foundations of all other
    /// remote candidates, for a learned peer-reflexive candidate.
    pub(crate) fn generate_arbitrary_foundation(&self) -> String {
        let mut rng = thread_rng();
        loop {
            let foundation = format!("{:x}", rng.gen::<u64>());
            if !self
                .remote_candidates
                .iter()
                .any(|c| c.foundation == foundation)
            {
                return foundation;
            }
        }
    }

    /// Choose the default candidate for each component as defined in
    /// RFC 5245 4.1.4: relayed over server-reflexive over host.
    pub(crate) fn choose_default_candidates(&mut self) {
        Self::choose_defaults_in(&mut self.local_candidates);
        Self::choose_defaults_in(&mut self.remote_candidates);
    }

    fn choose_defaults_in(candidates: &mut [Candidate]) {
        let mut components: Vec<u16> = candidates.iter().map(|c| c.component_id).collect();
        components.sort_unstable();
        components.dedup();
        for component_id in components {
            for ctype in [
                CandidateType::Relayed,
                CandidateType::ServerReflexive,
                CandidateType::Host,
            ] {
                if let Some(candidate) = candidates
                    .iter_mut()
                    .find(|c| c.candidate_type == ctype && c.component_id == component_id)
                {
                    candidate.is_default = true;
                    break;
                }
            }
        }
    }

    /// Point each server-reflexive local candidate without a base at the
    /// host candidate of its component.
    pub(crate) fn set_base_for_srflx_candidates(&mut self) {
        for i in 0..self.component_ids.len() {
            let component_id = self.component_ids[i];
            let Some(host) = self.local_candidates.iter().position(|c| {
                c.candidate_type == CandidateType::Host && c.component_id == component_id
            }) else {
                continue;
            };
            for candidate in self.local_candidates.iter_mut() {
                if candidate.candidate_type == CandidateType::ServerReflexive
                    && candidate.base.is_none()
                    && candidate.component_id == component_id
                {
                    candidate.base = Some(host);
                }
            }
        }
    }

    pub(crate) fn new_pair(
        &mut self,
        local: CandidateId,
        remote: CandidateId,
        role: Role,
    ) -> PairId {
        let local_candidate = &self.local_candidates[local];
        let remote_candidate = &self.remote_candidates[remote];
        let pair = CandidatePair {
            local,
            remote,
            priority: CandidatePair::compute_priority(
                local_candidate.priority,
                remote_candidate.priority,
                role,
            ),
            state: PairState::Frozen,
            role,
            is_default: local_candidate.is_default && remote_candidate.is_default,
            is_nominated: false,
            transaction_id: None,
            rto: DEFAULT_RTO,
            retransmissions: 0,
            transmission_time: None,
            wait_transaction_timeout: false,
        };
        self.pairs.push(pair);
        self.pairs.len() - 1
    }

    pub(crate) fn set_pair_state(&mut self, pair_id: PairId, state: PairState) {
        let pair = &mut self.pairs[pair_id];
        if pair.state != state {
            debug!(
                pair = pair_id,
                old_state = %pair.state,
                new_state = %state,
                "updating pair state"
            );
            pair.state = state;
            if matches!(state, PairState::Waiting | PairState::Failed) {
                pair.transaction_id = None;
            }
        }
    }

    /// Form pairs, prune them and build the prioritised check list as
    /// defined in RFC 5245 5.7.1 to 5.7.4.
    #[tracing::instrument(level = "debug", skip(self), fields(stream_id = self.stream_id))]
    pub(crate) fn pair_candidates(&mut self, role: Role, max_checks: usize, first_stream: bool) {
        self.form_candidate_pairs(role);
        self.replace_srflx_bases();
        self.prune_duplicate_pairs();
        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        if self.pairs.len() > max_checks {
            debug!(
                "limiting the check list from {} to {} pairs",
                self.pairs.len(),
                max_checks
            );
            self.pairs.truncate(max_checks);
        }
        self.check_list = (0..self.pairs.len()).collect();
        self.generate_pair_foundations();
        if first_stream {
            self.initial_unfreeze();
        }
        self.dump_check_state();
    }

    fn form_candidate_pairs(&mut self, role: Role) {
        for local in 0..self.local_candidates.len() {
            for remote in 0..self.remote_candidates.len() {
                if self.local_candidates[local].component_id
                    == self.remote_candidates[remote].component_id
                {
                    self.new_pair(local, remote, role);
                }
            }
        }
    }

    /// Replace each pair's server-reflexive local candidate with its base
    /// before pruning.
    fn replace_srflx_bases(&mut self) {
        for pair in self.pairs.iter_mut() {
            let local = &self.local_candidates[pair.local];
            if local.candidate_type == CandidateType::ServerReflexive {
                if let Some(base) = local.base {
                    pair.local = base;
                }
            }
        }
    }

    /// Pairs whose endpoints compare equal in (type, address, component,
    /// priority) are duplicates; the higher-priority pair survives, ties
    /// keep the pair formed first.
    fn prune_duplicate_pairs(&mut self) {
        let formed = std::mem::take(&mut self.pairs);
        let mut kept: Vec<CandidatePair> = Vec::with_capacity(formed.len());
        for pair in formed {
            let existing = kept.iter().position(|other| {
                candidate_is_duplicate(
                    &self.local_candidates[other.local],
                    &self.local_candidates[pair.local],
                ) && candidate_is_duplicate(
                    &self.remote_candidates[other.remote],
                    &self.remote_candidates[pair.remote],
                )
            });
            match existing {
                Some(idx) => {
                    debug!("pruning duplicate pair");
                    if pair.priority > kept[idx].priority {
                        kept[idx] = pair;
                    }
                }
                None => kept.push(pair),
            }
        }
        self.pairs = kept;
    }

    fn generate_pair_foundations(&mut self) {
        self.foundations.clear();
        for &pair_id in self.check_list.iter() {
            let foundation = PairFoundation {
                local: self.local_candidates[self.pairs[pair_id].local]
                    .foundation
                    .clone(),
                remote: self.remote_candidates[self.pairs[pair_id].remote]
                    .foundation
                    .clone(),
            };
            if !self.foundations.contains(&foundation) {
                self.foundations.push(foundation);
            }
        }
    }

    pub(crate) fn pair_foundation(&self, pair_id: PairId) -> PairFoundation {
        PairFoundation {
            local: self.local_candidates[self.pairs[pair_id].local]
                .foundation
                .clone(),
            remote: self.remote_candidates[self.pairs[pair_id].remote]
                .foundation
                .clone(),
        }
    }

    /// Unfreeze the pair with the lowest component id and, within that
    /// component, the highest priority (RFC 5245 5.7.4).
    fn initial_unfreeze(&mut self) {
        let Some(min_component) = self
            .check_list
            .iter()
            .map(|&pid| self.local_candidates[self.pairs[pid].local].component_id)
            .min()
        else {
            return;
        };
        // The check list is ordered by descending priority so the first
        // matching entry maximises the priority.
        if let Some(&pair_id) = self.check_list.iter().find(|&&pid| {
            self.local_candidates[self.pairs[pid].local].component_id == min_component
        }) {
            self.set_pair_state(pair_id, PairState::Waiting);
        }
    }

    /// Recompute every pair priority after a role change and restore the
    /// priority ordering of the check and valid lists.
    pub(crate) fn recompute_pair_priorities(&mut self, role: Role) {
        for pair in self.pairs.iter_mut() {
            pair.priority = CandidatePair::compute_priority(
                self.local_candidates[pair.local].priority,
                self.remote_candidates[pair.remote].priority,
                role,
            );
        }
        let pairs = &self.pairs;
        self.check_list
            .sort_by(|&a, &b| pairs[b].priority.cmp(&pairs[a].priority));
        self.valid_list
            .sort_by(|a, b| pairs[b.valid].priority.cmp(&pairs[a.valid].priority));
    }

    /// Insert a pair into the check list keeping the descending priority
    /// order and the configured length cap.
    pub(crate) fn insert_into_check_list(&mut self, pair_id: PairId, max_checks: usize) {
        let priority = self.pairs[pair_id].priority;
        let idx = self
            .check_list
            .partition_point(|&pid| self.pairs[pid].priority >= priority);
        self.check_list.insert(idx, pair_id);
        while self.check_list.len() > max_checks {
            let removed = self.check_list.pop().unwrap();
            debug!(pair = removed, "check list full, dropping lowest priority pair");
            self.triggered.retain(|&pid| pid != removed);
        }
    }

    pub(crate) fn queue_triggered_check(&mut self, pair_id: PairId) {
        if self.triggered.contains(&pair_id) {
            trace!(pair = pair_id, "pair already in the triggered checks queue");
        } else {
            debug!(pair = pair_id, "queueing triggered check");
            self.triggered.push_back(pair_id);
        }
    }

    pub(crate) fn pop_triggered_check(&mut self) -> Option<PairId> {
        self.triggered.pop_front()
    }

    pub(crate) fn find_local_candidate(&self, taddr: &TransportAddress) -> Option<CandidateId> {
        self.local_candidates.iter().position(|c| &c.taddr == taddr)
    }

    pub(crate) fn find_remote_candidate(&self, taddr: &TransportAddress) -> Option<CandidateId> {
        self.remote_candidates
            .iter()
            .position(|c| &c.taddr == taddr)
    }

    pub(crate) fn find_pair_in_check_list(
        &self,
        local: CandidateId,
        remote: CandidateId,
    ) -> Option<PairId> {
        self.check_list
            .iter()
            .copied()
            .find(|&pid| self.pairs[pid].local == local && self.pairs[pid].remote == remote)
    }

    pub(crate) fn find_check_list_pair_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Option<PairId> {
        self.check_list
            .iter()
            .copied()
            .find(|&pid| self.pairs[pid].transaction_id == Some(transaction_id))
    }

    /// Record a valid pair, keeping the valid list ordered by descending
    /// pair priority.  Duplicate (valid, generated_from) entries are
    /// dropped.  Returns the index of the (existing or inserted) entry.
    pub(crate) fn add_valid_pair(&mut self, valid: PairId, generated_from: PairId) -> usize {
        if let Some(idx) = self
            .valid_list
            .iter()
            .position(|vp| vp.valid == valid && vp.generated_from == generated_from)
        {
            debug!(pair = valid, "pair already in the valid list");
            return idx;
        }
        let priority = self.pairs[valid].priority;
        let idx = self
            .valid_list
            .partition_point(|vp| self.pairs[vp.valid].priority >= priority);
        self.valid_list.insert(
            idx,
            ValidPair {
                valid,
                generated_from,
                is_nominated: false,
            },
        );
        info!(
            local = %self.local_candidates[self.pairs[valid].local].taddr,
            remote = %self.remote_candidates[self.pairs[valid].remote].taddr,
            "added pair to the valid list"
        );
        idx
    }

    /// Move every frozen pair sharing the succeeded pair's foundation to
    /// waiting (RFC 5245 7.1.3.2.3).
    pub(crate) fn unfreeze_same_foundation(&mut self, succeeded: PairId) {
        let foundation = self.pair_foundation(succeeded);
        let frozen: Vec<PairId> = self
            .check_list
            .iter()
            .copied()
            .filter(|&pid| {
                pid != succeeded
                    && self.pairs[pid].state == PairState::Frozen
                    && self.pair_foundation(pid) == foundation
            })
            .collect();
        for pair_id in frozen {
            debug!(pair = pair_id, "unfreezing pair with succeeded foundation");
            self.set_pair_state(pair_id, PairState::Waiting);
        }
    }

    fn component_of(&self, pair_id: PairId) -> u16 {
        self.local_candidates[self.pairs[pair_id].local].component_id
    }

    fn nominated_valid_pair(&self, component_id: u16) -> Option<&ValidPair> {
        self.valid_list
            .iter()
            .find(|vp| vp.is_nominated && self.component_of(vp.valid) == component_id)
    }

    /// Conclude ICE processing as defined in RFC 5245 8.1.
    pub(crate) fn conclude_processing(&mut self, role: Role, now: Instant) {
        if role == Role::Controlling {
            self.perform_regular_nomination();
        }
        self.cancel_redundant_checks();

        let all_components_nominated = !self.component_ids.is_empty()
            && self
                .component_ids
                .iter()
                .all(|&cid| self.nominated_valid_pair(cid).is_some());
        if all_components_nominated {
            if self.state != CheckListState::Completed {
                self.set_state(CheckListState::Completed);
                info!(stream_id = self.stream_id, "check list processing completed");
                self.dump_check_state();
                self.keepalive_time = Some(now);
                self.completion_pending = true;
            }
        } else {
            let all_terminal = self.check_list.iter().all(|&pid| {
                matches!(self.pairs[pid].state, PairState::Failed | PairState::Succeeded)
            });
            if all_terminal && self.state != CheckListState::Failed {
                self.set_state(CheckListState::Failed);
                warn!(stream_id = self.stream_id, "check list processing failed");
            }
        }
    }

    /// Nominate the highest-priority valid pair of each component that has
    /// none nominated yet, by marking the generating pair and triggering a
    /// check that will carry USE-CANDIDATE.
    fn perform_regular_nomination(&mut self) {
        let component_ids = self.component_ids.clone();
        for component_id in component_ids {
            if self.nominated_valid_pair(component_id).is_some() {
                continue;
            }
            // The valid list is ordered by descending priority, so the
            // first matching entry is the best candidate for nomination.
            let Some(entry) = self
                .valid_list
                .iter()
                .find(|vp| self.component_of(vp.valid) == component_id)
                .copied()
            else {
                continue;
            };
            if !self.pairs[entry.generated_from].is_nominated {
                info!(component = component_id, "nominating pair");
                self.pairs[entry.generated_from].is_nominated = true;
                self.queue_triggered_check(entry.generated_from);
            }
        }
    }

    /// Once a component has a nominated valid pair, remove that component's
    /// waiting and frozen pairs from the check list and the triggered queue
    /// and stop retransmissions for its in-progress pairs.
    fn cancel_redundant_checks(&mut self) {
        let nominated_components: Vec<u16> = self
            .valid_list
            .iter()
            .filter(|vp| vp.is_nominated)
            .map(|vp| self.component_of(vp.valid))
            .collect();
        for component_id in nominated_components {
            let pairs = &self.pairs;
            let local_candidates = &self.local_candidates;
            let redundant = |&pid: &PairId| {
                matches!(pairs[pid].state, PairState::Waiting | PairState::Frozen)
                    && local_candidates[pairs[pid].local].component_id == component_id
            };
            self.check_list.retain(|pid| !redundant(pid));
            self.triggered.retain(|pid| !redundant(pid));
            let in_progress: Vec<PairId> = self
                .check_list
                .iter()
                .copied()
                .filter(|&pid| {
                    self.pairs[pid].state == PairState::InProgress
                        && self.component_of(pid) == component_id
                })
                .collect();
            for pair_id in in_progress {
                debug!(pair = pair_id, "stopping retransmissions for nominated component");
                self.pairs[pair_id].retransmissions = ICE_MAX_RETRANSMISSIONS;
            }
        }
    }

    fn set_state(&mut self, state: CheckListState) {
        if self.state != state {
            debug!(
                stream_id = self.stream_id,
                old_state = ?self.state,
                new_state = ?state,
                "changing check list state"
            );
            self.state = state;
        }
    }

    /// The remote address and ports selected by the nominated valid pairs,
    /// once available.
    pub fn remote_media_address(&self) -> Option<RemoteMediaAddress> {
        let mut addr = None;
        let mut rtp_port = None;
        let mut rtcp_port = None;
        for &component_id in self.component_ids.iter() {
            let Some(entry) = self.nominated_valid_pair(component_id) else {
                continue;
            };
            let remote = &self.remote_candidates[self.pairs[entry.valid].remote];
            match component_id {
                1 => {
                    addr = Some(remote.taddr.ip.clone());
                    rtp_port = Some(remote.taddr.port);
                }
                2 => rtcp_port = Some(remote.taddr.port),
                _ => (),
            }
        }
        Some(RemoteMediaAddress {
            addr: addr?,
            rtp_port: rtp_port?,
            rtcp_port,
        })
    }

    pub(crate) fn dump_check_state(&self) {
        let mut s = format!("checklist {}", self.stream_id);
        for &pair_id in self.check_list.iter() {
            use std::fmt::Write as _;
            let pair = &self.pairs[pair_id];
            let local = &self.local_candidates[pair.local];
            let remote = &self.remote_candidates[pair.remote];
            let _ = write!(
                &mut s,
                "\nID:{id} foundation:{foundation} state:{state} nom:{nominated} priority:{priority} local:{local_type} {local_addr} remote:{remote_type} {remote_addr}",
                id = format_args!("{:<3}", pair_id),
                foundation = format_args!("{:10}", format!("{}:{}", local.foundation, remote.foundation)),
                state = format_args!("{:11}", pair.state),
                nominated = format_args!("{:5}", pair.is_nominated),
                priority = format_args!("{:20}", pair.priority),
                local_type = format_args!("{:5}", local.candidate_type),
                local_addr = format_args!("{:21}", local.taddr),
                remote_type = format_args!("{:5}", remote.candidate_type),
                remote_addr = format_args!("{:21}", remote.taddr),
            );
        }
        debug!("{}", s);
    }
}

fn socket_for_kind(transport: &mut dyn IceTransport, kind: SocketKind) -> Option<SocketHandle> {
    match kind {
        SocketKind::Rtp => transport.rtp_socket(),
        SocketKind::Rtcp => transport.rtcp_socket(),
    }
}

fn short_term_credentials(pwd: &str) -> MessageIntegrityCredentials {
    MessageIntegrityCredentials::ShortTerm(ShortTermCredentials::new(pwd.to_owned()))
}

/// Compose a connectivity check binding request as defined in
/// RFC 5245 7.1.2.
#[allow(clippy::too_many_arguments)]
fn binding_request(
    transaction_id: TransactionId,
    prflx_priority: u32,
    role: Role,
    tie_breaker: u64,
    nominate: bool,
    username: &str,
    remote_pwd: &str,
) -> Result<Vec<u8>, StunWriteError> {
    let mut msg = Message::builder(
        MessageType::from_class_method(MessageClass::Request, BINDING),
        transaction_id,
    );
    msg.add_attribute(&Priority::new(prflx_priority))?;
    match role {
        Role::Controlling => msg.add_attribute(&IceControlling::new(tie_breaker))?,
        Role::Controlled => msg.add_attribute(&IceControlled::new(tie_breaker))?,
    }
    if nominate {
        msg.add_attribute(&UseCandidate::new())?;
    }
    let username = Username::new(username)?;
    msg.add_attribute(&username)?;
    msg.add_message_integrity(&short_term_credentials(remote_pwd), IntegrityAlgorithm::Sha1)?;
    msg.add_fingerprint()?;
    Ok(msg.build())
}

fn binding_success_response(
    msg: &Message,
    username: &str,
    mapped: std::net::SocketAddr,
    local_pwd: &str,
) -> Result<Vec<u8>, StunWriteError> {
    let mut response = Message::builder_success(msg);
    let username = Username::new(username)?;
    response.add_attribute(&username)?;
    response.add_attribute(&XorMappedAddress::new(mapped, msg.transaction_id()))?;
    response.add_message_integrity(&short_term_credentials(local_pwd), IntegrityAlgorithm::Sha1)?;
    response.add_fingerprint()?;
    Ok(response.build())
}

fn binding_error_response(
    msg: &Message,
    code: u16,
    reason: &str,
    integrity_pwd: Option<&str>,
) -> Result<Vec<u8>, StunWriteError> {
    let mut response = Message::builder_error(msg);
    response.add_attribute(&ErrorCode::builder(code).reason(reason).build()?)?;
    if let Some(pwd) = integrity_pwd {
        response.add_message_integrity(&short_term_credentials(pwd), IntegrityAlgorithm::Sha1)?;
    }
    response.add_fingerprint()?;
    Ok(response.build())
}

fn binding_indication() -> Result<Vec<u8>, StunWriteError> {
    let mut indication = Message::builder(
        MessageType::from_class_method(MessageClass::Indication, BINDING),
        TransactionId::generate(),
    );
    indication.add_fingerprint()?;
    Ok(indication.build())
}

impl Session {
    /// Drive the check scheduler for one stream.  Expected to be invoked
    /// once per tick of the embedding pipeline with the current monotonic
    /// time.
    #[tracing::instrument(level = "trace", skip(self, transport))]
    pub fn process(&mut self, stream_id: usize, transport: &mut dyn IceTransport, now: Instant) {
        if matches!(self.state, SessionState::Stopped | SessionState::Failed) {
            return;
        }
        if self.streams.get(stream_id).is_none() {
            warn!(stream_id, "no such stream");
            return;
        }
        self.process_inner(stream_id, transport, now);
        self.dispatch_completion(stream_id);
    }

    // RFC 5245 5.8. Scheduling Checks
    fn process_inner(
        &mut self,
        stream_id: usize,
        transport: &mut dyn IceTransport,
        now: Instant,
    ) {
        match self.streams[stream_id].state {
            CheckListState::Failed => return,
            CheckListState::Completed => {
                let due = self.streams[stream_id]
                    .keepalive_time
                    .map_or(true, |t| now.duration_since(t) >= self.keepalive_timeout);
                if due {
                    self.send_keepalive_packets(stream_id, transport);
                    self.streams[stream_id].keepalive_time = Some(now);
                }
            }
            CheckListState::Running => (),
        }

        // Retransmit the in-progress checks whose timer expired.
        let due: Vec<PairId> = {
            let cl = &self.streams[stream_id];
            cl.check_list
                .iter()
                .copied()
                .filter(|&pid| {
                    let pair = &cl.pairs[pid];
                    pair.state == PairState::InProgress
                        && pair
                            .transmission_time
                            .map_or(false, |t| now.duration_since(t) >= pair.rto)
                })
                .collect()
        };
        for pair_id in due {
            debug!(pair = pair_id, "retransmitting connectivity check");
            self.send_binding_request(stream_id, pair_id, transport, now);
        }

        // Pace the emission of new checks.
        let cl = &mut self.streams[stream_id];
        if let Some(ta_time) = cl.ta_time {
            if now.duration_since(ta_time) < self.ta {
                return;
            }
        }
        cl.ta_time = Some(now);

        if let Some(pair_id) = cl.pop_triggered_check() {
            debug!(pair = pair_id, "sending triggered connectivity check");
            self.send_binding_request(stream_id, pair_id, transport, now);
            return;
        }

        if self.streams[stream_id].state == CheckListState::Running {
            let cl = &self.streams[stream_id];
            let next_waiting = cl
                .check_list
                .iter()
                .copied()
                .find(|&pid| cl.pairs[pid].state == PairState::Waiting);
            if let Some(pair_id) = next_waiting {
                debug!(pair = pair_id, "sending ordinary check for waiting pair");
                self.send_binding_request(stream_id, pair_id, transport, now);
                return;
            }
            let next_frozen = cl
                .check_list
                .iter()
                .copied()
                .find(|&pid| cl.pairs[pid].state == PairState::Frozen);
            if let Some(pair_id) = next_frozen {
                debug!(pair = pair_id, "sending ordinary check for frozen pair");
                self.send_binding_request(stream_id, pair_id, transport, now);
                return;
            }
        }

        // Nothing left to send; once nothing is in flight either, conclude.
        let cl = &self.streams[stream_id];
        let retransmissions_pending = cl.check_list.iter().any(|&pid| {
            cl.pairs[pid].state == PairState::InProgress
                && cl.pairs[pid].retransmissions <= ICE_MAX_RETRANSMISSIONS
        });
        if !retransmissions_pending {
            self.streams[stream_id].conclude_processing(self.role, now);
            self.update_session_state();
        }
    }

    /// Feed one received STUN packet into the state machine.
    #[tracing::instrument(
        level = "debug",
        skip(self, transport, event),
        fields(source = %event.source, socket = %event.socket)
    )]
    pub fn handle_stun_packet(
        &mut self,
        stream_id: usize,
        transport: &mut dyn IceTransport,
        event: &StunPacketEvent,
        now: Instant,
    ) {
        if self.streams.get(stream_id).is_none() {
            warn!(stream_id, "no such stream");
            return;
        }
        let msg = match Message::from_bytes(event.data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = ?e, "received invalid STUN packet");
                return;
            }
        };
        if msg.has_class(MessageClass::Request) && msg.has_method(BINDING) {
            debug!("received binding request from {}", event.source);
            self.handle_binding_request(stream_id, transport, &msg, event, now);
        } else if msg.has_class(MessageClass::Success) {
            debug!("received binding response from {}", event.source);
            self.handle_binding_response(stream_id, transport, &msg, event, now);
        } else if msg.has_class(MessageClass::Error) {
            debug!("received error response from {}", event.source);
            self.handle_error_response(stream_id, &msg, now);
        } else if msg.has_class(MessageClass::Indication) {
            trace!("ignoring binding indication from {}", event.source);
        } else {
            warn!("STUN message type not handled");
        }
        self.dispatch_completion(stream_id);
    }

    /// Send (or resend) the binding request for a pair, RFC 5245 7.1.2.
    fn send_binding_request(
        &mut self,
        stream_id: usize,
        pair_id: PairId,
        transport: &mut dyn IceTransport,
        now: Instant,
    ) {
        let role = self.role;
        let tie_breaker = self.tie_breaker;
        {
            let cl = &mut self.streams[stream_id];
            if cl.pairs[pair_id].state == PairState::InProgress {
                if cl.pairs[pair_id].wait_transaction_timeout {
                    // A received check asked for a re-check mid-flight; wait
                    // for the running transaction to finish before reissuing.
                    cl.pairs[pair_id].wait_transaction_timeout = false;
                    cl.set_pair_state(pair_id, PairState::Waiting);
                    cl.queue_triggered_check(pair_id);
                    return;
                }
                cl.pairs[pair_id].retransmissions += 1;
                if cl.pairs[pair_id].retransmissions > ICE_MAX_RETRANSMISSIONS {
                    debug!(pair = pair_id, "too many retransmissions, failing pair");
                    cl.set_pair_state(pair_id, PairState::Failed);
                    return;
                }
                let rto = cl.pairs[pair_id].rto;
                cl.pairs[pair_id].rto = rto * 2;
                cl.pairs[pair_id].transmission_time = Some(now);
            }
        }

        let component_id = {
            let cl = &self.streams[stream_id];
            cl.local_candidates[cl.pairs[pair_id].local].component_id
        };
        let socket = match component_id {
            1 => transport.rtp_socket(),
            2 => transport.rtcp_socket(),
            _ => {
                warn!(component_id, "cannot send check for unknown component");
                return;
            }
        };
        let Some(socket) = socket else {
            warn!(component_id, "transport has no socket for component");
            return;
        };
        let Some((remote_ufrag, remote_pwd)) = self.stream_remote_credentials(stream_id) else {
            warn!("no remote credentials available, not sending check");
            return;
        };
        let username = format!("{}:{}", remote_ufrag, self.local_ufrag);

        let cl = &mut self.streams[stream_id];
        let in_progress = cl.pairs[pair_id].state == PairState::InProgress;
        // The original transaction id is kept across retransmissions.
        let transaction_id = if in_progress {
            cl.pairs[pair_id]
                .transaction_id
                .unwrap_or_else(TransactionId::generate)
        } else {
            TransactionId::generate()
        };
        // RFC 5245 7.1.2.1: the priority the local candidate would have as
        // a peer-reflexive candidate.
        let prflx_priority = (cl.local_candidates[cl.pairs[pair_id].local].priority
            & 0x00ff_ffff)
            | (CandidateType::PeerReflexive.type_preference() << 24);
        let nominate = role == Role::Controlling && cl.pairs[pair_id].is_nominated;
        let dest = cl.remote_candidates[cl.pairs[pair_id].remote].taddr.clone();

        match binding_request(
            transaction_id,
            prflx_priority,
            role,
            tie_breaker,
            nominate,
            &username,
            &remote_pwd,
        ) {
            Ok(data) => {
                trace!(
                    pair = pair_id,
                    transaction_id = ?transaction_id,
                    nominate,
                    "sending binding request to {dest}"
                );
                cl.pairs[pair_id].transaction_id = Some(transaction_id);
                transport.send_packet(socket, &data, &dest);
                if !in_progress {
                    let pair = &mut cl.pairs[pair_id];
                    pair.rto = DEFAULT_RTO;
                    pair.retransmissions = 0;
                    pair.role = role;
                    pair.transmission_time = Some(now);
                    cl.set_pair_state(pair_id, PairState::InProgress);
                }
            }
            Err(e) => warn!(error = %e, "failed to generate binding request"),
        }
    }

    fn reply_error(
        &self,
        transport: &mut dyn IceTransport,
        event: &StunPacketEvent,
        msg: &Message,
        code: u16,
        reason: &str,
    ) {
        let Some(socket) = socket_for_kind(transport, event.socket) else {
            return;
        };
        // Role conflict errors are integrity protected; the 400 class ones
        // only carry a fingerprint.
        let integrity_pwd =
            (code == ErrorCode::ROLE_CONFLICT).then_some(self.local_pwd.as_str());
        match binding_error_response(msg, code, reason, integrity_pwd) {
            Ok(data) => {
                info!(code, reason, "sending error response to {}", event.source);
                transport.send_packet(socket, &data, &event.source);
            }
            Err(e) => warn!(error = %e, "failed to generate error response"),
        }
    }

    // RFC 5245 7.2.1. Additional Procedures for Full Implementations
    fn handle_binding_request(
        &mut self,
        stream_id: usize,
        transport: &mut dyn IceTransport,
        msg: &Message,
        event: &StunPacketEvent,
        now: Instant,
    ) {
        if msg.attribute::<MessageIntegrity>().is_err() {
            warn!("received binding request missing MESSAGE-INTEGRITY attribute");
            self.reply_error(transport, event, msg, ErrorCode::BAD_REQUEST,
                "Missing MESSAGE-INTEGRITY attribute");
            return;
        }
        let username = match msg.attribute::<Username>() {
            Ok(username) => username,
            Err(_) => {
                warn!("received binding request missing USERNAME attribute");
                self.reply_error(transport, event, msg, ErrorCode::BAD_REQUEST,
                    "Missing USERNAME attribute");
                return;
            }
        };
        if msg.attribute::<Fingerprint>().is_err() {
            warn!("received binding request missing FINGERPRINT attribute");
            self.reply_error(transport, event, msg, ErrorCode::BAD_REQUEST,
                "Missing FINGERPRINT attribute");
            return;
        }
        let priority = match msg.attribute::<Priority>() {
            Ok(priority) => priority.priority(),
            Err(_) => {
                warn!("received binding request missing PRIORITY attribute");
                self.reply_error(transport, event, msg, ErrorCode::BAD_REQUEST,
                    "Missing PRIORITY attribute");
                return;
            }
        };
        let ice_controlling = msg.attribute::<IceControlling>().ok();
        let ice_controlled = msg.attribute::<IceControlled>().ok();
        match (&ice_controlling, &ice_controlled) {
            (None, None) => {
                warn!("received binding request missing ICE-CONTROLLING or ICE-CONTROLLED");
                self.reply_error(transport, event, msg, ErrorCode::BAD_REQUEST,
                    "Missing ICE-CONTROLLING or ICE-CONTROLLED attribute");
                return;
            }
            (Some(_), Some(_)) => {
                warn!("received binding request with both ICE-CONTROLLING and ICE-CONTROLLED");
                self.reply_error(transport, event, msg, ErrorCode::BAD_REQUEST,
                    "Both ICE-CONTROLLING and ICE-CONTROLLED attributes present");
                return;
            }
            _ => (),
        }
        if msg
            .validate_integrity(&short_term_credentials(&self.local_pwd))
            .is_err()
        {
            error!("wrong MESSAGE-INTEGRITY in received binding request");
            self.reply_error(transport, event, msg, ErrorCode::UNAUTHORIZED,
                "Wrong MESSAGE-INTEGRITY attribute");
            return;
        }
        let username_str = username.username();
        let valid_username = username_str
            .split_once(':')
            .map_or(false, |(first, _)| first == self.local_ufrag);
        if !valid_username {
            error!("wrong USERNAME attribute in received binding request");
            self.reply_error(transport, event, msg, ErrorCode::UNAUTHORIZED,
                "Wrong USERNAME attribute");
            return;
        }

        // RFC 5245 7.2.1.1. Detecting and Repairing Role Conflicts
        if let Some(ice_controlling) = ice_controlling {
            if self.role == Role::Controlling {
                warn!("role conflict, both agents are controlling");
                if self.tie_breaker >= ice_controlling.tie_breaker() {
                    self.reply_error(transport, event, msg, ErrorCode::ROLE_CONFLICT,
                        "Role Conflict");
                    return;
                }
                self.set_role(Role::Controlled);
            }
        }
        if let Some(ice_controlled) = ice_controlled {
            if self.role == Role::Controlled {
                warn!("role conflict, both agents are controlled");
                if self.tie_breaker >= ice_controlled.tie_breaker() {
                    self.set_role(Role::Controlling);
                } else {
                    self.reply_error(transport, event, msg, ErrorCode::ROLE_CONFLICT,
                        "Role Conflict");
                    return;
                }
            }
        }

        // Learn a peer-reflexive remote candidate, RFC 5245 7.2.1.3.
        let component_id = event.socket.component_id();
        {
            let cl = &mut self.streams[stream_id];
            if cl.find_remote_candidate(&event.source).is_none() {
                info!("learned peer reflexive candidate {}", event.source);
                let foundation = cl.generate_arbitrary_foundation();
                if let Err(e) = cl.add_remote_candidate(
                    CandidateType::PeerReflexive,
                    &event.source.ip,
                    event.source.port,
                    component_id,
                    priority,
                    &foundation,
                ) {
                    warn!(error = %e, "could not add peer reflexive candidate");
                }
            }
        }

        let triggered_pair = self.trigger_check_on_request(stream_id, transport, event);

        // RFC 5245 7.2.1.5. Updating the Nominated Flag
        let peer_nominating = msg.raw_attribute(UseCandidate::TYPE).is_some();
        if peer_nominating && self.role == Role::Controlled {
            if let Some(pair_id) = triggered_pair {
                let cl = &mut self.streams[stream_id];
                if cl.pairs[pair_id].state == PairState::Succeeded {
                    info!(pair = pair_id, "nominated by peer");
                    cl.pairs[pair_id].is_nominated = true;
                    for vp in cl.valid_list.iter_mut() {
                        if vp.valid == pair_id {
                            vp.is_nominated = true;
                        }
                    }
                }
            }
        }

        match event.source.to_socket_addr() {
            Ok(mapped) => {
                if let Some(socket) = socket_for_kind(transport, event.socket) {
                    match binding_success_response(msg, username_str, mapped, &self.local_pwd) {
                        Ok(data) => transport.send_packet(socket, &data, &event.source),
                        Err(e) => warn!(error = %e, "failed to generate binding response"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not interpret source address"),
        }

        self.streams[stream_id].conclude_processing(self.role, now);
        self.update_session_state();
    }

    /// Trigger a check in response to a received binding request,
    /// RFC 5245 7.2.1.4.
    fn trigger_check_on_request(
        &mut self,
        stream_id: usize,
        transport: &mut dyn IceTransport,
        event: &StunPacketEvent,
    ) -> Option<PairId> {
        let role = self.role;
        let max_checks = self.max_connectivity_checks;
        let Some(recv_port) = transport.recv_port(event.socket) else {
            warn!(socket = %event.socket, "transport has no receive port");
            return None;
        };
        let local_taddr = TransportAddress::new(&event.local_ip, recv_port);
        let cl = &mut self.streams[stream_id];
        let Some(local) = cl.find_local_candidate(&local_taddr) else {
            error!("local candidate {} not found", local_taddr);
            return None;
        };
        let Some(remote) = cl.find_remote_candidate(&event.source) else {
            error!("remote candidate {} not found", event.source);
            return None;
        };
        if let Some(pair_id) = cl.find_pair_in_check_list(local, remote) {
            match cl.pairs[pair_id].state {
                PairState::Waiting | PairState::Frozen | PairState::Failed => {
                    cl.set_pair_state(pair_id, PairState::Waiting);
                    cl.queue_triggered_check(pair_id);
                }
                PairState::InProgress => {
                    // The in-flight transaction must time out before a new
                    // check goes out for this pair.
                    cl.pairs[pair_id].wait_transaction_timeout = true;
                }
                PairState::Succeeded => (),
            }
            Some(pair_id)
        } else {
            info!("adding new candidate pair to the check list");
            let pair_id = cl.new_pair(local, remote, role);
            cl.insert_into_check_list(pair_id, max_checks);
            cl.set_pair_state(pair_id, PairState::Waiting);
            cl.queue_triggered_check(pair_id);
            Some(pair_id)
        }
    }

    // RFC 5245 7.1.3.2. Success Cases
    fn handle_binding_response(
        &mut self,
        stream_id: usize,
        transport: &mut dyn IceTransport,
        msg: &Message,
        event: &StunPacketEvent,
        now: Instant,
    ) {
        let role = self.role;
        let transaction_id = msg.transaction_id();
        let Some(recv_port) = transport.recv_port(event.socket) else {
            warn!(socket = %event.socket, "transport has no receive port");
            return;
        };
        let cl = &mut self.streams[stream_id];
        let Some(pair_id) = cl.find_check_list_pair_by_transaction(transaction_id) else {
            warn!(
                transaction_id = ?transaction_id,
                "received binding response for an unknown transaction"
            );
            return;
        };

        // RFC 5245 7.1.3.1: the response must come back on the symmetric
        // address pair the request went out on.
        let local_taddr = TransportAddress::new(&event.local_ip, recv_port);
        {
            let pair = &cl.pairs[pair_id];
            if event.source != cl.remote_candidates[pair.remote].taddr
                || local_taddr != cl.local_candidates[pair.local].taddr
            {
                warn!(pair = pair_id, "non-symmetric addresses, failing pair");
                cl.set_pair_state(pair_id, PairState::Failed);
                return;
            }
        }

        if msg.attribute::<Username>().is_err() {
            warn!("received binding response missing USERNAME attribute");
            return;
        }
        if msg.attribute::<Fingerprint>().is_err() {
            warn!("received binding response missing FINGERPRINT attribute");
            return;
        }
        let Ok(xor) = msg.attribute::<XorMappedAddress>() else {
            warn!("received binding response missing XOR-MAPPED-ADDRESS attribute");
            return;
        };
        let mapped = TransportAddress::from(xor.addr(transaction_id));
        let previous_state = cl.pairs[pair_id].state;

        // Discover a peer-reflexive local candidate, RFC 5245 7.1.3.2.1.
        let mut prflx_local = None;
        if cl.find_local_candidate(&mapped).is_none() {
            info!("discovered peer reflexive candidate {}", mapped);
            let base = cl.pairs[pair_id].local;
            let component_id = cl.local_candidates[base].component_id;
            match cl.add_local_candidate(
                CandidateType::PeerReflexive,
                &mapped.ip,
                mapped.port,
                component_id,
                Some(base),
            ) {
                Ok(idx) => {
                    cl.compute_candidate_foundation(idx);
                    prflx_local = Some(idx);
                }
                Err(e) => warn!(error = %e, "could not add peer reflexive candidate"),
            }
        }

        // Construct the valid pair, RFC 5245 7.1.3.2.2.
        let valid_local = prflx_local.or_else(|| cl.find_local_candidate(&local_taddr));
        if let Some(valid_local) = valid_local {
            let remote = cl.pairs[pair_id].remote;
            let valid_pair_id = cl
                .find_pair_in_check_list(valid_local, remote)
                .unwrap_or_else(|| cl.new_pair(valid_local, remote, role));
            let valid_idx = cl.add_valid_pair(valid_pair_id, pair_id);

            // Update the pair states, RFC 5245 7.1.3.2.3.
            cl.set_pair_state(pair_id, PairState::Succeeded);
            cl.unfreeze_same_foundation(pair_id);

            // Update the nominated flag, RFC 5245 7.1.3.2.4.
            match role {
                Role::Controlling => {
                    if cl.pairs[pair_id].is_nominated {
                        cl.valid_list[valid_idx].is_nominated = true;
                    }
                }
                Role::Controlled => {
                    if previous_state == PairState::InProgress {
                        cl.valid_list[valid_idx].is_nominated = true;
                    }
                }
            }
        } else {
            error!("local candidate {} not found", local_taddr);
            cl.set_pair_state(pair_id, PairState::Succeeded);
            cl.unfreeze_same_foundation(pair_id);
        }

        self.streams[stream_id].conclude_processing(role, now);
        self.update_session_state();
    }

    // RFC 5245 7.1.3.1. Failure Cases
    fn handle_error_response(&mut self, stream_id: usize, msg: &Message, now: Instant) {
        let transaction_id = msg.transaction_id();
        let Some(pair_id) =
            self.streams[stream_id].find_check_list_pair_by_transaction(transaction_id)
        else {
            debug!(
                transaction_id = ?transaction_id,
                "received error response for an unknown transaction"
            );
            return;
        };
        let pair_role = self.streams[stream_id].pairs[pair_id].role;
        self.streams[stream_id].set_pair_state(pair_id, PairState::Failed);
        info!(pair = pair_id, "error response, pair failed");

        let role_conflict = msg
            .attribute::<ErrorCode>()
            .map_or(false, |err| err.code() == ErrorCode::ROLE_CONFLICT);
        if role_conflict {
            // The role recorded when the check went out decides which way
            // to flip.
            info!("role conflict signalled by peer");
            self.set_role(pair_role.opposite());
            let cl = &mut self.streams[stream_id];
            cl.set_pair_state(pair_id, PairState::Waiting);
            cl.queue_triggered_check(pair_id);
        }

        self.streams[stream_id].conclude_processing(self.role, now);
        self.update_session_state();
    }

    /// Send a binding indication to the nominated remote of each component,
    /// keeping the NAT bindings alive.
    fn send_keepalive_packets(&mut self, stream_id: usize, transport: &mut dyn IceTransport) {
        let destinations: Vec<(u16, TransportAddress)> = {
            let cl = &self.streams[stream_id];
            cl.component_ids
                .iter()
                .filter_map(|&component_id| {
                    let entry = cl.nominated_valid_pair(component_id)?;
                    let remote = &cl.remote_candidates[cl.pairs[entry.valid].remote];
                    Some((component_id, remote.taddr.clone()))
                })
                .collect()
        };
        for (component_id, dest) in destinations {
            let socket = match component_id {
                1 => transport.rtp_socket(),
                2 => transport.rtcp_socket(),
                _ => continue,
            };
            let Some(socket) = socket else {
                continue;
            };
            match binding_indication() {
                Ok(data) => {
                    trace!(component_id, "sending keepalive to {dest}");
                    transport.send_packet(socket, &data, &dest);
                }
                Err(e) => warn!(error = %e, "failed to generate binding indication"),
            }
        }
    }

    /// Fire the registered success callback after a conclusion marked the
    /// check list completed.
    fn dispatch_completion(&mut self, stream_id: usize) {
        if !self.streams[stream_id].completion_pending {
            return;
        }
        self.streams[stream_id].completion_pending = false;
        if let Some(mut cb) = self.streams[stream_id].success_cb.take() {
            cb(&self.streams[stream_id]);
            self.streams[stream_id].success_cb = Some(cb);
        }
    }
}
