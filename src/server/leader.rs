//! Leader role: log replication, commit advancement, snapshot
//! installation toward lagging followers, and membership changes.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::cluster::Configuration;
use crate::error::{RaftError, Result};
use crate::protocol::message::*;
use crate::server::{
    ConfigReply, InstallSend, LeaderState, RoleKind, ServerActor, ServerMessage,
};
use crate::server::stamped;
use crate::storage::entry::EntryKind;
use crate::{LogIndex, MemberId, Term};
use tokio::sync::oneshot;

impl LeaderState {
    fn new(now: Instant) -> Self {
        Self {
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_contact: HashMap::new(),
            in_flight: HashSet::new(),
            installing: HashMap::new(),
            pending: HashMap::new(),
            pending_config: None,
            since: now,
        }
    }
}

impl ServerActor {
    /// Takes over leadership: initializes replication state and
    /// appends the no-op entry that lets prior-term entries commit.
    pub(crate) fn become_leader(&mut self) {
        let term = self.meta.current_term();
        slog::info!(self.logger, "Elected leader"; "term" => term);

        self.transition_to(RoleKind::Leader);
        let now = Instant::now();
        let mut leader = LeaderState::new(now);
        let next = self.log.next_index();
        for member in self.cluster.current().replicated_members() {
            if member.id != self.id {
                leader.next_index.insert(member.id, next);
                leader.match_index.insert(member.id, 0);
                leader.last_contact.insert(member.id, now);
            }
        }
        self.leader = Some(leader);

        let interval = self.config.heartbeat_interval;
        self.heartbeat_timer = Some(self.context.schedule_periodic(interval, interval, || {
            ServerMessage::HeartbeatTick
        }));

        match self.leader_append(EntryKind::Initialize) {
            Ok(_) => self.after_append(),
            Err(err) => self.fail_storage(&err),
        }
    }

    /// Appends an entry in the current term. The caller registers any
    /// pending reply before calling [`ServerActor::after_append`].
    pub(crate) fn leader_append(&mut self, kind: EntryKind) -> Result<LogIndex> {
        let term = self.meta.current_term();
        let indexed = self.log.append(stamped(term, kind))?;
        self.log.flush()?;
        Ok(indexed.index)
    }

    /// Replicates the fresh tail and advances the commit index (which
    /// is immediate for a single-member quorum).
    pub(crate) fn after_append(&mut self) {
        self.replicate_all();
        self.try_advance_commit();
    }

    pub(crate) fn handle_heartbeat_tick(&mut self) {
        if self.role != RoleKind::Leader {
            return;
        }
        self.check_quorum_contact();
        if self.role == RoleKind::Leader {
            self.replicate_all();
        }
    }

    /// Steps down when no quorum has been heard from within an
    /// election timeout.
    fn check_quorum_contact(&mut self) {
        let Some(leader) = self.leader.as_ref() else {
            return;
        };
        let window = self.config.election_timeout_max;
        let now = Instant::now();
        if now.duration_since(leader.since) < window {
            return;
        }
        let config = self.cluster.current();
        let mut contacted = 0;
        for member in config.voting_members() {
            if member.id == self.id {
                contacted += 1;
                continue;
            }
            if let Some(at) = leader.last_contact.get(&member.id) {
                if now.duration_since(*at) < window {
                    contacted += 1;
                }
            }
        }
        if contacted < config.quorum_size() {
            slog::warn!(self.logger, "Lost contact with quorum; stepping down");
            self.transition_to(self.role_for_membership());
        }
    }

    pub(crate) fn replicate_all(&mut self) {
        let members: Vec<MemberId> = self
            .cluster
            .current()
            .replicated_members()
            .map(|m| m.id)
            .filter(|&id| id != self.id)
            .collect();
        for member in members {
            self.replicate(member);
        }
    }

    /// Sends the next append or install toward one follower, unless a
    /// request is already in flight.
    pub(crate) fn replicate(&mut self, member: MemberId) {
        let term = self.meta.current_term();
        let compacted = self.log.compacted_index();
        let log_next = self.log.next_index();

        let Some(leader) = self.leader.as_mut() else {
            return;
        };
        if leader.in_flight.contains(&member) {
            return;
        }

        // Continue an install sequence in progress.
        if leader.installing.contains_key(&member) {
            self.send_install_chunk(member, term);
            return;
        }

        let next = *leader.next_index.entry(member).or_insert(log_next);
        if next <= compacted {
            // The prefix this follower needs is gone; ship the current
            // snapshot instead.
            let Some(snapshot) = self.snapshots.current_snapshot() else {
                slog::error!(self.logger, "Compacted log but no snapshot available";
                    "member" => member);
                return;
            };
            let data = match snapshot.reader() {
                Ok(reader) => reader.bytes().to_vec(),
                Err(err) => {
                    slog::error!(self.logger, "Snapshot read failed"; "error" => %err);
                    return;
                }
            };
            let Some(leader) = self.leader.as_mut() else {
                return;
            };
            leader.installing.insert(
                member,
                InstallSend {
                    id: snapshot.id(),
                    index: snapshot.index(),
                    timestamp: snapshot.timestamp(),
                    data,
                    offset: 0,
                },
            );
            self.send_install_chunk(member, term);
            return;
        }

        let prev = next - 1;
        let prev_term = match self.log.term_at(prev) {
            Ok(Some(prev_term)) => prev_term,
            _ => {
                slog::error!(self.logger, "Missing term for prev index"; "index" => prev);
                return;
            }
        };
        let entries = match self
            .log
            .entries_from(next, self.config.max_entries_per_append)
        {
            Ok(entries) => entries,
            Err(err) => {
                self.fail_storage(&err);
                return;
            }
        };
        let sent_last = prev + entries.len() as u64;
        let request = match AppendRequest::builder()
            .term(term)
            .leader(self.id)
            .prev_log(prev, prev_term)
            .entries(entries)
            .commit_index(self.log.commit_index())
            .build()
        {
            Ok(request) => request,
            Err(err) => {
                slog::error!(self.logger, "Append request build failed"; "error" => %err);
                return;
            }
        };

        let Some(leader) = self.leader.as_mut() else {
            return;
        };
        leader.in_flight.insert(member);

        let protocol = self.protocol.clone();
        let context = self.context.clone();
        let timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            let response =
                match tokio::time::timeout(timeout, protocol.append(member, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(RaftError::Timeout),
                };
            context.submit(ServerMessage::AppendOutcome {
                term,
                member,
                sent_last,
                response,
            });
        });
    }

    fn send_install_chunk(&mut self, member: MemberId, term: Term) {
        let chunk_size = self.config.install_chunk_size;
        let Some(leader) = self.leader.as_mut() else {
            return;
        };
        let Some(install) = leader.installing.get(&member) else {
            return;
        };

        let start = install.offset as usize;
        let end = (start + chunk_size).min(install.data.len());
        let complete = end == install.data.len();
        let request = match InstallRequest::builder()
            .term(term)
            .leader(self.id)
            .snapshot(install.id, install.index, install.timestamp)
            .chunk(install.offset, install.data[start..end].to_vec(), complete)
            .build()
        {
            Ok(request) => request,
            Err(_) => return,
        };
        let snapshot_index = install.index;
        let sent_to_offset = end as u32;
        leader.in_flight.insert(member);

        let protocol = self.protocol.clone();
        let context = self.context.clone();
        let timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            let response =
                match tokio::time::timeout(timeout, protocol.install(member, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(RaftError::Timeout),
                };
            context.submit(ServerMessage::InstallOutcome {
                term,
                member,
                sent_to_offset,
                complete,
                snapshot_index,
                response,
            });
        });
    }

    pub(crate) fn handle_append_outcome(
        &mut self,
        term: Term,
        member: MemberId,
        sent_last: LogIndex,
        response: Result<AppendResponse>,
    ) {
        if self.role != RoleKind::Leader || term != self.meta.current_term() {
            return;
        }
        let last_index = self.log.last_index();
        let Some(leader) = self.leader.as_mut() else {
            return;
        };
        leader.in_flight.remove(&member);

        let response = match response {
            Ok(response) => response,
            // Transport failure or timeout; the next heartbeat retries.
            Err(_) => return,
        };

        if response.term > term {
            self.step_down(response.term);
            return;
        }
        leader.last_contact.insert(member, Instant::now());

        if response.succeeded {
            let matched = leader.match_index.entry(member).or_insert(0);
            *matched = (*matched).max(sent_last);
            leader.next_index.insert(member, sent_last + 1);
            let more = sent_last < last_index;

            self.try_advance_commit();
            if more {
                self.replicate(member);
            }
        } else {
            // Back off using the follower's hint and retry at once.
            let current_next = leader.next_index.get(&member).copied().unwrap_or(1);
            let backed_off = current_next
                .saturating_sub(1)
                .min(response.log_index + 1)
                .max(1);
            leader.next_index.insert(member, backed_off);
            self.replicate(member);
        }
    }

    pub(crate) fn handle_install_outcome(
        &mut self,
        term: Term,
        member: MemberId,
        sent_to_offset: u32,
        complete: bool,
        snapshot_index: LogIndex,
        response: Result<InstallResponse>,
    ) {
        if self.role != RoleKind::Leader || term != self.meta.current_term() {
            return;
        }
        let Some(leader) = self.leader.as_mut() else {
            return;
        };
        leader.in_flight.remove(&member);

        let response = match response {
            Ok(response) => response,
            Err(_) => return,
        };
        if response.term > term {
            self.step_down(response.term);
            return;
        }
        leader.last_contact.insert(member, Instant::now());

        if response.succeeded {
            if complete {
                leader.installing.remove(&member);
                leader.next_index.insert(member, snapshot_index + 1);
                let matched = leader.match_index.entry(member).or_insert(0);
                *matched = (*matched).max(snapshot_index);
                self.try_advance_commit();
                self.replicate(member);
            } else {
                if let Some(install) = leader.installing.get_mut(&member) {
                    install.offset = sent_to_offset;
                }
                self.replicate(member);
            }
        } else {
            // The follower told us which offset it expects.
            if let Some(install) = leader.installing.get_mut(&member) {
                install.offset = response.next_offset;
            }
            self.replicate(member);
        }
    }

    /// Advances the commit index to the highest entry of the current
    /// term replicated on a quorum, then applies.
    pub(crate) fn try_advance_commit(&mut self) {
        if self.role != RoleKind::Leader {
            return;
        }
        let term = self.meta.current_term();
        let last_index = self.log.last_index();
        let Some(leader) = self.leader.as_ref() else {
            return;
        };
        let config = self.cluster.current();

        let mut indexes: Vec<LogIndex> = config
            .voting_members()
            .map(|m| {
                if m.id == self.id {
                    last_index
                } else {
                    leader.match_index.get(&m.id).copied().unwrap_or(0)
                }
            })
            .collect();
        let quorum = config.quorum_size();
        if indexes.len() < quorum {
            return;
        }
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        let replicated = indexes[quorum - 1];

        if replicated <= self.log.commit_index() {
            return;
        }
        // Entries from prior terms commit only through an entry of the
        // current term.
        match self.log.term_at(replicated) {
            Ok(Some(entry_term)) if entry_term == term => {
                self.log.commit(replicated);
                self.apply_committed();
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------
    // Membership changes
    // -----------------------------------------------------------------

    pub(crate) fn handle_join(
        &mut self,
        request: JoinRequest,
        reply: oneshot::Sender<Result<JoinResponse>>,
    ) {
        if self.role != RoleKind::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }
        let member = request.member;
        if let Some(existing) = self.cluster.current().member(member.id) {
            if existing.kind == member.kind {
                let _ = reply.send(Ok(JoinResponse {
                    index: self.cluster.current().index,
                    members: self.cluster.current().members.clone(),
                }));
                return;
            }
        }
        let members = self.cluster.current().with_member(member, 0).members;
        self.append_configuration(members, ConfigReply::Join(reply), Some(member.id));
    }

    pub(crate) fn handle_leave(
        &mut self,
        request: LeaveRequest,
        reply: oneshot::Sender<Result<LeaveResponse>>,
    ) {
        if self.role != RoleKind::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }
        if !self.cluster.current().contains(request.member) {
            let _ = reply.send(Ok(LeaveResponse {
                index: self.cluster.current().index,
                members: self.cluster.current().members.clone(),
            }));
            return;
        }
        let members = self
            .cluster
            .current()
            .without_member(request.member, 0)
            .members;
        self.append_configuration(members, ConfigReply::Leave(reply), None);
    }

    pub(crate) fn handle_reconfigure(
        &mut self,
        request: ReconfigureRequest,
        reply: oneshot::Sender<Result<ReconfigureResponse>>,
    ) {
        if self.role != RoleKind::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }
        if !self.cluster.current().contains(request.member.id) {
            let _ = reply.send(Err(RaftError::IllegalMember));
            return;
        }
        let members = self.cluster.current().with_member(request.member, 0).members;
        self.append_configuration(members, ConfigReply::Reconfigure(reply), None);
    }

    /// Appends a configuration entry; the new member set takes effect
    /// immediately. Only one change may be outstanding.
    fn append_configuration(
        &mut self,
        members: Vec<crate::cluster::Member>,
        reply: ConfigReply,
        added: Option<MemberId>,
    ) {
        if self.cluster.change_pending() {
            fail_config(
                reply,
                RaftError::Unavailable("configuration change in progress".into()),
            );
            return;
        }
        match self.leader_append(EntryKind::Configuration {
            members: members.clone(),
        }) {
            Ok(index) => {
                self.cluster.append(Configuration { index, members });
                let log_next = self.log.next_index();
                if let Some(leader) = self.leader.as_mut() {
                    leader.pending_config = Some((index, reply));
                    if let Some(added) = added {
                        leader.next_index.entry(added).or_insert(log_next);
                        leader.match_index.entry(added).or_insert(0);
                        leader.last_contact.insert(added, Instant::now());
                    }
                }
                self.check_membership_role();
                self.after_append();
            }
            Err(err) => fail_config(reply, err),
        }
    }
}

fn fail_config(reply: ConfigReply, error: RaftError) {
    match reply {
        ConfigReply::Join(reply) => {
            let _ = reply.send(Err(error));
        }
        ConfigReply::Leave(reply) => {
            let _ = reply.send(Err(error));
        }
        ConfigReply::Reconfigure(reply) => {
            let _ = reply.send(Err(error));
        }
    }
}
