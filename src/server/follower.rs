//! Follower-side protocol handling: append, vote, poll, and snapshot
//! installation. Passive and reserve members share these handlers but
//! never start elections.

use crate::cluster::Configuration;
use crate::error::{RaftError, Result};
use crate::protocol::message::*;
use crate::server::{PollRound, RoleKind, ServerActor, ServerMessage};
use crate::storage::entry::EntryKind;
use crate::{MemberId, Term};

impl ServerActor {
    /// Handles a replication request from a leader.
    pub(crate) fn handle_append(&mut self, request: AppendRequest) -> Result<AppendResponse> {
        let current_term = self.meta.current_term();
        if request.term < current_term {
            return Ok(AppendResponse {
                term: current_term,
                succeeded: false,
                log_index: self.log.last_index(),
            });
        }
        if request.term > current_term {
            self.step_down(request.term);
        }
        let term = self.meta.current_term();

        // A valid leader exists for this term.
        self.leader_hint = Some(request.leader);
        if self.role == RoleKind::Candidate {
            self.transition_to(self.role_for_membership());
        }
        if self.role == RoleKind::Follower {
            self.arm_election_timer();
        }

        // Consistency check against the local entry at prev_log_index.
        if request.prev_log_index > self.log.last_index() {
            return Ok(AppendResponse {
                term,
                succeeded: false,
                log_index: self.log.last_index(),
            });
        }
        if request.prev_log_index > 0 {
            match self.log.term_at(request.prev_log_index)? {
                Some(local_term) if local_term == request.prev_log_term => {}
                _ => {
                    return Ok(AppendResponse {
                        term,
                        succeeded: false,
                        log_index: request.prev_log_index.saturating_sub(1),
                    });
                }
            }
        }

        for entry in &request.entries {
            match self.log.term_at(entry.index)? {
                Some(local_term) if local_term == entry.term() => {
                    // Already replicated; keep it.
                    continue;
                }
                Some(_) => {
                    // Divergent suffix: drop it, along with any
                    // configurations recorded past the divergence.
                    self.log.truncate(entry.index - 1)?;
                    self.cluster.truncate(entry.index - 1);
                    self.append_entry(entry)?;
                }
                None => {
                    self.append_entry(entry)?;
                }
            }
        }
        self.log.flush()?;

        let last = self.log.last_index();
        self.log.commit(request.commit_index.min(last));
        self.apply_committed();

        Ok(AppendResponse {
            term,
            succeeded: true,
            log_index: last,
        })
    }

    fn append_entry(&mut self, entry: &crate::storage::entry::Indexed) -> Result<()> {
        self.log.append_indexed(entry)?;
        // Configuration entries take effect on append, not commit.
        if let EntryKind::Configuration { members } = &entry.entry.kind {
            self.cluster.append(Configuration {
                index: entry.index,
                members: members.clone(),
            });
            self.check_membership_role();
        }
        Ok(())
    }

    /// Handles a vote request. Only active members grant votes.
    pub(crate) fn handle_vote(&mut self, request: VoteRequest) -> Result<VoteResponse> {
        let current_term = self.meta.current_term();
        if request.term < current_term {
            return Ok(VoteResponse {
                term: current_term,
                voted: false,
            });
        }
        if request.term > current_term {
            self.step_down(request.term);
        }
        let term = self.meta.current_term();

        if !matches!(self.role, RoleKind::Follower | RoleKind::Candidate) {
            // Passive and reserve members never vote.
            return Ok(VoteResponse { term, voted: false });
        }

        let can_vote = match self.meta.voted_for() {
            None => true,
            Some(candidate) => candidate == request.candidate,
        };
        let up_to_date = self.log_up_to_date(request.last_log_index, request.last_log_term)?;

        if can_vote && up_to_date {
            self.meta.store_vote(request.candidate)?;
            self.arm_election_timer();
            slog::debug!(self.logger, "Vote granted";
                "candidate" => request.candidate, "term" => term);
            Ok(VoteResponse { term, voted: true })
        } else {
            Ok(VoteResponse { term, voted: false })
        }
    }

    /// Handles a pre-vote probe. Nothing is persisted and no timers are
    /// touched; the check is purely whether the candidate could win.
    pub(crate) fn handle_poll(&mut self, request: PollRequest) -> Result<PollResponse> {
        let current_term = self.meta.current_term();
        let accepted = request.term >= current_term
            && self.log_up_to_date(request.last_log_index, request.last_log_term)?;
        Ok(PollResponse {
            term: current_term,
            accepted,
        })
    }

    fn log_up_to_date(&self, last_index: u64, last_term: Term) -> Result<bool> {
        let local_last = self.log.last_index();
        let local_term = self.log.last_term()?;
        Ok(last_term > local_term || (last_term == local_term && last_index >= local_last))
    }

    /// Handles one chunk of the snapshot install protocol.
    pub(crate) fn handle_install(&mut self, request: InstallRequest) -> Result<InstallResponse> {
        let current_term = self.meta.current_term();
        if request.term < current_term {
            return Ok(InstallResponse {
                term: current_term,
                succeeded: false,
                next_offset: 0,
            });
        }
        if request.term > current_term {
            self.step_down(request.term);
        }
        let term = self.meta.current_term();
        self.leader_hint = Some(request.leader);
        if self.role == RoleKind::Candidate {
            self.transition_to(self.role_for_membership());
        }
        if self.role == RoleKind::Follower {
            self.arm_election_timer();
        }

        // Start a new pending snapshot if this is a new transfer.
        let stale = match &self.pending_install {
            Some(progress) => {
                progress.id != request.snapshot_id || progress.index != request.snapshot_index
            }
            None => true,
        };
        if stale {
            if request.offset != 0 {
                return Ok(InstallResponse {
                    term,
                    succeeded: false,
                    next_offset: 0,
                });
            }
            let snapshot = self.snapshots.new_snapshot_with_id(
                request.snapshot_id,
                request.snapshot_index,
                request.snapshot_timestamp,
            )?;
            let writer = snapshot.writer()?;
            self.pending_install = Some(crate::server::InstallProgress {
                id: request.snapshot_id,
                index: request.snapshot_index,
                next_offset: 0,
                snapshot,
                writer: Some(writer),
            });
        }

        let progress = self.pending_install.as_mut().expect("install in progress");
        if request.offset != progress.next_offset {
            return Ok(InstallResponse {
                term,
                succeeded: false,
                next_offset: progress.next_offset,
            });
        }

        if let Some(writer) = progress.writer.as_mut() {
            writer.write(&request.data)?;
        }
        progress.next_offset += request.data.len() as u32;
        let next_offset = progress.next_offset;

        if request.complete {
            let progress = self.pending_install.take().expect("install in progress");
            if let Some(writer) = progress.writer {
                writer.close()?;
            }
            let snapshot = progress.snapshot.complete()?;

            // Load the snapshot into the applier, adopt its
            // configuration, then discard the log prefix it covers.
            let data = snapshot.reader()?.bytes().to_vec();
            let envelope: crate::server::SnapshotEnvelope = serde_json::from_slice(&data)?;
            let (index, snapshot_term) = self.applier.restore_with_term(&envelope.state)?;
            let config_index = envelope.configuration.index;
            self.cluster = crate::cluster::ClusterState::new(envelope.configuration);
            // A snapshotted configuration is committed by definition.
            self.cluster.commit(config_index);
            self.meta.store_config_index(config_index)?;
            self.check_membership_role();
            self.log.reset(index, snapshot_term)?;
            self.last_snapshot_index = index;
            self.last_applied_term = snapshot_term;
            self.snapshots.prune()?;
            slog::info!(self.logger, "Snapshot installed";
                "index" => index, "bytes" => data.len());
        }

        Ok(InstallResponse {
            term,
            succeeded: true,
            next_offset,
        })
    }

    /// Fires when no leader contact arrived within the election
    /// timeout. Runs the pre-vote round before any term is burned.
    pub(crate) fn handle_election_timeout(&mut self, round: u64) {
        if round != self.election_round {
            return;
        }
        match self.role {
            RoleKind::Follower => {
                if !self.cluster.current().is_voting(self.id) {
                    return;
                }
                self.start_poll_round();
            }
            RoleKind::Candidate => {
                // Election drew no quorum; try again in a fresh term.
                self.start_election();
            }
            _ => {}
        }
    }

    fn start_poll_round(&mut self) {
        let poll_term = self.meta.current_term() + 1;
        let mut accepts = std::collections::HashSet::new();
        accepts.insert(self.id);
        self.poll_round = Some(PollRound {
            term: poll_term,
            accepts,
        });
        self.arm_election_timer();

        let quorum = self.cluster.current().quorum_size();
        if self.poll_round.as_ref().map(|p| p.accepts.len()).unwrap_or(0) >= quorum {
            self.poll_round = None;
            self.start_election();
            return;
        }

        slog::debug!(self.logger, "Starting pre-vote round"; "term" => poll_term);
        let last_log_index = self.log.last_index();
        let last_log_term = match self.log.last_term() {
            Ok(term) => term,
            Err(err) => {
                self.fail_storage(&err);
                return;
            }
        };

        let peers: Vec<MemberId> = self
            .cluster
            .current()
            .voting_members()
            .map(|m| m.id)
            .filter(|&id| id != self.id)
            .collect();
        for peer in peers {
            let request = match PollRequest::builder()
                .term(poll_term)
                .candidate(self.id)
                .last_log(last_log_index, last_log_term)
                .build()
            {
                Ok(request) => request,
                Err(_) => continue,
            };
            let protocol = self.protocol.clone();
            let context = self.context.clone();
            let timeout = self.config.rpc_timeout;
            tokio::spawn(async move {
                let response =
                    match tokio::time::timeout(timeout, protocol.poll(peer, request)).await {
                        Ok(result) => result,
                        Err(_) => Err(RaftError::Timeout),
                    };
                context.submit(ServerMessage::PollOutcome {
                    term: poll_term,
                    from: peer,
                    response,
                });
            });
        }
    }

    pub(crate) fn handle_poll_outcome(
        &mut self,
        term: Term,
        from: MemberId,
        response: Result<PollResponse>,
    ) {
        if self.role != RoleKind::Follower {
            return;
        }
        let Some(poll) = self.poll_round.as_mut() else {
            return;
        };
        if poll.term != term {
            return;
        }
        let Ok(response) = response else {
            return;
        };
        if response.term > self.meta.current_term() {
            self.poll_round = None;
            self.step_down(response.term);
            return;
        }
        if !response.accepted {
            return;
        }
        poll.accepts.insert(from);
        if poll.accepts.len() >= self.cluster.current().quorum_size() {
            self.poll_round = None;
            self.start_election();
        }
    }
}
