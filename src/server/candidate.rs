//! Candidate role: term-incrementing elections.

use std::collections::HashSet;

use crate::error::{RaftError, Result};
use crate::protocol::message::{VoteRequest, VoteResponse};
use crate::server::{CandidateState, RoleKind, ServerActor, ServerMessage};
use crate::{MemberId, Term};

impl ServerActor {
    /// Starts an election: increments the term, votes for itself, and
    /// solicits votes from every other voting member.
    pub(crate) fn start_election(&mut self) {
        let term = self.meta.current_term() + 1;
        if let Err(err) = self.meta.store_term(term) {
            self.fail_storage(&err);
            return;
        }
        if let Err(err) = self.meta.store_vote(self.id) {
            self.fail_storage(&err);
            return;
        }

        self.leader_hint = None;
        self.transition_to(RoleKind::Candidate);
        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.candidate = Some(CandidateState { votes });

        slog::info!(self.logger, "Starting election"; "term" => term);

        if self.has_vote_quorum() {
            self.become_leader();
            return;
        }

        let last_log_index = self.log.last_index();
        let last_log_term = match self.log.last_term() {
            Ok(log_term) => log_term,
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
            let request = match VoteRequest::builder()
                .term(term)
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
                    match tokio::time::timeout(timeout, protocol.vote(peer, request)).await {
                        Ok(result) => result,
                        Err(_) => Err(RaftError::Timeout),
                    };
                context.submit(ServerMessage::VoteOutcome {
                    term,
                    from: peer,
                    response,
                });
            });
        }
    }

    pub(crate) fn handle_vote_outcome(
        &mut self,
        term: Term,
        from: MemberId,
        response: Result<VoteResponse>,
    ) {
        if self.role != RoleKind::Candidate || term != self.meta.current_term() {
            return;
        }
        let Ok(response) = response else {
            return;
        };
        if response.term > self.meta.current_term() {
            self.step_down(response.term);
            return;
        }
        if !response.voted {
            return;
        }
        if let Some(candidate) = self.candidate.as_mut() {
            candidate.votes.insert(from);
        }
        if self.has_vote_quorum() {
            self.become_leader();
        }
    }

    fn has_vote_quorum(&self) -> bool {
        let votes = self
            .candidate
            .as_ref()
            .map(|c| c.votes.len())
            .unwrap_or(0);
        votes >= self.cluster.current().quorum_size()
    }
}
