//! Cluster membership and configuration.
//!
//! A configuration is the committed member set plus the log index of the
//! `configuration` entry that produced it. Configuration changes are
//! ordinary log entries and take effect when appended, not when
//! committed, so at most one change can be outstanding at a time.

use serde::{Deserialize, Serialize};

use crate::{LogIndex, MemberId};

/// How a member participates in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// Votes in elections and replicates the log.
    Active,
    /// Replicates the log but never votes or leads.
    Passive,
    /// Member of record; not replicated to until promoted.
    Reserve,
}

/// A single cluster member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub kind: MemberKind,
}

impl Member {
    pub fn active(id: MemberId) -> Self {
        Self {
            id,
            kind: MemberKind::Active,
        }
    }

    pub fn passive(id: MemberId) -> Self {
        Self {
            id,
            kind: MemberKind::Passive,
        }
    }

    pub fn reserve(id: MemberId) -> Self {
        Self {
            id,
            kind: MemberKind::Reserve,
        }
    }

    pub fn is_voting(&self) -> bool {
        self.kind == MemberKind::Active
    }
}

/// A member set tagged with the index of the entry that created it.
/// The bootstrap configuration carries index 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub index: LogIndex,
    pub members: Vec<Member>,
}

impl Configuration {
    pub fn bootstrap(members: Vec<Member>) -> Self {
        Self { index: 0, members }
    }

    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.member(id).is_some()
    }

    /// Members that vote in elections and count toward the quorum.
    pub fn voting_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.is_voting())
    }

    /// Members the leader replicates to (everything but reserves).
    pub fn replicated_members(&self) -> impl Iterator<Item = &Member> {
        self.members
            .iter()
            .filter(|m| m.kind != MemberKind::Reserve)
    }

    /// Majority size over the voting members.
    pub fn quorum_size(&self) -> usize {
        self.voting_members().count() / 2 + 1
    }

    pub fn is_voting(&self, id: MemberId) -> bool {
        self.member(id).map(|m| m.is_voting()).unwrap_or(false)
    }

    /// Returns a copy with `member` added or replaced.
    pub fn with_member(&self, member: Member, index: LogIndex) -> Configuration {
        let mut members: Vec<Member> =
            self.members.iter().copied().filter(|m| m.id != member.id).collect();
        members.push(member);
        Configuration { index, members }
    }

    /// Returns a copy without the given member.
    pub fn without_member(&self, id: MemberId, index: LogIndex) -> Configuration {
        Configuration {
            index,
            members: self.members.iter().copied().filter(|m| m.id != id).collect(),
        }
    }
}

/// Per-server view of the configuration log.
///
/// Keeps every configuration seen since the last snapshot so that
/// truncating an uncommitted change can revert to the predecessor.
#[derive(Clone, Debug)]
pub struct ClusterState {
    history: Vec<Configuration>,
    committed: LogIndex,
}

impl ClusterState {
    pub fn new(bootstrap: Configuration) -> Self {
        Self {
            history: vec![bootstrap],
            committed: 0,
        }
    }

    /// The effective configuration (latest appended).
    pub fn current(&self) -> &Configuration {
        self.history.last().expect("configuration history is never empty")
    }

    /// Index of the last committed configuration entry.
    pub fn committed_index(&self) -> LogIndex {
        self.committed
    }

    /// Whether a configuration entry is appended but not yet committed.
    pub fn change_pending(&self) -> bool {
        self.current().index > self.committed
    }

    /// Records a configuration entry at append time.
    pub fn append(&mut self, configuration: Configuration) {
        self.history.push(configuration);
    }

    /// Marks configurations at or below `index` committed.
    pub fn commit(&mut self, index: LogIndex) {
        if self.current().index <= index && self.current().index > self.committed {
            self.committed = self.current().index;
        }
        // Configurations older than the committed one can no longer be
        // reverted; drop them to bound the history.
        while self.history.len() > 1 && self.history[1].index <= self.committed {
            self.history.remove(0);
        }
    }

    /// Reverts configurations recorded above `index` after a log
    /// truncation.
    pub fn truncate(&mut self, index: LogIndex) {
        while self.history.len() > 1 && self.current().index > index {
            self.history.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node() -> Configuration {
        Configuration::bootstrap(vec![
            Member::active(1),
            Member::active(2),
            Member::active(3),
        ])
    }

    #[test]
    fn test_quorum_sizes() {
        assert_eq!(three_node().quorum_size(), 2);

        let single = Configuration::bootstrap(vec![Member::active(1)]);
        assert_eq!(single.quorum_size(), 1);

        let mixed = Configuration::bootstrap(vec![
            Member::active(1),
            Member::active(2),
            Member::passive(3),
            Member::reserve(4),
        ]);
        // Only active members vote.
        assert_eq!(mixed.quorum_size(), 2);
        assert_eq!(mixed.replicated_members().count(), 3);
    }

    #[test]
    fn test_append_commit_and_revert() {
        let mut state = ClusterState::new(three_node());
        assert!(!state.change_pending());

        let joined = state.current().with_member(Member::active(4), 10);
        state.append(joined);
        assert!(state.change_pending());
        assert_eq!(state.current().members.len(), 4);

        // Leader lost before commit; truncation reverts the change.
        state.truncate(9);
        assert_eq!(state.current().members.len(), 3);
        assert!(!state.change_pending());

        let joined = state.current().with_member(Member::active(4), 12);
        state.append(joined);
        state.commit(12);
        assert!(!state.change_pending());
        assert_eq!(state.committed_index(), 12);
        assert!(state.current().contains(4));
    }
}
