//! Communication strategies: which servers a client talks to, in what
//! order.

use crate::MemberId;

/// Server selection policy for client requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommunicationStrategy {
    /// Talk to the leader only; fail fast when it is unknown.
    LeaderOnly,
    /// Prefer the leader but fall back to any member.
    Any,
    /// Prefer followers; used to spread eventual-consistency reads.
    FollowersFirst,
}

impl CommunicationStrategy {
    /// Orders the known members for an attempt round. The leader hint
    /// is placed according to the strategy; unknown leaders simply drop
    /// out.
    pub fn order(&self, members: &[MemberId], leader: Option<MemberId>) -> Vec<MemberId> {
        let mut ordered = Vec::with_capacity(members.len());
        match self {
            CommunicationStrategy::LeaderOnly => {
                if let Some(leader) = leader {
                    ordered.push(leader);
                }
            }
            CommunicationStrategy::Any => {
                if let Some(leader) = leader {
                    ordered.push(leader);
                }
                for &member in members {
                    if Some(member) != leader {
                        ordered.push(member);
                    }
                }
            }
            CommunicationStrategy::FollowersFirst => {
                for &member in members {
                    if Some(member) != leader {
                        ordered.push(member);
                    }
                }
                if let Some(leader) = leader {
                    ordered.push(leader);
                }
            }
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leader_only() {
        let strategy = CommunicationStrategy::LeaderOnly;
        assert_eq!(strategy.order(&[1, 2, 3], Some(2)), vec![2]);
        assert!(strategy.order(&[1, 2, 3], None).is_empty());
    }

    #[test]
    fn test_any_prefers_leader() {
        let strategy = CommunicationStrategy::Any;
        assert_eq!(strategy.order(&[1, 2, 3], Some(2)), vec![2, 1, 3]);
        assert_eq!(strategy.order(&[1, 2, 3], None), vec![1, 2, 3]);
    }

    #[test]
    fn test_followers_first_puts_leader_last() {
        let strategy = CommunicationStrategy::FollowersFirst;
        assert_eq!(strategy.order(&[1, 2, 3], Some(2)), vec![1, 3, 2]);
    }
}
