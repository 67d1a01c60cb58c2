use crate::domain::user::UserId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendshipStatus {
    Pending,
    Accepted,
    Blocked,
}

impl FriendshipStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Blocked => "blocked",
        }
    }
}

impl std::str::FromStr for FriendshipStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "blocked" => Ok(Self::Blocked),
            other => Err(format!("unknown friendship status: {other}")),
        }
    }
}

/// A directed friendship row. The relation it encodes is symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendshipEdge {
    pub requester_id: UserId,
    pub addressee_id: UserId,
    pub status: FriendshipStatus,
}

impl FriendshipEdge {
    /// The other endpoint, if `user` is part of this edge.
    #[must_use]
    pub fn other(&self, user: UserId) -> Option<UserId> {
        if self.requester_id == user {
            Some(self.addressee_id)
        } else if self.addressee_id == user {
            Some(self.requester_id)
        } else {
            None
        }
    }
}

/// Accepted friends of `user`, whichever side of the edge they sit on.
#[must_use]
pub fn friend_set<'a, I>(user: UserId, edges: I) -> BTreeSet<UserId>
where
    I: IntoIterator<Item = &'a FriendshipEdge>,
{
    edges
        .into_iter()
        .filter(|edge| edge.status == FriendshipStatus::Accepted)
        .filter_map(|edge| edge.other(user))
        .filter(|other| *other != user)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(requester: i64, addressee: i64, status: FriendshipStatus) -> FriendshipEdge {
        FriendshipEdge { requester_id: UserId(requester), addressee_id: UserId(addressee), status }
    }

    #[test]
    fn test_friend_set_is_symmetric_and_accepted_only() {
        let edges = [
            edge(1, 2, FriendshipStatus::Accepted),
            edge(3, 1, FriendshipStatus::Accepted),
            edge(1, 4, FriendshipStatus::Pending),
            edge(5, 1, FriendshipStatus::Blocked),
            edge(6, 7, FriendshipStatus::Accepted),
        ];
        let friends = friend_set(UserId(1), &edges);
        assert_eq!(friends.into_iter().collect::<Vec<_>>(), vec![UserId(2), UserId(3)]);
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let edges = [edge(1, 2, FriendshipStatus::Accepted), edge(2, 1, FriendshipStatus::Accepted)];
        assert_eq!(friend_set(UserId(1), &edges).len(), 1);
    }

    #[test]
    fn test_no_edges_means_no_friends() {
        assert!(friend_set(UserId(1), &Vec::<FriendshipEdge>::new()).is_empty());
    }
}
