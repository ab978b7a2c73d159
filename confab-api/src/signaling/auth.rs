//! Publish authorization boundary
//!
//! Who may join a room as a publisher is decided outside the signaling core.
//! The router only asks.

use confab_sfu::{RoomId, UserId};
use std::collections::HashSet;

pub trait PublishAuthorizer: Send + Sync {
    /// Whether the connection identified by `user_id` may publish in `room_id`
    fn can_publish(&self, user_id: Option<&UserId>, room_id: &RoomId) -> bool;
}

/// Config-driven policy: either everyone may publish, or only listed users
#[derive(Debug, Clone, Default)]
pub struct StaticPublishPolicy {
    open: bool,
    publishers: HashSet<UserId>,
}

impl StaticPublishPolicy {
    pub fn new(open: bool, publishers: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            open,
            publishers: publishers.into_iter().collect(),
        }
    }

    /// Anyone may publish anywhere
    #[must_use]
    pub fn open() -> Self {
        Self::new(true, [])
    }
}

impl PublishAuthorizer for StaticPublishPolicy {
    fn can_publish(&self, user_id: Option<&UserId>, _room_id: &RoomId) -> bool {
        self.open || user_id.is_some_and(|id| self.publishers.contains(id))
    }
}
