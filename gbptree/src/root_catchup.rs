//! Catching up with a root that moved while a traversal started.

use crate::error::{Result, TreeError};
use crate::page::PageId;

/// Latching the root and re-reading the root id is retried at most this many
/// times per descent.
pub const MAX_TRIP_COUNT: usize = 10;

/// Root id and the generation it was published in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
    pub id: PageId,
    pub generation: u32,
}

/// Counts attempts at pinning a root that stays current. A root that keeps
/// changing under the traversal for [`MAX_TRIP_COUNT`] attempts is reported
/// as a tree inconsistency.
#[derive(Debug)]
pub struct TripCountingRootCatchup {
    trips: usize,
    last_seen: Option<Root>,
}

impl TripCountingRootCatchup {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            trips: 0,
            last_seen: None,
        }
    }

    /// Register one more attempt at the root `root`.
    pub fn catch_up(&mut self, root: Root) -> Result<Root> {
        self.trips += 1;
        if self.trips > MAX_TRIP_COUNT {
            return Err(TreeError::TreeInconsistency(format!(
                "root moved {MAX_TRIP_COUNT} times during one traversal, last seen {:?}, now {root:?}",
                self.last_seen
            )));
        }
        self.last_seen = Some(root);
        Ok(root)
    }

    #[must_use]
    pub const fn trips(&self) -> usize {
        self.trips
    }
}

impl Default for TripCountingRootCatchup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_up_is_bounded() {
        let mut catchup = TripCountingRootCatchup::new();
        for id in 0..MAX_TRIP_COUNT as u64 {
            let root = Root {
                id: 10 + id,
                generation: 2,
            };
            assert_eq!(catchup.catch_up(root).expect("within bounds"), root);
        }
        let err = catchup
            .catch_up(Root {
                id: 99,
                generation: 3,
            })
            .expect_err("should give up");
        assert!(matches!(err, TreeError::TreeInconsistency(_)));
        assert_eq!(catchup.trips(), MAX_TRIP_COUNT + 1);
    }
}
