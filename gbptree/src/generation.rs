//! Stable/unstable generation pair.
//!
//! A tree is always written in its unstable generation. Checkpoint turns the
//! unstable generation into the new stable one. Pages written in a generation
//! that never became stable (the process died before its checkpoint) are
//! "crashed" and get reclaimed by recovery cleanup.

/// Generation of a freshly created tree's first stable state.
pub const MIN_GENERATION: u32 = 1;

/// A packed `(stable, unstable)` generation pair.
///
/// Stable lives in the high 32 bits, unstable in the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(u64);

impl Generation {
    /// Pack a generation pair.
    #[must_use]
    pub const fn new(stable: u32, unstable: u32) -> Self {
        Self(((stable as u64) << 32) | unstable as u64)
    }

    /// Generation pair of a tree that was just created.
    #[must_use]
    pub const fn initial() -> Self {
        Self::new(MIN_GENERATION, MIN_GENERATION + 1)
    }

    /// Rebuild from the packed form.
    #[must_use]
    pub const fn from_packed(packed: u64) -> Self {
        Self(packed)
    }

    /// The packed form.
    #[must_use]
    pub const fn packed(self) -> u64 {
        self.0
    }

    /// The last checkpointed generation.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn stable(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The generation currently being written.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn unstable(self) -> u32 {
        self.0 as u32
    }

    /// Pair after a successful checkpoint: unstable becomes stable and a new
    /// unstable generation begins.
    #[must_use]
    pub const fn after_checkpoint(self) -> Self {
        let stable = self.unstable();
        Self::new(stable, stable + 1)
    }

    /// Pair after opening a tree that was not shut down cleanly. The skipped
    /// generation marks everything written since the last checkpoint as
    /// crashed.
    #[must_use]
    pub const fn after_crash(self) -> Self {
        Self::new(self.stable(), self.unstable() + 1)
    }

    /// Whether a node written in `node_generation` must be copied before it is
    /// modified.
    #[must_use]
    pub const fn needs_successor(self, node_generation: u32) -> bool {
        node_generation < self.unstable()
    }

    /// Whether `node_generation` belongs to a generation that was never
    /// checkpointed.
    #[must_use]
    pub const fn is_crashed(self, node_generation: u32) -> bool {
        node_generation > self.stable() && node_generation < self.unstable()
    }

    /// Whether an id released in `release_generation` can be handed out again.
    #[must_use]
    pub const fn is_reusable(self, release_generation: u32) -> bool {
        release_generation <= self.stable()
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.stable(), self.unstable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack() {
        let generation = Generation::new(7, 8);
        assert_eq!(generation.stable(), 7);
        assert_eq!(generation.unstable(), 8);
        assert_eq!(Generation::from_packed(generation.packed()), generation);

        let extreme = Generation::new(u32::MAX - 1, u32::MAX);
        assert_eq!(extreme.stable(), u32::MAX - 1);
        assert_eq!(extreme.unstable(), u32::MAX);
    }

    #[test]
    fn test_checkpoint_advances_both() {
        let generation = Generation::initial().after_checkpoint();
        assert_eq!(generation.stable(), MIN_GENERATION + 1);
        assert_eq!(generation.unstable(), MIN_GENERATION + 2);
    }

    #[test]
    fn test_crash_leaves_gap() {
        let generation = Generation::new(4, 5).after_crash();
        assert_eq!(generation, Generation::new(4, 6));
        assert!(generation.is_crashed(5));
        assert!(!generation.is_crashed(4));
        assert!(!generation.is_crashed(6));

        // The gap is closed again by the next checkpoint.
        let next = generation.after_checkpoint();
        assert_eq!(next, Generation::new(6, 7));
        assert!(!next.is_crashed(5));
    }

    #[test]
    fn test_successor_and_reuse_rules() {
        let generation = Generation::new(3, 4);
        assert!(generation.needs_successor(3));
        assert!(generation.needs_successor(1));
        assert!(!generation.needs_successor(4));

        assert!(generation.is_reusable(3));
        assert!(!generation.is_reusable(4));
    }
}
