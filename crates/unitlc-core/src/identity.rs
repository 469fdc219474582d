//! # Identity Newtypes
//!
//! Typed handles for the objects the engine hands out. A [`UnitId`] names one
//! state machine instance; a unit URL that reaches Terminal and is requested
//! again gets a fresh `UnitId`. An [`OwnerId`] tags callback registrations
//! so a whole group can be withdrawn at once.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handle of one state machine instance. Allocated in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub u64);

impl UnitId {
    /// The raw sequence number.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Token identifying the owner of one or more callback registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    /// Generate a new random owner token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Access the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_tokens_are_unique() {
        assert_ne!(OwnerId::new(), OwnerId::new());
    }

    #[test]
    fn unit_ids_order_by_sequence() {
        assert!(UnitId(1) < UnitId(2));
        assert_eq!(UnitId(7).to_string(), "unit#7");
    }
}
