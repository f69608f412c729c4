//! Strong type definitions for meshsync.
//!
//! Identifiers are newtypes so a peer id can never be passed where an object
//! id is expected.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{CoreError, Result};

/// Milliseconds on the caller's monotonic clock.
pub type Millis = u64;

/// Identity of a participant as assigned by the relay.
///
/// Identities are usually decimal strings. Ordering between two identities
/// is numeric when both parse as integers and lexical otherwise, so "9" sorts
/// before "10". Every tie-break in the workspace uses [`PeerId::cmp_identity`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id, rejecting empty strings.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CoreError::InvalidPeerId(id));
        }
        Ok(Self(id))
    }

    /// Get the raw identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Total identity ordering shared by every observer.
    pub fn cmp_identity(&self, other: &PeerId) -> Ordering {
        let numeric = match (self.0.parse::<u128>(), other.0.parse::<u128>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => Ordering::Equal,
        };
        numeric.then_with(|| self.0.cmp(&other.0))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_identity(other)
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a shared world object (vehicle, cart, artillery, resource).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// World-space position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Key of the horizontal spatial cell a position falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub x: i32,
    pub z: i32,
}

impl CellKey {
    /// Cell containing `position` for square cells of side `cell_size`.
    pub fn from_position(position: Vec3, cell_size: f32) -> Self {
        Self {
            x: (position.x / cell_size).floor() as i32,
            z: (position.z / cell_size).floor() as i32,
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identity_numeric_ordering() {
        let nine = PeerId::from("9");
        let ten = PeerId::from("10");
        assert_eq!(nine.cmp_identity(&ten), Ordering::Less);
        assert!(ten > nine);
    }

    #[test]
    fn test_identity_lexical_fallback() {
        let a = PeerId::from("alpha");
        let b = PeerId::from("beta");
        assert_eq!(a.cmp_identity(&b), Ordering::Less);
    }

    #[test]
    fn test_identity_leading_zero_is_not_equal() {
        let a = PeerId::from("05");
        let b = PeerId::from("5");
        assert_ne!(a.cmp_identity(&b), Ordering::Equal);
    }

    #[test]
    fn test_empty_peer_id_rejected() {
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new("7").is_ok());
    }

    #[test]
    fn test_cell_key_negative_coordinates() {
        let key = CellKey::from_position(Vec3::new(-1.0, 0.0, 65.0), 64.0);
        assert_eq!(key, CellKey { x: -1, z: 1 });
        assert_eq!(key.to_string(), "-1,1");
    }

    #[test]
    fn test_peer_id_serializes_as_string() {
        let json = serde_json::to_string(&PeerId::from("42")).unwrap();
        assert_eq!(json, "\"42\"");
    }

    proptest! {
        #[test]
        fn identity_ordering_is_antisymmetric(a in "[0-9a-z]{1,6}", b in "[0-9a-z]{1,6}") {
            let a = PeerId::from(a);
            let b = PeerId::from(b);
            prop_assert_eq!(a.cmp_identity(&b), b.cmp_identity(&a).reverse());
        }
    }
}
