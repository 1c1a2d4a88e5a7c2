use crate::domain::WorkflowKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifies one workflow instance.
///
/// The id is a SHA-256 hash derived from the instance's defining inputs,
/// so starting the same workflow with the same client token yields the
/// same id: idempotent start falls out of the derivation.
///
/// Display: hex of the first 6 bytes (`"a1b2c3d4e5f6"`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId([u8; 32]);

impl InstanceId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive an instance id from its defining inputs.
    ///
    /// Computes `SHA-256(kind_len || kind || token_len || token)`.
    /// Each field is length-prefixed (little-endian u32) to prevent
    /// concatenation collisions.
    pub fn derive(kind: WorkflowKind, client_token: &str) -> Self {
        let mut hasher = Sha256::new();

        let kind_bytes = kind.as_str().as_bytes();
        hasher.update((kind_bytes.len() as u32).to_le_bytes());
        hasher.update(kind_bytes);

        let token_bytes = client_token.as_bytes();
        hasher.update((token_bytes.len() as u32).to_le_bytes());
        hasher.update(token_bytes);

        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full 64-character hex form, used as the key for provider-side rows.
    pub fn full_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

/// Identifies one event record.
///
/// Derived from `(instance_id, version)`, so a retried append after an
/// ambiguous IO failure produces the same id and the store can detect
/// the duplicate instead of double-writing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId([u8; 32]);

impl EventId {
    pub fn derive(instance: &InstanceId, version: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(instance.as_bytes());
        hasher.update(version.to_le_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_token_same_id() {
        let a = InstanceId::derive(WorkflowKind::Investment, "tok-1");
        let b = InstanceId::derive(WorkflowKind::Investment, "tok-1");
        assert_eq!(a, b);
    }

    #[test]
    fn kind_participates_in_derivation() {
        let a = InstanceId::derive(WorkflowKind::Investment, "tok-1");
        let b = InstanceId::derive(WorkflowKind::Nda, "tok-1");
        assert_ne!(a, b);
    }

    #[test]
    fn length_prefixing_prevents_concatenation_collisions() {
        let a = InstanceId::derive(WorkflowKind::Production, "ab");
        let b = InstanceId::derive(WorkflowKind::Production, "a");
        assert_ne!(a, b);
    }

    #[test]
    fn event_ids_are_deterministic_per_version() {
        let instance = InstanceId::derive(WorkflowKind::Nda, "tok");
        assert_eq!(EventId::derive(&instance, 3), EventId::derive(&instance, 3));
        assert_ne!(EventId::derive(&instance, 3), EventId::derive(&instance, 4));
    }

    #[test]
    fn full_hex_is_the_whole_digest() {
        let instance = InstanceId::from_bytes([0x5c; 32]);
        let hex = instance.full_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("5c5c"));
    }

    #[test]
    fn display_is_short_hex() {
        let instance = InstanceId::from_bytes([0xab; 32]);
        assert_eq!(instance.to_string(), "abababababab");
    }
}
