//! Lazily-assigned opaque identities for cache-key arguments.
//!
//! A type whose textual form is unstable (or expensive) opts in by embedding a
//! [`StableIdentity`] and implementing [`HasStableIdentity`]. The key deriver
//! then uses the surrogate instead of the value's text.

use std::sync::OnceLock;

use uuid::Uuid;

/// A random 64-bit surrogate, generated on first access and fixed afterwards.
///
/// Concurrent first accesses converge on a single value. Cloning shares the
/// assigned surrogate, so a clone keys identically to the original.
#[derive(Debug, Default)]
pub struct StableIdentity {
    cell: OnceLock<u64>,
}

impl StableIdentity {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Adopt a surrogate persisted elsewhere (e.g. to key across processes).
    pub fn from_raw(id: u64) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(id);
        Self { cell }
    }

    pub fn get(&self) -> u64 {
        *self.cell.get_or_init(random_u64)
    }

    pub fn is_assigned(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Lowercase hex form used as key material.
    pub fn to_hex(&self) -> String {
        format!("{:x}", self.get())
    }
}

impl Clone for StableIdentity {
    fn clone(&self) -> Self {
        Self::from_raw(self.get())
    }
}

/// Capability implemented by values that key by surrogate identity.
pub trait HasStableIdentity {
    fn stable_identity(&self) -> &StableIdentity;
}

impl HasStableIdentity for StableIdentity {
    fn stable_identity(&self) -> &StableIdentity {
        self
    }
}

fn random_u64() -> u64 {
    // v4 fixes the version nibble in the high half and the variant bits in the
    // low half; folding the halves keeps all 64 bits uniform.
    let (high, low) = Uuid::new_v4().as_u64_pair();
    high ^ low
}
