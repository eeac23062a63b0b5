//! Cache records as they move between the engine and the storage tiers.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::types::RecordSource;

/// Fixed-length fingerprint addressing one cached result in every tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Printable length of a derived key (96 bits, URL-safe base64).
    pub const LEN: usize = 16;

    /// Wrap a key read back from storage or supplied by an operator.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identity of a cached function: declaring module plus function name.
///
/// Changing the function body does not change this identity; bump the policy
/// version to invalidate old results.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionId {
    module: String,
    name: String,
}

impl FunctionId {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// Build a [`FunctionId`] for `name` in the calling module.
#[macro_export]
macro_rules! function_id {
    ($name:expr) => {
        $crate::domain::entities::FunctionId::new(module_path!(), $name)
    };
}

/// A cached value read from one of the tiers.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub key: CacheKey,
    pub value: Bytes,
    pub modified_at: OffsetDateTime,
    /// `None` means the record never expires.
    pub expires_hint: Option<OffsetDateTime>,
    pub effort: f64,
    pub source: RecordSource,
}

/// A write-back payload. The volatile tier keeps only `modified_at` and `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub function: String,
    pub version: String,
    pub namespace: String,
    pub key: CacheKey,
    pub effort: f64,
    pub modified_at: OffsetDateTime,
    pub expires_hint: Option<OffsetDateTime>,
    pub value: Bytes,
}

impl CacheEntry {
    pub fn into_record(self, source: RecordSource) -> CacheRecord {
        CacheRecord {
            key: self.key,
            value: self.value,
            modified_at: self.modified_at,
            expires_hint: self.expires_hint,
            effort: self.effort,
            source,
        }
    }
}
