//! Cache key derivation.
//!
//! A key is a fingerprint of `{namespace + prefix, version, function identity,
//! argument tokens}`: the ordered list is serialized as JSON, hashed with
//! SHA-256, and the first 96 bits are encoded as 16 URL-safe characters.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::domain::entities::{CacheKey, FunctionId};
use crate::domain::identity::HasStableIdentity;

const KEY_TAG: &str = "tierstash";
const KEY_DIGEST_BYTES: usize = 12;

/// Key material contributed by one call argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgToken {
    /// An argument that keys by its surrogate identity.
    Identity { kind: &'static str, id: u64 },
    /// An argument that keys by its canonical text.
    Plain(String),
}

impl ArgToken {
    pub fn identity<T: HasStableIdentity + ?Sized>(value: &T) -> Self {
        Self::Identity {
            kind: short_type_name::<T>(),
            id: value.stable_identity().get(),
        }
    }

    pub fn plain(value: impl fmt::Display) -> Self {
        Self::Plain(value.to_string())
    }

    /// Key by canonical JSON. Never fails: unserializable values fall back to a
    /// lossy per-type token.
    pub fn serialized<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(text) => Self::Plain(text),
            Err(err) => {
                let kind = short_type_name::<T>();
                warn!(
                    target = "tierstash::cache::keys",
                    kind,
                    error = %err,
                    "argument has no stable serialized form; using lossy key token"
                );
                Self::Plain(format!("<unserializable:{kind}>"))
            }
        }
    }

    /// Text hashed into the key.
    ///
    /// An identity token deliberately keys the same as a plain token holding
    /// the surrogate's hex text.
    pub fn key_part(&self) -> String {
        match self {
            ArgToken::Identity { id, .. } => format!("{id:x}"),
            ArgToken::Plain(text) => text.clone(),
        }
    }

    /// Human-readable form for logs.
    pub fn summary(&self) -> String {
        match self {
            ArgToken::Identity { kind, id } => format!("{kind}<{id:x}>"),
            ArgToken::Plain(text) => format!("{text:?}"),
        }
    }
}

impl From<&str> for ArgToken {
    fn from(value: &str) -> Self {
        Self::Plain(value.to_string())
    }
}

impl From<String> for ArgToken {
    fn from(value: String) -> Self {
        Self::Plain(value)
    }
}

impl From<&String> for ArgToken {
    fn from(value: &String) -> Self {
        Self::Plain(value.clone())
    }
}

macro_rules! plain_from_display {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ArgToken {
                fn from(value: $ty) -> Self {
                    Self::plain(value)
                }
            }
        )*
    };
}

plain_from_display!(i32, i64, u32, u64, usize, bool, char);

/// Derive the fingerprint for one call.
///
/// `function` is `None` for keys that are not tied to a cached function (the
/// key/value store).
pub fn derive_key(
    namespace: &str,
    prefix: &str,
    version: &str,
    function: Option<&FunctionId>,
    args: &[ArgToken],
) -> CacheKey {
    let mut parts: Vec<String> = Vec::with_capacity(args.len() + 4);
    parts.push(KEY_TAG.to_string());
    parts.push(format!("{namespace}{prefix}"));
    parts.push(version.to_string());
    parts.push(function.map(ToString::to_string).unwrap_or_default());
    parts.extend(args.iter().map(ArgToken::key_part));

    // A list of strings always serializes.
    let material = serde_json::to_vec(&parts).unwrap_or_else(|_| parts.concat().into_bytes());

    let mut hasher = Sha256::new();
    hasher.update(&material);
    let digest = hasher.finalize();

    CacheKey::from_stored(URL_SAFE_NO_PAD.encode(&digest[..KEY_DIGEST_BYTES]))
}

/// Format an argument list for log lines, e.g. `("alice", User<1f>)`.
pub fn summarize_args(args: &[ArgToken]) -> String {
    let parts: Vec<String> = args.iter().map(ArgToken::summary).collect();
    format!("({})", parts.join(", "))
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
