//! Cache primitives: key derivation, the volatile tier, policies and the
//! recompute decision table.
//!
//! ## Configuration
//!
//! Engine-wide defaults come from `tierstash.toml`:
//!
//! ```toml
//! [cache]
//! namespace = "shop"
//! volatile_capacity = 10000
//! worker_concurrency = 4
//! default_recompute = "auto"
//! default_expiry = "10m"
//! ```

pub mod codec;
mod config;
mod keys;
mod lock;
mod policy;
mod store;

pub use codec::CodecError;
pub use config::CacheConfig;
pub use keys::{ArgToken, derive_key, summarize_args};
pub use policy::{
    Decision, Lookup, Policy, PolicyBuilder, PolicyOverride, decide, expires_hint, is_stale,
    is_stale_at,
};
pub use store::{VolatileEntry, VolatileStore};
