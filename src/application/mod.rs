//! Application layer: storage contracts, the execution engine and its
//! background machinery.

pub mod engine;
pub mod error;
pub mod guard;
pub mod kv;
pub mod repos;
pub mod worker;
