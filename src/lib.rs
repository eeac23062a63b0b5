//! Two-tier function result cache: a volatile in-process LRU in front of a
//! durable Postgres table, with per-function recompute policies, background
//! refresh and a row-lock stampede guard.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
