//! Core data models for the encryption controller.
//!
//! These entities describe the buckets being enforced, the manifests that
//! drive the inventory → batch job → report chain, and the durable state the
//! controller keeps about that chain. They serialize naturally as JSON via
//! `serde`.

pub mod bucket;
pub mod event;
pub mod inventory;
pub mod job;
pub mod ledger;
pub mod manifest;
pub mod object;
pub mod partition;
