//! Controller components, the contracts they drive, and the local backend
//! implementing those contracts.

pub mod controller;
pub mod gateways;
pub mod launcher;
pub mod ledger;
pub mod local;
pub mod manifest_reader;
pub mod reconciler;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod selector;

#[cfg(test)]
pub(crate) mod testing;
