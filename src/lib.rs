//! Orchestrates server-side encryption across a bucket fleet: tagged buckets
//! get an inventory, each delivered inventory launches a batch copy-in-place
//! job, and each completion report is reconciled back into the catalog.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
