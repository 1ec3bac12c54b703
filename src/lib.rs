//! Real-time session relay.
//!
//! Producers append messages to a session store; a broadcast hub fans events
//! out to every connected dashboard; dashboards hold a reconnecting channel to
//! the hub and reconcile their view against the store.

pub mod app;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod frame;
pub mod hub;
pub mod store;
pub mod timestamp;
pub mod types;
