//! A client that keeps a service instance registered with a discovery server:
//! registration, heartbeats, re-registration on failure and registry polling.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod heartbeat;
pub mod poller;
pub mod registration;
pub mod schedule;
pub mod service;
