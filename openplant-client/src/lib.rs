//! # openplant-client
//!
//! Async client library for OpenPlant.
//!
//! This crate provides:
//! - Framed TCP transport with transparent heartbeat handling
//! - Connection login, request execution and streaming result cursors
//! - Subscriptions that resubscribe on their own after connection loss
//! - High-level API for SQL, realtime, archive and statistics reads
//! - YAML and environment based configuration

pub mod client;
pub mod config;
pub mod connection;
pub mod dataset;
pub mod error;
pub mod subscription;
pub mod transport;

#[cfg(test)]
mod mock;

pub use client::{ArchiveMode, Client, RealValue, SelectOptions, StatValue};
pub use config::{ClientConfig, ConfigError, SubscriptionConfig};
pub use connection::{Connection, ConnectionConfig};
pub use dataset::{DataSet, ResultSet};
pub use error::{ClientError, ErrorKind};
pub use subscription::{SubscribeOptions, Subscription, SubscriptionEvent, SubscriptionState};
