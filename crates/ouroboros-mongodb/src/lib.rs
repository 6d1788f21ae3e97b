//! MongoDB client layer for ouroboros
//!
//! This crate turns a connection string plus ordered overrides into an
//! immutable [`Client`], and delegates connection lifecycle and command
//! execution to a [`Topology`].
//!
//! # Features
//! - Connection string parsing with presence-tracked write concern fields
//! - Ordered, fail-fast client options
//! - Read/write concern resolution
//! - Background server monitoring and per-server connection pools
//! - Graceful disconnect that force-closes in-use connections on deadline
//!
//! The wire transport is pluggable through [`Connector`].

pub mod client;
pub mod command;
pub mod concern;
pub mod connstring;
pub mod context;
pub mod database;
pub mod dispatch;
pub mod options;
pub mod readpref;
pub mod topology;

pub use client::{connect, Client, DEFAULT_LOCAL_THRESHOLD};
pub use command::{DatabaseSpecification, ListDatabases, ListDatabasesResult};
pub use concern::{Acknowledgment, ReadConcern, WriteConcern};
pub use connstring::ConnString;
pub use context::Context;
pub use database::Database;
pub use options::ClientOptions;
pub use ouroboros_common::{DriverError, Result};
pub use readpref::{ReadPrefMode, ReadPreference, TagSet};
pub use topology::connection::{Connector, StreamConnection};
pub use topology::pool::PoolConfig;
pub use topology::Topology;
