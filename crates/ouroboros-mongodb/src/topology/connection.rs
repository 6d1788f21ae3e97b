//! Transport seam between the topology and the wire.
//!
//! Framing and socket I/O live behind these traits. A connection is closed
//! when it is dropped.

use async_trait::async_trait;
use bson::Document;
use ouroboros_common::{DriverError, Result};

/// Opens connections to a single server address
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a connection to `address` (`host:port`)
    async fn connect(&self, address: &str) -> Result<Box<dyn StreamConnection>>;
}

/// An established connection able to run one command at a time
#[async_trait]
pub trait StreamConnection: Send + Sync {
    /// Run `command` against database `db` and return the raw reply
    async fn run_command(&mut self, db: &str, command: Document) -> Result<Document>;
}

/// Connector used when the caller has not supplied a transport.
/// Every attempt fails, so servers stay unknown and selection times out.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredConnector;

#[async_trait]
impl Connector for UnconfiguredConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn StreamConnection>> {
        Err(DriverError::Connection(format!(
            "no transport configured for {}; supply one with ClientOptions::connector",
            address
        )))
    }
}
