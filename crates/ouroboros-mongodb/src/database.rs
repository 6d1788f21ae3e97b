//! Database handle

use bson::Document;
use ouroboros_common::Result;

use crate::client::Client;
use crate::concern::{ReadConcern, WriteConcern};
use crate::context::Context;
use crate::dispatch;
use crate::readpref::ReadPreference;
use crate::topology::ReadPrefSelector;

/// A named database on a client's deployment. Cheap to create and clone.
#[derive(Debug, Clone)]
pub struct Database {
    client: Client,
    name: String,
}

impl Database {
    pub(crate) fn new(client: Client, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.client.read_concern()
    }

    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.client.write_concern()
    }

    pub fn read_preference(&self) -> &ReadPreference {
        self.client.read_preference()
    }

    /// Run an arbitrary command against this database on the primary.
    ///
    /// # Errors
    ///
    /// Dispatch errors, including `Command` for `ok: 0` replies.
    pub async fn run_command(&self, ctx: &Context, command: Document) -> Result<Document> {
        dispatch::run_command(
            ctx,
            &self.name,
            command,
            self.client.topology(),
            &ReadPrefSelector::primary(),
        )
        .await
    }
}
