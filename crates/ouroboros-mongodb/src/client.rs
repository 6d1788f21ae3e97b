//! MongoDB client: configuration resolution and lifecycle delegation

use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use ouroboros_common::Result;
use tracing::{debug, info, instrument};

use crate::command::{ListDatabases, ListDatabasesResult};
use crate::concern::{
    read_concern_from_conn_string, write_concern_from_conn_string, ReadConcern, WriteConcern,
};
use crate::connstring::ConnString;
use crate::context::Context;
use crate::database::Database;
use crate::dispatch;
use crate::options::{ClientOptions, ClientSettings};
use crate::readpref::ReadPreference;
use crate::topology::{self, ReadPrefSelector, Topology};

/// Latency window used when neither the connection string nor an option sets one
pub const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// Create a client and connect it in one step.
///
/// # Errors
///
/// Any construction error, or the error from [`Client::connect`].
pub async fn connect(ctx: &Context, uri: &str, options: Option<ClientOptions>) -> Result<Client> {
    let client = Client::with_options(uri, options)?;
    client.connect(ctx).await?;
    Ok(client)
}

struct ClientInner {
    conn_string: ConnString,
    local_threshold: Duration,
    read_preference: ReadPreference,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
    topology: Topology,
}

/// Handle to a deployment.
///
/// Configuration is fixed at construction; cloning is cheap and every
/// clone shares the same topology.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("hosts", &self.inner.conn_string.hosts)
            .field("local_threshold", &self.inner.local_threshold)
            .field("read_preference", &self.inner.read_preference)
            .field("read_concern", &self.inner.read_concern)
            .field("write_concern", &self.inner.write_concern)
            .finish()
    }
}

impl Client {
    /// Create a client from a connection string.
    ///
    /// # Errors
    ///
    /// Connection string parse errors and topology construction errors.
    pub fn new(uri: &str) -> Result<Self> {
        Self::with_options(uri, None)
    }

    /// Create a client from a connection string plus overrides. Overrides
    /// apply after the connection string, so they win on conflict.
    ///
    /// # Errors
    ///
    /// Connection string parse errors, the first failing option, and
    /// topology construction errors, each returned unchanged.
    pub fn with_options(uri: &str, options: Option<ClientOptions>) -> Result<Self> {
        let cs = ConnString::parse(uri)?;
        Self::build(cs, options)
    }

    /// Create a client from an already parsed connection string
    pub fn from_conn_string(cs: ConnString) -> Result<Self> {
        Self::build(cs, None)
    }

    /// Create a client from `MONGODB_URI`, defaulting to localhost
    pub fn from_env() -> Result<Self> {
        Self::build(ConnString::from_env()?, None)
    }

    #[instrument(skip_all, fields(hosts = ?cs.hosts, options = options.as_ref().map(ClientOptions::len).unwrap_or(0)))]
    fn build(cs: ConnString, options: Option<ClientOptions>) -> Result<Self> {
        let read_preference = cs.read_preference()?.unwrap_or_else(ReadPreference::primary);
        let mut settings = ClientSettings {
            local_threshold: cs.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD),
            conn_string: cs,
            read_preference,
            topology_options: Vec::new(),
        };

        if let Some(options) = options {
            options.apply(&mut settings)?;
        }

        let ClientSettings {
            conn_string,
            local_threshold,
            read_preference,
            mut topology_options,
        } = settings;

        let final_cs = conn_string.clone();
        topology_options.push(topology::with_conn_string(move |_| final_cs));
        let topology = Topology::new(topology_options)?;

        let read_concern = read_concern_from_conn_string(&conn_string);
        let write_concern = write_concern_from_conn_string(&conn_string);
        debug!(?read_concern, ?write_concern, "resolved client concerns");

        Ok(Self {
            inner: Arc::new(ClientInner {
                conn_string,
                local_threshold,
                read_preference,
                read_concern,
                write_concern,
                topology,
            }),
        })
    }

    /// Start background monitoring. Must succeed before any operation that
    /// talks to the deployment.
    ///
    /// # Errors
    ///
    /// Topology lifecycle errors, returned unchanged.
    pub async fn connect(&self, ctx: &Context) -> Result<()> {
        self.inner.topology.connect(ctx).await?;
        info!(hosts = ?self.inner.conn_string.hosts, "client connected");
        Ok(())
    }

    /// Stop monitoring and close every connection.
    ///
    /// Idle connections close immediately. In-use connections are given until
    /// `ctx` is cancelled or expires to come back; after that they are closed
    /// and any operation still running on them fails. An `Ok` return means
    /// every connection owned by this client is closed.
    ///
    /// # Errors
    ///
    /// Topology lifecycle errors, returned unchanged.
    pub async fn disconnect(&self, ctx: &Context) -> Result<()> {
        self.inner.topology.disconnect(ctx).await?;
        info!(hosts = ?self.inner.conn_string.hosts, "client disconnected");
        Ok(())
    }

    /// Handle for database `name`. Does no I/O.
    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name)
    }

    /// The connection string exactly as it was supplied
    pub fn connection_string(&self) -> &str {
        &self.inner.conn_string.original
    }

    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.read_concern.as_ref()
    }

    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    pub fn read_preference(&self) -> &ReadPreference {
        &self.inner.read_preference
    }

    pub fn local_threshold(&self) -> Duration {
        self.inner.local_threshold
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    async fn list_databases_helper(
        &self,
        ctx: &Context,
        filter: Option<Document>,
        name_only: bool,
    ) -> Result<ListDatabasesResult> {
        let cmd = ListDatabases { filter, name_only };

        // listDatabases never runs on a secondary, whatever the client's read preference
        let reply = dispatch::list_databases(
            ctx,
            cmd,
            &self.inner.topology,
            &ReadPrefSelector::primary(),
        )
        .await?;
        ListDatabasesResult::from_reply(reply)
    }

    /// List databases matching `filter`.
    ///
    /// # Errors
    ///
    /// Dispatch errors and malformed replies.
    pub async fn list_databases(
        &self,
        ctx: &Context,
        filter: impl Into<Option<Document>>,
    ) -> Result<ListDatabasesResult> {
        self.list_databases_helper(ctx, filter.into(), false).await
    }

    /// Names of the databases matching `filter`, in server order.
    ///
    /// # Errors
    ///
    /// Dispatch errors and malformed replies.
    pub async fn list_database_names(
        &self,
        ctx: &Context,
        filter: impl Into<Option<Document>>,
    ) -> Result<Vec<String>> {
        let result = self.list_databases_helper(ctx, filter.into(), true).await?;
        Ok(result.names())
    }
}
