//! Command dispatch: select a server, check out a connection, run.
//!
//! No retries happen here; every failure goes straight back to the caller.

use bson::Document;
use ouroboros_common::Result;
use tracing::{debug, instrument};

use crate::command::{check_reply, ListDatabases};
use crate::context::Context;
use crate::topology::description::ServerSelector;
use crate::topology::Topology;

/// Run `command` against database `db` on a server chosen by `selector`.
///
/// # Errors
///
/// Server selection, checkout, transport and `ok: 0` command errors, or the
/// context error if `ctx` ends first. The topology is left untouched.
#[instrument(skip(ctx, command, topology, selector), fields(command = command.keys().next().map(String::as_str).unwrap_or("")))]
pub async fn run_command(
    ctx: &Context,
    db: &str,
    command: Document,
    topology: &Topology,
    selector: &dyn ServerSelector,
) -> Result<Document> {
    let pool = topology.select_server(ctx, selector).await?;
    let conn = pool.checkout(ctx).await?;
    debug!(address = %conn.address(), connection = conn.id(), "dispatching command");

    let reply = ctx.run(conn.run_command(db, command)).await??;
    check_reply(reply)
}

/// Run `listDatabases` against `admin` and return the raw reply
pub async fn list_databases(
    ctx: &Context,
    cmd: ListDatabases,
    topology: &Topology,
    selector: &dyn ServerSelector,
) -> Result<Document> {
    run_command(ctx, "admin", cmd.encode(), topology, selector).await
}
