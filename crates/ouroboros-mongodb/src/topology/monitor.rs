//! Background server monitoring

use std::sync::Arc;
use std::time::Duration;

use bson::doc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::{Connector, StreamConnection};
use super::description::{ServerDescription, TopologyDescription};

/// Spawn a task that checks `address` every `heartbeat` until `shutdown`
/// is cancelled, publishing each result into `updates`.
pub(crate) fn spawn(
    address: String,
    connector: Arc<dyn Connector>,
    heartbeat: Duration,
    connect_timeout: Duration,
    updates: watch::Sender<TopologyDescription>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut conn: Option<Box<dyn StreamConnection>> = None;
        debug!(address = %address, "server monitor started");

        loop {
            let description = tokio::select! {
                _ = shutdown.cancelled() => break,
                d = check(&address, connector.as_ref(), &mut conn, connect_timeout) => d,
            };
            if let Some(error) = &description.error {
                warn!(address = %address, error = %error, "server check failed");
            }
            updates.send_modify(|topology| topology.update(description));

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(heartbeat) => {}
            }
        }

        debug!(address = %address, "server monitor stopped");
    })
}

/// Run one `hello` round trip, reconnecting if the previous check failed
async fn check(
    address: &str,
    connector: &dyn Connector,
    conn: &mut Option<Box<dyn StreamConnection>>,
    connect_timeout: Duration,
) -> ServerDescription {
    let started = Instant::now();

    if conn.is_none() {
        match tokio::time::timeout(connect_timeout, connector.connect(address)).await {
            Ok(Ok(c)) => *conn = Some(c),
            Ok(Err(e)) => return ServerDescription::with_error(address, e.to_string()),
            Err(_) => return ServerDescription::with_error(address, "connect timed out"),
        }
    }

    let Some(c) = conn.as_mut() else {
        return ServerDescription::with_error(address, "no monitoring connection");
    };
    match c.run_command("admin", doc! { "hello": 1 }).await {
        Ok(reply) => ServerDescription::from_hello(address, &reply, started.elapsed()),
        Err(e) => {
            *conn = None;
            ServerDescription::with_error(address, e.to_string())
        }
    }
}
