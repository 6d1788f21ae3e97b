//! Topology: server monitoring, selection and connection pools.
//!
//! A [`Topology`] is built from an ordered list of [`TopologyOption`]s. It
//! does nothing until [`Topology::connect`] starts one monitor task and one
//! pool per seed; [`Topology::disconnect`] stops the monitors and closes the
//! pools.

pub mod connection;
pub mod description;
mod monitor;
pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ouroboros_common::{DriverError, Result};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::DEFAULT_LOCAL_THRESHOLD;
use crate::connstring::ConnString;
use crate::context::Context;
use connection::{Connector, UnconfiguredConnector};
use description::{LatencySelector, ServerSelector, TopologyDescription};
use pool::{Pool, PoolConfig};

pub use connection::StreamConnection;
pub use description::{ReadPrefSelector, ServerDescription, ServerKind, TopologyKind};
pub use pool::{PoolStats, PooledConnection};

/// Default interval between server checks
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default time to wait for a suitable server
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_PORT: u16 = 27017;

/// A fallible mutation of the topology configuration
pub type TopologyOption = Box<dyn FnOnce(&mut TopologyConfig) -> Result<()> + Send>;

/// Resolved topology settings
#[derive(Clone)]
pub struct TopologyConfig {
    /// Connection string the settings below were derived from
    pub conn_string: ConnString,
    pub seeds: Vec<String>,
    pub replica_set: Option<String>,
    pub heartbeat_interval: Duration,
    pub server_selection_timeout: Duration,
    pub local_threshold: Duration,
    pub pool: PoolConfig,
    pub connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for TopologyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyConfig")
            .field("seeds", &self.seeds)
            .field("replica_set", &self.replica_set)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("server_selection_timeout", &self.server_selection_timeout)
            .field("local_threshold", &self.local_threshold)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            conn_string: ConnString::default(),
            seeds: Vec::new(),
            replica_set: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
            local_threshold: DEFAULT_LOCAL_THRESHOLD,
            pool: PoolConfig::default(),
            connector: Arc::new(UnconfiguredConnector),
        }
    }
}

impl TopologyConfig {
    fn apply_conn_string(&mut self, cs: &ConnString) {
        self.seeds = cs.hosts.iter().map(|h| normalize_address(h)).collect();
        self.replica_set = cs.replica_set.clone();
        if let Some(interval) = cs.heartbeat_interval {
            self.heartbeat_interval = interval;
        }
        if let Some(timeout) = cs.server_selection_timeout {
            self.server_selection_timeout = timeout;
        }
        if let Some(threshold) = cs.local_threshold {
            self.local_threshold = threshold;
        }
        if let Some(max) = cs.max_pool_size {
            self.pool.max_pool_size = max;
        }
        if let Some(idle) = cs.max_conn_idle_time {
            self.pool.max_idle_time = Some(idle);
        }
        if let Some(connect) = cs.connect_timeout {
            self.pool.connect_timeout = connect;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(DriverError::Topology("no seed addresses configured".to_string()));
        }
        if self.pool.max_pool_size == 0 {
            return Err(DriverError::Topology(
                "max pool size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Derive the topology settings from a connection string. `f` maps the
/// current connection string to the one to use; it is called once, when the
/// option is applied.
pub fn with_conn_string<F>(f: F) -> TopologyOption
where
    F: FnOnce(ConnString) -> ConnString + Send + 'static,
{
    Box::new(move |config: &mut TopologyConfig| {
        let cs = f(std::mem::take(&mut config.conn_string));
        config.apply_conn_string(&cs);
        config.conn_string = cs;
        Ok(())
    })
}

/// Use `connector` to open server connections
pub fn with_connector(connector: Arc<dyn Connector>) -> TopologyOption {
    Box::new(move |config: &mut TopologyConfig| {
        config.connector = connector;
        Ok(())
    })
}

/// Adjust the pool configuration
pub fn with_pool_config<F>(f: F) -> TopologyOption
where
    F: FnOnce(PoolConfig) -> PoolConfig + Send + 'static,
{
    Box::new(move |config: &mut TopologyConfig| {
        config.pool = f(config.pool.clone());
        Ok(())
    })
}

fn normalize_address(host: &str) -> String {
    let has_port = match host.rsplit_once(':') {
        Some((_, port)) => !port.ends_with(']'),
        None => false,
    };
    if has_port {
        host.to_ascii_lowercase()
    } else {
        format!("{}:{}", host.to_ascii_lowercase(), DEFAULT_PORT)
    }
}

enum Lifecycle {
    Disconnected,
    Connected {
        shutdown: CancellationToken,
        monitors: Vec<JoinHandle<()>>,
        pools: Arc<HashMap<String, Arc<Pool>>>,
    },
}

/// Owns monitoring, server selection and connection pools for a deployment
pub struct Topology {
    config: TopologyConfig,
    description: watch::Sender<TopologyDescription>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Topology {
    /// Build a topology by applying `options` in order.
    ///
    /// # Errors
    ///
    /// Propagates the first option error, then rejects configurations with
    /// no seeds or a zero pool size.
    pub fn new(options: impl IntoIterator<Item = TopologyOption>) -> Result<Self> {
        let mut config = TopologyConfig::default();
        for option in options {
            option(&mut config)?;
        }
        config.validate()?;

        let (description, _) = watch::channel(
            TopologyDescription::new(&config.seeds, config.replica_set.clone())
                .with_heartbeat_interval(config.heartbeat_interval),
        );
        debug!(seeds = ?config.seeds, replica_set = ?config.replica_set, "topology created");

        Ok(Self {
            config,
            description,
            lifecycle: Mutex::new(Lifecycle::Disconnected),
        })
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Latest snapshot of the deployment
    pub fn description(&self) -> TopologyDescription {
        self.description.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Connected { .. })
    }

    /// Pool counters per server address; empty when disconnected
    pub fn pool_stats(&self) -> HashMap<String, PoolStats> {
        match &*self.lifecycle.lock() {
            Lifecycle::Connected { pools, .. } => pools
                .iter()
                .map(|(address, pool)| (address.clone(), pool.stats()))
                .collect(),
            Lifecycle::Disconnected => HashMap::new(),
        }
    }

    /// Start monitoring every seed and open a pool per seed.
    ///
    /// # Errors
    ///
    /// Fails if the topology is already connected or `ctx` has ended.
    #[instrument(skip(self, ctx), fields(seeds = self.config.seeds.len()))]
    pub async fn connect(&self, ctx: &Context) -> Result<()> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let mut lifecycle = self.lifecycle.lock();
        if let Lifecycle::Connected { .. } = *lifecycle {
            return Err(DriverError::Topology("topology is already connected".to_string()));
        }

        let shutdown = CancellationToken::new();
        let mut pools = HashMap::new();
        let mut monitors = Vec::with_capacity(self.config.seeds.len());
        for address in &self.config.seeds {
            pools.insert(
                address.clone(),
                Pool::new(address.clone(), self.config.pool.clone(), self.config.connector.clone()),
            );
            monitors.push(monitor::spawn(
                address.clone(),
                self.config.connector.clone(),
                self.config.heartbeat_interval,
                self.config.pool.connect_timeout,
                self.description.clone(),
                shutdown.child_token(),
            ));
        }

        *lifecycle = Lifecycle::Connected {
            shutdown,
            monitors,
            pools: Arc::new(pools),
        };
        info!("topology connected");
        Ok(())
    }

    /// Stop monitoring and close every pool.
    ///
    /// Idle connections close at once; in-use connections are awaited until
    /// `ctx` ends and then force-closed. A successful return means every
    /// connection this topology opened is closed.
    ///
    /// # Errors
    ///
    /// Fails if the topology is not connected.
    #[instrument(skip(self, ctx))]
    pub async fn disconnect(&self, ctx: &Context) -> Result<()> {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Disconnected);
        let (shutdown, monitors, pools) = match previous {
            Lifecycle::Connected {
                shutdown,
                monitors,
                pools,
            } => (shutdown, monitors, pools),
            Lifecycle::Disconnected => {
                return Err(DriverError::Topology("topology is not connected".to_string()))
            }
        };

        shutdown.cancel();
        for monitor in monitors {
            if let Err(e) = monitor.await {
                warn!(error = %e, "server monitor task ended abnormally");
            }
        }

        let closes = pools.values().map(|pool| pool.close(ctx));
        let results = futures::future::join_all(closes).await;
        self.description.send_modify(TopologyDescription::reset);

        info!("topology disconnected");
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    /// Wait for a server matching `selector`, then the latency window.
    ///
    /// # Errors
    ///
    /// `Topology` when not connected, `ServerSelection` when the server
    /// selection timeout passes, or the context error if `ctx` ends first.
    pub async fn select_server(
        &self,
        ctx: &Context,
        selector: &dyn ServerSelector,
    ) -> Result<Arc<Pool>> {
        let pools = match &*self.lifecycle.lock() {
            Lifecycle::Connected { pools, .. } => pools.clone(),
            Lifecycle::Disconnected => {
                return Err(DriverError::Topology("topology is not connected".to_string()))
            }
        };

        let latency = LatencySelector::new(self.config.local_threshold);
        let mut updates = self.description.subscribe();
        let deadline = tokio::time::Instant::now() + self.config.server_selection_timeout;

        loop {
            let chosen = {
                let topology = updates.borrow_and_update();
                let candidates = topology.servers.iter().collect();
                let suitable = selector.select(&topology, candidates);
                let suitable = latency.select(&topology, suitable);
                pick(&suitable).and_then(|address| pools.get(address).cloned())
            };
            if let Some(pool) = chosen {
                return Ok(pool);
            }

            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        return Err(DriverError::Topology("topology was dropped".to_string()));
                    }
                }
                _ = ctx.done() => {
                    return Err(ctx.err().unwrap_or_else(|| {
                        DriverError::Cancelled("context ended".to_string())
                    }));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(DriverError::ServerSelection(format!(
                        "no suitable server within {:?}; topology: {:?}",
                        self.config.server_selection_timeout,
                        self.description.borrow().servers,
                    )));
                }
            }
        }
    }
}

/// Spread load across equally suitable servers
fn pick<'a>(suitable: &[&'a ServerDescription]) -> Option<&'a str> {
    suitable
        .choose(&mut rand::thread_rng())
        .map(|server| server.address.as_str())
}

impl Drop for Topology {
    fn drop(&mut self) {
        if let Lifecycle::Connected { shutdown, .. } = &*self.lifecycle.lock() {
            shutdown.cancel();
        }
    }
}
