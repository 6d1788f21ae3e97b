//! Client options.
//!
//! [`ClientOptions`] is an ordered chain of fallible mutations. The client
//! applies them after the connection-string defaults, first to last, and
//! stops at the first error. A later option overwrites whatever an earlier
//! option or the connection string set.
//!
//! ```rust,ignore
//! let opts = ClientOptions::new()
//!     .app_name("billing")
//!     .w_tag_set("majority")
//!     .journal(true);
//! let client = Client::with_options("mongodb://db0,db1/?replicaSet=rs0", opts)?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use ouroboros_common::{DriverError, Result};

use crate::connstring::ConnString;
use crate::readpref::ReadPreference;
use crate::topology::connection::Connector;
use crate::topology::{self, TopologyOption};

/// Client state visible to options while the client is being built
pub struct ClientSettings {
    pub(crate) conn_string: ConnString,
    pub(crate) local_threshold: Duration,
    pub(crate) read_preference: ReadPreference,
    pub(crate) topology_options: Vec<TopologyOption>,
}

impl std::fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSettings")
            .field("conn_string", &self.conn_string)
            .field("local_threshold", &self.local_threshold)
            .field("read_preference", &self.read_preference)
            .field("topology_options", &self.topology_options.len())
            .finish()
    }
}

impl ClientSettings {
    pub fn conn_string(&self) -> &ConnString {
        &self.conn_string
    }

    pub fn local_threshold(&self) -> Duration {
        self.local_threshold
    }

    pub fn read_preference(&self) -> &ReadPreference {
        &self.read_preference
    }
}

type ClientOption = Box<dyn FnOnce(&mut ClientSettings) -> Result<()> + Send>;

/// Ordered, composable client overrides
#[derive(Default)]
pub struct ClientOptions {
    chain: Vec<ClientOption>,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("len", &self.chain.len())
            .finish()
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    fn push<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut ClientSettings) -> Result<()> + Send + 'static,
    {
        self.chain.push(Box::new(f));
        self
    }

    /// Append every option of `other` after this chain's options
    pub fn extend(mut self, other: ClientOptions) -> Self {
        self.chain.extend(other.chain);
        self
    }

    /// Apply the chain to `settings`, stopping at the first failure.
    /// Options after the failing one are never run.
    pub(crate) fn apply(self, settings: &mut ClientSettings) -> Result<()> {
        self.chain.into_iter().try_for_each(|opt| opt(settings))
    }

    pub fn app_name(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.push(move |s| {
            s.conn_string.app_name = Some(name);
            Ok(())
        })
    }

    /// Credentials and, optionally, the database to authenticate against
    pub fn auth(self, username: impl Into<String>, password: impl Into<String>, source: Option<String>) -> Self {
        let username = username.into();
        let password = password.into();
        self.push(move |s| {
            if username.is_empty() {
                return Err(DriverError::Configuration("username cannot be empty".to_string()));
            }
            s.conn_string.username = Some(username);
            s.conn_string.password = Some(password);
            if source.is_some() {
                s.conn_string.auth_source = source;
            }
            Ok(())
        })
    }

    pub fn connect_timeout(self, timeout: Duration) -> Self {
        self.push(move |s| {
            s.conn_string.connect_timeout = Some(timeout);
            Ok(())
        })
    }

    pub fn heartbeat_interval(self, interval: Duration) -> Self {
        self.push(move |s| {
            if interval.is_zero() {
                return Err(DriverError::Configuration(
                    "heartbeat interval must be greater than zero".to_string(),
                ));
            }
            s.conn_string.heartbeat_interval = Some(interval);
            Ok(())
        })
    }

    /// Replace the seed list
    pub fn hosts(self, hosts: Vec<String>) -> Self {
        self.push(move |s| {
            if hosts.is_empty() || hosts.iter().any(String::is_empty) {
                return Err(DriverError::Configuration(
                    "hosts must be a non-empty list of non-empty addresses".to_string(),
                ));
            }
            s.conn_string.hosts = hosts;
            Ok(())
        })
    }

    pub fn journal(self, journal: bool) -> Self {
        self.push(move |s| {
            s.conn_string.j = journal;
            s.conn_string.j_set = true;
            Ok(())
        })
    }

    /// Latency window for choosing among suitable servers
    pub fn local_threshold(self, threshold: Duration) -> Self {
        self.push(move |s| {
            s.local_threshold = threshold;
            s.conn_string.local_threshold = Some(threshold);
            Ok(())
        })
    }

    pub fn max_conn_idle_time(self, idle: Duration) -> Self {
        self.push(move |s| {
            s.conn_string.max_conn_idle_time = Some(idle);
            Ok(())
        })
    }

    pub fn max_pool_size(self, size: u32) -> Self {
        self.push(move |s| {
            if size == 0 {
                return Err(DriverError::Configuration(
                    "max pool size must be greater than zero".to_string(),
                ));
            }
            s.conn_string.max_pool_size = Some(size);
            Ok(())
        })
    }

    pub fn read_concern_level(self, level: impl Into<String>) -> Self {
        let level = level.into();
        self.push(move |s| {
            s.conn_string.read_concern_level = level;
            Ok(())
        })
    }

    /// Default read preference for operations that honor it
    pub fn read_preference(self, read_preference: ReadPreference) -> Self {
        self.push(move |s| {
            s.read_preference = read_preference;
            Ok(())
        })
    }

    pub fn replica_set(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.push(move |s| {
            s.conn_string.replica_set = Some(name);
            Ok(())
        })
    }

    pub fn server_selection_timeout(self, timeout: Duration) -> Self {
        self.push(move |s| {
            s.conn_string.server_selection_timeout = Some(timeout);
            Ok(())
        })
    }

    pub fn socket_timeout(self, timeout: Duration) -> Self {
        self.push(move |s| {
            s.conn_string.socket_timeout = Some(timeout);
            Ok(())
        })
    }

    /// Require acknowledgment from `nodes` members. Clears a tag set set
    /// earlier so that the last `w`-style option wins.
    pub fn w(self, nodes: i32) -> Self {
        self.push(move |s| {
            if nodes < 0 {
                return Err(DriverError::Configuration(format!(
                    "w must be non-negative, got {}",
                    nodes
                )));
            }
            s.conn_string.w_string.clear();
            s.conn_string.w_number = nodes;
            s.conn_string.w_number_set = true;
            Ok(())
        })
    }

    /// Require acknowledgment according to a named tag set such as
    /// `majority`. Clears a numeric `w` set earlier.
    pub fn w_tag_set(self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.push(move |s| {
            if tag.is_empty() {
                return Err(DriverError::Configuration("w tag set cannot be empty".to_string()));
            }
            s.conn_string.w_string = tag;
            s.conn_string.w_number = 0;
            s.conn_string.w_number_set = false;
            Ok(())
        })
    }

    pub fn w_timeout(self, timeout: Duration) -> Self {
        self.push(move |s| {
            s.conn_string.w_timeout = timeout;
            s.conn_string.w_timeout_set = true;
            Ok(())
        })
    }

    /// Transport used to reach servers
    pub fn connector(self, connector: Arc<dyn Connector>) -> Self {
        self.topology_option(topology::with_connector(connector))
    }

    /// Pass an option straight through to the topology
    pub fn topology_option(self, option: TopologyOption) -> Self {
        self.push(move |s| {
            s.topology_options.push(option);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DEFAULT_LOCAL_THRESHOLD;
    use crate::readpref::ReadPrefMode;

    fn settings(uri: &str) -> ClientSettings {
        ClientSettings {
            conn_string: ConnString::parse(uri).unwrap(),
            local_threshold: DEFAULT_LOCAL_THRESHOLD,
            read_preference: ReadPreference::primary(),
            topology_options: Vec::new(),
        }
    }

    #[test]
    fn test_last_write_wins() {
        let mut s = settings("mongodb://h");
        ClientOptions::new()
            .app_name("first")
            .app_name("second")
            .apply(&mut s)
            .unwrap();
        assert_eq!(s.conn_string.app_name.as_deref(), Some("second"));
    }

    #[test]
    fn test_options_override_conn_string() {
        let mut s = settings("mongodb://h/?w=1&journal=false&localThresholdMS=30&replicaSet=a");
        ClientOptions::new()
            .journal(true)
            .local_threshold(Duration::from_millis(5))
            .replica_set("b")
            .apply(&mut s)
            .unwrap();
        assert!(s.conn_string.j && s.conn_string.j_set);
        assert_eq!(s.local_threshold, Duration::from_millis(5));
        assert_eq!(s.conn_string.local_threshold, Some(Duration::from_millis(5)));
        assert_eq!(s.conn_string.replica_set.as_deref(), Some("b"));
        assert_eq!(s.conn_string.w_number, 1);
    }

    #[test]
    fn test_w_style_options_replace_each_other() {
        let mut s = settings("mongodb://h/?w=majority");
        ClientOptions::new().w(3).apply(&mut s).unwrap();
        assert!(s.conn_string.w_string.is_empty());
        assert!(s.conn_string.w_number_set);

        ClientOptions::new().w_tag_set("dc-east").apply(&mut s).unwrap();
        assert_eq!(s.conn_string.w_string, "dc-east");
        assert!(!s.conn_string.w_number_set);
    }

    #[test]
    fn test_first_error_stops_chain() {
        let mut s = settings("mongodb://h");
        let err = ClientOptions::new()
            .app_name("applied")
            .max_pool_size(0)
            .app_name("never applied")
            .apply(&mut s)
            .unwrap_err();
        assert!(matches!(err, DriverError::Configuration(_)));
        assert_eq!(s.conn_string.app_name.as_deref(), Some("applied"));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let cases = vec![
            ClientOptions::new().hosts(Vec::new()),
            ClientOptions::new().hosts(vec!["a".to_string(), String::new()]),
            ClientOptions::new().w(-1),
            ClientOptions::new().w_tag_set(""),
            ClientOptions::new().heartbeat_interval(Duration::ZERO),
            ClientOptions::new().auth("", "secret", None),
        ];
        for opts in cases {
            let mut s = settings("mongodb://h");
            assert!(opts.apply(&mut s).is_err());
        }
    }

    #[test]
    fn test_read_preference_and_topology_options() {
        let mut s = settings("mongodb://h");
        let opts = ClientOptions::new()
            .read_preference(ReadPreference::new(ReadPrefMode::Nearest))
            .topology_option(topology::with_pool_config(|p| p));
        assert_eq!(opts.len(), 2);
        opts.apply(&mut s).unwrap();
        assert_eq!(s.read_preference.mode(), ReadPrefMode::Nearest);
        assert_eq!(s.topology_options.len(), 1);
    }

    #[test]
    fn test_extend_preserves_order() {
        let mut s = settings("mongodb://h");
        ClientOptions::new()
            .app_name("base")
            .extend(ClientOptions::new().app_name("override"))
            .apply(&mut s)
            .unwrap();
        assert_eq!(s.conn_string.app_name.as_deref(), Some("override"));
    }
}
