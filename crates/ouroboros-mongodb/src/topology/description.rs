//! Server and topology descriptions, and the selectors that filter them

use std::collections::BTreeMap;
use std::time::Duration;

use bson::{Bson, DateTime, Document};

use crate::readpref::{ReadPrefMode, ReadPreference, TagSet};

/// What kind of server a monitor found at an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerKind {
    #[default]
    Unknown,
    Standalone,
    Mongos,
    RsPrimary,
    RsSecondary,
    RsArbiter,
    RsOther,
    RsGhost,
}

impl ServerKind {
    pub fn is_data_bearing(&self) -> bool {
        matches!(
            self,
            Self::Standalone | Self::Mongos | Self::RsPrimary | Self::RsSecondary
        )
    }

    pub fn is_replica_set_member(&self) -> bool {
        matches!(
            self,
            Self::RsPrimary | Self::RsSecondary | Self::RsArbiter | Self::RsOther | Self::RsGhost
        )
    }
}

/// Latest monitoring result for one server
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerDescription {
    pub address: String,
    pub kind: ServerKind,
    pub average_rtt: Option<Duration>,
    pub set_name: Option<String>,
    pub tags: TagSet,
    /// `lastWrite.lastWriteDate` from the latest `hello`
    pub last_write_date: Option<DateTime>,
    /// When the latest `hello` reply arrived
    pub last_update_time: Option<DateTime>,
    /// Last monitoring error, if the server is unknown because of one
    pub error: Option<String>,
}

impl ServerDescription {
    pub fn unknown(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_error(address: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Build a description from a `hello` reply measured at `rtt`
    pub fn from_hello(address: impl Into<String>, reply: &Document, rtt: Duration) -> Self {
        let flag = |key: &str| reply.get_bool(key).unwrap_or(false);
        let set_name = reply.get_str("setName").ok().map(str::to_string);

        let kind = if !is_ok(reply) {
            ServerKind::Unknown
        } else if flag("isreplicaset") {
            ServerKind::RsGhost
        } else if reply.get_str("msg").ok() == Some("isdbgrid") {
            ServerKind::Mongos
        } else if set_name.is_some() {
            if flag("isWritablePrimary") || flag("ismaster") {
                ServerKind::RsPrimary
            } else if flag("secondary") {
                ServerKind::RsSecondary
            } else if flag("arbiterOnly") {
                ServerKind::RsArbiter
            } else {
                ServerKind::RsOther
            }
        } else {
            ServerKind::Standalone
        };

        let tags = reply
            .get_document("tags")
            .map(|tags| {
                tags.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();

        let last_write_date = reply
            .get_document("lastWrite")
            .ok()
            .and_then(|last_write| last_write.get_datetime("lastWriteDate").ok())
            .copied();

        Self {
            address: address.into(),
            kind,
            average_rtt: Some(rtt),
            set_name,
            tags,
            last_write_date,
            last_update_time: Some(DateTime::now()),
            error: None,
        }
    }

    fn matches_tags(&self, tag_set: &TagSet) -> bool {
        tag_set
            .iter()
            .all(|(k, v)| self.tags.get(k).map(|t| t == v).unwrap_or(false))
    }
}

/// `ok` may arrive as a double, int32 or int64
pub(crate) fn is_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(ok)) => *ok == 1.0,
        Some(Bson::Int32(ok)) => *ok == 1,
        Some(Bson::Int64(ok)) => *ok == 1,
        Some(Bson::Boolean(ok)) => *ok,
        _ => false,
    }
}

/// Overall deployment shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyKind {
    #[default]
    Unknown,
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
}

/// Snapshot of every monitored server
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopologyDescription {
    pub kind: TopologyKind,
    pub servers: Vec<ServerDescription>,
    /// Monitoring interval, part of every staleness estimate
    pub heartbeat_interval: Duration,
    replica_set: Option<String>,
    seed_count: usize,
}

impl TopologyDescription {
    /// All seeds start unknown
    pub fn new(seeds: &[String], replica_set: Option<String>) -> Self {
        let mut description = Self {
            kind: TopologyKind::Unknown,
            servers: seeds.iter().map(ServerDescription::unknown).collect(),
            heartbeat_interval: Duration::ZERO,
            replica_set,
            seed_count: seeds.len(),
        };
        description.kind = description.derive_kind();
        description
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Replace the description for `server.address`, folding the new RTT
    /// sample into the running average.
    pub fn update(&mut self, mut server: ServerDescription) {
        if let Some(existing) = self.servers.iter_mut().find(|s| s.address == server.address) {
            if let (Some(old), Some(new)) = (existing.average_rtt, server.average_rtt) {
                server.average_rtt = Some(old.mul_f64(0.8) + new.mul_f64(0.2));
            }
            *existing = server;
        }
        self.kind = self.derive_kind();
    }

    /// Mark every server unknown again
    pub fn reset(&mut self) {
        for server in &mut self.servers {
            *server = ServerDescription::unknown(server.address.clone());
        }
        self.kind = self.derive_kind();
    }

    pub fn server(&self, address: &str) -> Option<&ServerDescription> {
        self.servers.iter().find(|s| s.address == address)
    }

    /// A lone seed without a replica set name is a direct connection: it is
    /// `Single` whatever the server reports, so a secondary reached this way
    /// stays selectable.
    fn derive_kind(&self) -> TopologyKind {
        let any = |kind: ServerKind| self.servers.iter().any(|s| s.kind == kind);

        if self.seed_count == 1 && self.replica_set.is_none() {
            return TopologyKind::Single;
        }
        if any(ServerKind::Mongos) {
            return TopologyKind::Sharded;
        }
        if any(ServerKind::RsPrimary) {
            return TopologyKind::ReplicaSetWithPrimary;
        }
        if self.replica_set.is_some() || self.servers.iter().any(|s| s.kind.is_replica_set_member()) {
            return TopologyKind::ReplicaSetNoPrimary;
        }
        TopologyKind::Unknown
    }
}

/// Narrows a list of candidate servers
pub trait ServerSelector: Send + Sync {
    fn select<'a>(
        &self,
        topology: &TopologyDescription,
        candidates: Vec<&'a ServerDescription>,
    ) -> Vec<&'a ServerDescription>;
}

/// Selects servers eligible under a read preference
#[derive(Debug, Clone)]
pub struct ReadPrefSelector {
    read_preference: ReadPreference,
}

impl ReadPrefSelector {
    pub fn new(read_preference: ReadPreference) -> Self {
        Self { read_preference }
    }

    /// Selector pinned to the primary
    pub fn primary() -> Self {
        Self::new(ReadPreference::primary())
    }

    pub fn read_preference(&self) -> &ReadPreference {
        &self.read_preference
    }

    fn by_tags<'a>(&self, servers: Vec<&'a ServerDescription>) -> Vec<&'a ServerDescription> {
        let tag_sets = self.read_preference.tag_sets();
        if tag_sets.is_empty() {
            return servers;
        }
        for tag_set in tag_sets {
            let matching: Vec<_> = servers
                .iter()
                .copied()
                .filter(|s| s.matches_tags(tag_set))
                .collect();
            if !matching.is_empty() {
                return matching;
            }
        }
        Vec::new()
    }

    /// Drop secondaries whose estimated lag exceeds the max staleness.
    ///
    /// With a primary the lag is measured against the primary's last write;
    /// without one, against the freshest secondary. Secondaries that have not
    /// reported a last write date are treated as stale.
    fn fresh<'a>(
        &self,
        topology: &TopologyDescription,
        secondaries: Vec<&'a ServerDescription>,
        primary: Option<&ServerDescription>,
    ) -> Vec<&'a ServerDescription> {
        let Some(max_staleness) = self.read_preference.max_staleness() else {
            return secondaries;
        };
        let max_staleness = millis(max_staleness);
        let heartbeat = millis(topology.heartbeat_interval);

        let newest_write = topology
            .servers
            .iter()
            .filter(|s| s.kind == ServerKind::RsSecondary)
            .filter_map(|s| s.last_write_date)
            .map(|d| d.timestamp_millis())
            .max();

        let staleness = |s: &ServerDescription| -> Option<i64> {
            let write = s.last_write_date?.timestamp_millis();
            match primary {
                Some(p) => {
                    let primary_lag = p.last_update_time?.timestamp_millis()
                        - p.last_write_date?.timestamp_millis();
                    let lag = s.last_update_time?.timestamp_millis() - write;
                    Some(lag - primary_lag + heartbeat)
                }
                None => Some(newest_write? - write + heartbeat),
            }
        };

        secondaries
            .into_iter()
            .filter(|s| staleness(s).map(|st| st <= max_staleness).unwrap_or(false))
            .collect()
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl ServerSelector for ReadPrefSelector {
    fn select<'a>(
        &self,
        topology: &TopologyDescription,
        candidates: Vec<&'a ServerDescription>,
    ) -> Vec<&'a ServerDescription> {
        let of_kind = |kind: ServerKind| -> Vec<&'a ServerDescription> {
            candidates.iter().copied().filter(|s| s.kind == kind).collect()
        };

        match topology.kind {
            TopologyKind::Unknown => Vec::new(),
            TopologyKind::Single => candidates
                .iter()
                .copied()
                .filter(|s| s.kind.is_data_bearing())
                .collect(),
            TopologyKind::Sharded => of_kind(ServerKind::Mongos),
            TopologyKind::ReplicaSetNoPrimary | TopologyKind::ReplicaSetWithPrimary => {
                let primaries = of_kind(ServerKind::RsPrimary);
                let primary = primaries.first().copied();
                let fresh_secondaries =
                    || self.fresh(topology, of_kind(ServerKind::RsSecondary), primary);
                let secondaries = || self.by_tags(fresh_secondaries());
                match self.read_preference.mode() {
                    ReadPrefMode::Primary => primaries,
                    ReadPrefMode::PrimaryPreferred if !primaries.is_empty() => primaries,
                    ReadPrefMode::PrimaryPreferred | ReadPrefMode::Secondary => secondaries(),
                    ReadPrefMode::SecondaryPreferred => {
                        let selected = secondaries();
                        if selected.is_empty() {
                            primaries
                        } else {
                            selected
                        }
                    }
                    ReadPrefMode::Nearest => {
                        let mut members = primaries;
                        members.extend(fresh_secondaries());
                        self.by_tags(members)
                    }
                }
            }
        }
    }
}

/// Keeps servers within `threshold` of the fastest round trip
#[derive(Debug, Clone, Copy)]
pub struct LatencySelector {
    threshold: Duration,
}

impl LatencySelector {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }
}

impl ServerSelector for LatencySelector {
    fn select<'a>(
        &self,
        _topology: &TopologyDescription,
        candidates: Vec<&'a ServerDescription>,
    ) -> Vec<&'a ServerDescription> {
        let fastest = match candidates.iter().filter_map(|s| s.average_rtt).min() {
            Some(fastest) => fastest,
            None => return candidates,
        };
        let ceiling = fastest + self.threshold;
        candidates
            .into_iter()
            .filter(|s| s.average_rtt.map(|rtt| rtt <= ceiling).unwrap_or(false))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn server(address: &str, kind: ServerKind, rtt_ms: u64) -> ServerDescription {
        ServerDescription {
            address: address.to_string(),
            kind,
            average_rtt: Some(Duration::from_millis(rtt_ms)),
            set_name: kind.is_replica_set_member().then(|| "rs0".to_string()),
            ..Default::default()
        }
    }

    fn replica_set(servers: Vec<ServerDescription>) -> TopologyDescription {
        let seeds: Vec<String> = servers.iter().map(|s| s.address.clone()).collect();
        let mut topology = TopologyDescription::new(&seeds, Some("rs0".to_string()));
        for s in servers {
            topology.update(s);
        }
        topology
    }

    fn select(selector: &dyn ServerSelector, topology: &TopologyDescription) -> Vec<String> {
        let candidates = topology.servers.iter().collect();
        selector
            .select(topology, candidates)
            .into_iter()
            .map(|s| s.address.clone())
            .collect()
    }

    #[test]
    fn test_from_hello_kinds() {
        let rtt = Duration::from_millis(1);
        let primary = doc! { "ok": 1.0, "isWritablePrimary": true, "setName": "rs0" };
        let secondary = doc! { "ok": 1, "secondary": true, "setName": "rs0" };
        let mongos = doc! { "ok": 1.0, "msg": "isdbgrid" };
        let standalone = doc! { "ok": 1.0, "isWritablePrimary": true };
        let failed = doc! { "ok": 0.0, "errmsg": "boom" };

        assert_eq!(ServerDescription::from_hello("a", &primary, rtt).kind, ServerKind::RsPrimary);
        assert_eq!(ServerDescription::from_hello("a", &secondary, rtt).kind, ServerKind::RsSecondary);
        assert_eq!(ServerDescription::from_hello("a", &mongos, rtt).kind, ServerKind::Mongos);
        assert_eq!(ServerDescription::from_hello("a", &standalone, rtt).kind, ServerKind::Standalone);
        assert_eq!(ServerDescription::from_hello("a", &failed, rtt).kind, ServerKind::Unknown);
    }

    #[test]
    fn test_from_hello_tags() {
        let reply = doc! { "ok": 1.0, "secondary": true, "setName": "rs0", "tags": { "dc": "ny" } };
        let description = ServerDescription::from_hello("a", &reply, Duration::ZERO);
        assert_eq!(description.tags.get("dc").map(String::as_str), Some("ny"));
    }

    #[test]
    fn test_topology_kind_derivation() {
        let single = {
            let mut t = TopologyDescription::new(&["a".to_string()], None);
            t.update(server("a", ServerKind::Standalone, 1));
            t
        };
        assert_eq!(single.kind, TopologyKind::Single);

        let no_primary = replica_set(vec![server("a", ServerKind::RsSecondary, 1)]);
        assert_eq!(no_primary.kind, TopologyKind::ReplicaSetNoPrimary);

        let with_primary = replica_set(vec![
            server("a", ServerKind::RsSecondary, 1),
            server("b", ServerKind::RsPrimary, 1),
        ]);
        assert_eq!(with_primary.kind, TopologyKind::ReplicaSetWithPrimary);

        let mut reset = with_primary.clone();
        reset.reset();
        assert_eq!(reset.kind, TopologyKind::ReplicaSetNoPrimary);
        assert!(reset.servers.iter().all(|s| s.kind == ServerKind::Unknown));
    }

    #[test]
    fn test_primary_selector_ignores_secondaries() {
        let topology = replica_set(vec![
            server("s1", ServerKind::RsSecondary, 1),
            server("p", ServerKind::RsPrimary, 50),
        ]);
        assert_eq!(select(&ReadPrefSelector::primary(), &topology), vec!["p"]);
    }

    #[test]
    fn test_secondary_preferred_falls_back_to_primary() {
        let topology = replica_set(vec![server("p", ServerKind::RsPrimary, 1)]);
        let selector = ReadPrefSelector::new(ReadPreference::new(ReadPrefMode::SecondaryPreferred));
        assert_eq!(select(&selector, &topology), vec!["p"]);
    }

    #[test]
    fn test_tag_sets_evaluated_in_order() {
        let mut ny = server("ny", ServerKind::RsSecondary, 1);
        ny.tags.insert("dc".to_string(), "ny".to_string());
        let mut sf = server("sf", ServerKind::RsSecondary, 1);
        sf.tags.insert("dc".to_string(), "sf".to_string());
        let topology = replica_set(vec![ny, sf, server("p", ServerKind::RsPrimary, 1)]);

        let tags = |dc: &str| {
            let mut t = TagSet::new();
            t.insert("dc".to_string(), dc.to_string());
            t
        };
        let rp = ReadPreference::new(ReadPrefMode::Secondary)
            .with_tag_sets(vec![tags("la"), tags("sf"), tags("ny")])
            .unwrap();
        assert_eq!(select(&ReadPrefSelector::new(rp), &topology), vec!["sf"]);
    }

    #[test]
    fn test_direct_connection_to_secondary() {
        let mut topology = TopologyDescription::new(&["s1".to_string()], None);
        assert_eq!(topology.kind, TopologyKind::Single);
        assert!(select(&ReadPrefSelector::primary(), &topology).is_empty());

        topology.update(server("s1", ServerKind::RsSecondary, 1));
        assert_eq!(topology.kind, TopologyKind::Single);
        assert_eq!(select(&ReadPrefSelector::primary(), &topology), vec!["s1"]);

        let named = {
            let mut t = TopologyDescription::new(&["s1".to_string()], Some("rs0".to_string()));
            t.update(server("s1", ServerKind::RsSecondary, 1));
            t
        };
        assert_eq!(named.kind, TopologyKind::ReplicaSetNoPrimary);
        assert!(select(&ReadPrefSelector::primary(), &named).is_empty());
    }

    fn written(address: &str, kind: ServerKind, lag_secs: i64) -> ServerDescription {
        const NOW: i64 = 1_700_000_000_000;
        ServerDescription {
            last_write_date: Some(DateTime::from_millis(NOW - lag_secs * 1000)),
            last_update_time: Some(DateTime::from_millis(NOW)),
            ..server(address, kind, 1)
        }
    }

    fn stale_reads(mode: ReadPrefMode) -> ReadPrefSelector {
        let rp = ReadPreference::new(mode)
            .with_max_staleness(Duration::from_secs(90))
            .unwrap();
        ReadPrefSelector::new(rp)
    }

    #[test]
    fn test_max_staleness_against_primary() {
        let topology = replica_set(vec![
            written("p", ServerKind::RsPrimary, 0),
            written("fresh", ServerKind::RsSecondary, 30),
            written("stale", ServerKind::RsSecondary, 200),
            server("unreported", ServerKind::RsSecondary, 1),
        ])
        .with_heartbeat_interval(Duration::from_secs(10));

        assert_eq!(select(&stale_reads(ReadPrefMode::Secondary), &topology), vec!["fresh"]);
        assert_eq!(
            select(&stale_reads(ReadPrefMode::Nearest), &topology),
            vec!["p", "fresh"]
        );

        let unbounded = ReadPrefSelector::new(ReadPreference::new(ReadPrefMode::Secondary));
        assert_eq!(select(&unbounded, &topology).len(), 3);
    }

    #[test]
    fn test_max_staleness_without_primary() {
        let topology = replica_set(vec![
            written("newest", ServerKind::RsSecondary, 0),
            written("close", ServerKind::RsSecondary, 75),
            written("behind", ServerKind::RsSecondary, 85),
        ])
        .with_heartbeat_interval(Duration::from_secs(10));

        assert_eq!(
            select(&stale_reads(ReadPrefMode::SecondaryPreferred), &topology),
            vec!["newest", "close"]
        );
    }

    #[test]
    fn test_from_hello_last_write() {
        let written_at = DateTime::from_millis(1_700_000_000_000);
        let reply = doc! {
            "ok": 1.0,
            "secondary": true,
            "setName": "rs0",
            "lastWrite": { "lastWriteDate": written_at },
        };
        let description = ServerDescription::from_hello("a", &reply, Duration::ZERO);
        assert_eq!(description.last_write_date, Some(written_at));
        assert!(description.last_update_time.is_some());
    }

    #[test]
    fn test_unknown_topology_selects_nothing() {
        let topology = TopologyDescription::new(&["a".to_string(), "b".to_string()], None);
        assert!(select(&ReadPrefSelector::primary(), &topology).is_empty());
    }

    #[test]
    fn test_latency_window() {
        let topology = replica_set(vec![
            server("fast", ServerKind::RsSecondary, 5),
            server("ok", ServerKind::RsSecondary, 19),
            server("slow", ServerKind::RsSecondary, 40),
        ]);
        let selected = select(&LatencySelector::new(Duration::from_millis(15)), &topology);
        assert_eq!(selected, vec!["fast", "ok"]);
    }
}
