//! Read preference modes and tag sets

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ouroboros_common::{DriverError, Result};

/// Smallest max staleness a read preference accepts
pub const SMALLEST_MAX_STALENESS: Duration = Duration::from_secs(90);

/// A set of server tags that must all match, e.g. `{dc: "ny", rack: "1"}`
pub type TagSet = BTreeMap<String, String>;

/// Which members of a deployment a read may target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadPrefMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPrefMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::Secondary => "secondary",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        }
    }
}

impl fmt::Display for ReadPrefMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadPrefMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "primarypreferred" => Ok(Self::PrimaryPreferred),
            "secondary" => Ok(Self::Secondary),
            "secondarypreferred" => Ok(Self::SecondaryPreferred),
            "nearest" => Ok(Self::Nearest),
            other => Err(DriverError::Configuration(format!(
                "unknown read preference mode: '{}'",
                other
            ))),
        }
    }
}

/// Read preference: a mode plus optional tag sets
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadPreference {
    mode: ReadPrefMode,
    tag_sets: Vec<TagSet>,
    max_staleness: Option<Duration>,
}

impl ReadPreference {
    /// Reads only from the primary
    pub fn primary() -> Self {
        Self::new(ReadPrefMode::Primary)
    }

    pub fn new(mode: ReadPrefMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
            max_staleness: None,
        }
    }

    /// Attach tag sets, evaluated in order.
    ///
    /// # Errors
    ///
    /// Tag sets cannot be combined with the primary mode.
    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        if self.mode == ReadPrefMode::Primary && !tag_sets.is_empty() {
            return Err(DriverError::Configuration(
                "read preference tag sets cannot be used with mode primary".to_string(),
            ));
        }
        self.tag_sets = tag_sets;
        Ok(self)
    }

    /// Exclude secondaries whose replication lag is estimated above
    /// `max_staleness`.
    ///
    /// # Errors
    ///
    /// Max staleness cannot be combined with the primary mode and must be at
    /// least 90 seconds.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        if self.mode == ReadPrefMode::Primary {
            return Err(DriverError::Configuration(
                "max staleness cannot be used with mode primary".to_string(),
            ));
        }
        if max_staleness < SMALLEST_MAX_STALENESS {
            return Err(DriverError::Configuration(format!(
                "max staleness must be at least {}s, got {}s",
                SMALLEST_MAX_STALENESS.as_secs(),
                max_staleness.as_secs()
            )));
        }
        self.max_staleness = Some(max_staleness);
        Ok(self)
    }

    pub fn mode(&self) -> ReadPrefMode {
        self.mode
    }

    pub fn tag_sets(&self) -> &[TagSet] {
        &self.tag_sets
    }

    pub fn max_staleness(&self) -> Option<Duration> {
        self.max_staleness
    }
}

/// Parse `readPreferenceTags` syntax: `dc:ny,rack:1`. An empty string is the
/// empty tag set, which matches every server.
pub fn parse_tag_set(raw: &str) -> Result<TagSet> {
    let mut tags = TagSet::new();
    if raw.is_empty() {
        return Ok(tags);
    }
    for pair in raw.split(',') {
        let (key, value) = pair.split_once(':').ok_or_else(|| {
            DriverError::ConnString(format!("invalid read preference tag: '{}'", pair))
        })?;
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_is_case_insensitive() {
        assert_eq!(
            "secondaryPreferred".parse::<ReadPrefMode>().unwrap(),
            ReadPrefMode::SecondaryPreferred
        );
        assert_eq!("NEAREST".parse::<ReadPrefMode>().unwrap(), ReadPrefMode::Nearest);
        assert!("fastest".parse::<ReadPrefMode>().is_err());
    }

    #[test]
    fn test_default_is_primary() {
        assert_eq!(ReadPreference::default(), ReadPreference::primary());
        assert_eq!(ReadPreference::primary().mode().as_str(), "primary");
    }

    #[test]
    fn test_primary_rejects_tags() {
        let tags = vec![parse_tag_set("dc:ny").unwrap()];
        assert!(ReadPreference::primary().with_tag_sets(tags.clone()).is_err());

        let rp = ReadPreference::new(ReadPrefMode::Nearest)
            .with_tag_sets(tags)
            .unwrap();
        assert_eq!(rp.tag_sets()[0].get("dc").map(String::as_str), Some("ny"));
    }

    #[test]
    fn test_max_staleness_validation() {
        let err = ReadPreference::primary()
            .with_max_staleness(Duration::from_secs(120))
            .unwrap_err();
        assert!(matches!(err, DriverError::Configuration(_)));

        let err = ReadPreference::new(ReadPrefMode::Secondary)
            .with_max_staleness(Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, DriverError::Configuration(_)));

        let rp = ReadPreference::new(ReadPrefMode::Secondary)
            .with_max_staleness(SMALLEST_MAX_STALENESS)
            .unwrap();
        assert_eq!(rp.max_staleness(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_parse_tag_set() {
        let tags = parse_tag_set("dc:ny,rack:1").unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["rack"], "1");
        assert!(parse_tag_set("").unwrap().is_empty());
        assert!(parse_tag_set("dc").is_err());
    }
}
