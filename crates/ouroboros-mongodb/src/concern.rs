//! Read and write concerns, and their resolution from a connection string.

use std::time::Duration;

use bson::{doc, Bson, Document};

use crate::connstring::ConnString;

/// Read isolation level, e.g. `local` or `majority`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadConcern {
    level: Option<String>,
}

impl ReadConcern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(level: impl Into<String>) -> Self {
        Self {
            level: Some(level.into()),
        }
    }

    pub fn set_level(&mut self, level: impl Into<String>) {
        self.level = Some(level.into());
    }

    pub fn level(&self) -> Option<&str> {
        self.level.as_deref()
    }

    /// Command-embedded form: `{ level: <level> }`
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if let Some(level) = &self.level {
            doc.insert("level", level.as_str());
        }
        doc
    }
}

/// The `w` component of a write concern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgment {
    /// Number of members that must acknowledge
    Nodes(i32),
    /// Named tag set, e.g. `majority`
    TagSet(String),
}

impl From<&Acknowledgment> for Bson {
    fn from(w: &Acknowledgment) -> Self {
        match w {
            Acknowledgment::Nodes(n) => Bson::Int32(*n),
            Acknowledgment::TagSet(tag) => Bson::String(tag.clone()),
        }
    }
}

/// Write acknowledgment requirements.
///
/// Every field is optional; an empty write concern means "server default".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteConcern {
    w: Option<Acknowledgment>,
    journal: Option<bool>,
    w_timeout: Option<Duration>,
}

impl WriteConcern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tag_set(&mut self, tag: impl Into<String>) {
        self.w = Some(Acknowledgment::TagSet(tag.into()));
    }

    pub fn set_w(&mut self, nodes: i32) {
        self.w = Some(Acknowledgment::Nodes(nodes));
    }

    pub fn set_journal(&mut self, journal: bool) {
        self.journal = Some(journal);
    }

    pub fn set_w_timeout(&mut self, timeout: Duration) {
        self.w_timeout = Some(timeout);
    }

    pub fn w(&self) -> Option<&Acknowledgment> {
        self.w.as_ref()
    }

    pub fn journal(&self) -> Option<bool> {
        self.journal
    }

    pub fn w_timeout(&self) -> Option<Duration> {
        self.w_timeout
    }

    /// True when no field has been set
    pub fn is_empty(&self) -> bool {
        self.w.is_none() && self.journal.is_none() && self.w_timeout.is_none()
    }

    /// False only for `w: 0` without journaling
    pub fn acknowledged(&self) -> bool {
        !matches!(self.w, Some(Acknowledgment::Nodes(0))) || self.journal == Some(true)
    }

    /// Command-embedded form: `{ w, j, wtimeout }`
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {};
        if let Some(w) = &self.w {
            doc.insert("w", Bson::from(w));
        }
        if let Some(j) = self.journal {
            doc.insert("j", j);
        }
        if let Some(timeout) = self.w_timeout {
            doc.insert("wtimeout", i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX));
        }
        doc
    }
}

/// Resolve the read concern. An empty level yields `None`: no concern object
/// is materialized and the server default applies.
pub fn read_concern_from_conn_string(cs: &ConnString) -> Option<ReadConcern> {
    if cs.read_concern_level.is_empty() {
        return None;
    }
    Some(ReadConcern::with_level(cs.read_concern_level.as_str()))
}

/// Resolve the write concern from the presence-flagged fields.
///
/// Fields apply in a fixed order: tag set, numeric `w`, journal, timeout.
/// When both a tag set and a numeric `w` are present both are applied and
/// the numeric `w` is the one that remains. Returns `None` when no field was
/// present at all.
pub fn write_concern_from_conn_string(cs: &ConnString) -> Option<WriteConcern> {
    let mut wc = WriteConcern::new();

    if !cs.w_string.is_empty() {
        wc.set_tag_set(cs.w_string.as_str());
    }
    if cs.w_number_set {
        wc.set_w(cs.w_number);
    }
    if cs.j_set {
        wc.set_journal(cs.j);
    }
    if cs.w_timeout_set {
        wc.set_w_timeout(cs.w_timeout);
    }

    (!wc.is_empty()).then_some(wc)
}
