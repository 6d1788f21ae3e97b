//! Administrative commands and their replies

use bson::{doc, Bson, Document};
use ouroboros_common::{DriverError, Result};
use serde::{Deserialize, Serialize};

use crate::topology::description::is_ok;

/// The `listDatabases` command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListDatabases {
    pub filter: Option<Document>,
    pub name_only: bool,
}

impl ListDatabases {
    pub fn encode(&self) -> Document {
        let mut cmd = doc! { "listDatabases": 1 };
        if let Some(filter) = &self.filter {
            cmd.insert("filter", filter.clone());
        }
        if self.name_only {
            cmd.insert("nameOnly", true);
        }
        cmd
    }
}

/// One entry of a `listDatabases` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpecification {
    pub name: String,
    /// Absent when the command ran with `nameOnly`
    #[serde(default, deserialize_with = "lenient_i64")]
    pub size_on_disk: i64,
    #[serde(default)]
    pub empty: bool,
}

/// Structured `listDatabases` result
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDatabasesResult {
    pub databases: Vec<DatabaseSpecification>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub total_size: i64,
}

impl ListDatabasesResult {
    /// Decode a raw reply
    pub fn from_reply(reply: Document) -> Result<Self> {
        Ok(bson::from_document(reply)?)
    }

    pub fn names(&self) -> Vec<String> {
        self.databases.iter().map(|db| db.name.clone()).collect()
    }
}

/// Turn an `ok: 0` reply into a `Command` error
pub fn check_reply(reply: Document) -> Result<Document> {
    if is_ok(&reply) {
        return Ok(reply);
    }
    let code = match reply.get("code") {
        Some(Bson::Int32(code)) => *code,
        Some(Bson::Int64(code)) => i32::try_from(*code).unwrap_or(-1),
        Some(Bson::Double(code)) => *code as i32,
        _ => -1,
    };
    let message = reply
        .get_str("errmsg")
        .unwrap_or("command failed without an error message")
        .to_string();
    Err(DriverError::Command { code, message })
}

/// Servers report sizes as int32, int64 or double depending on magnitude
fn lenient_i64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Bson::deserialize(deserializer)? {
        Bson::Int32(v) => Ok(i64::from(v)),
        Bson::Int64(v) => Ok(v),
        Bson::Double(v) => Ok(v as i64),
        Bson::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!(
            "expected a numeric size, got {:?}",
            other.element_type()
        ))),
    }
}
