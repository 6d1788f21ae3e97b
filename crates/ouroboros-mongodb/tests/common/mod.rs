//! In-memory deployment used by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use ouroboros_mongodb::{Connector, DriverError, Result, StreamConnection};
use tokio::sync::Semaphore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Fake servers keyed by `host:port`, sharing one database catalog
pub struct MockDeployment {
    hello: HashMap<String, Document>,
    databases: Vec<(String, i64)>,
    list_calls: Mutex<Vec<String>>,
    live: AtomicUsize,
    hold_list: AtomicBool,
    gate: Semaphore,
}

impl MockDeployment {
    pub fn standalone(address: &str) -> Arc<Self> {
        Self::new(vec![(address, doc! { "ok": 1.0, "isWritablePrimary": true })])
    }

    /// `primary` plus `secondaries`, all in set `rs0`
    pub fn replica_set(primary: &str, secondaries: &[&str]) -> Arc<Self> {
        let mut servers = vec![(
            primary,
            doc! { "ok": 1.0, "isWritablePrimary": true, "setName": "rs0" },
        )];
        for s in secondaries {
            servers.push((*s, doc! { "ok": 1.0, "secondary": true, "setName": "rs0" }));
        }
        Self::new(servers)
    }

    fn new(servers: Vec<(&str, Document)>) -> Arc<Self> {
        Arc::new(Self {
            hello: servers
                .into_iter()
                .map(|(address, reply)| (address.to_string(), reply))
                .collect(),
            databases: vec![
                ("admin".to_string(), 40960),
                ("config".to_string(), 12288),
                ("inventory".to_string(), 1 << 20),
                ("local".to_string(), 73728),
            ],
            list_calls: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            hold_list: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector(self.clone()))
    }

    /// Open connections, monitoring connections included
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Addresses that received `listDatabases`, in order
    pub fn list_calls(&self) -> Vec<String> {
        self.list_calls.lock().unwrap().clone()
    }

    /// Make `listDatabases` block until [`MockDeployment::release`]
    pub fn hold_list_databases(&self) {
        self.hold_list.store(true, Ordering::SeqCst);
    }

    pub fn release(&self, commands: usize) {
        self.gate.add_permits(commands);
    }

    /// Poll until `n` `listDatabases` calls have arrived
    pub async fn wait_for_list_calls(&self, n: usize) {
        while self.list_calls.lock().unwrap().len() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn list_databases(&self, address: &str, command: &Document) -> Result<Document> {
        self.list_calls.lock().unwrap().push(address.to_string());
        if self.hold_list.load(Ordering::SeqCst) {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| DriverError::Connection("gate closed".to_string()))?;
            permit.forget();
        }

        let wanted = command
            .get_document("filter")
            .ok()
            .and_then(|f| f.get_str("name").ok());
        let name_only = command.get_bool("nameOnly").unwrap_or(false);

        let mut total = 0_i64;
        let databases: Vec<Bson> = self
            .databases
            .iter()
            .filter(|(name, _)| wanted.map(|w| w == name.as_str()).unwrap_or(true))
            .map(|(name, size)| {
                total += size;
                if name_only {
                    Bson::Document(doc! { "name": name.as_str() })
                } else {
                    Bson::Document(doc! { "name": name.as_str(), "sizeOnDisk": *size, "empty": false })
                }
            })
            .collect();

        let mut reply = doc! { "databases": databases, "ok": 1.0 };
        if !name_only {
            reply.insert("totalSize", total);
        }
        Ok(reply)
    }
}

struct MockConnector(Arc<MockDeployment>);

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn StreamConnection>> {
        if !self.0.hello.contains_key(address) {
            return Err(DriverError::Connection(format!("connection refused: {}", address)));
        }
        self.0.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            address: address.to_string(),
            deployment: self.0.clone(),
        }))
    }
}

struct MockConnection {
    address: String,
    deployment: Arc<MockDeployment>,
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.deployment.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamConnection for MockConnection {
    async fn run_command(&mut self, db: &str, command: Document) -> Result<Document> {
        let name = command.keys().next().cloned().unwrap_or_default();
        match name.as_str() {
            "hello" => Ok(self.deployment.hello[&self.address].clone()),
            "listDatabases" => {
                assert_eq!(db, "admin");
                self.deployment.list_databases(&self.address, &command).await
            }
            "ping" => Ok(doc! { "ok": 1.0 }),
            "whoami" => Ok(doc! { "ok": 1.0, "db": db, "address": self.address.as_str() }),
            _ => Ok(doc! { "ok": 0.0, "code": 59, "errmsg": format!("no such command: '{}'", name) }),
        }
    }
}
