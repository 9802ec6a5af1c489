//! SQL broker adapter backed by SQLite.
//!
//! The publisher batches INSERTs and flushes on a schedule. The subscriber
//! polls `status='PENDING'` rows in insertion order and marks them `DONE`
//! as they are enqueued.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dgfacade_config::ResolvedChannel;
use dgfacade_core::MessageEnvelope;
use rusqlite::Connection;
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::publisher::PublisherTransport;
use crate::subscriber::{Delivery, SubscriberTransport};

fn database_path(channel: &ResolvedChannel) -> BrokerResult<PathBuf> {
    channel
        .property_str("database")
        .map(PathBuf::from)
        .ok_or_else(|| {
            BrokerError::Config(dgfacade_config::ConfigError::Invalid(format!(
                "sql channel {} requires a database property",
                channel.channel_id
            )))
        })
}

fn ensure_table(conn: &Connection, table: &str) -> BrokerResult<()> {
    validate_table_name(table)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            payload TEXT NOT NULL,
            headers TEXT NOT NULL DEFAULT '{{}}',
            status TEXT NOT NULL DEFAULT 'PENDING',
            created_at TEXT NOT NULL
        )"
    ))?;
    Ok(())
}

/// Table names come from destination config, not user input, but a broken
/// config must not become SQL.
fn validate_table_name(table: &str) -> BrokerResult<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BrokerError::Config(dgfacade_config::ConfigError::Invalid(
            format!("invalid sql table name {table}"),
        )))
    }
}

/// Batching INSERT publisher.
#[derive(Debug, Default)]
pub struct SqlPublisherTransport {
    conn: Option<Mutex<Connection>>,
    pending: Vec<(String, MessageEnvelope)>,
    batch_size: usize,
    flush_interval: Duration,
}

impl SqlPublisherTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            conn: None,
            pending: Vec::new(),
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl PublisherTransport for SqlPublisherTransport {
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()> {
        let path = database_path(channel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        self.batch_size = usize::try_from(channel.property_u64("batch_size", 100)).unwrap_or(100);
        self.flush_interval =
            Duration::from_millis(channel.property_u64("flush_interval_ms", 1_000));
        self.conn = Some(Mutex::new(conn));
        debug!(database = %path.display(), "sql publisher connected");
        Ok(())
    }

    async fn send(&mut self, topic: &str, envelope: &MessageEnvelope) -> BrokerResult<()> {
        self.pending.push((topic.to_owned(), envelope.clone()));
        if self.pending.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn register_topic(&mut self, topic: &str) -> BrokerResult<()> {
        let Some(conn) = &self.conn else {
            return Err(BrokerError::NotConnected("sql".to_owned()));
        };
        let conn = conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        ensure_table(&conn, topic)
    }

    async fn flush(&mut self) -> BrokerResult<()> {
        let Some(conn) = &self.conn else {
            return Err(BrokerError::NotConnected("sql".to_owned()));
        };
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut conn = conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let tx = conn.transaction()?;
        for (table, envelope) in self.pending.drain(..) {
            ensure_table(&tx, &table)?;
            let headers = serde_json::to_string(&envelope.headers)?;
            tx.execute(
                &format!(
                    "INSERT INTO \"{table}\" (message_id, topic, payload, headers, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                rusqlite::params![
                    envelope.message_id,
                    envelope.topic,
                    envelope.payload,
                    headers,
                    envelope.timestamp.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn flush_interval(&self) -> Option<Duration> {
        Some(self.flush_interval)
    }
}

/// Pending-row polling subscriber.
#[derive(Debug, Default)]
pub struct SqlSubscriberTransport {
    conn: Option<Mutex<Connection>>,
    tables: Vec<String>,
    batch_size: usize,
}

impl SqlSubscriberTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            conn: None,
            tables: Vec::new(),
            batch_size: 50,
        }
    }

    fn poll_table(conn: &Connection, table: &str, batch_size: usize) -> BrokerResult<Vec<Delivery>> {
        let mut statement = conn.prepare(&format!(
            "SELECT id, message_id, topic, payload, headers, created_at
             FROM \"{table}\" WHERE status = 'PENDING' ORDER BY id LIMIT ?1"
        ))?;
        let rows = statement.query_map([batch_size], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut deliveries = Vec::new();
        for row in rows {
            let (id, message_id, topic, payload, headers, created_at) = row?;
            let headers = serde_json::from_str(&headers).unwrap_or_default();
            let timestamp = DateTime::parse_from_rfc3339(&created_at)
                .map_or_else(|_| Utc::now(), |t| t.with_timezone(&Utc));
            // Mark DONE as the row is enqueued.
            conn.execute(
                &format!("UPDATE \"{table}\" SET status = 'DONE' WHERE id = ?1"),
                [id],
            )?;
            deliveries.push(Delivery {
                destination: table.to_owned(),
                envelope: MessageEnvelope {
                    message_id,
                    topic,
                    payload,
                    headers,
                    timestamp,
                    partition: None,
                    offset: Some(id),
                },
            });
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl SubscriberTransport for SqlSubscriberTransport {
    async fn connect(&mut self, channel: &ResolvedChannel) -> BrokerResult<()> {
        let path = database_path(channel)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        self.batch_size = usize::try_from(channel.property_u64("batch_size", 50)).unwrap_or(50);
        self.conn = Some(Mutex::new(conn));
        debug!(database = %path.display(), "sql subscriber connected");
        Ok(())
    }

    async fn subscribe(&mut self, destination: &str) -> BrokerResult<()> {
        validate_table_name(destination)?;
        if !self.tables.iter().any(|t| t == destination) {
            self.tables.push(destination.to_owned());
        }
        let Some(conn) = &self.conn else {
            return Err(BrokerError::NotConnected("sql".to_owned()));
        };
        let conn = conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        ensure_table(&conn, destination)
    }

    async fn unsubscribe(&mut self, destination: &str) -> BrokerResult<()> {
        self.tables.retain(|t| t != destination);
        Ok(())
    }

    async fn poll(&mut self) -> BrokerResult<Vec<Delivery>> {
        let Some(conn) = &self.conn else {
            return Err(BrokerError::NotConnected("sql".to_owned()));
        };
        let conn = conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut deliveries = Vec::new();
        for table in &self.tables {
            deliveries.extend(Self::poll_table(&conn, table, self.batch_size)?);
        }
        Ok(deliveries)
    }
}
