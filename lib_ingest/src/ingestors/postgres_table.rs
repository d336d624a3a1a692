//! # PostgreSQL Table Reader
//!
//! Polls a table for rows, renders each row as a JSON object with
//! `row_to_json`, and deletes the row once the message is acknowledged. The
//! row's `ctid` is the receipt. Rows handed out but not yet settled are
//! tracked so a later poll does not emit them twice.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SourceAdapter;
use crate::configs::SourceDescriptor;
use crate::core::event::RawMessage;
use crate::errors::{AdapterError, ServiceError};

const DEFAULT_TABLE: &str = "cdrs";
const DEFAULT_BATCH: usize = 100;

/// Consumes rows of a PostgreSQL table.
pub struct PostgresTableAdapter {
    reader_id: String,
    url: String,
    table: String,
    batch: usize,
    poll: Duration,
    client: RwLock<Option<Arc<Client>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    queue: tokio::sync::Mutex<VecDeque<RawMessage>>,
    pending: Mutex<HashSet<String>>,
    closed: CancellationToken,
}

impl PostgresTableAdapter {
    /// Reads from `opts.sql_table` on the database at `source_path`.
    pub fn new(desc: &SourceDescriptor) -> Result<Self, ServiceError> {
        let table = desc.opts.sql_table.clone().unwrap_or_else(|| DEFAULT_TABLE.to_string());
        if !is_identifier(&table) {
            return Err(ServiceError::Config(crate::configs::ConfigError::invalid(
                &desc.id,
                format!("invalid sql table name {table:?}"),
            )));
        }
        Ok(Self {
            reader_id: desc.id.clone(),
            url: desc.source_path.clone(),
            table,
            batch: desc.opts.batch_size.unwrap_or(DEFAULT_BATCH).max(1),
            poll: desc.run_delay.max(Duration::from_millis(1)),
            client: RwLock::new(None),
            driver: Mutex::new(None),
            queue: tokio::sync::Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashSet::new()),
            closed: CancellationToken::new(),
        })
    }

    async fn client(&self) -> Result<Arc<Client>, AdapterError> {
        self.client.read().await.clone().ok_or(AdapterError::Closed)
    }

    /// Fetches up to one batch of rows that are not already in flight.
    async fn poll_rows(&self) -> Result<Vec<RawMessage>, AdapterError> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT ctid::text, row_to_json(t)::text FROM {} t LIMIT {}",
            self.table, self.batch
        );
        let messages = client.simple_query(&sql).await?;
        let mut pending = self.pending.lock();
        let mut out = Vec::new();
        for msg in messages {
            let SimpleQueryMessage::Row(row) = msg else {
                continue;
            };
            let (Some(ctid), Some(doc)) = (row.get(0), row.get(1)) else {
                continue;
            };
            if !pending.insert(ctid.to_string()) {
                continue;
            }
            out.push(
                RawMessage::new(format!("{}:{ctid}", self.table), doc.to_string())
                    .with_receipt(ctid),
            );
        }
        Ok(out)
    }

    async fn delete_row(&self, ctid: &str) -> Result<(), AdapterError> {
        let client = self.client().await?;
        let sql = format!("DELETE FROM {} WHERE ctid = $1::text::tid", self.table);
        client.execute(sql.as_str(), &[&ctid]).await.map_err(|e| AdapterError::Ack {
            id: ctid.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

/// Accepts plain and schema-qualified names only, since the table name is
/// spliced into the query text.
fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

#[async_trait]
impl SourceAdapter for PostgresTableAdapter {
    async fn connect(&self) -> Result<(), AdapterError> {
        let (client, connection) =
            tokio_postgres::connect(&self.url, NoTls)
                .await
                .map_err(|e| AdapterError::Connect {
                    target: self.table.clone(),
                    reason: e.to_string(),
                })?;
        let reader_id = self.reader_id.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(reader = %reader_id, error = %e, "postgres connection terminated");
            }
        });
        *self.client.write().await = Some(Arc::new(client));
        if let Some(old) = self.driver.lock().replace(driver) {
            old.abort();
        }
        info!(reader = %self.reader_id, table = %self.table, "connected to postgres");
        Ok(())
    }

    async fn next(&self) -> Result<Option<RawMessage>, AdapterError> {
        loop {
            if self.closed.is_cancelled() {
                return Ok(None);
            }
            {
                let mut queue = self.queue.lock().await;
                if queue.is_empty() {
                    let rows = match self.poll_rows().await {
                        Err(AdapterError::Closed) => return Ok(None),
                        other => other?,
                    };
                    if !rows.is_empty() {
                        debug!(reader = %self.reader_id, rows = rows.len(), "rows fetched");
                    }
                    queue.extend(rows);
                }
                if let Some(msg) = queue.pop_front() {
                    return Ok(Some(msg));
                }
            }
            tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
    }

    async fn ack(&self, msg: &RawMessage) -> Result<(), AdapterError> {
        let result = self.delete_row(&msg.receipt).await;
        self.pending.lock().remove(&msg.receipt);
        result
    }

    async fn reject(&self, msg: &RawMessage, redeliver: bool) -> Result<(), AdapterError> {
        if redeliver {
            self.pending.lock().remove(&msg.receipt);
            return Ok(());
        }
        warn!(reader = %self.reader_id, row = %msg.receipt, "dropping rejected row");
        self.ack(msg).await
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.closed.cancel();
        self.client.write().await.take();
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        Ok(())
    }
}
