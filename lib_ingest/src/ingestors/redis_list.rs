//! # Redis List Reader
//!
//! Reliable-queue consumer: `BLMOVE` atomically moves each message from the
//! source list into a per-reader processing list, `ack` removes it from
//! there, and a redelivering `reject` pushes it back to the head of the source list.
//! Messages left in the processing list by a crash stay visible to
//! operators instead of being lost.
//!
//! Blocking reads and acknowledgements use separate connections so a long
//! `BLMOVE` never delays an `ack`.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::SourceAdapter;
use crate::configs::SourceDescriptor;
use crate::core::event::RawMessage;
use crate::errors::AdapterError;
use crate::utils::correlation_key;

const DEFAULT_LIST: &str = "cgrates_cdrs";
/// Seconds a single `BLMOVE` blocks before the read loop retries.
const BLOCK_SECS: f64 = 1.0;

#[derive(Clone)]
struct Connections {
    reader: MultiplexedConnection,
    writer: MultiplexedConnection,
}

/// Consumes JSON records from a Redis list.
pub struct RedisListAdapter {
    reader_id: String,
    url: String,
    list: String,
    processing: String,
    conns: RwLock<Option<Connections>>,
}

impl RedisListAdapter {
    /// Reads from `opts.redis_list` on the server at `source_path`.
    pub fn new(desc: &SourceDescriptor) -> Self {
        let list = desc.opts.redis_list.clone().unwrap_or_else(|| DEFAULT_LIST.to_string());
        Self {
            reader_id: desc.id.clone(),
            url: desc.source_path.clone(),
            processing: format!("{list}:processing:{}", desc.id),
            list,
            conns: RwLock::new(None),
        }
    }

    async fn connections(&self) -> Result<Connections, AdapterError> {
        self.conns.read().await.clone().ok_or(AdapterError::Closed)
    }
}

#[async_trait]
impl SourceAdapter for RedisListAdapter {
    async fn connect(&self) -> Result<(), AdapterError> {
        let connect_err = |e: redis::RedisError| AdapterError::Connect {
            target: self.url.clone(),
            reason: e.to_string(),
        };
        let client = Client::open(self.url.as_str()).map_err(connect_err)?;
        let reader = client.get_multiplexed_async_connection().await.map_err(connect_err)?;
        let writer = client.get_multiplexed_async_connection().await.map_err(connect_err)?;
        *self.conns.write().await = Some(Connections { reader, writer });
        info!(reader = %self.reader_id, list = %self.list, "connected to redis");
        Ok(())
    }

    async fn next(&self) -> Result<Option<RawMessage>, AdapterError> {
        loop {
            let Ok(mut conns) = self.connections().await else {
                return Ok(None);
            };
            let popped: Option<Vec<u8>> = redis::cmd("BLMOVE")
                .arg(&self.list)
                .arg(&self.processing)
                .arg("LEFT")
                .arg("RIGHT")
                .arg(BLOCK_SECS)
                .query_async(&mut conns.reader)
                .await?;
            if let Some(payload) = popped {
                let receipt = String::from_utf8_lossy(&payload).into_owned();
                let mut id = correlation_key(&[receipt.as_str()]);
                id.truncate(16);
                debug!(reader = %self.reader_id, message = %id, "message received");
                return Ok(Some(RawMessage::new(id, payload).with_receipt(receipt)));
            }
        }
    }

    async fn ack(&self, msg: &RawMessage) -> Result<(), AdapterError> {
        let mut conns = self.connections().await?;
        let _: i64 = redis::cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&msg.receipt)
            .query_async(&mut conns.writer)
            .await?;
        Ok(())
    }

    async fn reject(&self, msg: &RawMessage, redeliver: bool) -> Result<(), AdapterError> {
        let mut conns = self.connections().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("LREM").arg(&self.processing).arg(1).arg(&msg.receipt).ignore();
        if redeliver {
            pipe.cmd("LPUSH").arg(&self.list).arg(&msg.receipt).ignore();
        }
        let _: () = pipe.query_async(&mut conns.writer).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.conns.write().await.take();
        Ok(())
    }
}
