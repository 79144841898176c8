//! Redis pub/sub backend

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::transport::{BusTransport, PayloadStream};
use crate::error::BusError;

/// Bus over redis PUBLISH / SUBSCRIBE
///
/// Publishing shares one managed connection; every subscription opens its
/// own pub/sub connection.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    /// Connect to redis at `url`
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl BusTransport for RedisBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(subject, payload.as_ref()).await?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<PayloadStream, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(subject).await?;

        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));
        Ok(stream.boxed())
    }
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus").finish_non_exhaustive()
    }
}
