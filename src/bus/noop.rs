//! No-op bus, used when no backend is configured or reachable

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;

use super::transport::{BusTransport, PayloadStream};
use crate::error::BusError;

/// Accepts every call and delivers nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBus;

#[async_trait]
impl BusTransport for NoopBus {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn is_distributed(&self) -> bool {
        false
    }

    async fn publish(&self, _subject: &str, _payload: Bytes) -> Result<(), BusError> {
        Ok(())
    }

    async fn subscribe(&self, _subject: &str) -> Result<PayloadStream, BusError> {
        Ok(futures_util::stream::pending().boxed())
    }
}
