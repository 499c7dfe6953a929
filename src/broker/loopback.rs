//! In-process dialer connecting brokers of one process.
//!
//! Each dialed RPC spawns the target broker's service loop over a fresh
//! channel pair, exactly as a network transport would bind a stream to a
//! handler. Integration suites assemble multi-broker clusters with it;
//! registrations hold weak references so dropped brokers simply become
//! unreachable.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{AppendStream, Broker, Dialer, ReplicateStream};
use crate::constants::PIPELINE_SEND_DEPTH;
use crate::error::{Error, Result};
use crate::protocol::{ReadRequest, ReadResponse};
use crate::types::BrokerId;

#[derive(Default)]
pub struct LoopbackDialer {
    brokers: DashMap<BrokerId, Weak<Broker>>,
}

impl LoopbackDialer {
    pub fn new() -> Arc<LoopbackDialer> {
        Arc::new(LoopbackDialer::default())
    }

    /// Make `broker` dialable under its configured ID.
    pub fn register(&self, broker: &Arc<Broker>) {
        self.brokers
            .insert(broker.config.id.clone(), Arc::downgrade(broker));
    }

    fn lookup(&self, id: &BrokerId) -> Result<Arc<Broker>> {
        self.brokers
            .get(id)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| Error::Unavailable(format!("broker {id} is not dialable")))
    }
}

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn replicate(&self, id: &BrokerId, _endpoint: &str) -> Result<ReplicateStream> {
        let broker = self.lookup(id)?;
        let (req_tx, req_rx) = mpsc::channel(PIPELINE_SEND_DEPTH);
        let (resp_tx, resp_rx) = mpsc::channel(PIPELINE_SEND_DEPTH);

        tokio::spawn(async move {
            if let Err(err) = broker.serve_replicate(req_rx, resp_tx).await {
                debug!(error = %err, "replicate stream ended with error");
            }
        });
        Ok(ReplicateStream {
            tx: req_tx,
            rx: resp_rx,
        })
    }

    async fn append(&self, id: &BrokerId, _endpoint: &str) -> Result<AppendStream> {
        let broker = self.lookup(id)?;
        let (req_tx, req_rx) = mpsc::channel(PIPELINE_SEND_DEPTH);
        let (resp_tx, resp_rx) = oneshot::channel();

        tokio::spawn(async move {
            let response = broker.serve_append(req_rx).await;
            let _ = resp_tx.send(response);
        });
        Ok(AppendStream {
            tx: req_tx,
            response: resp_rx,
        })
    }

    async fn read(
        &self,
        id: &BrokerId,
        _endpoint: &str,
        req: ReadRequest,
    ) -> Result<mpsc::Receiver<ReadResponse>> {
        let broker = self.lookup(id)?;
        let (resp_tx, resp_rx) = mpsc::channel(PIPELINE_SEND_DEPTH);

        tokio::spawn(async move {
            if let Err(err) = broker.serve_read(req, resp_tx).await {
                debug!(error = %err, "read stream ended with error");
            }
        });
        Ok(resp_rx)
    }
}
