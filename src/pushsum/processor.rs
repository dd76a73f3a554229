use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};

use super::{
    message::{Ack, Message, Share},
    state::{NoPartnerPolicy, NodeState},
};
use crate::common::error::{PushSumError, Result};
use crate::network::NodeId;

/// A node running as its own task. It owns its state; other nodes reach it
/// only through its mailbox.
pub struct NodeProcessor {
    pub state: NodeState,
    pub msg_rx: Receiver<Message>,
    /// Mailboxes of the whole population, indexed by node id.
    pub mailboxes: Arc<Vec<Sender<Message>>>,
    pub ack_tx: Sender<Ack>,
}

impl NodeProcessor {
    pub async fn run(mut self) -> NodeState {
        let node = self.state.id();
        tracing::trace!(%node, "processor started");
        while let Some(message) = self.msg_rx.recv().await {
            let ack = match message {
                Message::Broadcast { round, partner, policy } => self.handle_broadcast(round, partner, policy).await,
                Message::Deliver(share) => self.handle_deliver(share),
                Message::Commit { round } => self.handle_commit(round),
                Message::Shutdown => break,
            };
            if let Some(ack) = ack {
                if self.ack_tx.send(ack).await.is_err() {
                    tracing::debug!(%node, "cluster gone, stopping");
                    break;
                }
            }
        }
        tracing::trace!(%node, "processor stopped");
        self.state
    }

    async fn handle_broadcast(&mut self, round: u64, partner: Option<NodeId>, policy: NoPartnerPolicy) -> Option<Ack> {
        let node = self.state.id();
        match self.broadcast(round, partner, policy).await {
            Ok(shared) => Some(Ack::Broadcast { node, round, shared }),
            Err(error) => Some(Ack::Failed { node, round, error }),
        }
    }

    async fn broadcast(&mut self, round: u64, partner: Option<NodeId>, policy: NoPartnerPolicy) -> Result<bool> {
        self.expect_round(round)?;
        let Some(share) = self.state.broadcast(partner, policy)? else {
            return Ok(false);
        };

        let mailbox = self.mailboxes.get(share.to.0).ok_or(PushSumError::UnknownNode {
            node: share.to,
            size: self.mailboxes.len(),
        })?;
        mailbox
            .send(Message::Deliver(share))
            .await
            .map_err(|_| PushSumError::RoundAborted {
                round,
                reason: format!("mailbox of {} closed", share.to),
            })?;
        Ok(true)
    }

    fn handle_deliver(&mut self, share: Share) -> Option<Ack> {
        match self.state.receive(&share) {
            Ok(()) => None,
            Err(error) => Some(Ack::Failed {
                node: self.state.id(),
                round: share.round,
                error,
            }),
        }
    }

    fn handle_commit(&mut self, round: u64) -> Option<Ack> {
        let node = self.state.id();
        let result = self.expect_round(round).and_then(|_| self.state.commit());
        Some(match result {
            Ok(()) => Ack::Committed {
                node,
                round,
                state: self.state,
            },
            Err(error) => Ack::Failed { node, round, error },
        })
    }

    fn expect_round(&self, round: u64) -> Result<()> {
        let expected = self.state.round_in_progress();
        if round != expected {
            return Err(PushSumError::RoundAborted {
                round,
                reason: format!("{} is in round {}", self.state.id(), expected),
            });
        }
        Ok(())
    }
}
