use std::{sync::Arc, time::Duration};

use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    task::JoinHandle,
    time::{timeout_at, Instant},
};

use super::{
    coordinator::{check_population, max_delta, prime, RoundReport, RunSummary, RunTracker},
    ledger::MassLedger,
    message::{Ack, Message},
    processor::NodeProcessor,
    reader::EstimateReader,
    state::{NoPartnerPolicy, NodeState},
};
use crate::common::{
    config::{RoundOptions, Termination},
    error::{PushSumError, Result},
};
use crate::network::{NodeId, Overlay};

/*
    Concurrent execution: one tokio task per node. A round goes

      cluster --Broadcast--> every node
      node    --Deliver-->   partner mailbox       (before acking)
      node    --Ack::Broadcast--> cluster
      ........ barrier: all broadcast acks in ........
      cluster --Commit-->    every node
      node    --Ack::Committed(state)--> cluster

    Mailboxes are FIFO and a node enqueues its share before it acks, so every
    share sits ahead of the Commit in its receiver's mailbox. The round tag on
    shares catches anything that would cross the barrier anyway.

    The cluster only adopts snapshots once every node has committed. If a round
    fails or times out, nothing from it is adopted, the cluster halts, and the
    last fully committed snapshots stay readable.
*/

pub struct Cluster<O: Overlay> {
    overlay: O,
    options: RoundOptions,
    rng: StdRng,
    mailboxes: Arc<Vec<Sender<Message>>>,
    ack_rx: Receiver<Ack>,
    handles: Vec<JoinHandle<NodeState>>,
    committed: Vec<NodeState>,
    estimates: Vec<f64>,
    ledger: MassLedger,
    round_timeout: Duration,
    round: u64,
    halted: bool,
}

impl<O: Overlay> Cluster<O> {
    /// Primes the nodes and spawns one processor per node. Must be called
    /// from within a tokio runtime.
    pub fn spawn(overlay: O, mut states: Vec<NodeState>, options: RoundOptions, round_timeout: Duration) -> Result<Self> {
        check_population(&overlay, &states)?;
        prime(&mut states)?;

        let ledger = MassLedger::open(&states, options.conservation_tolerance);
        let estimates = states.iter().map(NodeState::estimate).collect::<Result<Vec<_>>>()?;

        // one Broadcast, up to n - 1 shares and one Commit per round
        let capacity = states.len() + 2;
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..states.len()).map(|_| mpsc::channel(capacity)).unzip();
        let mailboxes = Arc::new(senders);
        let (ack_tx, ack_rx) = mpsc::channel(2 * states.len() + 1);

        let handles = states
            .iter()
            .zip(receivers)
            .map(|(state, msg_rx)| {
                let processor = NodeProcessor {
                    state: *state,
                    msg_rx,
                    mailboxes: mailboxes.clone(),
                    ack_tx: ack_tx.clone(),
                };
                tokio::spawn(processor.run())
            })
            .collect();

        tracing::info!(nodes = states.len(), ?round_timeout, "cluster spawned");
        Ok(Cluster {
            overlay,
            options,
            rng: StdRng::seed_from_u64(options.seed),
            mailboxes,
            ack_rx,
            handles,
            committed: states,
            estimates,
            ledger,
            round_timeout,
            round: 0,
            halted: false,
        })
    }

    /// Completed rounds.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Snapshots from the last fully committed round.
    pub fn states(&self) -> &[NodeState] {
        &self.committed
    }

    pub fn ledger(&self) -> &MassLedger {
        &self.ledger
    }

    pub fn reader(&self) -> EstimateReader<'_> {
        EstimateReader::new(&self.committed)
    }

    pub async fn run_round(&mut self) -> Result<RoundReport> {
        if self.halted {
            return Err(PushSumError::Halted);
        }
        let result = self.drive_round().await;
        result.map_err(|error| {
            if error.is_fatal() {
                self.halted = true;
                tracing::error!(round = self.round + 1, %error, "cluster halted");
            }
            error
        })
    }

    pub async fn run(&mut self, termination: Termination) -> Result<RunSummary> {
        tracing::info!(nodes = self.committed.len(), ?termination, "starting concurrent run");
        let mut tracker = RunTracker::new(termination);
        while tracker.should_continue() {
            let report = self.run_round().await?;
            tracker.observe(&report);
        }

        let summary = tracker.summary();
        tracing::info!(
            rounds = summary.rounds,
            converged = summary.converged,
            last_delta = ?summary.last_delta,
            "run finished"
        );
        Ok(summary)
    }

    /// Stops every processor and returns the last committed snapshots.
    pub async fn shutdown(mut self) -> Result<Vec<NodeState>> {
        for mailbox in self.mailboxes.iter() {
            // a processor that already stopped has dropped its receiver
            let _ = mailbox.send(Message::Shutdown).await;
        }
        for handle in std::mem::take(&mut self.handles) {
            handle.await.map_err(|e| PushSumError::RoundAborted {
                round: self.round + 1,
                reason: format!("processor task failed: {}", e),
            })?;
        }
        tracing::debug!(rounds = self.round, "cluster shut down");
        Ok(std::mem::take(&mut self.committed))
    }

    async fn drive_round(&mut self) -> Result<RoundReport> {
        for state in &self.committed {
            state.ensure_quiescent()?;
        }

        let round = self.round + 1;
        let size = self.committed.len();
        let policy = self.options.no_partner;

        let mut isolated = 0;
        let (mut lost_value, mut lost_weight) = (0.0, 0.0);
        let mut partners = Vec::with_capacity(size);
        for state in &self.committed {
            let node = state.id();
            let partner = self.overlay.neighbor_for(node, round, &mut self.rng);
            match partner {
                Some(p) if p == node => return Err(PushSumError::SelfPartner { node }),
                Some(p) if p.0 >= size => {
                    return Err(PushSumError::RoundAborted {
                        round,
                        reason: format!("overlay picked unknown node {} for {}", p, node),
                    })
                }
                Some(_) => {}
                None => {
                    isolated += 1;
                    if policy == NoPartnerPolicy::Discard {
                        lost_value += state.value() / 2.0;
                        lost_weight += state.weight() / 2.0;
                    }
                }
            }
            partners.push(partner);
        }

        // phase 1
        let deadline = Instant::now() + self.round_timeout;
        for (i, partner) in partners.into_iter().enumerate() {
            self.send(round, NodeId(i), Message::Broadcast { round, partner, policy }, deadline).await?;
        }
        let mut broadcast = vec![false; size];
        for _ in 0..size {
            match self.next_ack(round, deadline).await? {
                Ack::Broadcast { node, .. } if !broadcast[node.0] => broadcast[node.0] = true,
                ack => return Err(unexpected(round, &ack)),
            }
        }
        tracing::trace!(round, "broadcast barrier passed");

        // phase 2
        let deadline = Instant::now() + self.round_timeout;
        for i in 0..size {
            self.send(round, NodeId(i), Message::Commit { round }, deadline).await?;
        }
        let mut snapshots: Vec<Option<NodeState>> = vec![None; size];
        for _ in 0..size {
            match self.next_ack(round, deadline).await? {
                Ack::Committed { node, state, .. } if snapshots[node.0].is_none() => snapshots[node.0] = Some(state),
                ack => return Err(unexpected(round, &ack)),
            }
        }
        let committed: Vec<NodeState> = snapshots.into_iter().flatten().collect();

        let mut ledger = self.ledger;
        ledger.record_loss(lost_value, lost_weight);
        ledger.verify(round, &committed)?;
        let estimates = committed.iter().map(NodeState::estimate).collect::<Result<Vec<_>>>()?;
        let max_delta = max_delta(&self.estimates, &estimates);

        self.ledger = ledger;
        self.committed = committed;
        self.estimates = estimates;
        self.round = round;

        if isolated > 0 && policy == NoPartnerPolicy::Discard {
            tracing::warn!(round, isolated, lost_value, lost_weight, "mass dropped by isolated nodes");
        }
        tracing::debug!(round, max_delta, isolated, "round committed");

        Ok(RoundReport {
            round,
            max_delta,
            isolated,
            lost_value,
            lost_weight,
        })
    }

    async fn send(&self, round: u64, node: NodeId, message: Message, deadline: Instant) -> Result<()> {
        let mailbox = &self.mailboxes[node.0];
        match timeout_at(deadline, mailbox.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PushSumError::RoundAborted {
                round,
                reason: format!("mailbox of {} closed", node),
            }),
            Err(_) => Err(PushSumError::RoundAborted {
                round,
                reason: format!("timed out sending to {}", node),
            }),
        }
    }

    /// Next acknowledgement of `round`; node failures surface as their error.
    async fn next_ack(&mut self, round: u64, deadline: Instant) -> Result<Ack> {
        match timeout_at(deadline, self.ack_rx.recv()).await {
            Ok(Some(Ack::Failed { node, error, .. })) => {
                tracing::error!(round, %node, %error, "node failed");
                Err(error)
            }
            Ok(Some(ack)) if ack.round() == round => Ok(ack),
            Ok(Some(ack)) => Err(unexpected(round, &ack)),
            Ok(None) => Err(PushSumError::RoundAborted {
                round,
                reason: "all processors stopped".into(),
            }),
            Err(_) => Err(PushSumError::RoundAborted {
                round,
                reason: format!("barrier timed out after {:?}", self.round_timeout),
            }),
        }
    }
}

impl<O: Overlay> Drop for Cluster<O> {
    fn drop(&mut self) {
        for mailbox in self.mailboxes.iter() {
            let _ = mailbox.try_send(Message::Shutdown);
        }
    }
}

fn unexpected(round: u64, ack: &Ack) -> PushSumError {
    PushSumError::RoundAborted {
        round,
        reason: format!("unexpected acknowledgement from {}: {:?}", ack.node(), ack),
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;
    use crate::network::{FullMesh, Peers};
    use crate::pushsum::init::{populate, Population, ValueDistribution};
    use crate::pushsum::message::Share;
    use crate::pushsum::Coordinator;

    fn nodes(values: &[f64]) -> Vec<NodeState> {
        let mut rng = StdRng::seed_from_u64(0);
        let population = Population::new(ValueDistribution::Explicit { values: values.to_vec() }, 1.0);
        populate(values.len(), &population, &mut rng).unwrap()
    }

    fn options(seed: u64, no_partner: NoPartnerPolicy) -> RoundOptions {
        RoundOptions {
            seed,
            no_partner,
            ..Default::default()
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_cluster_converges() {
        let mut cluster = Cluster::spawn(
            FullMesh::new(4),
            nodes(&[0.0, 0.0, 0.0, 8.0]),
            options(42, NoPartnerPolicy::Discard),
            TIMEOUT,
        )
        .unwrap();

        let summary = cluster.run(Termination::Rounds { rounds: 50 }).await.unwrap();
        assert_eq!(summary.rounds, 50);
        for estimate in cluster.reader().estimates().unwrap() {
            assert!((estimate - 2.0).abs() < 1e-6, "estimate {}", estimate);
        }

        let states = cluster.shutdown().await.unwrap();
        let value: f64 = states.iter().map(NodeState::value).sum();
        let weight: f64 = states.iter().map(NodeState::weight).sum();
        assert!((value - 8.0).abs() < 1e-9);
        assert!((weight - 4.0).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cluster_matches_sequential_run() {
        let values = [5.0, 1.0, 9.0, 3.0, 7.0, 2.0, 8.0, 4.0];

        let mut cluster = Cluster::spawn(FullMesh::new(8), nodes(&values), options(7, NoPartnerPolicy::Discard), TIMEOUT).unwrap();
        cluster.run(Termination::Rounds { rounds: 20 }).await.unwrap();

        let mut coordinator = Coordinator::new(FullMesh::new(8), nodes(&values), options(7, NoPartnerPolicy::Discard)).unwrap();
        coordinator.run(Termination::Rounds { rounds: 20 }).unwrap();

        // same seed, same partners; only the order of additions may differ
        for (a, b) in cluster.states().iter().zip(coordinator.states()) {
            assert!((a.value() - b.value()).abs() < 1e-12);
            assert!((a.weight() - b.weight()).abs() < 1e-12);
        }
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_lossy_partner() {
        let overlay = Peers::from_edges(3, &[(0, 1)]).unwrap();
        let mut cluster = Cluster::spawn(overlay, nodes(&[2.0, 4.0, 6.0]), options(0, NoPartnerPolicy::Discard), TIMEOUT).unwrap();

        let report = cluster.run_round().await.unwrap();
        assert_eq!(report.isolated, 1);
        let isolated = cluster.states()[2];
        assert_eq!((isolated.value(), isolated.weight()), (3.0, 0.5));
        assert_eq!(cluster.ledger().lost(), (3.0, 0.5));
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_single_node_retain() {
        let mut cluster = Cluster::spawn(Peers::isolated(1), nodes(&[3.0]), options(0, NoPartnerPolicy::Retain), TIMEOUT).unwrap();
        let summary = cluster
            .run(Termination::Converged { tolerance: 0.0, max_rounds: 10 })
            .await
            .unwrap();
        assert!(summary.converged);
        assert_eq!(summary.rounds, 1);
        let state = cluster.states()[0];
        assert_eq!((state.value(), state.weight()), (3.0, 1.0));
        cluster.shutdown().await.unwrap();
    }

    struct SelfLoop;

    impl Overlay for SelfLoop {
        fn len(&self) -> usize {
            2
        }

        fn neighbor_for(&self, node: NodeId, _round: u64, _rng: &mut dyn RngCore) -> Option<NodeId> {
            Some(node)
        }
    }

    #[tokio::test]
    async fn test_cluster_halts_on_self_partner() {
        let mut cluster = Cluster::spawn(SelfLoop, nodes(&[1.0, 2.0]), options(0, NoPartnerPolicy::Discard), TIMEOUT).unwrap();
        let before = cluster.states().to_vec();

        assert_eq!(cluster.run_round().await.unwrap_err(), PushSumError::SelfPartner { node: NodeId(0) });
        assert!(cluster.is_halted());
        assert_eq!(cluster.run_round().await.unwrap_err(), PushSumError::Halted);
        assert_eq!(cluster.states(), &before[..]);
        assert_eq!(cluster.round(), 0);
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_halts_when_node_fails_mid_round() {
        let mut cluster = Cluster::spawn(FullMesh::new(3), nodes(&[1.0, 2.0, 3.0]), options(3, NoPartnerPolicy::Discard), TIMEOUT).unwrap();
        cluster.run_round().await.unwrap();
        let committed = cluster.states().to_vec();

        // node 0 rejects a share tagged with a round nobody is in
        let stale = Share { round: 7, from: NodeId(1), to: NodeId(0), value: 1.0, weight: 1.0 };
        cluster.mailboxes[0].send(Message::Deliver(stale)).await.unwrap();

        assert_eq!(
            cluster.run_round().await.unwrap_err(),
            PushSumError::StaleShare { node: NodeId(0), from: NodeId(1), expected: 2, got: 7 }
        );
        assert!(cluster.is_halted());
        assert_eq!(cluster.round(), 1);
        assert_eq!(cluster.states(), &committed[..]);
        assert_eq!(cluster.run_round().await.unwrap_err(), PushSumError::Halted);

        assert_eq!(cluster.shutdown().await.unwrap(), committed);
    }

    #[tokio::test]
    async fn test_cluster_barrier_timeout_aborts_round() {
        let timeout = Duration::from_millis(50);
        let mut cluster = Cluster::spawn(FullMesh::new(2), nodes(&[4.0, 8.0]), options(0, NoPartnerPolicy::Discard), timeout).unwrap();
        let before = cluster.states().to_vec();

        // node 1 never hears about the round, so its broadcast ack never comes
        let (unread, _inbox) = mpsc::channel(8);
        let mut mailboxes = cluster.mailboxes.to_vec();
        let live = std::mem::replace(&mut mailboxes[1], unread);
        cluster.mailboxes = Arc::new(mailboxes);

        let error = cluster.run_round().await.unwrap_err();
        assert!(matches!(error, PushSumError::RoundAborted { round: 1, .. }), "{:?}", error);
        assert!(cluster.is_halted());
        assert_eq!(cluster.round(), 0);
        assert_eq!(cluster.states(), &before[..]);

        live.send(Message::Shutdown).await.unwrap();
        assert_eq!(cluster.shutdown().await.unwrap(), before);
    }
}
