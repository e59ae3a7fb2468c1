use color_eyre::eyre::{bail, eyre};
use rustbully_node::msg::{ElectionPhase, MsgId};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};

use crate::local_node::{LocalNodeSummary, NodeId};
use crate::{Cluster, CtlMsg, TEST_BULLY_TIME};

pub type Nodes = Vec<LocalNodeSummary>;

pub struct LocalClusterRunner {
    tx: mpsc::Sender<CtlMsg>,
    rx: mpsc::Receiver<CtlMsg>,
}

impl LocalClusterRunner {
    pub async fn new(node_count: u32) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(1024);
        let (replies_tx, replies_rx) = mpsc::channel(1024);
        let mut c = Cluster::launch(node_count, requests_rx, replies_tx)
            .await
            .expect("Failed to launch local cluster");
        tokio::spawn(async move {
            c.run().await;
        });
        Self {
            tx: requests_tx,
            rx: replies_rx,
        }
    }

    pub async fn get_cluster_state(&mut self) -> Nodes {
        self.tx.send(CtlMsg::GetClusterState).await.unwrap();

        if let Some(CtlMsg::SendClusterState { nodes }) = self.rx.recv().await {
            Ok(nodes)
        } else {
            Err(eyre!("No state received!"))
        }
        .unwrap()
    }

    pub async fn node(&mut self, id: NodeId) -> LocalNodeSummary {
        self.get_cluster_state()
            .await
            .into_iter()
            .find(|n| n.id == id)
            .expect("No such node")
    }

    pub async fn sleep(&mut self, ms: u64) {
        sleep(Duration::from_millis(ms)).await;
    }

    /// `from` dials `to`, which also makes `from` start an election.
    pub async fn link(&mut self, from: NodeId, to: NodeId) {
        self.tx
            .send(CtlMsg::Link { from, to })
            .await
            .expect("Failed to send Link");
    }

    pub async fn start_election(&mut self, id: NodeId) {
        self.tx
            .send(CtlMsg::StartElection { dest: id })
            .await
            .expect("Failed to send StartElection");
    }

    pub async fn broadcast(&mut self, id: NodeId, body: &str) -> MsgId {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CtlMsg::Broadcast {
                dest: id,
                body: body.to_string(),
                reply,
            })
            .await
            .expect("Failed to send Broadcast");
        rx.await.expect("No broadcast id received")
    }

    pub async fn kill(&mut self, id: NodeId) {
        self.tx
            .send(CtlMsg::Kill { dest: id })
            .await
            .expect("Failed to send Kill");
    }

    /// Wait until node `id` has exactly `count` identified neighbors.
    pub async fn wait_for_neighbors(
        &mut self,
        id: NodeId,
        count: usize,
    ) -> Result<LocalNodeSummary, color_eyre::eyre::Error> {
        for _ in 0..40 {
            let node = self.node(id).await;
            if node.node.neighbor_count() == count
                && node.node.neighbors.iter().all(|n| n.identity.is_some())
            {
                return Ok(node);
            }
            self.sleep(50).await;
        }
        bail!("Node {id} never reached {count} neighbors!")
    }

    /// Exactly one live node considers itself leader and every live node
    /// agrees on it.
    pub async fn check_one_leader(&mut self) -> Result<LocalNodeSummary, color_eyre::eyre::Error> {
        let iterations = 40;
        let mut last = String::new();
        for _ in 0..iterations {
            self.sleep(100).await;
            let nodes = self.get_cluster_state().await;
            let live: Nodes = nodes.into_iter().filter(|n| !n.is_dead).collect();
            let leaders = leaders(&live);
            match leaders.len() {
                1 => {
                    let leader = &leaders[0];
                    if live
                        .iter()
                        .all(|n| n.node.leader.as_ref() == Some(&leader.node.identity))
                    {
                        return Ok(leader.clone());
                    }
                    last = "live nodes disagree on the leader".to_string();
                }
                0 => last = "no leader".to_string(),
                l => last = format!("{l} nodes claim leadership"),
            }
        }
        bail!("No single agreed leader in time: {last}!")
    }

    /// Wait until no election is pending anywhere and no gossip has been
    /// delivered for a full election timeout.
    pub async fn wait_for_quiet(&mut self) -> Result<Nodes, color_eyre::eyre::Error> {
        let mut previous: Option<Vec<u64>> = None;
        for _ in 0..20 {
            let nodes = self.get_cluster_state().await;
            let delivered: Vec<u64> = nodes.iter().map(|n| n.node.delivered).collect();
            let idle = nodes
                .iter()
                .filter(|n| !n.is_dead)
                .all(|n| n.node.phase == ElectionPhase::Idle);
            if idle && previous.as_ref() == Some(&delivered) {
                return Ok(nodes);
            }
            previous = Some(delivered);
            sleep(TEST_BULLY_TIME).await;
        }
        bail!("Cluster never went quiet!")
    }

    pub async fn has_no_leader(&mut self) -> bool {
        self.get_cluster_state()
            .await
            .iter()
            .all(|n| n.node.leader.is_none())
    }
}

impl Drop for LocalClusterRunner {
    fn drop(&mut self) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(CtlMsg::Shutdown).await;
        });
    }
}

fn leaders(nodes: &Nodes) -> Nodes {
    nodes.iter().filter(|n| n.node.is_leader()).cloned().collect()
}

/// The identity the bully comparator lets win among `nodes`.
pub fn strongest(nodes: &Nodes) -> Option<String> {
    nodes.iter().map(|n| n.node.identity.clone()).max()
}
