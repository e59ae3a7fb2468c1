use ahash::{HashMap, HashMapExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use rustbully_node::{msg::MsgId, NodeConfig, Result};

pub mod local_cluster_tester;
pub mod local_node;

use crate::local_node::{LocalNode, LocalNodeSummary, NodeId};

/// Election timeout used by test clusters.
pub const TEST_BULLY_TIME: Duration = Duration::from_millis(300);
/// Heartbeat interval used by test clusters.
pub const TEST_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

pub enum CtlMsg {
    /// `from` dials `to`.
    Link { from: NodeId, to: NodeId },
    StartElection { dest: NodeId },
    Broadcast {
        dest: NodeId,
        body: String,
        reply: oneshot::Sender<MsgId>,
    },
    GetClusterState,
    SendClusterState { nodes: Vec<LocalNodeSummary> },
    Kill { dest: NodeId },
    Shutdown,
}

pub struct Cluster {
    nodes: HashMap<NodeId, LocalNode>,
    /// Channel for messages from cluster runner
    ctl_requests: mpsc::Receiver<CtlMsg>,
    /// Channel for sending messages to cluster runner
    ctl_replies: mpsc::Sender<CtlMsg>,
}

impl Cluster {
    pub async fn launch(
        node_count: u32,
        ctl_requests: mpsc::Receiver<CtlMsg>,
        ctl_replies: mpsc::Sender<CtlMsg>,
    ) -> Result<Self> {
        let mut nodes = HashMap::new();
        for id in 0..node_count as usize {
            let config =
                NodeConfig::ephemeral().with_timing(TEST_BULLY_TIME, TEST_HEARTBEAT_INTERVAL);
            nodes.insert(id, LocalNode::start(id, config).await?);
        }
        Ok(Self {
            nodes,
            ctl_requests,
            ctl_replies,
        })
    }

    pub async fn run(&mut self) {
        while let Some(msg) = self.ctl_requests.recv().await {
            if !self.process_ctl_msg(msg).await {
                return;
            }
        }
        self.shutdown().await;
    }

    /// Process messages sent from cluster runner
    async fn process_ctl_msg(&mut self, msg: CtlMsg) -> bool {
        use CtlMsg::*;
        match msg {
            Link { from, to } => {
                debug!(from, to, "linking nodes");
                let (Some(a), Some(b)) = (self.nodes.get(&from), self.nodes.get(&to)) else {
                    warn!(from, to, "no such node");
                    return true;
                };
                if let Err(e) = a.connect(b).await {
                    warn!(from, to, "link failed: {e}");
                }
            }
            StartElection { dest } => {
                if let Some(n) = self.nodes.get(&dest) {
                    let _ = n.handle().start_election().await;
                }
            }
            Broadcast { dest, body, reply } => {
                if let Some(n) = self.nodes.get(&dest) {
                    match n.handle().broadcast(body).await {
                        Ok(id) => {
                            let _ = reply.send(id);
                        }
                        Err(e) => warn!(dest, "broadcast failed: {e}"),
                    }
                }
            }
            GetClusterState => {
                let mut nodes = Vec::new();
                for n in self.nodes.values() {
                    match n.summary().await {
                        Ok(summary) => nodes.push(summary),
                        Err(e) => warn!(id = n.id, "no summary: {e}"),
                    }
                }
                nodes.sort_by_key(|n| n.id);
                if self.ctl_replies.send(SendClusterState { nodes }).await.is_err() {
                    return false;
                }
            }
            SendClusterState { .. } => {
                warn!("Cluster shouldn't receive SendClusterState!");
            }
            Kill { dest } => {
                if let Some(n) = self.nodes.get_mut(&dest) {
                    let _ = n.kill().await;
                }
            }
            Shutdown => {
                self.shutdown().await;
                return false;
            }
        }
        true
    }

    async fn shutdown(&mut self) {
        debug!("local cluster shutting down");
        for n in self.nodes.values() {
            n.shutdown().await;
        }
    }
}
