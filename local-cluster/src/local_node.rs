use rustbully_node::{msg::NodeSummary, Node, NodeConfig, NodeHandle, Result};

pub type NodeId = usize;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalNodeSummary {
    pub id: NodeId,
    pub is_dead: bool,
    pub node: NodeSummary,
}

/// A real node listening on an ephemeral localhost port.
pub struct LocalNode {
    pub id: NodeId,
    pub is_dead: bool,
    handle: NodeHandle,
}

impl LocalNode {
    pub async fn start(id: NodeId, config: NodeConfig) -> Result<Self> {
        let handle = Node::spawn(config).await?;
        Ok(Self {
            id,
            is_dead: false,
            handle,
        })
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    /// Dial another local node.
    pub async fn connect(&self, other: &LocalNode) -> Result<()> {
        self.handle
            .connect(&other.handle.local_addr().to_string())
            .await
    }

    pub async fn summary(&self) -> Result<LocalNodeSummary> {
        Ok(LocalNodeSummary {
            id: self.id,
            is_dead: self.is_dead,
            node: self.handle.summary().await?,
        })
    }

    /// The node stops answering on every link but keeps its sockets open.
    pub async fn kill(&mut self) -> Result<()> {
        self.is_dead = true;
        self.handle.suspend().await
    }

    pub async fn shutdown(&self) {
        let _ = self.handle.stop().await;
    }
}
