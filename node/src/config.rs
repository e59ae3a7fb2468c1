use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::msg::{
    random_identity, Identity, BULLY_TIME, DEDUP_CAPACITY, HEARTBEAT_INTERVAL,
    MAX_MISSED_HEARTBEATS, MSG_ID_LEN, NODE_PORT,
};

/// Construction-time settings of a node. The identity lives here rather
/// than in any global so that several nodes can share a process.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub identity: Identity,
    pub listen_addr: SocketAddr,
    pub bully_time: Duration,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub dedup_capacity: usize,
    pub msg_id_len: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: random_identity(),
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, NODE_PORT)),
            bully_time: BULLY_TIME,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            max_missed_heartbeats: MAX_MISSED_HEARTBEATS,
            dedup_capacity: DEDUP_CAPACITY,
            msg_id_len: MSG_ID_LEN,
        }
    }
}

impl NodeConfig {
    /// Default settings on an ephemeral localhost port, for running many
    /// nodes in one process.
    pub fn ephemeral() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, identity: impl Into<Identity>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_timing(mut self, bully_time: Duration, heartbeat_interval: Duration) -> Self {
        self.bully_time = bully_time;
        self.heartbeat_interval = heartbeat_interval;
        self
    }
}
