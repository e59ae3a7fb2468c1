use rand::Rng;
use std::{fmt, net::SocketAddr, time::Duration};
use tokio::sync::oneshot;

pub type Identity = String;
pub type MsgId = String;
pub type ConnId = u64;

/// Well-known port nodes listen on and dial by default.
pub const NODE_PORT: u16 = 12345;
/// How long a candidate waits before declaring victory, and how long a
/// deferring node waits before contesting again.
pub const BULLY_TIME: Duration = Duration::from_secs(5);
/// Interval between heartbeat probes on every link.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Consecutive unanswered probes before a link is declared dead.
pub const MAX_MISSED_HEARTBEATS: u32 = 3;
/// Number of recent broadcast ids kept after a trim of the duplicate log.
pub const DEDUP_CAPACITY: usize = 20;
pub const IDENTITY_LEN: usize = 10;
pub const MSG_ID_LEN: usize = 20;

const TOKEN_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A message as it travels over a peer link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Identify { identity: Identity },
    Ping,
    Pong,
    /// Flood-gossiped envelope. The body is kept verbatim so that relays
    /// forward exactly what they received.
    Broadcast { id: MsgId, body: String },
    /// Anything with an unrecognized leading token. Dropped by consumers.
    Unknown(String),
}

/// Interpretation of a broadcast body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Gossip {
    Election { candidate: Identity },
    Victory { leader: Identity },
    /// Flooded, never interpreted.
    Other(String),
}

impl fmt::Display for Gossip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gossip::Election { candidate } => write!(f, "election${candidate}"),
            Gossip::Victory { leader } => write!(f, "victory${leader}"),
            Gossip::Other(raw) => f.write_str(raw),
        }
    }
}

/// Commands the node core sends to a connection actor.
#[derive(Debug)]
pub enum PeerCmd {
    Send(Message),
    /// Stop reading and writing without closing the socket.
    Suspend,
}

/// How a connection actor ended.
#[derive(Debug)]
pub enum Departure {
    /// Zero-length read.
    Closed,
    HeartbeatTimeout,
    /// A write stayed blocked for as long as the heartbeat would allow.
    Stalled,
    Failed(crate::NodeError),
}

impl fmt::Display for Departure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Departure::Closed => f.write_str("closed by peer"),
            Departure::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            Departure::Stalled => f.write_str("peer stopped reading"),
            Departure::Failed(e) => write!(f, "link failure: {e}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkOrigin {
    Accepted,
    Dialed,
}

/// Everything the node core reacts to. Connection actors, the accept loop
/// and [`crate::NodeHandle`] all talk to the node through this.
#[derive(Debug)]
pub enum NodeCmd {
    Attach {
        stream: tokio::net::TcpStream,
        remote_addr: SocketAddr,
        origin: LinkOrigin,
    },
    PeerIdentified {
        conn: ConnId,
        identity: Identity,
    },
    Gossip {
        from: ConnId,
        id: MsgId,
        body: String,
    },
    PeerDown {
        conn: ConnId,
        departure: Departure,
    },
    StartElection,
    Broadcast {
        body: String,
        reply: oneshot::Sender<MsgId>,
    },
    Summary {
        reply: oneshot::Sender<NodeSummary>,
    },
    /// Stop accepting inbound links. Established links keep running.
    Shutdown,
    Suspend,
    /// Stop accepting, drop every link and end the node task.
    Stop,
}

///////////////////////////////////////////////////
// State snapshots for the console and for testing.
///////////////////////////////////////////////////
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ElectionPhase {
    Idle,
    Candidate,
    Deferring,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NeighborSummary {
    pub conn: ConnId,
    pub identity: Option<Identity>,
    pub remote_addr: SocketAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeSummary {
    pub identity: Identity,
    pub leader: Option<Identity>,
    pub is_candidate: bool,
    pub phase: ElectionPhase,
    pub neighbors: Vec<NeighborSummary>,
    /// Contents of the duplicate-suppression log, oldest first.
    pub seen: Vec<MsgId>,
    /// Number of broadcast bodies accepted and interpreted locally.
    pub delivered: u64,
}

impl NodeSummary {
    pub fn is_leader(&self) -> bool {
        self.leader.as_deref() == Some(self.identity.as_str())
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }
}

pub fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

pub fn random_identity() -> Identity {
    random_token(IDENTITY_LEN)
}
