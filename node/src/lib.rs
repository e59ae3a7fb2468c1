use std::{cmp::Ordering, future, net::SocketAddr};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub mod codec;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod msg;
mod net;

pub use config::NodeConfig;
pub use error::{NodeError, Result};

use codec::{check_body, check_identity, decode_line};
use connection::{Connection, PeerHandle};
use dedup::DedupLog;
use msg::{
    random_token, ConnId, Departure, ElectionPhase, Gossip, Identity, LinkOrigin, Message, MsgId,
    NeighborSummary, NodeCmd, NodeSummary,
};

const NODE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TimerKind {
    /// Declare victory if still a candidate.
    Candidacy,
    /// Contest again if no leader turned up.
    Deferral,
}

/// The single pending election timeout. Replacing or clearing it is how a
/// stale candidacy or deferral gets cancelled.
#[derive(Clone, Copy, Debug)]
struct ElectionTimer {
    kind: TimerKind,
    deadline: Instant,
}

#[derive(Debug)]
struct Neighbor {
    handle: PeerHandle,
    /// Unknown until the peer identifies itself.
    identity: Option<Identity>,
}

/// Peer node core: neighbor set, bully election and flood gossip.
///
/// All node-level state lives in this struct and is only touched from the
/// task running [`Node::run`]; everything else talks to it via [`NodeCmd`].
#[derive(Debug)]
pub struct Node {
    config: NodeConfig,
    /// Links in the order they were established.
    neighbors: Vec<Neighbor>,
    leader: Option<Identity>,
    is_candidate: bool,
    timer: Option<ElectionTimer>,
    log: DedupLog,
    /// Broadcast bodies accepted and interpreted here.
    delivered: u64,
    next_conn: ConnId,
    // Channels
    cmd_rx: mpsc::Receiver<NodeCmd>,
    /// Handed to every connection actor.
    cmd_tx: mpsc::Sender<NodeCmd>,
    accepting: CancellationToken,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        cmd_tx: mpsc::Sender<NodeCmd>,
        cmd_rx: mpsc::Receiver<NodeCmd>,
        accepting: CancellationToken,
    ) -> Self {
        let log = DedupLog::new(config.dedup_capacity);
        Self {
            config,
            neighbors: Vec::new(),
            leader: None,
            is_candidate: false,
            timer: None,
            log,
            delivered: 0,
            next_conn: 0,
            cmd_rx,
            cmd_tx,
            accepting,
        }
    }

    /// Bind the listener and start the node and accept tasks.
    pub async fn spawn(config: NodeConfig) -> Result<NodeHandle> {
        check_identity(&config.identity)?;
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(NODE_CHANNEL_CAPACITY);
        let accepting = CancellationToken::new();
        tokio::spawn(net::accept_loop(
            listener,
            cmd_tx.clone(),
            accepting.clone(),
        ));

        let identity = config.identity.clone();
        let mut node = Node::new(config, cmd_tx.clone(), cmd_rx, accepting);
        tokio::spawn(async move {
            node.run().await;
        });
        info!(%identity, %local_addr, "node running");
        Ok(NodeHandle {
            identity,
            local_addr,
            tx: cmd_tx,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.config.identity
    }

    pub async fn run(&mut self) {
        loop {
            let deadline = self.timer.map(|t| t.deadline);
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => {
                    if !self.process(cmd) {
                        return;
                    }
                }
                _ = sleep_until(deadline) => {
                    self.handle_timeout();
                }
            }
        }
    }

    /// Returns false once the node should stop.
    fn process(&mut self, cmd: NodeCmd) -> bool {
        match cmd {
            NodeCmd::Attach {
                stream,
                remote_addr,
                origin,
            } => {
                let conn = self.next_conn_id();
                let handle = Connection::spawn(
                    stream,
                    conn,
                    remote_addr,
                    &self.config,
                    self.cmd_tx.clone(),
                );
                self.add_neighbor(handle);
                if origin == LinkOrigin::Dialed {
                    self.start_election();
                }
            }
            NodeCmd::PeerIdentified { conn, identity } => self.identify_neighbor(conn, identity),
            NodeCmd::Gossip { from, id, body } => self.receive_gossip(from, id, body),
            NodeCmd::PeerDown { conn, departure } => self.peer_down(conn, departure),
            NodeCmd::StartElection => self.start_election(),
            NodeCmd::Broadcast { body, reply } => {
                let id = self.broadcast(body);
                let _ = reply.send(id);
            }
            NodeCmd::Summary { reply } => {
                let _ = reply.send(self.state_summary());
            }
            NodeCmd::Shutdown => self.accepting.cancel(),
            NodeCmd::Suspend => {
                self.accepting.cancel();
                for n in &self.neighbors {
                    n.handle.suspend();
                }
            }
            NodeCmd::Stop => {
                self.accepting.cancel();
                self.neighbors.clear();
                return false;
            }
        }
        true
    }

    fn next_conn_id(&mut self) -> ConnId {
        self.next_conn += 1;
        self.next_conn
    }

    fn add_neighbor(&mut self, handle: PeerHandle) {
        info!(conn = handle.conn, remote_addr = %handle.remote_addr, "neighbor added");
        self.neighbors.push(Neighbor {
            handle,
            identity: None,
        });
        debug!("{} neighbors connected", self.neighbors.len());
    }

    /// Removing a link that is already gone is a no-op.
    fn remove_neighbor(&mut self, conn: ConnId) -> Option<Neighbor> {
        let idx = self.neighbors.iter().position(|n| n.handle.conn == conn)?;
        let neighbor = self.neighbors.remove(idx);
        info!(
            conn,
            peer = ?neighbor.identity,
            "neighbor disconnected, {} remain",
            self.neighbors.len()
        );
        Some(neighbor)
    }

    fn identify_neighbor(&mut self, conn: ConnId, identity: Identity) {
        if let Some(n) = self.neighbors.iter_mut().find(|n| n.handle.conn == conn) {
            n.identity = Some(identity);
        }
    }

    fn peer_down(&mut self, conn: ConnId, departure: Departure) {
        let Some(neighbor) = self.remove_neighbor(conn) else {
            return;
        };
        debug!(conn, "link teardown: {departure}");
        if neighbor.identity.is_some() && neighbor.identity == self.leader {
            info!(leader = ?self.leader, "lost the leader");
            self.leader = None;
            self.start_election();
        }
    }

    /// Flood `body` to every neighbor, wrapping it in a fresh envelope
    /// unless it already is one. Returns the envelope id.
    fn broadcast(&mut self, body: String) -> MsgId {
        let (id, body) = match decode_line(&body) {
            Message::Broadcast { id, body } => (id, body),
            _ => (random_token(self.config.msg_id_len), body),
        };
        // Our own flood echoing back must be dropped like any duplicate.
        self.log.insert(id.clone());
        self.flood(Message::Broadcast {
            id: id.clone(),
            body,
        });
        id
    }

    /// Send to every neighbor, including the one a relayed message came
    /// from. The duplicate log at each hop is what stops the flood.
    fn flood(&self, msg: Message) {
        for n in &self.neighbors {
            n.handle.send(msg.clone());
        }
    }

    fn receive_gossip(&mut self, from: ConnId, id: MsgId, body: String) {
        if self.log.contains(&id) {
            trace!(from, %id, "duplicate broadcast dropped");
            return;
        }
        self.log.insert(id.clone());
        self.flood(Message::Broadcast {
            id,
            body: body.clone(),
        });
        self.delivered += 1;
        match Gossip::parse(&body) {
            Gossip::Election { candidate } => self.receive_election(candidate),
            Gossip::Victory { leader } => self.receive_victory(leader),
            Gossip::Other(_) => {}
        }
    }

    /// Remote below us: contest. Remote above us: defer.
    fn receive_election(&mut self, candidate: Identity) {
        debug!(%candidate, "received election");
        match candidate.as_str().cmp(self.identity().as_str()) {
            Ordering::Less => self.contest(),
            Ordering::Greater => self.defer(),
            Ordering::Equal => {}
        }
    }

    fn receive_victory(&mut self, leader: Identity) {
        info!(%leader, "victory announced");
        self.leader = Some(leader);
        self.is_candidate = false;
        self.timer = None;
    }

    /// Announce candidacy and give everyone `bully_time` to object.
    fn start_election(&mut self) {
        info!(identity = %self.identity(), "starting election");
        let body = Gossip::Election {
            candidate: self.identity().clone(),
        }
        .to_string();
        self.broadcast(body);
        self.is_candidate = true;
        self.set_timer(TimerKind::Candidacy);
    }

    /// A running candidacy keeps its deadline; the contender only needs to
    /// hear our election.
    fn contest(&mut self) {
        if self.is_candidate {
            let body = Gossip::Election {
                candidate: self.identity().clone(),
            }
            .to_string();
            self.broadcast(body);
        } else {
            self.start_election();
        }
    }

    fn defer(&mut self) {
        debug!("deferring to a stronger candidate");
        self.is_candidate = false;
        self.set_timer(TimerKind::Deferral);
    }

    fn declare_victory(&mut self) {
        let identity = self.identity().clone();
        info!(%identity, "won the election");
        self.leader = Some(identity.clone());
        self.is_candidate = false;
        self.timer = None;
        self.broadcast(Gossip::Victory { leader: identity }.to_string());
    }

    fn set_timer(&mut self, kind: TimerKind) {
        self.timer = Some(ElectionTimer {
            kind,
            deadline: Instant::now() + self.config.bully_time,
        });
    }

    fn handle_timeout(&mut self) {
        let Some(timer) = self.timer.take() else {
            return;
        };
        // Whatever happened since the timer was set decides what it means now.
        match timer.kind {
            TimerKind::Candidacy if self.is_candidate => self.declare_victory(),
            TimerKind::Deferral if self.leader.is_none() => self.start_election(),
            _ => {}
        }
    }

    fn phase(&self) -> ElectionPhase {
        match self.timer.map(|t| t.kind) {
            Some(TimerKind::Candidacy) if self.is_candidate => ElectionPhase::Candidate,
            Some(TimerKind::Deferral) => ElectionPhase::Deferring,
            _ => ElectionPhase::Idle,
        }
    }

    fn state_summary(&self) -> NodeSummary {
        NodeSummary {
            identity: self.identity().clone(),
            leader: self.leader.clone(),
            is_candidate: self.is_candidate,
            phase: self.phase(),
            neighbors: self
                .neighbors
                .iter()
                .map(|n| NeighborSummary {
                    conn: n.handle.conn,
                    identity: n.identity.clone(),
                    remote_addr: n.handle.remote_addr,
                })
                .collect(),
            seen: self.log.iter().cloned().collect(),
            delivered: self.delivered,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Cloneable control surface of a running node.
#[derive(Clone, Debug)]
pub struct NodeHandle {
    identity: Identity,
    local_addr: SocketAddr,
    tx: mpsc::Sender<NodeCmd>,
}

impl NodeHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dial `addr` (`host:port`), register the link and start an election.
    pub async fn connect(&self, addr: &str) -> Result<()> {
        let (stream, remote_addr) = net::dial(addr).await?;
        self.attach(stream, remote_addr).await
    }

    /// [`connect`](Self::connect) with the host and port given apart.
    pub async fn connect_host(&self, host: &str, port: u16) -> Result<()> {
        let (stream, remote_addr) = net::dial_host(host, port).await?;
        self.attach(stream, remote_addr).await
    }

    async fn attach(&self, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        self.send(NodeCmd::Attach {
            stream,
            remote_addr,
            origin: LinkOrigin::Dialed,
        })
        .await
    }

    pub async fn start_election(&self) -> Result<()> {
        self.send(NodeCmd::StartElection).await
    }

    /// Flood `body` to the network. Bodies spanning several lines are
    /// refused since the line break would split the frame.
    pub async fn broadcast(&self, body: impl Into<String>) -> Result<MsgId> {
        let body = body.into();
        check_body(&body)?;
        let (reply, rx) = oneshot::channel();
        self.send(NodeCmd::Broadcast {
            body,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::NodeStopped)
    }

    pub async fn summary(&self) -> Result<NodeSummary> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCmd::Summary { reply }).await?;
        rx.await.map_err(|_| NodeError::NodeStopped)
    }

    /// Stop accepting inbound links.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(NodeCmd::Shutdown).await
    }

    /// Make every link go silent without closing it, as if the process hung.
    pub async fn suspend(&self) -> Result<()> {
        self.send(NodeCmd::Suspend).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(NodeCmd::Stop).await
    }

    /// Resolves once the node task has ended.
    pub async fn stopped(&self) {
        self.tx.closed().await
    }

    async fn send(&self, cmd: NodeCmd) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| NodeError::NodeStopped)
    }
}
