//! Per-link connection actor.
//!
//! Each established link, inbound or outbound, is owned by exactly one
//! [`Connection`] task. The task holds the framed socket, answers pings,
//! probes the peer on a fixed heartbeat interval and hands broadcasts to the
//! node core. The node core reaches the task only through its
//! [`PeerHandle`]; dropping the handle ends the task and closes the socket.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::{self, error::TrySendError},
    time::{self, MissedTickBehavior},
};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::codec::WireCodec;
use crate::config::NodeConfig;
use crate::msg::{ConnId, Departure, Identity, Message, NodeCmd, PeerCmd};

const PEER_CHANNEL_CAPACITY: usize = 1024;

/// The node core's side of a link.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub conn: ConnId,
    pub remote_addr: SocketAddr,
    tx: mpsc::Sender<PeerCmd>,
}

impl PeerHandle {
    /// Queue a message on the link without waiting. Gossip is best effort:
    /// a full queue drops the message, a closed one means the link is
    /// already going down and its departure is on the way.
    pub fn send(&self, msg: Message) {
        match self.tx.try_send(PeerCmd::Send(msg)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(conn = self.conn, "outbound queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                trace!(conn = self.conn, "link already closed");
            }
        }
    }

    pub fn suspend(&self) {
        let _ = self.tx.try_send(PeerCmd::Suspend);
    }

    #[cfg(test)]
    pub(crate) fn detached(conn: ConnId) -> (Self, mpsc::Receiver<PeerCmd>) {
        let (tx, rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        let remote_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        (
            Self {
                conn,
                remote_addr,
                tx,
            },
            rx,
        )
    }
}

enum Exit {
    /// The link died; the node core must hear about it.
    Down(Departure),
    /// The node core let go of the link or is gone itself.
    Released,
}

pub struct Connection<S> {
    conn: ConnId,
    framed: Framed<S, WireCodec>,
    local_identity: Identity,
    peer_identity: Option<Identity>,
    /// Set by a pong, cleared before every probe.
    alive: bool,
    /// Whether a probe has been sent since the link came up.
    probing: bool,
    missed: u32,
    heartbeat_interval: Duration,
    max_missed: u32,
    /// Longest a single write may block before the peer counts as hung.
    write_timeout: Duration,
    cmds_rx: mpsc::Receiver<PeerCmd>,
    node_tx: mpsc::Sender<NodeCmd>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Start the actor for a freshly accepted or dialed socket. The first
    /// thing it does is identify the local node to the peer.
    pub fn spawn(
        io: S,
        conn: ConnId,
        remote_addr: SocketAddr,
        config: &NodeConfig,
        node_tx: mpsc::Sender<NodeCmd>,
    ) -> PeerHandle {
        let (tx, cmds_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        let connection = Connection {
            conn,
            framed: Framed::new(io, WireCodec::new()),
            local_identity: config.identity.clone(),
            peer_identity: None,
            alive: false,
            probing: false,
            missed: 0,
            heartbeat_interval: config.heartbeat_interval,
            max_missed: config.max_missed_heartbeats,
            write_timeout: config.heartbeat_interval * config.max_missed_heartbeats.max(1),
            cmds_rx,
            node_tx,
        };
        tokio::spawn(connection.run());
        PeerHandle {
            conn,
            remote_addr,
            tx,
        }
    }

    async fn run(mut self) {
        let departure = match self.serve().await {
            Exit::Down(departure) => departure,
            Exit::Released => {
                trace!(conn = self.conn, "released by node");
                return;
            }
        };
        debug!(
            conn = self.conn,
            peer = ?self.peer_identity,
            "link down: {departure}"
        );
        let _ = self
            .node_tx
            .send(NodeCmd::PeerDown {
                conn: self.conn,
                departure,
            })
            .await;
    }

    async fn serve(&mut self) -> Exit {
        let identify = Message::Identify {
            identity: self.local_identity.clone(),
        };
        if let Err(exit) = self.transmit(identify).await {
            return exit;
        }

        let mut heartbeat = time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(msg)) => self.receive(msg).await,
                    Some(Err(e)) => Err(Exit::Down(Departure::Failed(e))),
                    None => Err(Exit::Down(Departure::Closed)),
                },
                cmd = self.cmds_rx.recv() => match cmd {
                    Some(PeerCmd::Send(msg)) => self.transmit(msg).await,
                    Some(PeerCmd::Suspend) => {
                        self.hang().await;
                        Err(Exit::Released)
                    }
                    None => Err(Exit::Released),
                },
                _ = heartbeat.tick() => self.probe().await,
            };
            if let Err(exit) = step {
                return exit;
            }
        }
    }

    async fn receive(&mut self, msg: Message) -> Result<(), Exit> {
        match msg {
            Message::Identify { identity } => {
                trace!(conn = self.conn, %identity, "peer identified");
                self.peer_identity = Some(identity.clone());
                self.notify(NodeCmd::PeerIdentified {
                    conn: self.conn,
                    identity,
                })
                .await
            }
            Message::Ping => self.transmit(Message::Pong).await,
            Message::Pong => {
                self.alive = true;
                Ok(())
            }
            Message::Broadcast { id, body } => {
                self.notify(NodeCmd::Gossip {
                    from: self.conn,
                    id,
                    body,
                })
                .await
            }
            Message::Unknown(raw) => {
                debug!(conn = self.conn, "dropping unrecognized message {raw:?}");
                Ok(())
            }
        }
    }

    /// A peer that stops reading eventually blocks our writes. The deadline
    /// keeps such a write from holding up the heartbeat forever.
    async fn transmit(&mut self, msg: Message) -> Result<(), Exit> {
        match time::timeout(self.write_timeout, self.framed.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Exit::Down(Departure::Failed(e))),
            Err(_) => {
                debug!(conn = self.conn, "write blocked for {:?}", self.write_timeout);
                Err(Exit::Down(Departure::Stalled))
            }
        }
    }

    /// A closed node channel means the node task is gone.
    async fn notify(&mut self, cmd: NodeCmd) -> Result<(), Exit> {
        self.node_tx.send(cmd).await.map_err(|_| Exit::Released)
    }

    /// Judge the previous probe, then send the next one.
    async fn probe(&mut self) -> Result<(), Exit> {
        if self.probing {
            if self.alive {
                self.missed = 0;
            } else {
                self.missed += 1;
                debug!(conn = self.conn, missed = self.missed, "heartbeat missed");
                if self.missed >= self.max_missed {
                    return Err(Exit::Down(Departure::HeartbeatTimeout));
                }
            }
        }
        self.probing = true;
        self.alive = false;
        self.transmit(Message::Ping).await
    }

    /// Simulates a hung peer: the socket stays open but nothing is read or
    /// written until the node drops the link.
    async fn hang(&mut self) {
        debug!(conn = self.conn, "link suspended");
        while self.cmds_rx.recv().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        cell::Cell,
        io,
        marker::PhantomData,
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    fn test_config(heartbeat_ms: u64) -> NodeConfig {
        NodeConfig::ephemeral()
            .with_identity("LOCAL")
            .with_timing(Duration::from_millis(300), Duration::from_millis(heartbeat_ms))
    }

    fn start(
        heartbeat_ms: u64,
    ) -> (
        PeerHandle,
        Framed<DuplexStream, WireCodec>,
        mpsc::Receiver<NodeCmd>,
    ) {
        start_buffered(heartbeat_ms, 64 * 1024)
    }

    fn start_buffered(
        heartbeat_ms: u64,
        buffer: usize,
    ) -> (
        PeerHandle,
        Framed<DuplexStream, WireCodec>,
        mpsc::Receiver<NodeCmd>,
    ) {
        let (local, remote) = duplex(buffer);
        let (node_tx, node_rx) = mpsc::channel(16);
        let addr = SocketAddr::from(([127, 0, 0, 1], 1));
        let handle = Connection::spawn(local, 7, addr, &test_config(heartbeat_ms), node_tx);
        (handle, Framed::new(remote, WireCodec::new()), node_rx)
    }

    #[tokio::test]
    async fn identifies_first() {
        let (_handle, mut peer, _node_rx) = start(10_000);
        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Identify {
                identity: "LOCAL".into()
            }
        );
    }

    #[tokio::test]
    async fn ping_yields_exactly_one_pong() {
        let (_handle, mut peer, mut node_rx) = start(10_000);
        // identify, then the first heartbeat probe
        assert!(matches!(
            peer.next().await.unwrap().unwrap(),
            Message::Identify { .. }
        ));
        assert_eq!(peer.next().await.unwrap().unwrap(), Message::Ping);

        peer.send(Message::Ping).await.unwrap();
        assert_eq!(peer.next().await.unwrap().unwrap(), Message::Pong);

        let nothing_else = time::timeout(Duration::from_millis(200), peer.next()).await;
        assert!(nothing_else.is_err());
        assert!(node_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwards_identity_and_broadcasts() {
        let (_handle, mut peer, mut node_rx) = start(10_000);
        peer.send(Message::Identify {
            identity: "REMOTE".into(),
        })
        .await
        .unwrap();
        peer.send(Message::Unknown("garbage".into())).await.unwrap();
        peer.send(Message::Broadcast {
            id: "M1".into(),
            body: "victory$REMOTE".into(),
        })
        .await
        .unwrap();

        match node_rx.recv().await.unwrap() {
            NodeCmd::PeerIdentified { conn, identity } => {
                assert_eq!(conn, 7);
                assert_eq!(identity, "REMOTE");
            }
            other => panic!("unexpected {other:?}"),
        }
        match node_rx.recv().await.unwrap() {
            NodeCmd::Gossip { from, id, body } => {
                assert_eq!(from, 7);
                assert_eq!(id, "M1");
                assert_eq!(body, "victory$REMOTE");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_peer_is_reported_once() {
        let (_handle, peer, mut node_rx) = start(50);
        let down = time::timeout(Duration::from_secs(2), node_rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            down,
            Some(NodeCmd::PeerDown {
                conn: 7,
                departure: Departure::HeartbeatTimeout
            })
        ));
        // The actor has exited and dropped its sender.
        assert!(node_rx.recv().await.is_none());
        drop(peer);
    }

    #[tokio::test]
    async fn answering_peer_stays_up() {
        let (_handle, mut peer, mut node_rx) = start(50);
        let responder = tokio::spawn(async move {
            while let Some(Ok(msg)) = peer.next().await {
                if msg == Message::Ping && peer.send(Message::Pong).await.is_err() {
                    break;
                }
            }
        });
        let down = time::timeout(Duration::from_millis(500), node_rx.recv()).await;
        assert!(down.is_err());
        responder.abort();
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let (_handle, peer, mut node_rx) = start(10_000);
        drop(peer);
        assert!(matches!(
            node_rx.recv().await,
            Some(NodeCmd::PeerDown {
                departure: Departure::Closed | Departure::Failed(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn queued_messages_reach_the_peer() {
        let (handle, mut peer, _node_rx) = start(10_000);
        handle.send(Message::Broadcast {
            id: "M2".into(),
            body: "election$LOCAL".into(),
        });
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(peer.next().await.unwrap().unwrap());
        }
        assert!(seen.contains(&Message::Broadcast {
            id: "M2".into(),
            body: "election$LOCAL".into(),
        }));
    }

    #[tokio::test]
    async fn dropping_the_handle_closes_the_link() {
        let (handle, mut peer, mut node_rx) = start(10_000);
        drop(handle);
        let mut closed = false;
        for _ in 0..3 {
            if peer.next().await.is_none() {
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert!(node_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn blocked_write_does_not_stall_the_heartbeat() {
        // Room for identify and the first ping, not for the broadcast.
        let (handle, _peer, mut node_rx) = start_buffered(50, 64);
        handle.send(Message::Broadcast {
            id: "M3".into(),
            body: "x".repeat(200),
        });
        let down = time::timeout(Duration::from_secs(1), node_rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            down,
            Some(NodeCmd::PeerDown {
                conn: 7,
                departure: Departure::Stalled | Departure::HeartbeatTimeout
            })
        ));
    }

    /// A stream that may move between threads but not be shared by them.
    struct Unshared {
        inner: DuplexStream,
        _not_sync: PhantomData<Cell<()>>,
    }

    impl AsyncRead for Unshared {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Unshared {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn runs_over_streams_that_are_only_send() {
        let (local, remote) = duplex(1024);
        let (node_tx, mut node_rx) = mpsc::channel(16);
        let io = Unshared {
            inner: local,
            _not_sync: PhantomData,
        };
        let addr = SocketAddr::from(([127, 0, 0, 1], 1));
        let _handle = Connection::spawn(io, 9, addr, &test_config(10_000), node_tx);

        let mut peer = Framed::new(remote, WireCodec::new());
        peer.send(Message::Identify {
            identity: "REMOTE".into(),
        })
        .await
        .unwrap();
        assert!(matches!(
            node_rx.recv().await,
            Some(NodeCmd::PeerIdentified { conn: 9, .. })
        ));
    }
}
