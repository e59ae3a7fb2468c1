//! Listener and dialer glue. Both only produce sockets; the node core
//! wraps them in connection actors and registers them as neighbors.

use std::net::SocketAddr;
use tokio::{
    net::{lookup_host, TcpListener, TcpStream, ToSocketAddrs},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::msg::{LinkOrigin, NodeCmd};
use crate::{NodeError, Result};

/// Accepts inbound links until `accepting` is cancelled or the node is gone.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    node_tx: mpsc::Sender<NodeCmd>,
    accepting: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = accepting.cancelled() => {
                info!("no longer accepting connections");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    debug!(%remote_addr, "connection accepted");
                    let _ = stream.set_nodelay(true);
                    let attach = NodeCmd::Attach {
                        stream,
                        remote_addr,
                        origin: LinkOrigin::Accepted,
                    };
                    if node_tx.send(attach).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("accept failed: {e}"),
            },
        }
    }
}

/// Resolves `addr` (`host:port`) and opens a socket to the first address
/// it resolves to.
pub(crate) async fn dial(addr: &str) -> Result<(TcpStream, SocketAddr)> {
    open(addr, addr).await
}

/// Like [`dial`], for a host and port given apart. Works with bare IPv6
/// literals such as `::1`.
pub(crate) async fn dial_host(host: &str, port: u16) -> Result<(TcpStream, SocketAddr)> {
    open((host, port), &format!("{host} port {port}")).await
}

async fn open(target: impl ToSocketAddrs, addr: &str) -> Result<(TcpStream, SocketAddr)> {
    let target = lookup_host(target)
        .await
        .map_err(|e| NodeError::Resolve {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| NodeError::Resolve {
            addr: addr.to_string(),
            reason: "no addresses found".to_string(),
        })?;
    let stream = TcpStream::connect(target)
        .await
        .map_err(|source| NodeError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    let _ = stream.set_nodelay(true);
    debug!(%target, "connection with {addr} established");
    Ok((stream, target))
}
