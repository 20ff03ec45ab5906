//! Peer discovery surface.
//!
//! The real content-addressed discovery network is an external
//! collaborator; this module pins down exactly what the core consumes
//! from it: join a swarm under a 32-byte key (announce + lookup),
//! receive connected sockets as events, leave on cleanup. A direct
//! TCP implementation is included so the binary and the end-to-end
//! tests can run two cores against each other.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Fault;

/// How the core reaches peers: straight over TCP, or through the
/// configured overlay tunnel. Flipped by the 30-second connection
/// timeout and by `set_transport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Direct,
    Overlay,
}

impl TransportMode {
    pub fn flipped(self) -> Self {
        match self {
            TransportMode::Direct => TransportMode::Overlay,
            TransportMode::Overlay => TransportMode::Direct,
        }
    }
}

/// Connection produced by the swarm, inbound or outbound.
#[derive(Debug)]
pub struct SwarmConnection {
    pub stream: TcpStream,
    pub addr: SocketAddr,
}

/// The consumed discovery interface: announce + lookup under a swarm
/// key, connections as events, leave on teardown. The futures carry
/// explicit `Send` bounds because the controller task awaits them.
pub trait Swarm: Send + 'static {
    /// Announce ourselves and start looking up peers under `key`.
    /// Connections arrive on the returned channel until `leave`.
    /// Joining again implies leaving first.
    fn join(
        &mut self,
        key: [u8; 32],
        mode: TransportMode,
    ) -> impl Future<Output = Result<mpsc::UnboundedReceiver<SwarmConnection>, Fault>> + Send;

    fn leave(&mut self) -> impl Future<Output = ()> + Send;
}

/// Direct-TCP swarm: the listener is the announce half, dialing the
/// configured peers is the lookup half. Overlay mode dials the tunnel
/// addresses instead.
pub struct TcpSwarm {
    listen_addr: Option<String>,
    peer_addrs: Vec<String>,
    overlay_addrs: Vec<String>,
    bound: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpSwarm {
    pub fn new(
        listen_addr: Option<String>,
        peer_addrs: Vec<String>,
        overlay_addrs: Vec<String>,
    ) -> Self {
        Self {
            listen_addr,
            peer_addrs,
            overlay_addrs,
            bound: None,
            tasks: Vec::new(),
        }
    }

    /// Address the announce listener actually bound, once joined.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }
}

impl Swarm for TcpSwarm {
    async fn join(
        &mut self,
        key: [u8; 32],
        mode: TransportMode,
    ) -> Result<mpsc::UnboundedReceiver<SwarmConnection>, Fault> {
        self.leave().await;
        debug!(key = %hex::encode(&key[..8]), ?mode, "joining swarm");

        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(ref addr) = self.listen_addr {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| Fault::Transport(format!("swarm announce bind: {e}")))?;
            let bound = listener
                .local_addr()
                .map_err(|e| Fault::Transport(format!("swarm announce addr: {e}")))?;
            // Pin the ephemeral port so a rejoin announces at the
            // same address peers already know.
            self.listen_addr = Some(bound.to_string());
            self.bound = Some(bound);
            let tx_accept = tx.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            debug!(%addr, "inbound swarm connection");
                            if tx_accept.send(SwarmConnection { stream, addr }).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("swarm accept failed: {e}");
                            break;
                        }
                    }
                }
            }));
        }

        let dial = match mode {
            TransportMode::Direct => self.peer_addrs.clone(),
            TransportMode::Overlay => self.overlay_addrs.clone(),
        };
        for addr in dial {
            let tx_dial = tx.clone();
            self.tasks.push(tokio::spawn(async move {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => {
                        let resolved = stream
                            .peer_addr()
                            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
                        debug!(addr = %resolved, "outbound swarm connection");
                        let _ = tx_dial.send(SwarmConnection {
                            stream,
                            addr: resolved,
                        });
                    }
                    Err(e) => {
                        warn!(%addr, "swarm dial failed: {e}");
                    }
                }
            }));
        }

        Ok(rx)
    }

    async fn leave(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
            // Wait the abort out so the listener socket is really
            // closed before a rejoin rebinds the pinned port.
            let _ = task.await;
        }
        self.bound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn announce_and_lookup_connect() {
        let key = [3u8; 32];

        let mut server = TcpSwarm::new(Some("127.0.0.1:0".into()), vec![], vec![]);
        let mut server_events = server.join(key, TransportMode::Direct).await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpSwarm::new(None, vec![addr.to_string()], vec![]);
        let mut client_events = client.join(key, TransportMode::Direct).await.unwrap();

        let inbound = server_events.recv().await.unwrap();
        let outbound = client_events.recv().await.unwrap();
        assert_eq!(outbound.addr, addr);
        assert!(inbound.addr.ip().is_loopback());

        server.leave().await;
        client.leave().await;
    }

    #[tokio::test]
    async fn overlay_mode_uses_tunnel_addresses() {
        let key = [4u8; 32];

        let mut tunnel = TcpSwarm::new(Some("127.0.0.1:0".into()), vec![], vec![]);
        let mut tunnel_events = tunnel.join(key, TransportMode::Direct).await.unwrap();
        let tunnel_addr = tunnel.local_addr().unwrap();

        // Direct peers list is empty; only the overlay address can
        // produce a connection.
        let mut client = TcpSwarm::new(None, vec![], vec![tunnel_addr.to_string()]);
        let mut client_events = client.join(key, TransportMode::Overlay).await.unwrap();

        assert!(tunnel_events.recv().await.is_some());
        assert_eq!(client_events.recv().await.unwrap().addr, tunnel_addr);

        tunnel.leave().await;
        client.leave().await;
    }
}
