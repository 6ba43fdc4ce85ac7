//! Iroh QUIC transport for the swarm.
//!
//! Peers connect over iroh's encrypted, NAT-traversing transport. Each
//! link carries one bidirectional stream bridged into a duplex pair so the
//! coordinator speaks the same wire protocol it uses on the in-memory
//! swarm. Topic membership is bookkeeping only — replication interest
//! travels in-protocol via `interest` messages — so this adapter works
//! with an explicit peer list rather than rendezvous discovery.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::keys::DiscoveryId;
use crate::swarm::{Swarm, SwarmEvent};

/// ALPN protocol identifier for feedmesh sync links.
pub const ALPN: &[u8] = b"feedmesh/sync/1";

/// Configuration for the iroh transport.
#[derive(Debug, Clone, Default)]
pub struct IrohConfig {
    /// Where to persist the endpoint secret key (hex). `None` means an
    /// ephemeral identity.
    pub key_path: Option<PathBuf>,
    /// Optional fixed UDP port.
    pub bind_port: Option<u16>,
    /// Endpoint ids of peers to connect to (with reconnection).
    pub peers: Vec<String>,
}

pub struct IrohSwarm {
    endpoint: iroh::Endpoint,
}

impl IrohSwarm {
    pub fn endpoint(&self) -> &iroh::Endpoint {
        &self.endpoint
    }
}

impl Swarm for IrohSwarm {
    fn join(&self, topic: DiscoveryId) {
        // Interest reaches peers through the wire protocol; nothing to do
        // at the transport layer.
        tracing::debug!(%topic, "joined topic");
    }

    fn leave(&self, topic: DiscoveryId) {
        tracing::debug!(%topic, "left topic");
    }
}

/// Load or generate a persistent secret key for stable endpoint identity.
fn load_or_create_secret_key(path: &Path) -> Result<iroh::SecretKey> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        let key: iroh::SecretKey = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid iroh secret key in {}: {e}", path.display()))?;
        Ok(key)
    } else {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = iroh::SecretKey::from_bytes(&bytes);
        let encoded: String = key.to_bytes().iter().map(|b| format!("{b:02x}")).collect();
        std::fs::write(path, &encoded)?;
        tracing::info!("Generated new iroh secret key at {}", path.display());
        Ok(key)
    }
}

/// Start the iroh endpoint: accept loop plus outbound links to the
/// configured peers. Established links arrive on `events` as peer streams.
pub async fn start(
    config: IrohConfig,
    events: mpsc::UnboundedSender<SwarmEvent>,
) -> Result<IrohSwarm> {
    let secret_key = match &config.key_path {
        Some(path) => load_or_create_secret_key(path)?,
        None => {
            use rand::RngCore;
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            iroh::SecretKey::from_bytes(&bytes)
        }
    };

    let mut builder = iroh::Endpoint::builder(iroh::endpoint::presets::N0)
        .secret_key(secret_key)
        .alpns(vec![ALPN.to_vec()]);
    if let Some(port) = config.bind_port {
        builder = builder.bind_addr(std::net::SocketAddrV4::new(
            std::net::Ipv4Addr::UNSPECIFIED,
            port,
        ))?;
    }
    let endpoint = builder.bind().await?;
    tracing::info!("Iroh endpoint ID: {}", endpoint.id());

    // Accept loop.
    let ep = endpoint.clone();
    let accept_events = events.clone();
    tokio::spawn(async move {
        while let Some(incoming) = ep.accept().await {
            let events = accept_events.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => bridge_connection(conn, events, true).await,
                    Err(e) => tracing::warn!("Iroh incoming connection failed: {e}"),
                }
            });
        }
        tracing::info!("Iroh accept loop ended");
    });

    // Outbound links with reconnection.
    for peer in &config.peers {
        connect_peer_with_retry(endpoint.clone(), peer.clone(), events.clone());
    }

    Ok(IrohSwarm { endpoint })
}

/// Connect to a peer endpoint id, reconnecting with backoff whenever the
/// link drops.
pub fn connect_peer_with_retry(
    endpoint: iroh::Endpoint,
    peer_id: String,
    events: mpsc::UnboundedSender<SwarmEvent>,
) {
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        loop {
            match connect_once(&endpoint, &peer_id, &events).await {
                Ok(()) => {
                    backoff = Duration::from_secs(1);
                    tracing::warn!(peer = %peer_id, "iroh link dropped, will reconnect");
                }
                Err(e) => {
                    tracing::warn!(
                        peer = %peer_id,
                        backoff_secs = backoff.as_secs(),
                        "iroh connect failed: {e}"
                    );
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
            tokio::time::sleep(backoff).await;
        }
    });
}

async fn connect_once(
    endpoint: &iroh::Endpoint,
    peer_id: &str,
    events: &mpsc::UnboundedSender<SwarmEvent>,
) -> Result<()> {
    let endpoint_id: iroh::EndpointId = peer_id
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid peer endpoint ID: {e}"))?;
    let addr = iroh::EndpointAddr::new(endpoint_id);
    let conn = endpoint.connect(addr, ALPN).await?;
    bridge_connection(conn, events.clone(), false).await;
    Ok(())
}

/// Bridge one QUIC connection into a duplex stream handed to the
/// coordinator. The connection stays alive until its recv side ends.
async fn bridge_connection(
    conn: iroh::endpoint::Connection,
    events: mpsc::UnboundedSender<SwarmEvent>,
    incoming: bool,
) {
    let remote_id = conn.remote_id();
    tracing::info!(%remote_id, incoming, "iroh link established");

    // Incoming side waits for the dialer to open the stream.
    let (send, recv) = if incoming {
        match conn.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                tracing::warn!(%remote_id, "accept_bi failed: {e}");
                return;
            }
        }
    } else {
        match conn.open_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                tracing::warn!(%remote_id, "open_bi failed: {e}");
                return;
            }
        }
    };

    let (repo_side, bridge_side) = tokio::io::duplex(16384);
    let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge_side);

    // QUIC recv → bridge.
    let rx_remote = remote_id;
    tokio::spawn(async move {
        let mut recv = recv;
        let mut buf = vec![0u8; 4096];
        loop {
            match recv.read(&mut buf).await {
                Ok(Some(n)) => {
                    if bridge_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(remote = %rx_remote, "QUIC recv error: {e}");
                    break;
                }
            }
        }
        let _ = bridge_write.shutdown().await;
        conn.close(0u32.into(), b"link ended");
        tracing::debug!(remote = %rx_remote, "iroh link closed");
    });

    // Bridge → QUIC send.
    let tx_remote = remote_id;
    tokio::spawn(async move {
        let mut send = send;
        let mut buf = vec![0u8; 4096];
        loop {
            match bridge_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if send.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(remote = %tx_remote, "bridge read error: {e}");
                    break;
                }
            }
        }
        let _ = send.finish();
    });

    if events.send(SwarmEvent::PeerStream(repo_side)).is_err() {
        tracing::debug!(%remote_id, "coordinator gone, dropping iroh link");
    }
}
