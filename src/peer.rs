use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bitcoin::consensus::encode;
use bitcoin::p2p::address::Address as P2pAddress;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Magic, ServiceFlags};
use bitcoin::{Network, Txid};
use smol::channel::{Receiver, Sender};
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;
use smol_timeout::TimeoutExt;

use crate::flow::FlowControl;
use crate::mempool::MemPool;

/// How connected peers are told about newly available transactions. The relay
/// buffer only depends on this seam, not on the wire session behind it.
pub trait PeerSession: Send + Sync + 'static {
    /// Sends one batched announcement to every connected peer.
    fn announce(&self, txids: Vec<Txid>);
}

const PROTOCOL_VERSION: u32 = 70016;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Wire frame header: 4-byte magic, 12-byte command, 4-byte length, 4-byte checksum.
const HEADER_LEN: usize = 24;
const MAX_PAYLOAD: u32 = 32 * 1024 * 1024;

/// Announcement handle shared with the relay buffer.
pub struct PeerHandle {
    out_send: Sender<NetworkMessage>,
}

impl PeerSession for PeerHandle {
    fn announce(&self, txids: Vec<Txid>) {
        let inv = txids.into_iter().map(Inventory::Transaction).collect();
        let _ = self.out_send.try_send(NetworkMessage::Inv(inv));
    }
}

/// The single trusted peer connection: a version handshake, then batched inv
/// announcements out and getdata requests in, the latter answered from the
/// relay buffer.
pub struct PeerConnection {
    addr: SocketAddr,
    network: Network,
    out_send: Sender<NetworkMessage>,
    out_recv: Receiver<NetworkMessage>,
}

impl PeerConnection {
    pub fn new(addr: SocketAddr, network: Network) -> Self {
        let (out_send, out_recv) = smol::channel::unbounded();
        Self {
            addr,
            network,
            out_send,
            out_recv,
        }
    }

    /// Announcement handle for the relay buffer.
    pub fn handle(&self) -> std::sync::Arc<PeerHandle> {
        std::sync::Arc::new(PeerHandle {
            out_send: self.out_send.clone(),
        })
    }

    /// Connects and runs the session until shutdown or connection loss. Outbound
    /// writes run on their own task so a quiet socket never blocks them; the
    /// writer shuts the socket down on exit, which also releases the reader.
    pub async fn run(self, flow: FlowControl, mempool: MemPool) -> anyhow::Result<()> {
        let magic = Magic::from(self.network);
        let mut stream = TcpStream::connect(self.addr)
            .await
            .with_context(|| format!("cannot connect to peer {}", self.addr))?;
        handshake(&mut stream, magic, self.addr).await?;
        log::info!("connected to peer {}", self.addr);

        let writer_flow = flow.clone();
        let out_recv = self.out_recv;
        let mut writer_stream = stream.clone();
        let writer: smol::Task<()> = smolscale::spawn(async move {
            while !writer_flow.is_shutting_down() {
                match out_recv.recv().timeout(POLL_INTERVAL).await {
                    Some(Ok(msg)) => {
                        if let Err(err) = send_message(&mut writer_stream, magic, msg).await {
                            log::warn!("cannot write to peer: {}", err);
                            break;
                        }
                    }
                    Some(Err(_)) => break,
                    None => continue,
                }
            }
            let _ = writer_stream.shutdown(std::net::Shutdown::Both);
        });

        let result = read_loop(&mut stream, magic, &flow, &mempool, &self.out_send).await;
        // release the writer even when the connection died before shutdown
        self.out_send.close();
        writer.await;
        result
    }
}

async fn read_loop(
    stream: &mut TcpStream,
    magic: Magic,
    flow: &FlowControl,
    mempool: &MemPool,
    out_send: &Sender<NetworkMessage>,
) -> anyhow::Result<()> {
    loop {
        let msg = match read_message(stream, magic).await {
            Ok(msg) => msg,
            Err(err) => {
                if flow.is_shutting_down() {
                    return Ok(());
                }
                return Err(err.context("peer connection lost"));
            }
        };
        match msg {
            NetworkMessage::Ping(nonce) => {
                let _ = out_send.try_send(NetworkMessage::Pong(nonce));
            }
            NetworkMessage::GetData(items) => {
                let txids: Vec<Txid> = items
                    .iter()
                    .filter_map(|item| match item {
                        Inventory::Transaction(txid) => Some(*txid),
                        Inventory::WitnessTransaction(txid) => Some(*txid),
                        _ => None,
                    })
                    .collect();
                if txids.is_empty() {
                    continue;
                }
                match mempool.serve_data_request(txids).await {
                    Some(txs) => {
                        for tx in txs {
                            let _ = out_send.try_send(NetworkMessage::Tx(tx));
                        }
                    }
                    None => log::warn!("data request timed out in the mempool"),
                }
            }
            // we do not track the peer's inventory or addresses
            NetworkMessage::Inv(_) | NetworkMessage::Addr(_) => {}
            other => log::trace!("ignoring {} message from peer", other.command()),
        }
        if flow.is_shutting_down() {
            return Ok(());
        }
    }
}

async fn handshake(stream: &mut TcpStream, magic: Magic, addr: SocketAddr) -> anyhow::Result<()> {
    send_message(stream, magic, NetworkMessage::Version(version_message(addr))).await?;
    let mut got_version = false;
    let mut got_verack = false;
    while !(got_version && got_verack) {
        let msg = read_message(stream, magic)
            .timeout(HANDSHAKE_TIMEOUT)
            .await
            .context("handshake timed out")??;
        match msg {
            NetworkMessage::Version(v) => {
                log::debug!("peer runs {} at height {}", v.user_agent, v.start_height);
                send_message(stream, magic, NetworkMessage::Verack).await?;
                got_version = true;
            }
            NetworkMessage::Verack => got_verack = true,
            other => log::trace!("ignoring {} message during handshake", other.command()),
        }
    }
    Ok(())
}

fn version_message(addr: SocketAddr) -> VersionMessage {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_secs() as i64)
        .unwrap_or_default();
    let nowhere = SocketAddr::from(([0, 0, 0, 0], 0));
    VersionMessage {
        version: PROTOCOL_VERSION,
        services: ServiceFlags::NONE,
        timestamp,
        receiver: P2pAddress::new(&addr, ServiceFlags::NONE),
        sender: P2pAddress::new(&nowhere, ServiceFlags::NONE),
        nonce: fastrand::u64(..),
        user_agent: format!("/loadgend:{}/", env!("CARGO_PKG_VERSION")),
        start_height: 0,
        relay: false,
    }
}

async fn send_message(
    stream: &mut TcpStream,
    magic: Magic,
    payload: NetworkMessage,
) -> anyhow::Result<()> {
    let raw = RawNetworkMessage::new(magic, payload);
    let bytes = encode::serialize(&raw);
    stream
        .write_all(&bytes)
        .await
        .context("cannot write to peer")?;
    Ok(())
}

/// Reads one framed message. The frame length is taken from the header so the
/// whole message can be pulled off the socket before decoding; the decoder
/// itself (and the checksum it verifies) comes from the wire-protocol crate.
async fn read_message(stream: &mut TcpStream, magic: Magic) -> anyhow::Result<NetworkMessage> {
    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .await
        .context("peer closed the connection")?;
    let payload_len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
    if payload_len > MAX_PAYLOAD {
        anyhow::bail!("oversized message from peer ({} bytes)", payload_len);
    }
    let mut buf = vec![0u8; HEADER_LEN + payload_len as usize];
    buf[..HEADER_LEN].copy_from_slice(&header);
    stream
        .read_exact(&mut buf[HEADER_LEN..])
        .await
        .context("peer closed mid-message")?;
    let raw: RawNetworkMessage = encode::deserialize(&buf).context("cannot decode peer message")?;
    if *raw.magic() != magic {
        anyhow::bail!("peer message has wrong network magic");
    }
    Ok(raw.payload().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::net::TcpListener;

    #[test]
    fn framing_roundtrip_over_tcp() {
        smol::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let magic = Magic::from(Network::Regtest);

            let server = smolscale::spawn(async move {
                let (mut conn, _) = listener.accept().await.unwrap();
                send_message(&mut conn, magic, NetworkMessage::Ping(42)).await.unwrap();
                // hold the socket open until the client is done reading
                smol::Timer::after(Duration::from_millis(200)).await;
            });

            let mut client = TcpStream::connect(addr).await.unwrap();
            let msg = read_message(&mut client, magic).await.unwrap();
            match msg {
                NetworkMessage::Ping(nonce) => assert_eq!(nonce, 42),
                other => panic!("unexpected message {:?}", other),
            }
            server.await;
        });
    }

    #[test]
    fn wrong_magic_is_rejected() {
        smol::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server = smolscale::spawn(async move {
                let (mut conn, _) = listener.accept().await.unwrap();
                send_message(&mut conn, Magic::from(Network::Bitcoin), NetworkMessage::Ping(1))
                    .await
                    .unwrap();
                smol::Timer::after(Duration::from_millis(200)).await;
            });

            let mut client = TcpStream::connect(addr).await.unwrap();
            let err = read_message(&mut client, Magic::from(Network::Regtest)).await;
            assert!(err.is_err());
            server.await;
        });
    }

    #[test]
    fn announce_becomes_an_inv_message() {
        let conn = PeerConnection::new(SocketAddr::from(([127, 0, 0, 1], 0)), Network::Regtest);
        let handle = conn.handle();
        use bitcoin::hashes::Hash;
        let txid = Txid::from_byte_array([4u8; 32]);
        handle.announce(vec![txid]);
        match conn.out_recv.try_recv().unwrap() {
            NetworkMessage::Inv(items) => {
                assert_eq!(items, vec![Inventory::Transaction(txid)]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
