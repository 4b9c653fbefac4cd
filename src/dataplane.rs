use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::socket::{CMD_BIDIRECTIONAL, CMD_DOWNLOAD, CMD_UPLOAD};
use crate::engine::SOCKET_BUFFER_BYTES;

/// Payload chunk pushed to downloading peers. Content is irrelevant;
/// only byte counts matter on the measuring side.
const SEND_CHUNK_BYTES: usize = 16 * 1024;
const UDP_DATAGRAM_BYTES: usize = 1400;

// ─── Data-plane listeners ────────────────────────────────────────

/// Server side of the framed TCP/UDP test protocol. Each accepted
/// connection announces itself with a one-byte command: 'D' asks the
/// server to write until the peer closes, 'U' asks it to read and
/// discard, 'B' does both concurrently.
pub struct DataPlane {
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
    tcp_task: JoinHandle<()>,
    udp_task: JoinHandle<()>,
}

impl DataPlane {
    /// Bind both listeners and start serving. `max_session` caps how
    /// long the server keeps feeding any single peer, so an abandoned
    /// connection cannot pin a writer forever.
    pub async fn bind(
        bind_address: &str,
        tcp_port: u16,
        udp_port: u16,
        max_session: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let tcp = TcpListener::bind((bind_address, tcp_port)).await?;
        let udp = UdpSocket::bind((bind_address, udp_port)).await?;
        let tcp_addr = tcp.local_addr()?;
        let udp_addr = udp.local_addr()?;

        let tcp_task = tokio::spawn(tcp_accept_loop(tcp, max_session, shutdown.clone()));
        let udp_task = tokio::spawn(udp_serve_loop(udp, max_session, shutdown));

        info!(%tcp_addr, %udp_addr, "data plane listening");
        Ok(Self {
            tcp_addr,
            udp_addr,
            tcp_task,
            udp_task,
        })
    }

    pub fn abort(&self) {
        self.tcp_task.abort();
        self.udp_task.abort();
    }
}

fn random_chunk(len: usize) -> Vec<u8> {
    let mut chunk = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut chunk);
    chunk
}

// ─── TCP side ────────────────────────────────────────────────────

async fn tcp_accept_loop(
    listener: TcpListener,
    max_session: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "tcp accept failed");
                        continue;
                    }
                };
                debug!(%peer, "tcp test connection");
                tokio::spawn(handle_tcp_conn(stream, max_session));
            }
        }
    }
}

async fn handle_tcp_conn(stream: TcpStream, max_session: Duration) {
    if stream.set_nodelay(true).is_err() {
        return;
    }
    {
        let sock = SockRef::from(&stream);
        let _ = sock.set_recv_buffer_size(SOCKET_BUFFER_BYTES);
        let _ = sock.set_send_buffer_size(SOCKET_BUFFER_BYTES);
    }

    let mut stream = stream;
    let mut cmd = [0u8; 1];
    if stream.read_exact(&mut cmd).await.is_err() {
        return;
    }

    let deadline = Instant::now() + max_session;
    match cmd[0] {
        CMD_DOWNLOAD => {
            let (_, write_half) = stream.into_split();
            feed_peer(write_half, deadline).await;
        }
        CMD_UPLOAD => {
            let (read_half, _) = stream.into_split();
            drain_peer(read_half, deadline).await;
        }
        CMD_BIDIRECTIONAL => {
            let (read_half, write_half) = stream.into_split();
            tokio::join!(drain_peer(read_half, deadline), feed_peer(write_half, deadline));
        }
        other => debug!(command = other, "unknown data-plane command"),
    }
}

async fn feed_peer(mut writer: OwnedWriteHalf, deadline: Instant) {
    let chunk = random_chunk(SEND_CHUNK_BYTES);
    while Instant::now() < deadline {
        if writer.write_all(&chunk).await.is_err() {
            // peer closed: the normal end of a download
            return;
        }
    }
}

async fn drain_peer(mut reader: OwnedReadHalf, deadline: Instant) {
    let mut sink = vec![0u8; SOCKET_BUFFER_BYTES];
    while Instant::now() < deadline {
        match reader.read(&mut sink).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

// ─── UDP side ────────────────────────────────────────────────────

/// One socket serves every UDP peer. A 1-byte 'D' or 'B' datagram
/// starts a sender task for that peer; everything else (upload
/// traffic) is received and discarded.
async fn udp_serve_loop(
    socket: UdpSocket,
    max_session: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "udp recv failed");
                        continue;
                    }
                };
                if n == 1 && (buf[0] == CMD_DOWNLOAD || buf[0] == CMD_BIDIRECTIONAL) {
                    debug!(%peer, "udp download peer");
                    let socket = Arc::clone(&socket);
                    let shutdown = shutdown.clone();
                    tokio::spawn(udp_feed_peer(socket, peer, max_session, shutdown));
                }
            }
        }
    }
}

async fn udp_feed_peer(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    max_session: Duration,
    shutdown: watch::Receiver<bool>,
) {
    let chunk = random_chunk(UDP_DATAGRAM_BYTES);
    let deadline = Instant::now() + max_session;

    while Instant::now() < deadline && !*shutdown.borrow() {
        if socket.send_to(&chunk, peer).await.is_err() {
            return;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────
