use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use super::{
    ByteWindow, EngineConfig, WarmupGate, DIAL_TIMEOUT, IO_TIMEOUT, IO_TIMEOUT_BIDIRECTIONAL,
    LATENCY_SAMPLE_INTERVAL, SOCKET_BUFFER_BYTES,
};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{Metrics, MultiStreamAggregator, RttCollector, TransferDirection};
use crate::stream::{Direction, Protocol};

/// Receive buffer large enough for any datagram the wire allows.
const RECV_BUFFER_BYTES: usize = 64 * 1024;

/// One-byte commands opening every data-plane connection.
pub const CMD_DOWNLOAD: u8 = b'D';
pub const CMD_UPLOAD: u8 = b'U';
pub const CMD_BIDIRECTIONAL: u8 = b'B';

pub fn command_byte(direction: Direction) -> u8 {
    match direction {
        Direction::Download => CMD_DOWNLOAD,
        Direction::Upload => CMD_UPLOAD,
        Direction::Bidirectional => CMD_BIDIRECTIONAL,
    }
}

// ─── SocketEngine ────────────────────────────────────────────────

/// TCP/UDP data-plane engine: `stream_count` parallel sub-streams
/// against the test listener, driven for `warm_up + duration` under
/// per-call deadlines so cancellation is observed within one I/O tick.
pub struct SocketEngine {
    config: EngineConfig,
    aggregator: Arc<MultiStreamAggregator>,
    rtt: Arc<RttCollector>,
    running: AtomicBool,
}

enum Conn {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl SocketEngine {
    pub fn new(config: EngineConfig) -> Self {
        let aggregator = Arc::new(MultiStreamAggregator::with_histogram_config(
            config.stream_count,
            config.bucket_width_ms,
            config.bucket_count,
        ));
        Self {
            config,
            aggregator,
            rtt: Arc::new(RttCollector::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Live merged snapshot; throughput is computed over the
    /// measurement window only (warm-up bytes never reach the
    /// collectors).
    pub fn metrics(&self) -> Metrics {
        let mut metrics = self.aggregator.aggregated_metrics();
        let rtt = self.rtt.stats();
        if rtt.count > 0 {
            metrics.rtt = Some(rtt);
        }
        metrics
    }

    pub async fn run(&self, cancel: Arc<AtomicBool>) -> EngineResult<()> {
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_inner(cancel).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self, cancel: Arc<AtomicBool>) -> EngineResult<()> {
        // Dial every sub-stream before any traffic flows; one refused
        // connection fails the whole engine and drops the rest.
        let mut conns = Vec::with_capacity(self.config.stream_count);
        for _ in 0..self.config.stream_count {
            let conn = match self.config.protocol {
                Protocol::Tcp => Conn::Tcp(dial_tcp(&self.config.target).await?),
                Protocol::Udp => Conn::Udp(dial_udp(&self.config.target).await?),
                Protocol::Http => unreachable!("http sessions use the bulk-HTTP engine"),
            };
            conns.push(conn);
        }
        debug!(
            target = %self.config.target,
            streams = self.config.stream_count,
            "data plane connected"
        );

        let gate = Arc::new(WarmupGate::new(self.config.warm_up));
        let deadline = Instant::now() + self.config.total_window();
        let (err_tx, mut err_rx) = mpsc::channel(self.config.stream_count);

        let mut handles = Vec::with_capacity(conns.len());
        for (i, conn) in conns.into_iter().enumerate() {
            let ctx = WorkerCtx {
                direction: self.config.direction,
                packet_size: self.config.packet_size,
                collector: self.aggregator.collector(i),
                aggregator: Arc::clone(&self.aggregator),
                gate: Arc::clone(&gate),
                rtt: Arc::clone(&self.rtt),
                cancel: Arc::clone(&cancel),
                deadline,
                err_tx: err_tx.clone(),
            };
            handles.push(tokio::spawn(async move {
                match conn {
                    Conn::Tcp(stream) => tcp_worker(stream, ctx).await,
                    Conn::Udp(socket) => udp_worker(socket, ctx).await,
                }
            }));
        }
        drop(err_tx);

        // Drain every worker, then surface the first real error.
        for handle in handles {
            let _ = handle.await;
        }

        while let Ok(err) = err_rx.try_recv() {
            if !err.is_cancellation() {
                return Err(err);
            }
        }
        Ok(())
    }
}

// ─── Dialing ─────────────────────────────────────────────────────

async fn dial_tcp(target: &str) -> EngineResult<TcpStream> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| EngineError::DialTimeout(target.to_string()))?
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::ConnectionRefused => {
                EngineError::ConnectionRefused(target.to_string())
            }
            _ => EngineError::Io(err),
        })?;

    stream.set_nodelay(true)?;
    let sock = SockRef::from(&stream);
    sock.set_recv_buffer_size(SOCKET_BUFFER_BYTES)?;
    sock.set_send_buffer_size(SOCKET_BUFFER_BYTES)?;
    Ok(stream)
}

async fn dial_udp(target: &str) -> EngineResult<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    let sock = SockRef::from(&socket);
    sock.set_recv_buffer_size(SOCKET_BUFFER_BYTES)?;
    sock.set_send_buffer_size(SOCKET_BUFFER_BYTES)?;
    Ok(socket)
}

// ─── Worker context ──────────────────────────────────────────────

struct WorkerCtx {
    direction: Direction,
    packet_size: usize,
    collector: Arc<crate::metrics::StreamCollector>,
    aggregator: Arc<MultiStreamAggregator>,
    gate: Arc<WarmupGate>,
    rtt: Arc<RttCollector>,
    cancel: Arc<AtomicBool>,
    deadline: Instant,
    err_tx: mpsc::Sender<EngineError>,
}

impl WorkerCtx {
    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || Instant::now() >= self.deadline
    }

    /// Route bytes through the warm-up gate; the winner of the
    /// transition resets the aggregator so the measurement window
    /// starts from zero.
    fn account(&self, n: u64, dir: TransferDirection, is_packet: bool) {
        match self.gate.on_bytes(n) {
            ByteWindow::Grace => {}
            ByteWindow::First => {
                self.aggregator.reset();
                self.record(n, dir, is_packet);
            }
            ByteWindow::Measured => self.record(n, dir, is_packet),
        }
    }

    fn record(&self, n: u64, dir: TransferDirection, is_packet: bool) {
        self.collector.record_bytes(n, dir);
        if is_packet {
            self.collector.record_packet(dir);
        }
    }

    /// Throttled latency sample: the wall time of one read/write call
    /// that moved at least one byte, at most every 500 ms, and only
    /// once the measurement window is open.
    fn sample_latency(&self, last: &mut Instant, call_time: Duration) {
        if !self.gate.is_measuring() || last.elapsed() < LATENCY_SAMPLE_INTERVAL {
            return;
        }
        let ms = call_time.as_secs_f64() * 1000.0;
        self.collector.record_latency(ms);
        self.rtt.record(ms);
        *last = Instant::now();
    }

    /// Non-blocking error surface; a full channel drops the report so
    /// one failing worker cannot wedge its peers.
    fn report(&self, err: EngineError) {
        let _ = self.err_tx.try_send(err);
    }
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut payload);
    payload
}

// ─── TCP workers ─────────────────────────────────────────────────

async fn tcp_worker(mut stream: TcpStream, ctx: WorkerCtx) {
    if let Err(err) = stream.write_all(&[command_byte(ctx.direction)]).await {
        ctx.report(err.into());
        return;
    }

    match ctx.direction {
        Direction::Download => tcp_recv_loop(stream, &ctx, IO_TIMEOUT).await,
        Direction::Upload => tcp_send_loop(stream, &ctx, IO_TIMEOUT).await,
        Direction::Bidirectional => {
            let (read_half, write_half) = stream.into_split();
            tokio::join!(
                tcp_recv_loop(read_half, &ctx, IO_TIMEOUT_BIDIRECTIONAL),
                tcp_send_loop(write_half, &ctx, IO_TIMEOUT_BIDIRECTIONAL),
            );
        }
    }
}

async fn tcp_recv_loop<R>(mut reader: R, ctx: &WorkerCtx, io_timeout: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    let mut last_sample = Instant::now();

    loop {
        if ctx.should_stop() {
            return;
        }
        let call_start = Instant::now();
        match timeout(io_timeout, reader.read(&mut buf)).await {
            // deadline tick, not an error
            Err(_) => continue,
            // clean EOF: the server ended the download
            Ok(Ok(0)) => return,
            Ok(Ok(n)) => {
                ctx.account(n as u64, TransferDirection::Received, false);
                ctx.sample_latency(&mut last_sample, call_start.elapsed());
            }
            Ok(Err(err)) => {
                ctx.report(err.into());
                return;
            }
        }
    }
}

async fn tcp_send_loop<W>(mut writer: W, ctx: &WorkerCtx, io_timeout: Duration)
where
    W: AsyncWrite + Unpin,
{
    // packet_size sizes the writer buffer; TCP imposes no record
    // boundaries on the wire.
    let payload = random_payload(ctx.packet_size);
    let mut last_sample = Instant::now();

    loop {
        if ctx.should_stop() {
            return;
        }
        let call_start = Instant::now();
        match timeout(io_timeout, writer.write(&payload)).await {
            Err(_) => continue,
            Ok(Ok(0)) => return,
            Ok(Ok(n)) => {
                ctx.account(n as u64, TransferDirection::Sent, false);
                ctx.sample_latency(&mut last_sample, call_start.elapsed());
            }
            Ok(Err(err)) => {
                ctx.report(err.into());
                return;
            }
        }
    }
}

// ─── UDP workers ─────────────────────────────────────────────────

async fn udp_worker(socket: UdpSocket, ctx: WorkerCtx) {
    if let Err(err) = socket.send(&[command_byte(ctx.direction)]).await {
        ctx.report(err.into());
        return;
    }

    match ctx.direction {
        Direction::Download => udp_recv_loop(&socket, &ctx, IO_TIMEOUT).await,
        Direction::Upload => udp_send_loop(&socket, &ctx, IO_TIMEOUT).await,
        Direction::Bidirectional => {
            tokio::join!(
                udp_recv_loop(&socket, &ctx, IO_TIMEOUT_BIDIRECTIONAL),
                udp_send_loop(&socket, &ctx, IO_TIMEOUT_BIDIRECTIONAL),
            );
        }
    }
}

async fn udp_recv_loop(socket: &UdpSocket, ctx: &WorkerCtx, io_timeout: Duration) {
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];
    let mut last_sample = Instant::now();

    loop {
        if ctx.should_stop() {
            return;
        }
        let call_start = Instant::now();
        match timeout(io_timeout, socket.recv(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(n)) => {
                ctx.account(n as u64, TransferDirection::Received, true);
                ctx.sample_latency(&mut last_sample, call_start.elapsed());
            }
            Ok(Err(err)) => {
                ctx.report(err.into());
                return;
            }
        }
    }
}

async fn udp_send_loop(socket: &UdpSocket, ctx: &WorkerCtx, io_timeout: Duration) {
    let payload = random_payload(ctx.packet_size);
    let mut last_sample = Instant::now();

    loop {
        if ctx.should_stop() {
            return;
        }
        let call_start = Instant::now();
        match timeout(io_timeout, socket.send(&payload)).await {
            Err(_) => continue,
            Ok(Ok(n)) => {
                ctx.account(n as u64, TransferDirection::Sent, true);
                ctx.sample_latency(&mut last_sample, call_start.elapsed());
            }
            Ok(Err(err)) => {
                ctx.report(err.into());
                return;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Direction;
    use tokio::net::TcpListener;

    fn engine_config(target: String, direction: Direction, duration: Duration) -> EngineConfig {
        EngineConfig {
            protocol: Protocol::Tcp,
            direction,
            duration,
            warm_up: Duration::ZERO,
            stream_count: 1,
            packet_size: 1400,
            chunk_size: 64 * 1024,
            target,
            auth_token: None,
            bucket_count: 2000,
            bucket_width_ms: 1.0,
        }
    }

    /// Minimal in-process test listener speaking the one-byte command
    /// protocol, so the engine can be exercised end-to-end.
    async fn spawn_listener() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut cmd = [0u8; 1];
                    if stream.read_exact(&mut cmd).await.is_err() {
                        return;
                    }
                    let chunk = vec![0xA5u8; 16 * 1024];
                    match cmd[0] {
                        CMD_DOWNLOAD => {
                            while stream.write_all(&chunk).await.is_ok() {}
                        }
                        CMD_UPLOAD => {
                            let mut sink = vec![0u8; 64 * 1024];
                            while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                        }
                        _ => {}
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn download_session_counts_bytes() {
        let addr = spawn_listener().await;
        let engine = SocketEngine::new(engine_config(
            addr,
            Direction::Download,
            Duration::from_millis(400),
        ));

        let cancel = Arc::new(AtomicBool::new(false));
        engine.run(cancel).await.unwrap();

        let metrics = engine.metrics();
        assert!(metrics.bytes_transferred > 0);
        assert!(metrics.throughput_mbps > 0.0);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn upload_session_counts_sent_bytes() {
        let addr = spawn_listener().await;
        let engine = SocketEngine::new(engine_config(
            addr,
            Direction::Upload,
            Duration::from_millis(400),
        ));

        engine.run(Arc::new(AtomicBool::new(false))).await.unwrap();
        assert!(engine.metrics().bytes_transferred > 0);
    }

    #[tokio::test]
    async fn dial_failure_fails_the_engine() {
        // grab a port, then free it so the connect is refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let engine = SocketEngine::new(engine_config(
            addr,
            Direction::Download,
            Duration::from_secs(5),
        ));
        let err = engine.run(Arc::new(AtomicBool::new(false))).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ConnectionRefused(_) | EngineError::Io(_)
        ));
    }

    #[tokio::test]
    async fn cancel_stops_the_session_within_one_tick() {
        let addr = spawn_listener().await;
        let engine = Arc::new(SocketEngine::new(engine_config(
            addr,
            Direction::Download,
            Duration::from_secs(30),
        )));

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
        });

        // a cancelled run is not an error
        tokio::time::timeout(Duration::from_secs(5), engine.run(cancel))
            .await
            .expect("cancel was not observed in time")
            .unwrap();
    }
}
