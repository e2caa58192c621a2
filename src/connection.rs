//! Connection management
//!
//! Each connection owns one TCP transport to an inverter and a background
//! task that processes queued jobs strictly in order, so at most one
//! request is ever outstanding on the half-duplex wire. The transport is
//! dialed lazily on the first job, kept alive while jobs flow, and closed
//! by an idle timer, an explicit [`Connection::close`], or a fatal dial
//! error. Close requests queue behind in-flight work, so a busy connection
//! drains before it goes down.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::cache::ResponseCache;
use crate::config::{LinkConfig, DEFAULT_CACHE_MAX, DEFAULT_CACHE_TTL_MS};
use crate::error::{LinkError, Result};
use crate::frame::{self, encode_frame, Command, Datagram, DecodeStep};
use crate::pipeline::{Backoff, Job, RetryPolicy, WaiterSlot};
use crate::registry::{self, RegisterDesc, RegisterValue, ID_BATTERY_STATUS};

/// Socket read chunk size
const READ_CHUNK: usize = 4096;

/// Upper bound on the inbound reassembly buffer
const MAX_READ_BUFFER: usize = 64 * 1024;

/// Per-connection options for direct (pool-less) construction
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Timeouts and retry parameters
    pub config: LinkConfig,
    /// Response cache time-to-live
    pub cache_ttl: Duration,
    /// Response cache capacity (0 disables caching)
    pub cache_max: usize,
    /// Register polled by the write pipeline's readiness gate
    pub readiness_register: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            config: LinkConfig::default(),
            cache_ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            cache_max: DEFAULT_CACHE_MAX,
            readiness_register: ID_BATTERY_STATUS,
        }
    }
}

impl ConnectOptions {
    /// Defaults with environment overrides applied to the link config.
    pub fn from_env() -> Self {
        Self {
            config: LinkConfig::from_env(),
            ..Self::default()
        }
    }
}

/// Flags and counters shared between connection handles and the task
pub(crate) struct Shared {
    pending_close: AtomicBool,
    closed: AtomicBool,
    active_jobs: AtomicUsize,
    unsolicited: AtomicU64,
    evict: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            active_jobs: AtomicUsize::new(0),
            unsolicited: AtomicU64::new(0),
            evict: StdMutex::new(None),
        }
    }

    /// Run the pool eviction hook at most once.
    fn run_evict(&self) {
        if let Ok(mut guard) = self.evict.lock() {
            if let Some(hook) = guard.take() {
                hook();
            }
        }
    }
}

/// Handle to one inverter connection.
///
/// Handles are cheap to clone; all clones share the same background task
/// and therefore the same FIFO ordering and single-flight guarantee.
#[derive(Clone)]
pub struct Connection {
    host: Arc<str>,
    port: u16,
    jobs: mpsc::UnboundedSender<Job>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Open a connection handle directly, bypassing the pool.
    ///
    /// No I/O happens here; the transport is dialed by the first job.
    /// Must be called within a Tokio runtime.
    pub fn open(host: &str, port: u16, opts: ConnectOptions) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());
        let actor = ConnectionActor {
            host: host.to_string(),
            port,
            retry: RetryPolicy::from_config(&opts.config),
            cache: ResponseCache::new(opts.cache_ttl, opts.cache_max),
            opts,
            jobs: jobs_rx,
            shared: shared.clone(),
            transport: None,
            fatal: None,
        };
        tokio::spawn(actor.run());
        Self {
            host: Arc::from(host),
            port,
            jobs: jobs_tx,
            shared,
        }
    }

    /// Read a register and decode it per its wire type.
    ///
    /// Served from the response cache when a fresh entry exists; otherwise
    /// the read goes to the wire under the connection's retry policy.
    pub async fn query(&self, register: &RegisterDesc) -> Result<RegisterValue> {
        let (tx, rx) = oneshot::channel();
        self.submit(Job::Query {
            register: register.clone(),
            respond: tx,
        })?;
        rx.await
            .map_err(|_| LinkError::connection("connection task terminated"))?
    }

    /// Write a register and verify the new value with a follow-up read.
    pub async fn write(
        &self,
        register: &RegisterDesc,
        value: impl Into<RegisterValue>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(Job::Write {
            register: register.clone(),
            value: value.into(),
            respond: tx,
        })?;
        rx.await
            .map_err(|_| LinkError::connection("connection task terminated"))?
    }

    /// Close this connection.
    ///
    /// Jobs enqueued before the close request complete first; jobs
    /// submitted afterwards fail with [`LinkError::NotConnected`].
    pub async fn close(&self) {
        if self.shared.pending_close.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.run_evict();
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(Job::Close { done: tx }).is_ok() {
            let _ = rx.await;
        } else {
            self.shared.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Whether this handle still accepts jobs.
    pub fn is_open(&self) -> bool {
        !self.shared.pending_close.load(Ordering::SeqCst)
            && !self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of inbound frames discarded as unsolicited.
    pub fn unsolicited_frames(&self) -> u64 {
        self.shared.unsolicited.load(Ordering::Relaxed)
    }

    /// Jobs queued or running.
    pub fn active_jobs(&self) -> usize {
        self.shared.active_jobs.load(Ordering::SeqCst)
    }

    pub(crate) fn set_evict_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        if let Ok(mut guard) = self.shared.evict.lock() {
            *guard = Some(hook);
        }
    }

    pub(crate) fn same_instance(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn submit(&self, job: Job) -> Result<()> {
        if !self.is_open() {
            return Err(LinkError::NotConnected);
        }
        self.shared.active_jobs.fetch_add(1, Ordering::SeqCst);
        if self.jobs.send(job).is_err() {
            self.shared.active_jobs.fetch_sub(1, Ordering::SeqCst);
            return Err(LinkError::NotConnected);
        }
        Ok(())
    }
}

/// Live transport: write half plus the reader task feeding the waiter slot
struct Transport {
    writer: OwnedWriteHalf,
    waiter: WaiterSlot,
    reader: JoinHandle<()>,
}

/// Background task owning all connection state
struct ConnectionActor {
    host: String,
    port: u16,
    opts: ConnectOptions,
    retry: RetryPolicy,
    jobs: mpsc::UnboundedReceiver<Job>,
    shared: Arc<Shared>,
    cache: ResponseCache,
    transport: Option<Transport>,
    /// Terminal dial failure; set when the connection can no longer serve
    fatal: Option<LinkError>,
}

impl ConnectionActor {
    async fn run(mut self) {
        debug!("connection task started: {}:{}", self.host, self.port);
        loop {
            let idle = sleep(self.opts.config.idle_timeout());
            tokio::pin!(idle);
            let job = tokio::select! {
                job = self.jobs.recv() => job,
                _ = &mut idle => {
                    debug!("idle timeout: {}:{}", self.host, self.port);
                    break;
                },
            };
            match job {
                None => break,
                Some(Job::Close { done }) => {
                    let _ = done.send(());
                    break;
                },
                Some(job) => {
                    self.run_job(job).await;
                    if self.fatal.is_some() {
                        break;
                    }
                },
            }
        }
        self.shutdown();
        debug!("connection task ended: {}:{}", self.host, self.port);
    }

    async fn run_job(&mut self, job: Job) {
        match job {
            Job::Query { register, respond } => {
                let result = self.run_query(&register).await;
                if respond.send(result).is_err() {
                    debug!("query canceled: {}", register.label);
                }
            },
            Job::Write {
                register,
                value,
                respond,
            } => {
                let result = self.run_write(&register, &value).await;
                if respond.send(result).is_err() {
                    debug!("write canceled: {}", register.label);
                }
            },
            // Close is intercepted by the run loop before it gets here.
            Job::Close { done } => {
                let _ = done.send(());
                return;
            },
        }
        self.shared.active_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    /// One read job: cache lookup, then wire read under the retry policy.
    async fn run_query(&mut self, register: &RegisterDesc) -> Result<RegisterValue> {
        if let Some(cached) = self.cache.get(register.id) {
            debug!("cache hit: {} id=0x{:08X}", register.label, register.id);
            return registry::decode_value(register, &cached.data);
        }
        let mut backoff = self.retry.backoff();
        let mut attempt = 1u32;
        loop {
            match self.wire_read(register.id).await {
                Ok(response) => {
                    self.cache.put(register.id, response.clone());
                    return registry::decode_value(register, &response.data);
                },
                Err(e) if e.is_recoverable() => {
                    self.wait_or_give_up(&mut backoff, &mut attempt, e, register)
                        .await?
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// One write job: argument validation up front, then readiness gate,
    /// write, and byte-exact verification read under the retry policy.
    async fn run_write(&mut self, register: &RegisterDesc, value: &RegisterValue) -> Result<()> {
        if !register.writable {
            return Err(LinkError::NotWritable(register.label.to_string()));
        }
        if let Some(validate) = register.validate {
            if !validate(value) {
                return Err(LinkError::invalid_argument(format!(
                    "{}: value rejected by validation",
                    register.label
                )));
            }
        }
        let payload = registry::encode_value(register, value)?;
        let write_frame = encode_frame(Command::Write, register.id, &payload)?;

        let mut backoff = self.retry.backoff();
        let mut attempt = 1u32;
        loop {
            match self.try_write(register, &write_frame, &payload).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() => {
                    self.wait_or_give_up(&mut backoff, &mut attempt, e, register)
                        .await?
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_write(
        &mut self,
        register: &RegisterDesc,
        write_frame: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        // Readiness gate: the device rejects writes outside normal
        // operation, so probe the status register first.
        let status = self.wire_read(self.opts.readiness_register).await?;
        let Some(&status_byte) = status.data.first() else {
            return Err(LinkError::frame("empty status payload"));
        };
        if status_byte != 0 {
            return Err(LinkError::DeviceNotReady {
                status: status_byte,
            });
        }

        self.send_frame(write_frame).await?;
        let response = self.wire_read(register.id).await?;
        if response.data != payload {
            return Err(LinkError::mismatch(format!(
                "{}: verification read returned {:02X?}, wrote {:02X?}",
                register.label, response.data, payload
            )));
        }
        self.cache.put(register.id, response);
        info!("write verified: {} id=0x{:08X}", register.label, register.id);
        Ok(())
    }

    /// Sleep out the next backoff delay, or convert the last recoverable
    /// error into the terminal exhaustion error.
    async fn wait_or_give_up(
        &mut self,
        backoff: &mut Backoff,
        attempt: &mut u32,
        err: LinkError,
        register: &RegisterDesc,
    ) -> Result<()> {
        match backoff.next_delay() {
            Some(delay) => {
                warn!(
                    "{} attempt {}: {} (retrying in {:?})",
                    register.label, attempt, err, delay
                );
                sleep(delay).await;
                *attempt += 1;
                Ok(())
            },
            None => Err(LinkError::RetriesExhausted {
                attempts: *attempt,
                source: Box::new(err),
            }),
        }
    }

    /// Read one register from the wire, bypassing the cache.
    async fn wire_read(&mut self, id: u32) -> Result<Datagram> {
        let frame = encode_frame(Command::Read, id, &[])?;
        self.exchange(id, &frame).await
    }

    /// Send one frame and await the matching response.
    ///
    /// Correlation is positional: the next response on the wire belongs to
    /// this request. A response carrying a different id fails the attempt.
    async fn exchange(&mut self, expect_id: u32, frame_bytes: &[u8]) -> Result<Datagram> {
        self.ensure_transport().await?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        let rx = transport.waiter.install().await?;
        if let Err(e) = transport.writer.write_all(frame_bytes).await {
            error!("TX: {}", e);
            transport.waiter.clear().await;
            self.disconnect();
            return Err(LinkError::Io(format!("send error: {e}")));
        }
        debug!("TX: {}B id=0x{:08X}", frame_bytes.len(), expect_id);

        match timeout(self.opts.config.receive_timeout(), rx).await {
            Err(_) => {
                if let Some(t) = &self.transport {
                    t.waiter.clear().await;
                }
                Err(LinkError::timeout(format!(
                    "no response for id=0x{:08X} within {}ms",
                    expect_id, self.opts.config.receive_timeout_ms
                )))
            },
            Ok(Err(_)) => {
                self.disconnect();
                Err(LinkError::io("connection closed while awaiting response"))
            },
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(datagram))) => {
                if datagram.id != expect_id {
                    return Err(LinkError::mismatch(format!(
                        "expected id=0x{:08X}, got id=0x{:08X}",
                        expect_id, datagram.id
                    )));
                }
                Ok(datagram)
            },
        }
    }

    /// Send one frame without awaiting a response.
    async fn send_frame(&mut self, frame_bytes: &[u8]) -> Result<()> {
        self.ensure_transport().await?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        match transport.writer.write_all(frame_bytes).await {
            Ok(()) => {
                debug!("TX: {}B", frame_bytes.len());
                Ok(())
            },
            Err(e) => {
                error!("TX: {}", e);
                self.disconnect();
                Err(LinkError::Io(format!("send error: {e}")))
            },
        }
    }

    /// Dial the transport if it is absent or its reader has stopped.
    ///
    /// Mid-session transport loss is repaired here on the next attempt;
    /// dial failures are terminal for the connection instance.
    async fn ensure_transport(&mut self) -> Result<()> {
        if let Some(t) = &self.transport {
            if t.reader.is_finished() {
                debug!("reader gone, dropping stale transport");
                self.disconnect();
            }
        }
        if self.transport.is_some() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.host, self.port);
        debug!("TCP connecting: {}", addr);
        let stream = match timeout(self.opts.config.dial_timeout(), TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", addr, e);
                let err = LinkError::connection(format!("failed to connect to {addr}: {e}"));
                self.fatal = Some(err.clone());
                return Err(err);
            },
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                let err = LinkError::connection(format!("connection to {addr} timed out"));
                self.fatal = Some(err.clone());
                return Err(err);
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY: {}", e);
        }
        info!("TCP connected: {}", addr);

        let (read_half, writer) = stream.into_split();
        let waiter = WaiterSlot::new();
        let reader = tokio::spawn(reader_loop(read_half, waiter.clone(), self.shared.clone()));
        self.transport = Some(Transport {
            writer,
            waiter,
            reader,
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(t) = self.transport.take() {
            t.reader.abort();
            debug!("disconnected: {}:{}", self.host, self.port);
        }
    }

    /// Terminal teardown: mark closed, evict from the pool, fail leftovers.
    fn shutdown(&mut self) {
        self.disconnect();
        self.shared.pending_close.store(true, Ordering::SeqCst);
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.run_evict();
        self.jobs.close();
        let err = self.fatal.clone().unwrap_or(LinkError::NotConnected);
        while let Ok(job) = self.jobs.try_recv() {
            let is_work = !matches!(job, Job::Close { .. });
            job.fail(err.clone());
            if is_work {
                self.shared.active_jobs.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// Long-lived consumer of transport bytes.
///
/// Appends socket reads to its reassembly buffer, decodes as many frames
/// as the buffer allows, and resolves the waiter slot with responses (or
/// decode errors). Everything else is counted and discarded as
/// unsolicited. The buffer is owned here; the decoder only reports how
/// many bytes to slice off.
async fn reader_loop(mut read_half: OwnedReadHalf, waiter: WaiterSlot, shared: Arc<Shared>) {
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => {
                debug!("peer closed");
                break;
            },
            Ok(n) => n,
            Err(e) => {
                debug!("RX: {}", e);
                break;
            },
        };
        buffer.extend_from_slice(&chunk[..n]);

        loop {
            match frame::decode(&buffer) {
                DecodeStep::Frame { datagram, consumed } => {
                    buffer.drain(..consumed);
                    debug!(
                        "RX frame: {:?} id=0x{:08X} {}B",
                        datagram.cmd,
                        datagram.id,
                        datagram.data.len()
                    );
                    if datagram.cmd == Command::Response {
                        if !waiter.complete(Ok(datagram)).await {
                            shared.unsolicited.fetch_add(1, Ordering::Relaxed);
                            debug!("unsolicited response discarded");
                        }
                    } else {
                        shared.unsolicited.fetch_add(1, Ordering::Relaxed);
                        debug!("unsolicited frame discarded");
                    }
                },
                DecodeStep::NeedMoreData => {
                    if buffer.len() > MAX_READ_BUFFER {
                        // No frame start in sight: drain the stale prefix,
                        // keeping one byte of escape context.
                        let excess = buffer.len() - 1;
                        warn!("read buffer overflow, dropping {}B", excess);
                        buffer.drain(..excess);
                    }
                    break;
                },
                DecodeStep::Corrupt { error, discard } => {
                    let discard = discard.max(1);
                    warn!("frame error: {} (dropping {}B)", error, discard);
                    buffer.drain(..discard);
                    // Fail the in-flight receive so its job can retry.
                    waiter.complete(Err(error)).await;
                },
            }
        }
    }
    // Transport is gone; fail any in-flight receive.
    waiter
        .complete(Err(LinkError::io("connection lost")))
        .await;
}
