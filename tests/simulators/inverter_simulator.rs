//! Inverter TCP simulator for testing
//!
//! A simple in-memory register server speaking the framed wire protocol,
//! with configurable fault injection for retry and resync tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, error};

use heliolink::frame::{decode, encode_frame, Command, Datagram, DecodeStep};

/// Simple inverter register simulator
pub struct InverterSimulator {
    /// Register store: id -> payload bytes
    registers: Arc<RwLock<HashMap<u32, Vec<u8>>>>,
    /// Artificial delay before each response (milliseconds)
    response_delay_ms: AtomicU64,
    /// Read requests for these ids are silently dropped
    drop_ids: RwLock<HashSet<u32>>,
    /// The first response for each of these ids gets a corrupted trailer
    corrupt_once_ids: RwLock<HashSet<u32>>,
    /// Unsolicited frame pushed ahead of every response
    unsolicited: RwLock<Option<Datagram>>,
    /// Accept writes but do not store them
    ignore_writes: AtomicBool,
    read_requests: AtomicUsize,
    write_requests: AtomicUsize,
    /// Highest number of read requests observed awaiting a response
    max_overlap: AtomicUsize,
}

impl Default for InverterSimulator {
    fn default() -> Self {
        Self {
            registers: Arc::new(RwLock::new(HashMap::new())),
            response_delay_ms: AtomicU64::new(0),
            drop_ids: RwLock::new(HashSet::new()),
            corrupt_once_ids: RwLock::new(HashSet::new()),
            unsolicited: RwLock::new(None),
            ignore_writes: AtomicBool::new(false),
            read_requests: AtomicUsize::new(0),
            write_requests: AtomicUsize::new(0),
            max_overlap: AtomicUsize::new(0),
        }
    }
}

impl InverterSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a local port and start serving; returns the simulator handle
    /// and its address.
    pub async fn start(self) -> (Arc<Self>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let sim = Arc::new(self);
        let accept_sim = sim.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("simulator: connection from {}", peer);
                        let sim = accept_sim.clone();
                        tokio::spawn(async move {
                            sim.handle_connection(stream).await;
                        });
                    },
                    Err(e) => {
                        error!("simulator accept: {}", e);
                        break;
                    },
                }
            }
        });

        (sim, addr)
    }

    // ========================================================================
    // Register store and fault injection
    // ========================================================================

    pub async fn set_register(&self, id: u32, data: Vec<u8>) {
        self.registers.write().await.insert(id, data);
    }

    pub async fn get_register(&self, id: u32) -> Option<Vec<u8>> {
        self.registers.read().await.get(&id).cloned()
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.response_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Silently drop read requests for this id.
    pub async fn drop_requests_for(&self, id: u32) {
        self.drop_ids.write().await.insert(id);
    }

    /// Corrupt the trailer of the next response for this id.
    pub async fn corrupt_first_response_of(&self, id: u32) {
        self.corrupt_once_ids.write().await.insert(id);
    }

    /// Push an unsolicited frame ahead of every response.
    pub async fn emit_unsolicited_before_responses(&self, frame: Datagram) {
        *self.unsolicited.write().await = Some(frame);
    }

    /// Accept write frames without storing the value.
    pub fn set_ignore_writes(&self, ignore: bool) {
        self.ignore_writes.store(ignore, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> usize {
        self.read_requests.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.write_requests.load(Ordering::SeqCst)
    }

    /// Highest observed number of concurrently outstanding read requests.
    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Wire handling
    // ========================================================================

    async fn handle_connection(&self, mut stream: TcpStream) {
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 1024];

        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("simulator read: {}", e);
                    break;
                },
            };
            buffer.extend_from_slice(&chunk[..n]);

            loop {
                match decode(&buffer) {
                    DecodeStep::Frame { datagram, consumed } => {
                        buffer.drain(..consumed);
                        if datagram.cmd == Command::Read {
                            // Record how many reads are outstanding at once:
                            // this one plus any already sitting in the buffer.
                            let overlap = 1 + pending_reads(&buffer);
                            self.max_overlap.fetch_max(overlap, Ordering::SeqCst);
                        }
                        let replies = self.handle_datagram(datagram).await;
                        let delay = self.response_delay_ms.load(Ordering::SeqCst);
                        if delay > 0 && !replies.is_empty() {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                        for frame in replies {
                            if stream.write_all(&frame).await.is_err() {
                                return;
                            }
                        }
                    },
                    DecodeStep::NeedMoreData => break,
                    DecodeStep::Corrupt { discard, .. } => {
                        buffer.drain(..discard.max(1));
                    },
                }
            }
        }
    }

    async fn handle_datagram(&self, request: Datagram) -> Vec<Vec<u8>> {
        match request.cmd {
            Command::Read => {
                self.read_requests.fetch_add(1, Ordering::SeqCst);
                if self.drop_ids.read().await.contains(&request.id) {
                    debug!("simulator: dropping read of 0x{:08X}", request.id);
                    return Vec::new();
                }

                let mut replies = Vec::new();
                if let Some(unsolicited) = self.unsolicited.read().await.clone() {
                    replies.push(unsolicited.encode().expect("unsolicited frame"));
                }

                let data = self
                    .registers
                    .read()
                    .await
                    .get(&request.id)
                    .cloned()
                    .unwrap_or_default();
                let mut frame =
                    encode_frame(Command::Response, request.id, &data).expect("response frame");
                if self.corrupt_once_ids.write().await.remove(&request.id) {
                    // Flip the CRC low byte so the client sees a checksum
                    // failure and retries.
                    let last = frame.len() - 1;
                    frame[last] ^= 0xFF;
                    debug!("simulator: corrupting response for 0x{:08X}", request.id);
                }
                replies.push(frame);
                replies
            },
            Command::Write => {
                self.write_requests.fetch_add(1, Ordering::SeqCst);
                if !self.ignore_writes.load(Ordering::SeqCst) {
                    self.registers
                        .write()
                        .await
                        .insert(request.id, request.data);
                }
                // Writes are not acknowledged; the client verifies with a
                // follow-up read.
                Vec::new()
            },
            _ => Vec::new(),
        }
    }
}

/// Count complete read frames already waiting in the inbound buffer.
fn pending_reads(buffer: &[u8]) -> usize {
    let mut rest = buffer.to_vec();
    let mut count = 0;
    loop {
        match decode(&rest) {
            DecodeStep::Frame { datagram, consumed } => {
                rest.drain(..consumed);
                if datagram.cmd == Command::Read {
                    count += 1;
                }
            },
            _ => break,
        }
    }
    count
}
