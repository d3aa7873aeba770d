//! Authenticated, framed request/response transport between nodes.
//!
//! Frames are length-prefixed (`tokio_util` codec); the first frame of every
//! connection is a handshake carrying the peer's node id and the shared
//! cluster token. Each peer gets a single writer task fed by a bounded
//! queue; responses are matched to callers by correlation id. Failures are
//! returned verbatim; retry policy belongs to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::codec::{put_str, put_u64, put_u8, read_str, read_u64, read_u8, put_bytes, read_bytes};
use crate::error::ClusterError;

/// Capacity of each per-peer outbound queue.
const PEER_QUEUE_CAPACITY: usize = 4096;
/// Default round-trip deadline for requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline used by election polls.
pub const ELECTION_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const FRAME_HANDSHAKE: u8 = 0;
const FRAME_REQUEST: u8 = 1;
const FRAME_RESPONSE: u8 = 2;
const FRAME_NOTIFY: u8 = 3;

/// Inbound traffic sink. Requests return a status byte plus body; notifies
/// are one-way.
#[async_trait]
pub trait TransportHandler: Send + Sync + 'static {
    async fn handle_request(&self, from: u64, path: &str, body: Vec<u8>) -> (u8, Vec<u8>);
    async fn handle_notify(&self, from: u64, path: &str, body: Vec<u8>);
}

/// Resolves a node id to its cluster address.
pub type AddrResolver = Arc<dyn Fn(u64) -> Option<String> + Send + Sync>;

struct Peer {
    tx: mpsc::Sender<Bytes>,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<(u8, Vec<u8>)>>>;

pub struct Transport {
    node_id: u64,
    token: String,
    resolver: AddrResolver,
    peers: Mutex<HashMap<u64, Peer>>,
    pending: Arc<PendingMap>,
    next_correlation: AtomicU64,
    handler: OnceLock<Arc<dyn TransportHandler>>,
}

impl Transport {
    pub fn new(node_id: u64, token: String, resolver: AddrResolver) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            token,
            resolver,
            peers: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_correlation: AtomicU64::new(1),
            handler: OnceLock::new(),
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Install the inbound handler. Must be called before `start`.
    pub fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
        let _ = self.handler.set(handler);
    }

    /// Bind the listener and start accepting peer connections.
    pub async fn start(self: &Arc<Self>, listen_addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("bind transport listener {listen_addr}"))?;
        tracing::info!(node = self.node_id, addr = %listen_addr, "transport listening");
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            if let Err(err) = transport.run_inbound(stream).await {
                                tracing::debug!(%peer_addr, error = %err, "inbound connection closed");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "transport accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(())
    }

    // ------------------------------------------------------------- outbound

    /// Round-trip a request to a peer. `to == self` short-circuits through
    /// the local handler so callers never special-case themselves.
    pub async fn request(
        &self,
        to: u64,
        path: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<(u8, Vec<u8>), ClusterError> {
        if to == self.node_id {
            let handler = self
                .handler
                .get()
                .ok_or_else(|| ClusterError::Other(anyhow::anyhow!("transport handler not set")))?
                .clone();
            return Ok(handler.handle_request(self.node_id, path, body).await);
        }

        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(correlation, tx);

        let frame = encode_request(correlation, path, &body);
        if let Err(err) = self.send_frame(to, frame).await {
            self.pending.lock().expect("pending lock").remove(&correlation);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => {
                self.pending.lock().expect("pending lock").remove(&correlation);
                Err(ClusterError::Other(anyhow::anyhow!(
                    "connection to node {to} lost"
                )))
            }
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&correlation);
                Err(ClusterError::RequestTimeout)
            }
        }
    }

    /// One-way frame to a peer. `to == self` dispatches locally.
    pub async fn notify(&self, to: u64, path: &str, body: Vec<u8>) -> Result<(), ClusterError> {
        if to == self.node_id {
            if let Some(handler) = self.handler.get() {
                let handler = handler.clone();
                handler.handle_notify(self.node_id, path, body).await;
            }
            return Ok(());
        }
        let frame = encode_notify(path, &body);
        self.send_frame(to, frame).await
    }

    async fn send_frame(&self, to: u64, frame: Bytes) -> Result<(), ClusterError> {
        let tx = self.peer_sender(to)?;
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ClusterError::Other(anyhow::anyhow!(
                "outbound queue to node {to} full"
            ))),
            Err(mpsc::error::TrySendError::Closed(frame)) => {
                // The peer task died; rebuild it once and re-enqueue.
                self.peers.lock().expect("peers lock").remove(&to);
                let tx = self.peer_sender(to)?;
                tx.try_send(frame).map_err(|_| {
                    ClusterError::Other(anyhow::anyhow!("connection to node {to} unavailable"))
                })
            }
        }
    }

    fn peer_sender(&self, to: u64) -> Result<mpsc::Sender<Bytes>, ClusterError> {
        let mut peers = self.peers.lock().expect("peers lock");
        if let Some(peer) = peers.get(&to) {
            return Ok(peer.tx.clone());
        }
        let addr = (self.resolver)(to).ok_or(ClusterError::NodeNotFound(to))?;
        let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        peers.insert(to, Peer { tx: tx.clone() });

        let node_id = self.node_id;
        let token = self.token.clone();
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            if let Err(err) = run_peer(node_id, &addr, &token, rx, pending).await {
                tracing::debug!(to, addr = %addr, error = %err, "peer connection closed");
            }
        });
        // The task removes itself lazily: the next send to a dead peer gets
        // a Closed error and rebuilds the entry.
        Ok(tx)
    }

    // -------------------------------------------------------------- inbound

    async fn run_inbound(self: Arc<Self>, stream: TcpStream) -> anyhow::Result<()> {
        stream.set_nodelay(true).ok();
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let first = framed
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("connection closed before handshake"))??;
        let (peer_id, token) = decode_handshake(&first)?;
        anyhow::ensure!(token == self.token, "handshake token mismatch");
        tracing::debug!(node = self.node_id, peer = peer_id, "peer connected");

        let handler = self
            .handler
            .get()
            .ok_or_else(|| anyhow::anyhow!("transport handler not set"))?
            .clone();

        let (mut sink, mut source) = framed.split();
        let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(PEER_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = source.next().await {
            let frame = frame?;
            let mut offset = 0usize;
            match read_u8(&frame, &mut offset)? {
                FRAME_REQUEST => {
                    let correlation = read_u64(&frame, &mut offset)?;
                    let path = read_str(&frame, &mut offset)?;
                    let body = read_bytes(&frame, &mut offset)?;
                    let handler = handler.clone();
                    let write_tx = write_tx.clone();
                    tokio::spawn(async move {
                        let (status, resp_body) =
                            handler.handle_request(peer_id, &path, body).await;
                        let _ = write_tx
                            .send(encode_response(correlation, status, &resp_body))
                            .await;
                    });
                }
                FRAME_NOTIFY => {
                    let path = read_str(&frame, &mut offset)?;
                    let body = read_bytes(&frame, &mut offset)?;
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle_notify(peer_id, &path, body).await;
                    });
                }
                other => {
                    anyhow::bail!("unexpected frame type {other}");
                }
            }
        }
        Ok(())
    }
}

/// Outbound side of one peer link: connect, handshake, then pump queued
/// frames out and route response frames back to waiting callers.
async fn run_peer(
    node_id: u64,
    addr: &str,
    token: &str,
    mut rx: mpsc::Receiver<Bytes>,
    pending: Arc<PendingMap>,
) -> anyhow::Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect peer {addr}"))?;
    stream.set_nodelay(true).ok();
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    framed.send(encode_handshake(node_id, token)).await?;
    let (mut sink, mut source) = framed.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => sink.send(frame).await?,
                    None => return Ok(()),
                }
            }
            inbound = source.next() => {
                let frame = match inbound {
                    Some(frame) => frame?,
                    None => anyhow::bail!("peer {addr} closed connection"),
                };
                let mut offset = 0usize;
                match read_u8(&frame, &mut offset)? {
                    FRAME_RESPONSE => {
                        let correlation = read_u64(&frame, &mut offset)?;
                        let status = read_u8(&frame, &mut offset)?;
                        let body = read_bytes(&frame, &mut offset)?;
                        if let Some(tx) = pending.lock().expect("pending lock").remove(&correlation) {
                            let _ = tx.send((status, body));
                        }
                    }
                    other => {
                        tracing::warn!(addr, frame_type = other, "unexpected frame on outbound link");
                    }
                }
            }
        }
    }
}

// ------------------------------------------------------------------- frames

fn encode_handshake(node_id: u64, token: &str) -> Bytes {
    let mut out = Vec::with_capacity(16 + token.len());
    put_u8(&mut out, FRAME_HANDSHAKE);
    put_u64(&mut out, node_id);
    put_str(&mut out, token);
    Bytes::from(out)
}

fn decode_handshake(frame: &[u8]) -> anyhow::Result<(u64, String)> {
    let mut offset = 0usize;
    let frame_type = read_u8(frame, &mut offset)?;
    anyhow::ensure!(frame_type == FRAME_HANDSHAKE, "expected handshake frame");
    let node_id = read_u64(frame, &mut offset)?;
    let token = read_str(frame, &mut offset)?;
    Ok((node_id, token))
}

fn encode_request(correlation: u64, path: &str, body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(17 + path.len() + body.len());
    put_u8(&mut out, FRAME_REQUEST);
    put_u64(&mut out, correlation);
    put_str(&mut out, path);
    put_bytes(&mut out, body);
    Bytes::from(out)
}

fn encode_response(correlation: u64, status: u8, body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(14 + body.len());
    put_u8(&mut out, FRAME_RESPONSE);
    put_u64(&mut out, correlation);
    put_u8(&mut out, status);
    put_bytes(&mut out, body);
    Bytes::from(out)
}

fn encode_notify(path: &str, body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(9 + path.len() + body.len());
    put_u8(&mut out, FRAME_NOTIFY);
    put_str(&mut out, path);
    put_bytes(&mut out, body);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::status;

    struct EchoHandler {
        node_id: u64,
        notifies: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl TransportHandler for EchoHandler {
        async fn handle_request(&self, _from: u64, path: &str, mut body: Vec<u8>) -> (u8, Vec<u8>) {
            body.extend_from_slice(path.as_bytes());
            body.extend_from_slice(&self.node_id.to_be_bytes());
            (status::OK, body)
        }

        async fn handle_notify(&self, _from: u64, path: &str, body: Vec<u8>) {
            self.notifies
                .lock()
                .expect("notify lock")
                .push((path.to_string(), body));
        }
    }

    fn resolver(pairs: Vec<(u64, String)>) -> AddrResolver {
        Arc::new(move |id| {
            pairs
                .iter()
                .find(|(node, _)| *node == id)
                .map(|(_, addr)| addr.clone())
        })
    }

    async fn pick_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn request_round_trip_between_two_nodes() {
        let addr1 = pick_port().await;
        let addr2 = pick_port().await;
        let pairs = vec![(1u64, addr1.clone()), (2u64, addr2.clone())];

        let t1 = Transport::new(1, "tok".into(), resolver(pairs.clone()));
        let t2 = Transport::new(2, "tok".into(), resolver(pairs));
        t1.set_handler(Arc::new(EchoHandler {
            node_id: 1,
            notifies: Mutex::new(Vec::new()),
        }));
        let h2 = Arc::new(EchoHandler {
            node_id: 2,
            notifies: Mutex::new(Vec::new()),
        });
        t2.set_handler(h2.clone());
        t1.start(&addr1).await.unwrap();
        t2.start(&addr2).await.unwrap();

        let (code, body) = t1
            .request(2, "/echo", b"hi".to_vec(), DEFAULT_REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(code, status::OK);
        let mut expect = b"hi/echo".to_vec();
        expect.extend_from_slice(&2u64.to_be_bytes());
        assert_eq!(body, expect);

        t1.notify(2, "/note", b"n".to_vec()).await.unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if !h2.notifies.lock().unwrap().is_empty() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "notify not delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Local short-circuit.
        let (code, _) = t1
            .request(1, "/echo", b"self".to_vec(), DEFAULT_REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(code, status::OK);
    }

    #[tokio::test]
    async fn request_to_unknown_node_fails_fast() {
        let t1 = Transport::new(1, "tok".into(), resolver(vec![]));
        t1.set_handler(Arc::new(EchoHandler {
            node_id: 1,
            notifies: Mutex::new(Vec::new()),
        }));
        let err = t1
            .request(9, "/echo", Vec::new(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NodeNotFound(9)));
    }
}
