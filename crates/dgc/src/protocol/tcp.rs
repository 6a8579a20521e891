//! Framed TCP transport for DGC calls
//!
//! Each frame is `[length:u32][call_id:u32][payload]`, where `length`
//! counts the call id and payload. One call is outstanding per
//! connection at a time.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, trace, warn};

use super::channel::{DgcConnector, DgcProxy, RpcChannel, RpcDgcProxy};
use super::dispatch::DgcDispatcher;
use super::wire;
use crate::types::{DgcError, Endpoint, Result};

/// Largest frame accepted by default
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20;

/// Default limit on concurrently served connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default time allowed for connecting
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for one request/response exchange
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

const LENGTH_SIZE: usize = 4;
const CALL_ID_SIZE: usize = 4;

/// Reads and writes length-prefixed frames
pub struct FrameTransport<T> {
    inner: T,
    max_frame_size: usize,
    read_buf: BytesMut,
}

impl<T> FrameTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn with_max_frame_size(mut self, max_size: usize) -> Self {
        self.max_frame_size = max_size;
        self
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> FrameTransport<T> {
    /// Read one frame, returning its call id and payload
    pub async fn read_frame(&mut self) -> Result<(u32, Bytes)> {
        while self.read_buf.len() < LENGTH_SIZE {
            if self.fill_buf().await? == 0 {
                if self.read_buf.is_empty() {
                    return Err(DgcError::ConnectionClosed);
                }
                return Err(DgcError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "incomplete frame header",
                )));
            }
        }

        let header = &self.read_buf[..LENGTH_SIZE];
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length < CALL_ID_SIZE {
            return Err(DgcError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid frame length: {}", length),
            )));
        }
        if length > self.max_frame_size {
            return Err(DgcError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        while self.read_buf.len() < LENGTH_SIZE + length {
            if self.fill_buf().await? == 0 {
                return Err(DgcError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "incomplete frame: expected {} bytes, got {}",
                        LENGTH_SIZE + length,
                        self.read_buf.len()
                    ),
                )));
            }
        }

        self.read_buf.advance(LENGTH_SIZE);
        let call_id = self.read_buf.get_u32_le();
        let payload = self.read_buf.split_to(length - CALL_ID_SIZE).freeze();
        Ok((call_id, payload))
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 1024 {
            self.read_buf.reserve(4096);
        }
        Ok(self.inner.read_buf(&mut self.read_buf).await?)
    }
}

impl<T: AsyncWrite + Unpin> FrameTransport<T> {
    /// Write one frame
    pub async fn write_frame(&mut self, call_id: u32, payload: &[u8]) -> Result<()> {
        let length = CALL_ID_SIZE + payload.len();
        if length > self.max_frame_size {
            return Err(DgcError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }
        let mut frame = BytesMut::with_capacity(LENGTH_SIZE + length);
        frame.put_u32_le(length as u32);
        frame.put_u32_le(call_id);
        frame.put_slice(payload);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Channel to a remote endpoint over TCP
///
/// Connects on first use and reconnects on the call after a failure.
pub struct TcpChannel {
    endpoint: Endpoint,
    max_frame_size: usize,
    connect_timeout: Duration,
    call_timeout: Duration,
    conn: Mutex<Option<FrameTransport<TcpStream>>>,
    call_ids: AtomicU32,
}

impl TcpChannel {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            conn: Mutex::new(None),
            call_ids: AtomicU32::new(1),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, call: Duration) -> Self {
        self.connect_timeout = connect;
        self.call_timeout = call;
        self
    }

    pub fn with_max_frame_size(mut self, max_size: usize) -> Self {
        self.max_frame_size = max_size;
        self
    }

    async fn connect(&self) -> Result<FrameTransport<TcpStream>> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(self.endpoint.authority()),
        )
        .await
        .map_err(|_| {
            DgcError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out", self.endpoint),
            ))
        })??;
        stream.set_nodelay(true)?;
        debug!("connected to {}", self.endpoint);
        Ok(FrameTransport::new(stream).with_max_frame_size(self.max_frame_size))
    }
}

async fn exchange<T>(transport: &mut FrameTransport<T>, call_id: u32, request: &[u8]) -> Result<Bytes>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    transport.write_frame(call_id, request).await?;
    let (got, payload) = transport.read_frame().await?;
    if got != call_id {
        return Err(DgcError::CallIdMismatch {
            expected: call_id,
            got,
        });
    }
    Ok(payload)
}

#[async_trait]
impl RpcChannel for TcpChannel {
    async fn call(&self, opnum: u16, args: Bytes) -> Result<Bytes> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.connect().await?);
        }
        let Some(transport) = conn.as_mut() else {
            return Err(DgcError::ConnectionClosed);
        };

        let call_id = self.call_ids.fetch_add(1, Ordering::Relaxed);
        let request = wire::encode_request(opnum, &args);
        trace!("call {} opnum {} to {}", call_id, opnum, self.endpoint);

        let result = match tokio::time::timeout(
            self.call_timeout,
            exchange(transport, call_id, &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DgcError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("call to {} timed out", self.endpoint),
            ))),
        };

        match result {
            Ok(payload) => wire::decode_response(payload),
            Err(e) => {
                // The stream may hold a partial frame; start over next call.
                *conn = None;
                Err(e)
            }
        }
    }
}

/// Connector creating one lazily-connected TCP channel per endpoint
#[derive(Clone, Debug)]
pub struct TcpConnector {
    max_frame_size: usize,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, call: Duration) -> Self {
        self.connect_timeout = connect;
        self.call_timeout = call;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl DgcConnector for TcpConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn DgcProxy>> {
        let channel = TcpChannel::new(endpoint.clone())
            .with_max_frame_size(self.max_frame_size)
            .with_timeouts(self.connect_timeout, self.call_timeout);
        Ok(Arc::new(RpcDgcProxy::new(channel)))
    }
}

/// Accept loop serving DGC requests
pub struct DgcListener {
    dispatcher: Arc<DgcDispatcher>,
    max_connections: usize,
    max_frame_size: usize,
}

impl DgcListener {
    pub fn new(dispatcher: Arc<DgcDispatcher>) -> Self {
        Self {
            dispatcher,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_max_frame_size(mut self, max_size: usize) -> Self {
        self.max_frame_size = max_size;
        self
    }

    /// Serve connections from `listener` until `shutdown` resolves
    pub async fn serve_until<F: Future<Output = ()>>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<()> {
        let local = listener.local_addr()?;
        info!(
            "DGC listener on {} (max_connections: {})",
            local, self.max_connections
        );
        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("DGC listener on {} shutting down", local);
                    return Ok(());
                }

                result = listener.accept() => {
                    let (stream, peer) = result?;
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("connection limit reached, rejecting {}", peer);
                            drop(stream);
                            continue;
                        }
                    };
                    debug!("accepted connection from {}", peer);

                    let dispatcher = self.dispatcher.clone();
                    let max_frame_size = self.max_frame_size;
                    tokio::spawn(async move {
                        let _permit = permit;
                        match handle_connection(stream, dispatcher, max_frame_size).await {
                            Ok(()) | Err(DgcError::ConnectionClosed) => {
                                debug!("connection from {} closed", peer)
                            }
                            Err(e) => warn!("connection error from {}: {}", peer, e),
                        }
                    });
                }
            }
        }
    }

    /// Serve connections from `listener` forever
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_until(listener, std::future::pending()).await
    }
}

async fn handle_connection(
    stream: TcpStream,
    dispatcher: Arc<DgcDispatcher>,
    max_frame_size: usize,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut transport = FrameTransport::new(stream).with_max_frame_size(max_frame_size);
    loop {
        let (call_id, request) = transport.read_frame().await?;
        let reply = dispatcher.handle(request);
        transport.write_frame(call_id, &reply).await?;
    }
}
