//! DGC messages and the transports that carry them
//!
//! - [`wire`]: tagged value codec with per-message allow-lists
//! - [`RpcChannel`] / [`DgcProxy`] / [`DgcConnector`]: client-side seams
//! - [`DgcDispatcher`]: server-side request routing
//! - [`LoopbackConnector`]: in-process transport
//! - [`TcpConnector`] / [`DgcListener`]: framed TCP transport

pub mod wire;

mod channel;
mod dispatch;
mod loopback;
mod tcp;

pub use channel::{DgcConnector, DgcProxy, RpcChannel, RpcDgcProxy};
pub use dispatch::DgcDispatcher;
pub use loopback::{LoopbackChannel, LoopbackConnector};
pub use tcp::{
    DgcListener, FrameTransport, TcpChannel, TcpConnector, DEFAULT_CALL_TIMEOUT,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_FRAME_SIZE,
};
