//! Transport abstractions that let the worker pool and auto-SSL detector
//! run against either `mio`'s non-blocking sockets or a `std`-backed test
//! double, without hard-coding a concrete socket type anywhere else.

pub mod tcp_listener;
pub mod tcp_stream;

pub use tcp_listener::TcpListener;
pub use tcp_stream::TcpStream;
