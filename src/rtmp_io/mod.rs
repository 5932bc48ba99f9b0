//! Thin wrappers around `rml_rtmp`'s handshake/session state machines.
//!
//! Everything above this module (`session`, `producer`, `consumer::push`,
//! `consumer::pull`) talks in terms of [`server::ServerIntent`] /
//! [`client::ClientIntent`] and plain bytes, never the raw `rml_rtmp`
//! session/event types directly - that keeps the one genuinely
//! protocol-library-shaped seam in one place, following the same
//! handshake-then-event-loop shape the teacher's `ingress::rtmp` module
//! used server-side only.

pub mod client;
pub mod server;

use anyhow::{bail, Result};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A socket half (or whole) that is both readable and writable - a plain
/// `TcpStream` on the ingest side, or either a `TcpStream` or a
/// `tokio_native_tls::TlsStream<TcpStream>` boxed up on the push-egress
/// side, where the scheme (`rtmp`/`rtmps`) is only known at dial time.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// Drives the RTMP handshake (C0/C1/C2 or S0/S1/S2 depending on
/// `peer_type`) to completion and returns any trailing bytes the peer sent
/// immediately after the handshake, which must be fed into the session's
/// `handle_input` once it is constructed.
pub(crate) async fn run_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    socket: &mut S,
    peer_type: PeerType,
) -> Result<Vec<u8>> {
    let mut hs = Handshake::new(peer_type);
    let p0_p1 = hs.generate_outbound_p0_and_p1()?;
    socket.write_all(&p0_p1).await?;

    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            bail!("eof during rtmp handshake");
        }
        match hs.process_bytes(&buf[..n])? {
            HandshakeProcessResult::InProgress { response_bytes } => {
                if !response_bytes.is_empty() {
                    socket.write_all(&response_bytes).await?;
                }
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                if !response_bytes.is_empty() {
                    socket.write_all(&response_bytes).await?;
                }
                return Ok(remaining_bytes);
            }
        }
    }
}
