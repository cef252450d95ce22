//! Framed connections between nodes.

use crate::envelope::Envelope;
use crate::errors::NetworkError;
use crate::transport::RawStream;
use common::addressing::Address;
use log::warn;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

/// Maximum accepted frame size in bytes.
const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one live connection, unique within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote side closed the stream
    RemoteClosed,
    /// The local node shut down
    Shutdown,
    /// The stream failed mid-operation
    Error,
}

/// A live, framed, bidirectional link to one peer address.
///
/// Envelopes are length-prefixed bincode frames; a reader and a writer task
/// own the two stream halves for the life of the connection.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    peer_address: Address,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl Connection {
    /// Wraps a raw transport stream, spawning its reader and writer tasks.
    ///
    /// Decoded inbound envelopes are handed to `inbound_tx` together with this
    /// connection; the close reason is reported once on `closed_tx`.
    pub fn spawn(
        stream: Box<dyn RawStream>,
        peer_address: Address,
        inbound_tx: mpsc::UnboundedSender<(Connection, Envelope)>,
        closed_tx: mpsc::UnboundedSender<(ConnectionId, CloseReason)>,
    ) -> Connection {
        let id = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (reader, writer) = tokio::io::split(stream);

        let connection = Connection {
            id,
            peer_address,
            outbound: outbound_tx,
        };

        tokio::spawn(write_loop(writer, outbound_rx));
        tokio::spawn(read_loop(reader, connection.clone(), inbound_tx, closed_tx));

        connection
    }

    /// The process-unique id of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The peer's address as seen by the transport.
    pub fn peer_address(&self) -> &Address {
        &self.peer_address
    }

    /// Queues an envelope for delivery on this connection.
    pub fn send(&self, envelope: Envelope) -> Result<(), NetworkError> {
        self.outbound
            .send(envelope)
            .map_err(|_| NetworkError::ConnectionClosed(self.peer_address.to_string()))
    }
}

async fn write_loop(
    mut writer: WriteHalf<Box<dyn RawStream>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = outbound_rx.recv().await {
        match envelope.encode() {
            Ok(bytes) => {
                if write_frame(&mut writer, &bytes).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Dropping unencodable envelope: {}", e),
        }
    }
}

async fn read_loop(
    mut reader: ReadHalf<Box<dyn RawStream>>,
    connection: Connection,
    inbound_tx: mpsc::UnboundedSender<(Connection, Envelope)>,
    closed_tx: mpsc::UnboundedSender<(ConnectionId, CloseReason)>,
) {
    let id = connection.id();
    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(Some(bytes)) => match Envelope::decode(&bytes) {
                Ok(envelope) => {
                    if inbound_tx.send((connection.clone(), envelope)).is_err() {
                        break CloseReason::Shutdown;
                    }
                }
                Err(e) => warn!("Dropping malformed frame from {}: {}", id, e),
            },
            Ok(None) => break CloseReason::RemoteClosed,
            Err(_) => break CloseReason::Error,
        }
    };
    let _ = closed_tx.send((id, reason));
}

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
