//! Buffered, length-delimited packet framing over a split `TcpStream`.
//!
//! A packet is opaque to the dispatcher: a length-prefixed byte string, with
//! no further structure. Reads and writes are driven independently (one half
//! does not block the other), which is what lets a connection keep reading
//! pipelined requests while a response write is still in flight.

use bytes::{Bytes, BytesMut};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Reads framed packets off the read half of a connection.
pub type PacketReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;

/// Writes framed packets to the write half of a connection.
pub type PacketWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// A packet payload. Requests and responses share this representation so a
/// request's buffer can become the corresponding response's buffer without
/// any change of type, mirroring the envelope reuse of the source design
/// (the length-prefix itself is regenerated by the codec, not carried by
/// hand, since the codec is the source of truth for the wire format).
pub type Payload = Bytes;

/// Splits a connected socket into an independently-driven reader and writer.
///
/// The socket is always used in non-blocking mode by virtue of being a Tokio
/// `TcpStream`; there is no separate "make non-blocking" step to perform.
pub fn split(socket: TcpStream) -> (PacketReader, PacketWriter) {
    let (read_half, write_half) = socket.into_split();
    let codec = LengthDelimitedCodec::new();
    (
        FramedRead::new(read_half, codec.clone()),
        FramedWrite::new(write_half, codec),
    )
}

/// Converts a read buffer into an owned, immutable payload ready to be
/// handed to the upstream queue.
pub fn freeze(buf: BytesMut) -> Payload {
    buf.freeze()
}
