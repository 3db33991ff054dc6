use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Command request, and also the server's auth-success echo. The protocol
/// overloads this value; consumers disambiguate by request id, not by type.
pub const TYPE_EXEC_COMMAND: i32 = 2;
pub const TYPE_AUTH: i32 = 3;

/// Bounds on the declared frame length (the size prefix's value, which does
/// not count the prefix itself). Anything outside is a mis-synced stream or a
/// hostile peer.
pub const MIN_FRAME_LEN: i32 = 8;
pub const MAX_FRAME_LEN: i32 = 4096;

/// One frame of the remote-console wire protocol.
///
/// Wire layout, all integers little-endian:
///
/// ```text
/// offset 0:            i32 size       // = 4 + 4 + body.len() + 2
/// offset 4:            i32 request_id
/// offset 8:            i32 type       // 2 = command/response, 3 = auth
/// offset 12:           body bytes
/// offset 12+body.len:  two zero bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub request_id: i32,
    pub packet_type: i32,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("packet body contains an embedded NUL byte")]
    EmbeddedNul,
    #[error("packet body of {len} bytes exceeds the {MAX_FRAME_LEN}-byte frame limit")]
    BodyTooLarge { len: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("stream ended inside the 4-byte size prefix")]
    TruncatedStream,
    #[error("declared packet size {size} is outside [{MIN_FRAME_LEN}, {MAX_FRAME_LEN}]")]
    MalformedPacket { size: i32 },
    #[error("connection closed mid-frame ({got} of {want} bytes)")]
    ConnectionClosed { got: usize, want: usize },
    #[error("socket read failed: {0}")]
    Io(#[from] io::Error),
}

/// Builds one wire frame. The two terminator bytes are appended here; the
/// body must not contain NUL bytes of its own.
pub fn encode(request_id: i32, packet_type: i32, body: &str) -> Result<Vec<u8>, EncodeError> {
    if body.as_bytes().contains(&0) {
        return Err(EncodeError::EmbeddedNul);
    }

    let size = 4 + 4 + body.len() + 2;
    if size > MAX_FRAME_LEN as usize {
        return Err(EncodeError::BodyTooLarge { len: body.len() });
    }

    let mut out = Vec::with_capacity(4 + size);
    out.extend_from_slice(&(size as i32).to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&packet_type.to_le_bytes());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(&[0, 0]);
    Ok(out)
}

/// Reads exactly one frame, accumulating over as many partial reads as the
/// transport needs. The size prefix is validated before the frame body is
/// read, so a hostile length can never cause an oversized allocation.
pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, DecodeError> {
    let mut size_buf = [0u8; 4];
    let mut filled = 0;
    while filled < size_buf.len() {
        let n = reader.read(&mut size_buf[filled..]).await?;
        if n == 0 {
            return Err(DecodeError::TruncatedStream);
        }
        filled += n;
    }

    let size = i32::from_le_bytes(size_buf);
    if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&size) {
        return Err(DecodeError::MalformedPacket { size });
    }

    let want = size as usize;
    let mut frame = vec![0u8; want];
    let mut got = 0;
    while got < want {
        let n = reader.read(&mut frame[got..]).await?;
        if n == 0 {
            return Err(DecodeError::ConnectionClosed { got, want });
        }
        got += n;
    }

    let request_id = read_i32(&frame[0..4]);
    let packet_type = read_i32(&frame[4..8]);

    // Everything between the header and the two terminator bytes.
    let end = frame.len().saturating_sub(2).max(8);
    let body = decode_body(&frame[8..end]);

    Ok(Packet {
        request_id,
        packet_type,
        body,
    })
}

fn read_i32(b: &[u8]) -> i32 {
    i32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn decode_body(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        // Latin-1 maps every byte to the scalar of the same value, so a
        // response with a broken encoding still comes back intact.
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    }
}
