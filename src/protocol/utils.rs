//! Helper functions shared by the Git smart protocol handlers: pkt-line parsing over buffers and
//! async readers, pkt-line encoding, side-band framing, and advertisement builders.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::{PKT_LINE_END_MARKER, ProtocolError, SideBand, TransportProtocol};

/// Largest pkt-line, length prefix included.
pub const MAX_PKT_LEN: usize = 65520;

/// One decoded pkt-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Data(Bytes),
    /// `0000`
    Flush,
}

fn parse_pkt_len(prefix: &[u8]) -> Result<usize, ProtocolError> {
    let text = std::str::from_utf8(prefix)
        .map_err(|_| ProtocolError::decode(format!("invalid pkt-line length {prefix:?}")))?;
    let len = usize::from_str_radix(text, 16)
        .map_err(|_| ProtocolError::decode(format!("invalid pkt-line length {text:?}")))?;
    match len {
        0 => Ok(0),
        1..=3 => Err(ProtocolError::decode(format!(
            "invalid pkt-line length {len} (must be 0 or >= 4)"
        ))),
        _ if len > MAX_PKT_LEN => Err(ProtocolError::decode(format!(
            "pkt-line length {len} exceeds {MAX_PKT_LEN}"
        ))),
        _ => Ok(len),
    }
}

/// Read a packet line from the front of `bytes`, consuming it.
///
/// `Ok(None)` when the buffer is exhausted; an error when the buffer ends inside a line or the
/// length prefix is malformed.
pub fn read_pkt_line(bytes: &mut Bytes) -> Result<Option<PktLine>, ProtocolError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    if bytes.len() < 4 {
        return Err(ProtocolError::decode("truncated pkt-line length"));
    }
    let pkt_length = parse_pkt_len(&bytes[..4])?;
    if pkt_length == 0 {
        bytes.advance(4);
        return Ok(Some(PktLine::Flush));
    }
    if bytes.len() < pkt_length {
        return Err(ProtocolError::decode(format!(
            "truncated pkt-line: need {} bytes, have {}",
            pkt_length,
            bytes.len()
        )));
    }
    bytes.advance(4);
    let pkt_line = bytes.split_to(pkt_length - 4);
    tracing::trace!(line = ?pkt_line, "pkt line");
    Ok(Some(PktLine::Data(pkt_line)))
}

/// Async counterpart of [`read_pkt_line`]. `Ok(None)` on a clean EOF before a new line starts.
pub async fn read_pkt_line_async<R>(reader: &mut R) -> Result<Option<PktLine>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::decode("connection closed inside pkt-line length"));
        }
        filled += n;
    }
    let pkt_length = parse_pkt_len(&prefix)?;
    if pkt_length == 0 {
        return Ok(Some(PktLine::Flush));
    }
    let mut data = vec![0u8; pkt_length - 4];
    reader.read_exact(&mut data).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::decode("connection closed inside pkt-line")
        } else {
            e.into()
        }
    })?;
    Ok(Some(PktLine::Data(Bytes::from(data))))
}

/// Add a packet line string to the buffer with proper length prefix
pub fn add_pkt_line_string(pkt_line_stream: &mut BytesMut, buf_str: String) {
    add_pkt_line_bytes(pkt_line_stream, buf_str.as_bytes());
}

pub fn add_pkt_line_bytes(pkt_line_stream: &mut BytesMut, data: &[u8]) {
    let buf_length = data.len() + 4;
    pkt_line_stream.put(Bytes::from(format!("{buf_length:04x}")));
    pkt_line_stream.put(data);
}

pub fn add_flush(pkt_line_stream: &mut BytesMut) {
    pkt_line_stream.put(&PKT_LINE_END_MARKER[..]);
}

/// Read until whitespace or NUL and return the extracted string
pub fn read_until_white_space(bytes: &mut Bytes) -> String {
    let mut buf = Vec::new();
    while bytes.has_remaining() {
        let c = bytes.get_u8();
        if c.is_ascii_whitespace() || c == 0 {
            break;
        }
        buf.push(c);
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// Frames `data` as side-band packets on `band`, at most `max_data` payload bytes each.
pub fn side_band_frames(band: SideBand, data: &[u8], max_data: usize) -> BytesMut {
    let mut out = BytesMut::with_capacity(data.len() + (data.len() / max_data + 1) * 5);
    for chunk in data.chunks(max_data) {
        out.put(Bytes::from(format!("{:04x}", chunk.len() + 5)));
        out.put_u8(band.value());
        out.put(chunk);
    }
    out
}

/// Build a smart reply packet line stream. Over HTTP the reply starts with the
/// `# service=` preamble and a flush.
pub fn build_smart_reply(
    transport_protocol: TransportProtocol,
    ref_list: &[String],
    service: String,
) -> BytesMut {
    let mut pkt_line_stream = BytesMut::new();
    if transport_protocol == TransportProtocol::Http {
        add_pkt_line_string(&mut pkt_line_stream, format!("# service={service}\n"));
        add_flush(&mut pkt_line_stream);
    }

    for ref_line in ref_list {
        add_pkt_line_string(&mut pkt_line_stream, ref_line.to_string());
    }
    add_flush(&mut pkt_line_stream);
    pkt_line_stream
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::*;

    #[test]
    fn test_read_pkt_lines() {
        let mut buf = Bytes::from_static(b"000ahello\n00000009done\n");
        assert_eq!(
            read_pkt_line(&mut buf).unwrap(),
            Some(PktLine::Data(Bytes::from_static(b"hello\n")))
        );
        assert_eq!(read_pkt_line(&mut buf).unwrap(), Some(PktLine::Flush));
        assert_eq!(
            read_pkt_line(&mut buf).unwrap(),
            Some(PktLine::Data(Bytes::from_static(b"done\n")))
        );
        assert_eq!(read_pkt_line(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_read_pkt_line_errors() {
        for bad in [&b"00"[..], b"zzzz", b"0002", b"0010short"] {
            let mut buf = Bytes::copy_from_slice(bad);
            assert!(
                matches!(read_pkt_line(&mut buf), Err(ProtocolError::Decode(_))),
                "{bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_read_pkt_line_async() {
        let mut reader: &[u8] = b"0009want\n0000";
        assert_eq!(
            read_pkt_line_async(&mut reader).await.unwrap(),
            Some(PktLine::Data(Bytes::from_static(b"want\n")))
        );
        assert_eq!(read_pkt_line_async(&mut reader).await.unwrap(), Some(PktLine::Flush));
        assert_eq!(read_pkt_line_async(&mut reader).await.unwrap(), None);

        let mut truncated: &[u8] = b"0009wa";
        assert!(read_pkt_line_async(&mut truncated).await.is_err());
    }

    /// The advertisement preamble is exactly `0032# service=git-upload-pack\n0000`.
    #[test]
    fn test_http_preamble() {
        let reply = build_smart_reply(TransportProtocol::Http, &[], "git-upload-pack".to_string());
        assert_eq!(&reply[..], b"001e# service=git-upload-pack\n00000000");
        let reply = build_smart_reply(TransportProtocol::Ssh, &["x\n".to_string()], String::new());
        assert_eq!(&reply[..], b"0006x\n0000");
    }

    #[test]
    fn test_side_band_frames() {
        let data = vec![7u8; 10];
        let framed = side_band_frames(SideBand::PackfileData, &data, 4);
        // 4 + 4 + 2 payload bytes, each packet carrying 5 bytes of framing.
        assert_eq!(framed.len(), 10 + 3 * 5);
        assert_eq!(&framed[..5], b"0009\x01");

        let mut pkt = BytesMut::new();
        add_pkt_line_string(&mut pkt, "unpack ok\n".to_string());
        assert_eq!(&pkt[..], b"000eunpack ok\n");
    }
}
