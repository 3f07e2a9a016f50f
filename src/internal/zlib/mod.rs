//! zlib helpers for loose objects and pack entries.
//!
//! Loose objects are whole zlib streams. Pack entries are zlib streams packed back to back, so
//! [`inflate_entry`] reports how many compressed bytes the stream occupied, leaving the caller
//! positioned at the next entry header.

use std::io::{self, Read, Write};

use flate2::{Compression, Decompress, FlushDecompress, Status, read::ZlibDecoder, write::ZlibEncoder};

/// Outcome of inflating a pack entry from a possibly incomplete buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Inflated {
    /// The stream ended; `consumed` compressed bytes produced `data`.
    Complete { data: Vec<u8>, consumed: usize },
    /// The buffer ends before the zlib stream does.
    NeedMore,
}

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Inflates one zlib stream from the front of `input`, expecting `expected_size` output bytes.
pub fn inflate_entry(input: &[u8], expected_size: usize) -> io::Result<Inflated> {
    let mut state = Decompress::new(true);
    let mut out: Vec<u8> = Vec::with_capacity(expected_size.max(64));
    loop {
        if out.len() == out.capacity() {
            out.reserve(4096);
        }
        let in_before = state.total_in() as usize;
        let out_before = state.total_out();
        let status = state
            .decompress_vec(&input[in_before..], &mut out, FlushDecompress::None)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match status {
            Status::StreamEnd => {
                if out.len() != expected_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "inflated size {} does not match header size {expected_size}",
                            out.len()
                        ),
                    ));
                }
                return Ok(Inflated::Complete {
                    data: out,
                    consumed: state.total_in() as usize,
                });
            }
            Status::Ok | Status::BufError => {
                let progressed = state.total_in() as usize != in_before
                    || state.total_out() != out_before;
                let input_exhausted = state.total_in() as usize >= input.len();
                if input_exhausted && !progressed {
                    return Ok(Inflated::NeedMore);
                }
                if !progressed && out.len() < out.capacity() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "zlib stream stalled",
                    ));
                }
                if out.len() > expected_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "inflated data exceeds header size",
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Inflated, compress, decompress, inflate_entry};

    #[test]
    fn test_compress_decompress() {
        let data = b"blob 6\0hello\n".to_vec();
        let packed = compress(&data).unwrap();
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    /// Two streams back to back: the first inflate stops at the boundary.
    #[test]
    fn test_inflate_entry_reports_consumed() {
        let first = compress(b"first payload").unwrap();
        let second = compress(b"second").unwrap();
        let mut joined = first.clone();
        joined.extend_from_slice(&second);

        match inflate_entry(&joined, 13).unwrap() {
            Inflated::Complete { data, consumed } => {
                assert_eq!(data, b"first payload");
                assert_eq!(consumed, first.len());
            }
            Inflated::NeedMore => panic!("stream was complete"),
        }
    }

    #[test]
    fn test_inflate_entry_truncated() {
        let packed = compress(&vec![7u8; 10_000]).unwrap();
        let cut = &packed[..packed.len() / 2];
        assert_eq!(inflate_entry(cut, 10_000).unwrap(), Inflated::NeedMore);
    }

    #[test]
    fn test_inflate_entry_size_mismatch() {
        let packed = compress(b"abc").unwrap();
        assert!(inflate_entry(&packed, 4).is_err());
    }
}
