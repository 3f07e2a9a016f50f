//! Decoder for Git delta instructions: rebuilds a target object from a base buffer and the
//! instruction stream (base size + result size varints followed by copy/insert opcodes).

use std::io::{Cursor, ErrorKind, Read};

use crate::errors::GitError;

const VAR_INT_ENCODING_BITS: u8 = 7;
const VAR_INT_CONTINUE_FLAG: u8 = 1 << VAR_INT_ENCODING_BITS;
const COPY_INSTRUCTION_FLAG: u8 = 1 << 7; // msb set => copy from base, otherwise inline data
const COPY_OFFSET_BYTES: u8 = 4;
const COPY_SIZE_BYTES: u8 = 3;
const COPY_ZERO_SIZE: usize = 0x10000;

fn delta_error(msg: impl Into<String>) -> GitError {
    GitError::DeltaObjectError(msg.into())
}

fn read_byte<R: Read>(stream: &mut R) -> std::io::Result<u8> {
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Read a Git-style varint (little-endian 7-bit chunks with msb as continue flag).
fn read_size_encoding<R: Read>(stream: &mut R) -> Result<usize, GitError> {
    let mut value = 0usize;
    let mut length = 0u32;
    loop {
        let byte = read_byte(stream).map_err(|_| delta_error("truncated size header"))?;
        if length >= usize::BITS {
            return Err(delta_error("size header overflow"));
        }
        value |= ((byte & !VAR_INT_CONTINUE_FLAG) as usize) << length;
        if byte & VAR_INT_CONTINUE_FLAG == 0 {
            return Ok(value);
        }
        length += VAR_INT_ENCODING_BITS as u32;
    }
}

/// Read a partial integer according to presence bits (used by copy instructions):
/// for each bit set in `present_bytes`, consume one byte and accumulate into `value`.
fn read_partial_int<R: Read>(
    stream: &mut R,
    bytes: u8,
    present_bytes: &mut u8,
) -> Result<usize, GitError> {
    let mut value: usize = 0;
    for byte_index in 0..bytes {
        if *present_bytes & 1 != 0 {
            let byte = read_byte(stream).map_err(|_| delta_error("truncated copy instruction"))?;
            value |= (byte as usize) << (byte_index * 8);
        }
        *present_bytes >>= 1;
    }
    Ok(value)
}

/// Apply `delta` to `base`, returning the reconstructed target bytes.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, GitError> {
    let mut stream = Cursor::new(delta);

    let base_size = read_size_encoding(&mut stream)?;
    if base.len() != base_size {
        return Err(delta_error(format!(
            "base object len {} does not match delta header {base_size}",
            base.len()
        )));
    }
    let result_size = read_size_encoding(&mut stream)?;
    let mut buffer = Vec::with_capacity(result_size);

    loop {
        let instruction = match read_byte(&mut stream) {
            Ok(instruction) => instruction,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(delta_error(format!("Wrong instruction in delta: {err}"))),
        };

        if instruction & COPY_INSTRUCTION_FLAG == 0 {
            // Appending 0 bytes is reserved by git.
            if instruction == 0 {
                return Err(delta_error("Invalid data instruction"));
            }
            let mut data = vec![0; instruction as usize];
            stream
                .read_exact(&mut data)
                .map_err(|_| delta_error("truncated insert instruction"))?;
            buffer.extend_from_slice(&data);
        } else {
            let mut nonzero_bytes = instruction;
            let offset = read_partial_int(&mut stream, COPY_OFFSET_BYTES, &mut nonzero_bytes)?;
            let mut size = read_partial_int(&mut stream, COPY_SIZE_BYTES, &mut nonzero_bytes)?;
            if size == 0 {
                size = COPY_ZERO_SIZE;
            }
            let data = offset
                .checked_add(size)
                .and_then(|end| base.get(offset..end))
                .ok_or_else(|| delta_error("Invalid copy instruction"))?;
            buffer.extend_from_slice(data);
        }
    }

    if buffer.len() != result_size {
        return Err(delta_error(format!(
            "delta produced {} bytes, header declared {result_size}",
            buffer.len()
        )));
    }
    Ok(buffer)
}
