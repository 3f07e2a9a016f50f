//! Pack writer. Objects are emitted undeltified: each entry is a type/size header followed by the
//! zlib-compressed payload, and the pack ends with the SHA-1 of everything before it.

use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::{pack::entry::Entry, zlib},
};

const PACK_SIGNATURE: &[u8; 4] = b"PACK";
const PACK_VERSION: u32 = 2;

/// Serialises the pack header.
pub fn encode_header(object_number: usize) -> Result<Vec<u8>, GitError> {
    let count = u32::try_from(object_number)
        .map_err(|_| GitError::PackEncodeError(format!("too many objects: {object_number}")))?;
    let mut header = Vec::with_capacity(12);
    header.extend_from_slice(PACK_SIGNATURE);
    header.extend_from_slice(&PACK_VERSION.to_be_bytes());
    header.extend_from_slice(&count.to_be_bytes());
    Ok(header)
}

/// Type/size varint: 3 type bits and the low 4 size bits in the first byte, then 7 bits per
/// continuation byte.
pub fn encode_entry_header(type_id: u8, size: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(10);
    let mut byte = (type_id << 4) | (size & 0x0f) as u8;
    let mut remaining = size >> 4;
    while remaining > 0 {
        header.push(byte | 0x80);
        byte = (remaining & 0x7f) as u8;
        remaining >>= 7;
    }
    header.push(byte);
    header
}

/// Serialises one base entry.
pub fn encode_entry(entry: &Entry) -> Result<Vec<u8>, GitError> {
    if !entry.obj_type.is_base() {
        return Err(GitError::PackEncodeError(format!(
            "cannot encode {} entry {} without a base",
            entry.obj_type, entry.hash
        )));
    }
    let mut out = encode_entry_header(entry.obj_type.to_pack_type_u8(), entry.data.len());
    out.extend(zlib::compress(&entry.data)?);
    Ok(out)
}

/// Streams a pack into a channel while keeping the running trailer digest.
pub struct PackEncoder {
    object_number: usize,
    written: usize,
    inner_hash: Sha1,
    sender: mpsc::Sender<Vec<u8>>,
}

impl PackEncoder {
    pub fn new(object_number: usize, sender: mpsc::Sender<Vec<u8>>) -> Self {
        PackEncoder {
            object_number,
            written: 0,
            inner_hash: Sha1::new(),
            sender,
        }
    }

    async fn send(&mut self, data: Vec<u8>) -> Result<(), GitError> {
        self.inner_hash.update(&data);
        self.sender
            .send(data)
            .await
            .map_err(|_| GitError::PackEncodeError("pack receiver dropped".to_string()))
    }

    /// Encodes every entry from `entry_rx`, then the trailer. The number of entries received
    /// must match the count announced in the header.
    pub async fn encode(&mut self, mut entry_rx: mpsc::Receiver<Entry>) -> Result<ObjectHash, GitError> {
        let header = encode_header(self.object_number)?;
        self.send(header).await?;

        while let Some(entry) = entry_rx.recv().await {
            if self.written == self.object_number {
                return Err(GitError::PackEncodeError(
                    "more entries than announced".to_string(),
                ));
            }
            let encoded = encode_entry(&entry)?;
            self.send(encoded).await?;
            self.written += 1;
        }

        if self.written != self.object_number {
            return Err(GitError::PackEncodeError(format!(
                "announced {} entries, wrote {}",
                self.object_number, self.written
            )));
        }

        let digest = std::mem::take(&mut self.inner_hash).finalize();
        let trailer = ObjectHash::from_bytes(digest.as_ref()).map_err(GitError::InvalidHashValue)?;
        self.sender
            .send(trailer.to_data())
            .await
            .map_err(|_| GitError::PackEncodeError("pack receiver dropped".to_string()))?;
        Ok(trailer)
    }
}

/// Builds a complete pack in memory.
pub fn encode_to_vec(entries: &[Entry]) -> Result<Vec<u8>, GitError> {
    let mut pack = encode_header(entries.len())?;
    for entry in entries {
        pack.extend(encode_entry(entry)?);
    }
    let digest = Sha1::digest(&pack);
    pack.extend_from_slice(digest.as_ref());
    Ok(pack)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::{PackEncoder, encode_entry_header, encode_to_vec};
    use crate::internal::{object::types::ObjectType, pack::entry::Entry};

    #[test]
    fn test_entry_header_small_and_large() {
        // blob of 5 bytes fits in a single byte
        assert_eq!(encode_entry_header(3, 5), vec![0x35]);
        // 100 = 0b110_0100 -> low nibble 4, rest 6
        assert_eq!(encode_entry_header(1, 100), vec![0x94, 0x06]);
    }

    /// Streaming and in-memory encoding produce identical bytes.
    #[tokio::test]
    async fn test_streaming_matches_in_memory() {
        let entries = vec![
            Entry::new(ObjectType::Blob, b"hello\n".to_vec()),
            Entry::new(ObjectType::Blob, b"world\n".to_vec()),
        ];
        let expected = encode_to_vec(&entries).unwrap();

        let (pack_tx, mut pack_rx) = mpsc::channel(16);
        let (entry_tx, entry_rx) = mpsc::channel(16);
        let mut encoder = PackEncoder::new(entries.len(), pack_tx);
        let feeder = {
            let entries = entries.clone();
            tokio::spawn(async move {
                for entry in entries {
                    entry_tx.send(entry).await.unwrap();
                }
            })
        };
        let handle = tokio::spawn(async move { encoder.encode(entry_rx).await });

        let mut streamed = Vec::new();
        while let Some(chunk) = pack_rx.recv().await {
            streamed.extend(chunk);
        }
        feeder.await.unwrap();
        let trailer = handle.await.unwrap().unwrap();

        assert_eq!(streamed, expected);
        assert_eq!(&streamed[streamed.len() - 20..], trailer.as_ref());
    }

    #[tokio::test]
    async fn test_count_mismatch_is_error() {
        let (pack_tx, mut pack_rx) = mpsc::channel(16);
        let (entry_tx, entry_rx) = mpsc::channel(16);
        let mut encoder = PackEncoder::new(2, pack_tx);
        entry_tx
            .send(Entry::new(ObjectType::Blob, b"only one".to_vec()))
            .await
            .unwrap();
        drop(entry_tx);
        let result = encoder.encode(entry_rx).await;
        assert!(result.is_err());
        while pack_rx.try_recv().is_ok() {}
    }

    #[test]
    fn test_delta_entry_rejected() {
        let mut entry = Entry::new(ObjectType::Blob, vec![1, 2, 3]);
        entry.obj_type = ObjectType::OffsetDelta;
        assert!(encode_to_vec(&[entry]).is_err());
    }
}
