//! Pack reader. Decodes a complete pack held in memory into base entries, resolving offset and
//! ref deltas. Ref deltas whose base is absent from the pack (thin packs) are kept pending
//! until the caller supplies the base from storage.
//!
//! [`PackScanner`] finds where a pack ends inside a byte stream that may continue past it, which
//! is needed when the pack arrives over a long-lived channel rather than a sized request body.

use std::collections::HashMap;

use sha1::{Digest, Sha1};

use crate::{
    errors::GitError,
    hash::{HASH_SIZE, ObjectHash},
    internal::{
        object::types::ObjectType,
        pack::{delta::apply_delta, entry::Entry},
        zlib::{self, Inflated},
    },
};

const PACK_HEADER_LEN: usize = 12;

/// Header fields of a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pack {
    pub version: u32,
    pub number: usize,
}

impl Pack {
    /// Parses the 12-byte header.
    pub fn parse_header(data: &[u8]) -> Result<Pack, GitError> {
        if data.len() < PACK_HEADER_LEN {
            return Err(GitError::InvalidPackHeader(format!(
                "{} bytes",
                data.len()
            )));
        }
        if &data[0..4] != b"PACK" {
            return Err(GitError::InvalidPackHeader(
                String::from_utf8_lossy(&data[0..4]).to_string(),
            ));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != 2 && version != 3 {
            return Err(GitError::InvalidPackHeader(format!("version {version}")));
        }
        let number = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
        Ok(Pack { version, number })
    }

    /// Decodes a whole pack, verifying the trailer checksum.
    pub fn decode(data: &[u8]) -> Result<DecodedPack, GitError> {
        let pack = Pack::parse_header(data)?;
        if data.len() < PACK_HEADER_LEN + HASH_SIZE {
            return Err(GitError::InvalidPackFile("missing trailer".to_string()));
        }
        let body_end = data.len() - HASH_SIZE;
        let expected = Sha1::digest(&data[..body_end]);
        if expected.as_slice() != &data[body_end..] {
            return Err(GitError::InvalidPackFile("trailer checksum mismatch".to_string()));
        }
        let signature =
            ObjectHash::from_bytes(&data[body_end..]).map_err(GitError::InvalidHashValue)?;

        let mut decoded = DecodedPack {
            number: pack.number,
            signature,
            entries: Vec::with_capacity(pack.number),
            by_offset: HashMap::new(),
            by_hash: HashMap::new(),
            external: HashMap::new(),
            waiting: Vec::new(),
        };

        let mut offset = PACK_HEADER_LEN;
        for _ in 0..pack.number {
            let entry_offset = offset;
            let raw = read_raw_entry(&data[..body_end], offset)?.ok_or_else(|| {
                GitError::InvalidPackFile(format!("truncated entry at offset {entry_offset}"))
            })?;
            offset = raw.next_offset;
            match raw.kind {
                RawKind::Base(obj_type) => {
                    decoded.push_entry(entry_offset, Entry::new(obj_type, raw.data));
                }
                RawKind::OffsetDelta(base_offset) => decoded.waiting.push(WaitingDelta {
                    offset: entry_offset,
                    base: BaseRef::Offset(base_offset),
                    delta: raw.data,
                }),
                RawKind::HashDelta(base) => decoded.waiting.push(WaitingDelta {
                    offset: entry_offset,
                    base: BaseRef::Hash(base),
                    delta: raw.data,
                }),
            }
        }
        if offset != body_end {
            return Err(GitError::InvalidPackFile(format!(
                "{} unexpected bytes before trailer",
                body_end - offset
            )));
        }

        decoded.resolve_waiting()?;
        Ok(decoded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BaseRef {
    Offset(usize),
    Hash(ObjectHash),
}

#[derive(Debug)]
struct WaitingDelta {
    offset: usize,
    base: BaseRef,
    delta: Vec<u8>,
}

/// Result of decoding a pack.
#[derive(Debug)]
pub struct DecodedPack {
    pub number: usize,
    pub signature: ObjectHash,
    /// Every object resolved so far, in pack order for base objects.
    pub entries: Vec<Entry>,
    by_offset: HashMap<usize, usize>,
    by_hash: HashMap<ObjectHash, usize>,
    external: HashMap<ObjectHash, Entry>,
    waiting: Vec<WaitingDelta>,
}

impl DecodedPack {
    fn push_entry(&mut self, offset: usize, entry: Entry) {
        let idx = self.entries.len();
        self.by_hash.insert(entry.hash, idx);
        self.by_offset.insert(offset, idx);
        self.entries.push(entry);
    }

    fn lookup(&self, base: &BaseRef) -> Option<&Entry> {
        match base {
            BaseRef::Offset(offset) => self.by_offset.get(offset).map(|&i| &self.entries[i]),
            BaseRef::Hash(hash) => self
                .by_hash
                .get(hash)
                .map(|&i| &self.entries[i])
                .or_else(|| self.external.get(hash)),
        }
    }

    /// Applies every waiting delta whose base is known, repeating until no more progress.
    fn resolve_waiting(&mut self) -> Result<(), GitError> {
        loop {
            let mut progressed = false;
            let waiting = std::mem::take(&mut self.waiting);
            for delta in waiting {
                let resolved = match self.lookup(&delta.base) {
                    Some(base) => {
                        let data = apply_delta(&base.data, &delta.delta)?;
                        let mut entry = Entry::new(base.obj_type, data);
                        entry.chain_len = base.chain_len + 1;
                        Some(entry)
                    }
                    None => None,
                };
                match resolved {
                    Some(entry) => {
                        self.push_entry(delta.offset, entry);
                        progressed = true;
                    }
                    None => self.waiting.push(delta),
                }
            }
            if !progressed || self.waiting.is_empty() {
                return Ok(());
            }
        }
    }

    /// Ids of bases that are referenced by pending deltas but not present in the pack.
    pub fn missing_bases(&self) -> Vec<ObjectHash> {
        let mut missing: Vec<ObjectHash> = self
            .waiting
            .iter()
            .filter_map(|d| match &d.base {
                BaseRef::Hash(hash) if self.lookup(&d.base).is_none() => Some(*hash),
                _ => None,
            })
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// Supplies a base object from outside the pack and resolves what depends on it.
    /// The base itself is not added to `entries`.
    pub fn add_external_base(&mut self, base: Entry) -> Result<(), GitError> {
        self.external.insert(base.hash, base);
        self.resolve_waiting()
    }

    pub fn is_complete(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Fails when any delta is still unresolved.
    pub fn ensure_complete(&self) -> Result<(), GitError> {
        match self.waiting.first() {
            None => Ok(()),
            Some(delta) => Err(GitError::MissingDeltaBase(match &delta.base {
                BaseRef::Hash(hash) => hash.to_string(),
                BaseRef::Offset(offset) => format!("offset {offset}"),
            })),
        }
    }
}

enum RawKind {
    Base(ObjectType),
    OffsetDelta(usize),
    HashDelta(ObjectHash),
}

struct RawEntry {
    kind: RawKind,
    data: Vec<u8>,
    next_offset: usize,
}

/// Parses the type/size varint. `Ok(None)` means the buffer ends inside the header.
fn parse_entry_header(data: &[u8]) -> Result<Option<(u8, usize, usize)>, GitError> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };
    let type_id = (first >> 4) & 0x07;
    let mut size = (first & 0x0f) as usize;
    let mut shift = 4u32;
    let mut pos = 1;
    let mut byte = first;
    while byte & 0x80 != 0 {
        let Some(&next) = data.get(pos) else {
            return Ok(None);
        };
        if shift >= usize::BITS - 7 {
            return Err(GitError::InvalidPackFile("entry size overflow".to_string()));
        }
        byte = next;
        size |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        pos += 1;
    }
    Ok(Some((type_id, size, pos)))
}

/// Parses the negative offset of an OFS_DELTA entry.
fn parse_ofs_offset(data: &[u8]) -> Result<Option<(usize, usize)>, GitError> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };
    let mut byte = first;
    let mut value = (byte & 0x7f) as usize;
    let mut pos = 1;
    while byte & 0x80 != 0 {
        let Some(&next) = data.get(pos) else {
            return Ok(None);
        };
        byte = next;
        value = value
            .checked_add(1)
            .and_then(|v| v.checked_mul(128))
            .ok_or_else(|| GitError::InvalidPackFile("delta offset overflow".to_string()))?
            | (byte & 0x7f) as usize;
        pos += 1;
    }
    Ok(Some((value, pos)))
}

/// Reads one entry starting at `offset`. `Ok(None)` when `data` ends before the entry does.
fn read_raw_entry(data: &[u8], offset: usize) -> Result<Option<RawEntry>, GitError> {
    let Some((type_id, size, header_len)) = parse_entry_header(&data[offset..])? else {
        return Ok(None);
    };
    let mut pos = offset + header_len;
    let kind = match ObjectType::from_pack_type_u8(type_id)? {
        ObjectType::OffsetDelta => {
            let Some((distance, len)) = parse_ofs_offset(&data[pos..])? else {
                return Ok(None);
            };
            pos += len;
            let base_offset = offset.checked_sub(distance).filter(|_| distance > 0).ok_or_else(|| {
                GitError::InvalidPackFile(format!("bad delta base offset at {offset}"))
            })?;
            RawKind::OffsetDelta(base_offset)
        }
        ObjectType::HashDelta => {
            if data.len() < pos + HASH_SIZE {
                return Ok(None);
            }
            let base = ObjectHash::from_bytes(&data[pos..pos + HASH_SIZE])
                .map_err(GitError::InvalidHashValue)?;
            pos += HASH_SIZE;
            RawKind::HashDelta(base)
        }
        base => RawKind::Base(base),
    };

    match zlib::inflate_entry(&data[pos..], size)? {
        Inflated::NeedMore => Ok(None),
        Inflated::Complete { data, consumed } => Ok(Some(RawEntry {
            kind,
            data,
            next_offset: pos + consumed,
        })),
    }
}

/// Incrementally locates the end of a pack in a growing buffer.
#[derive(Debug, Default)]
pub struct PackScanner {
    next_offset: usize,
    remaining: Option<usize>,
}

impl PackScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total pack length once `buffer` holds the header, every entry and the
    /// trailer. Work already done on earlier calls is not repeated, so `buffer` must only grow.
    pub fn feed(&mut self, buffer: &[u8]) -> Result<Option<usize>, GitError> {
        if self.remaining.is_none() {
            if buffer.len() < PACK_HEADER_LEN {
                return Ok(None);
            }
            let pack = Pack::parse_header(buffer)?;
            self.remaining = Some(pack.number);
            self.next_offset = PACK_HEADER_LEN;
        }
        while let Some(remaining) = self.remaining.filter(|r| *r > 0) {
            match read_raw_entry(buffer, self.next_offset)? {
                None => return Ok(None),
                Some(raw) => {
                    self.next_offset = raw.next_offset;
                    self.remaining = Some(remaining - 1);
                }
            }
        }
        let total = self.next_offset + HASH_SIZE;
        Ok((buffer.len() >= total).then_some(total))
    }
}

#[cfg(test)]
mod tests {
    use super::{Pack, PackScanner};
    use crate::{
        hash::ObjectHash,
        internal::{
            object::types::ObjectType,
            pack::{
                encode::{encode_entry_header, encode_header, encode_to_vec},
                entry::Entry,
            },
            zlib,
        },
    };
    use sha1::{Digest, Sha1};

    fn finish(mut body: Vec<u8>) -> Vec<u8> {
        let digest = Sha1::digest(&body);
        body.extend_from_slice(digest.as_ref());
        body
    }

    fn raw_entry(type_id: u8, prefix: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut out = encode_entry_header(type_id, payload.len());
        out.extend_from_slice(prefix);
        out.extend(zlib::compress(payload).unwrap());
        out
    }

    #[test]
    fn test_decode_base_objects() {
        let entries = vec![
            Entry::new(ObjectType::Blob, b"hello\n".to_vec()),
            Entry::new(ObjectType::Tree, Vec::new()),
        ];
        let pack = encode_to_vec(&entries).unwrap();
        let decoded = Pack::decode(&pack).unwrap();
        assert_eq!(decoded.number, 2);
        assert!(decoded.is_complete());
        assert_eq!(decoded.entries, entries);
    }

    /// An offset delta resolves against the entry it points back to.
    #[test]
    fn test_decode_offset_delta() {
        let base = b"hello world".to_vec();
        let delta = vec![11, 10, 0b1001_0000, 6, 4, b'r', b'u', b's', b't'];

        let mut body = encode_header(2).unwrap();
        let base_offset = body.len();
        body.extend(raw_entry(3, &[], &base));
        let delta_offset = body.len();
        let distance = delta_offset - base_offset;
        assert!(distance < 128);
        body.extend(raw_entry(6, &[distance as u8], &delta));
        let pack = finish(body);

        let decoded = Pack::decode(&pack).unwrap();
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[1].data, b"hello rust");
        assert_eq!(decoded.entries[1].obj_type, ObjectType::Blob);
        assert_eq!(decoded.entries[1].chain_len, 1);
        assert_eq!(
            decoded.entries[1].hash,
            ObjectHash::from_type_and_data(ObjectType::Blob, b"hello rust")
        );
    }

    /// A ref delta against an object outside the pack waits for the base.
    #[test]
    fn test_thin_pack_resolution() {
        let base = Entry::new(ObjectType::Blob, b"hello world".to_vec());
        let delta = vec![11, 10, 0b1001_0000, 6, 4, b'r', b'u', b's', b't'];
        let mut body = encode_header(1).unwrap();
        body.extend(raw_entry(7, base.hash.as_ref(), &delta));
        let pack = finish(body);

        let mut decoded = Pack::decode(&pack).unwrap();
        assert!(!decoded.is_complete());
        assert_eq!(decoded.missing_bases(), vec![base.hash]);
        assert!(decoded.ensure_complete().is_err());

        decoded.add_external_base(base).unwrap();
        decoded.ensure_complete().unwrap();
        assert_eq!(decoded.entries.len(), 1);
        assert_eq!(decoded.entries[0].data, b"hello rust");
    }

    #[test]
    fn test_decode_rejects_bad_trailer() {
        let mut pack = encode_to_vec(&[Entry::new(ObjectType::Blob, b"x".to_vec())]).unwrap();
        let last = pack.len() - 1;
        pack[last] ^= 0xff;
        assert!(Pack::decode(&pack).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut pack = encode_to_vec(&[]).unwrap();
        pack[0] = b'K';
        assert!(Pack::decode(&pack).is_err());
    }

    /// The scanner waits for the trailer and ignores bytes after the pack.
    #[test]
    fn test_scanner_finds_pack_end() {
        let pack = encode_to_vec(&[
            Entry::new(ObjectType::Blob, vec![b'a'; 5000]),
            Entry::new(ObjectType::Blob, b"tail".to_vec()),
        ])
        .unwrap();

        let mut scanner = PackScanner::new();
        let mut buffer = Vec::new();
        let mut found = None;
        for chunk in pack.chunks(7) {
            buffer.extend_from_slice(chunk);
            if let Some(len) = scanner.feed(&buffer).unwrap() {
                found = Some(len);
                break;
            }
        }
        assert_eq!(found, Some(pack.len()));

        buffer.extend_from_slice(b"0000");
        let mut fresh = PackScanner::new();
        assert_eq!(fresh.feed(&buffer).unwrap(), Some(pack.len()));
    }

    #[test]
    fn test_scanner_empty_pack() {
        let pack = encode_to_vec(&[]).unwrap();
        let mut scanner = PackScanner::new();
        assert_eq!(scanner.feed(&pack[..12]).unwrap(), None);
        assert_eq!(scanner.feed(&pack).unwrap(), Some(32));
    }
}
