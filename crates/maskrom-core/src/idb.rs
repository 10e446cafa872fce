//! On-media Initial Data Block (IDB) scanner.
//!
//! Maskrom-era boot media carries one or more IDB headers: 2048-byte,
//! block-aligned structures that describe where the early boot payloads
//! live and chain their integrity hashes. The scanner walks a raw dump
//! block by block and reconstructs every layout it can verify. Recovery is
//! best-effort: a corrupt header or payload never aborts the pass, it only
//! invalidates that candidate.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use sha2::{Digest, Sha256, Sha512};
use std::io::Cursor;
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::constants::BLOCK_SIZE;

/// Magic the header block starts with.
pub const IDB_MAGIC: &[u8; 4] = b"RKNS";

/// Full header window: four storage blocks.
pub const IDB_HEADER_SIZE: usize = 4 * BLOCK_SIZE;

/// Trailing signature field inside the header window.
const IDB_SIGNATURE_SIZE: usize = 512;

/// Entry slots per header.
const IDB_MAX_ENTRIES: usize = 4;

/// Byte offset of the entry table inside the header window.
const IDB_ENTRIES_OFFSET: usize = 120;

/// On-media size of one entry.
const IDB_ENTRY_SIZE: usize = 88;

#[derive(Error, Debug)]
pub enum IdbError {
    #[error("bad IDB magic")]
    BadMagic,

    #[error("unknown hash type {0}")]
    UnknownHashType(u8),

    #[error("unhashed IDB cannot be validated")]
    Unhashed,

    #[error("hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch { stored: String, computed: String },

    #[error("truncated header window: {actual} bytes")]
    TruncatedHeader { actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hash algorithm selected by the low 4 bits of the header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha256,
    Sha512,
}

impl HashKind {
    fn from_flags(flags: u32) -> Result<Self, IdbError> {
        match flags & 0xF {
            0 => Err(IdbError::Unhashed),
            1 => Ok(HashKind::Sha256),
            2 => Ok(HashKind::Sha512),
            other => Err(IdbError::UnknownHashType(other as u8)),
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Sha256 => Sha256::digest(data).to_vec(),
            HashKind::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Compare `data` against a stored hash, truncated to this digest's
    /// length.
    fn verify(self, data: &[u8], stored: &[u8]) -> Result<(), IdbError> {
        let computed = self.digest(data);
        if stored[..computed.len()] != computed[..] {
            return Err(IdbError::HashMismatch {
                stored: hex(&stored[..computed.len()]),
                computed: hex(&computed),
            });
        }
        Ok(())
    }
}

/// One boot-payload descriptor inside an IDB header.
#[derive(Debug, Clone)]
pub struct IdbEntry {
    /// Payload position in blocks, relative to the header's own block.
    pub offset: u16,
    /// Payload length in blocks.
    pub blocks: u16,
    /// Load address.
    pub address: u32,
    pub flags: u32,
    /// Monotonic write counter; 0 marks an unused slot. Among entries at
    /// the same address the highest counter is the newest copy.
    pub counter: u32,
    /// Stored payload hash, truncated per hash kind.
    pub hash: [u8; 64],
}

impl IdbEntry {
    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        let offset = cursor.read_u16::<LittleEndian>()?;
        let blocks = cursor.read_u16::<LittleEndian>()?;
        let address = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let counter = cursor.read_u32::<LittleEndian>()?;
        cursor.set_position(cursor.position() + 8);
        let mut hash = [0u8; 64];
        cursor.read_exact(&mut hash)?;
        Ok(Self {
            offset,
            blocks,
            address,
            flags,
            counter,
            hash,
        })
    }
}

/// A parsed-and-verified IDB header.
#[derive(Debug, Clone)]
pub struct IdbHeader {
    /// Block index of the header within the scanned stream.
    pub block: u64,
    pub hash_kind: HashKind,
    /// Entry count the header claims.
    pub declared_entries: u16,
    /// Used entries, ascending by counter: the order in which copies at
    /// the same address supersede each other.
    pub entries: Vec<IdbEntry>,
}

impl IdbHeader {
    /// Parse and verify one header window located at `block`.
    pub fn parse(window: &[u8], block: u64) -> Result<Self, IdbError> {
        if window.len() < IDB_HEADER_SIZE {
            return Err(IdbError::TruncatedHeader {
                actual: window.len(),
            });
        }
        if &window[..4] != IDB_MAGIC {
            return Err(IdbError::BadMagic);
        }
        let mut cursor = Cursor::new(&window[8..]);
        let _offset = cursor.read_u16::<LittleEndian>().unwrap();
        let declared_entries = cursor.read_u16::<LittleEndian>().unwrap();
        let flags = cursor.read_u32::<LittleEndian>().unwrap();

        let hash_kind = HashKind::from_flags(flags)?;

        // header integrity covers everything up to the signature field
        let body = &window[..IDB_HEADER_SIZE - IDB_SIGNATURE_SIZE];
        hash_kind.verify(body, &window[IDB_HEADER_SIZE - IDB_SIGNATURE_SIZE..])?;

        let mut entries = Vec::with_capacity(IDB_MAX_ENTRIES);
        for slot in 0..IDB_MAX_ENTRIES {
            let start = IDB_ENTRIES_OFFSET + slot * IDB_ENTRY_SIZE;
            let mut cursor = Cursor::new(&window[start..start + IDB_ENTRY_SIZE]);
            entries.push(IdbEntry::read_from(&mut cursor).unwrap());
        }
        let entries = order_entries(entries);

        Ok(Self {
            block,
            hash_kind,
            declared_entries,
            entries,
        })
    }

    /// Read and verify one entry's payload out of the scanned stream.
    pub fn read_payload<R: Read + Seek>(
        &self,
        reader: &mut R,
        entry: &IdbEntry,
    ) -> Result<Vec<u8>, IdbError> {
        reader.seek(SeekFrom::Start(
            (self.block + entry.offset as u64) * BLOCK_SIZE as u64,
        ))?;
        let mut payload = vec![0u8; entry.blocks as usize * BLOCK_SIZE];
        reader.read_exact(&mut payload)?;
        self.hash_kind.verify(&payload, &entry.hash)?;
        Ok(payload)
    }
}

/// Drop unused slots (counter 0) and order the rest ascending by counter.
pub fn order_entries(entries: Vec<IdbEntry>) -> Vec<IdbEntry> {
    let mut used: Vec<IdbEntry> = entries.into_iter().filter(|e| e.counter != 0).collect();
    used.sort_by_key(|e| e.counter);
    used
}

/// One entry with its payload verification result. A failed payload
/// invalidates only this entry.
#[derive(Debug)]
pub struct RecoveredEntry {
    pub entry: IdbEntry,
    pub payload: Result<Vec<u8>, IdbError>,
}

/// One recovered boot layout: a verified header plus its entry payloads in
/// counter order.
#[derive(Debug)]
pub struct RecoveredIdb {
    pub header: IdbHeader,
    pub entries: Vec<RecoveredEntry>,
}

/// Scan a block-aligned stream for IDB structures.
pub fn scan<R: Read + Seek>(reader: R) -> IdbScanner<R> {
    IdbScanner { reader, block: 0 }
}

/// Iterator over every IDB candidate in a stream. Yields `Ok` for each
/// recoverable layout and `Err` for each candidate whose header fails
/// validation; the scan always continues to end of stream.
pub struct IdbScanner<R> {
    reader: R,
    block: u64,
}

impl<R: Read + Seek> Iterator for IdbScanner<R> {
    type Item = Result<RecoveredIdb, IdbError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self
                .reader
                .seek(SeekFrom::Start(self.block * BLOCK_SIZE as u64))
                .is_err()
            {
                return None;
            }
            let mut first = [0u8; BLOCK_SIZE];
            match self.reader.read_exact(&mut first) {
                Ok(()) => {}
                // end of stream ends the pass
                Err(_) => return None,
            }
            if &first[..4] != IDB_MAGIC {
                self.block += 1;
                continue;
            }

            let header_block = self.block;
            let mut window = vec![0u8; IDB_HEADER_SIZE];
            window[..BLOCK_SIZE].copy_from_slice(&first);
            if self
                .reader
                .read_exact(&mut window[BLOCK_SIZE..])
                .is_err()
            {
                return None;
            }
            // resume after the header window whatever happens below
            self.block = header_block + 4;

            let header = match IdbHeader::parse(&window, header_block) {
                Ok(header) => header,
                Err(e) => {
                    warn!(block = header_block, error = %e, "Rejected IDB candidate");
                    return Some(Err(e));
                }
            };

            debug!(
                block = header_block,
                entries = header.entries.len(),
                "Found IDB header"
            );
            let entries = header
                .entries
                .iter()
                .map(|entry| RecoveredEntry {
                    entry: entry.clone(),
                    payload: header.read_payload(&mut self.reader, entry),
                })
                .collect();
            return Some(Ok(RecoveredIdb { header, entries }));
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn entry_with_counter(counter: u32) -> IdbEntry {
        IdbEntry {
            offset: 0,
            blocks: 0,
            address: 0,
            flags: 0,
            counter,
            hash: [0u8; 64],
        }
    }

    #[test]
    fn ordering_drops_unused_and_sorts() {
        let entries = [0u32, 3, 1, 0, 2]
            .into_iter()
            .map(entry_with_counter)
            .collect();
        let ordered = order_entries(entries);
        let counters: Vec<u32> = ordered.iter().map(|e| e.counter).collect();
        assert_eq!(counters, vec![1, 2, 3]);
    }

    /// Write a valid SHA-256 IDB at `header_block`, with payloads at their
    /// entry offsets. Entries are `(offset_blocks, counter, payload)`.
    fn place_idb(image: &mut Vec<u8>, header_block: usize, entries: &[(u16, u32, &[u8])]) {
        let mut window = vec![0u8; IDB_HEADER_SIZE];
        window[..4].copy_from_slice(IDB_MAGIC);
        window[10..12].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        window[12..16].copy_from_slice(&1u32.to_le_bytes()); // sha256

        for (slot, (offset, counter, payload)) in entries.iter().enumerate() {
            assert_eq!(payload.len() % BLOCK_SIZE, 0);
            let base = IDB_ENTRIES_OFFSET + slot * IDB_ENTRY_SIZE;
            window[base..base + 2].copy_from_slice(&offset.to_le_bytes());
            window[base + 2..base + 4]
                .copy_from_slice(&((payload.len() / BLOCK_SIZE) as u16).to_le_bytes());
            window[base + 12..base + 16].copy_from_slice(&counter.to_le_bytes());
            let digest = Sha256::digest(payload);
            window[base + 24..base + 24 + 32].copy_from_slice(&digest);
        }

        let signature = Sha256::digest(&window[..IDB_HEADER_SIZE - IDB_SIGNATURE_SIZE]);
        window[IDB_HEADER_SIZE - IDB_SIGNATURE_SIZE..IDB_HEADER_SIZE - IDB_SIGNATURE_SIZE + 32]
            .copy_from_slice(&signature);

        let header_pos = header_block * BLOCK_SIZE;
        let mut needed = header_pos + IDB_HEADER_SIZE;
        for (offset, _, payload) in entries {
            needed = needed.max((header_block + *offset as usize) * BLOCK_SIZE + payload.len());
        }
        if image.len() < needed {
            image.resize(needed, 0);
        }
        image[header_pos..header_pos + IDB_HEADER_SIZE].copy_from_slice(&window);
        for (offset, _, payload) in entries {
            let pos = (header_block + *offset as usize) * BLOCK_SIZE;
            image[pos..pos + payload.len()].copy_from_slice(payload);
        }
    }

    #[test]
    fn recovers_layout_in_counter_order() {
        let newer = vec![0xB2u8; BLOCK_SIZE];
        let older = vec![0xA1u8; 2 * BLOCK_SIZE];
        let mut image = vec![0u8; 2 * BLOCK_SIZE]; // leading junk blocks
        place_idb(&mut image, 2, &[(8, 7, &newer), (4, 3, &older)]);

        let found: Vec<_> = scan(Cursor::new(image)).collect();
        assert_eq!(found.len(), 1);
        let idb = found.into_iter().next().unwrap().unwrap();
        assert_eq!(idb.header.block, 2);
        assert_eq!(idb.header.hash_kind, HashKind::Sha256);

        let counters: Vec<u32> = idb.entries.iter().map(|e| e.entry.counter).collect();
        assert_eq!(counters, vec![3, 7]);
        assert_eq!(idb.entries[0].payload.as_ref().unwrap(), &older);
        assert_eq!(idb.entries[1].payload.as_ref().unwrap(), &newer);
    }

    #[test]
    fn corrupt_header_does_not_stop_the_scan() {
        let payload = vec![0x11u8; BLOCK_SIZE];
        let mut image = Vec::new();
        place_idb(&mut image, 0, &[(4, 1, &payload)]);
        // corrupt the first header's signature
        image[IDB_HEADER_SIZE - IDB_SIGNATURE_SIZE] ^= 0xFF;

        let good = vec![0x22u8; BLOCK_SIZE];
        place_idb(&mut image, 16, &[(4, 1, &good)]);

        let found: Vec<_> = scan(Cursor::new(image)).collect();
        assert_eq!(found.len(), 2);
        assert!(matches!(found[0], Err(IdbError::HashMismatch { .. })));
        let recovered = found[1].as_ref().unwrap();
        assert_eq!(recovered.header.block, 16);
        assert_eq!(recovered.entries[0].payload.as_ref().unwrap(), &good);
    }

    #[test]
    fn corrupt_payload_invalidates_only_that_entry() {
        let bad = vec![0x33u8; BLOCK_SIZE];
        let good = vec![0x44u8; BLOCK_SIZE];
        let mut image = Vec::new();
        place_idb(&mut image, 0, &[(4, 1, &bad), (8, 2, &good)]);
        // flip a byte inside the first entry's payload
        image[4 * BLOCK_SIZE] ^= 0xFF;

        let idb = scan(Cursor::new(image)).next().unwrap().unwrap();
        assert_eq!(idb.entries.len(), 2);
        assert!(matches!(
            idb.entries[0].payload,
            Err(IdbError::HashMismatch { .. })
        ));
        assert!(idb.entries[1].payload.is_ok());
    }

    #[test]
    fn unknown_hash_type_is_rejected() {
        let payload = vec![0u8; BLOCK_SIZE];
        let mut image = Vec::new();
        place_idb(&mut image, 0, &[(4, 1, &payload)]);
        image[12] = 7; // low nibble of flags
        let found: Vec<_> = scan(Cursor::new(image)).collect();
        assert!(matches!(found[0], Err(IdbError::UnknownHashType(7))));
    }

    #[test]
    fn unhashed_header_is_rejected() {
        let payload = vec![0u8; BLOCK_SIZE];
        let mut image = Vec::new();
        place_idb(&mut image, 0, &[(4, 1, &payload)]);
        image[12] = 0;
        let found: Vec<_> = scan(Cursor::new(image)).collect();
        assert!(matches!(found[0], Err(IdbError::Unhashed)));
    }

    #[test]
    fn empty_stream_finds_nothing() {
        assert_eq!(scan(Cursor::new(Vec::new())).count(), 0);
        let junk = vec![0xEEu8; 8 * BLOCK_SIZE];
        assert_eq!(scan(Cursor::new(junk)).count(), 0);
    }
}
