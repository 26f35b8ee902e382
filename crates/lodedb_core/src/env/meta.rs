//! Environment metadata (`ENV` file).
//!
//! ```text
//! magic "LDBE" | version u16 | page_size u32 | env_id [16]
//! | epoch u64 | last_checkpoint u64 (raw LSN) | next_file_id u32
//! | file count u32 | files: [name_len u16][name][id u32] ...
//! | crc32 u32
//! ```
//!
//! All integers little-endian. The CRC covers everything before it.

use crate::error::{CoreError, CoreResult};
use crate::types::{FileId, Lsn};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Magic bytes of the metadata file.
pub const ENV_MAGIC: [u8; 4] = *b"LDBE";

/// Current metadata format version.
pub const ENV_VERSION: u16 = 1;

/// Persistent environment state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvMeta {
    /// Page size of every database in the environment.
    pub page_size: u32,
    /// Identity of the environment, fixed at creation.
    pub env_id: Uuid,
    /// Handle epoch; bumped by replication rollbacks.
    pub epoch: u64,
    /// LSN of the most recent checkpoint record.
    pub last_checkpoint: Lsn,
    /// Next file id to hand out.
    pub next_file_id: u32,
    /// Database name to file id.
    pub files: BTreeMap<String, FileId>,
}

impl EnvMeta {
    /// Metadata of a new, empty environment.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size as u32,
            env_id: Uuid::new_v4(),
            epoch: 1,
            last_checkpoint: Lsn::ZERO,
            next_file_id: 1,
            files: BTreeMap::new(),
        }
    }

    /// Adds a database to the registry and returns its new file id.
    pub fn register(&mut self, name: &str) -> FileId {
        let id = FileId::new(self.next_file_id);
        self.next_file_id += 1;
        self.files.insert(name.to_string(), id);
        id
    }

    /// Encodes the metadata.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&ENV_MAGIC);
        buf.extend_from_slice(&ENV_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.page_size.to_le_bytes());
        buf.extend_from_slice(self.env_id.as_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.last_checkpoint.to_u64().to_le_bytes());
        buf.extend_from_slice(&self.next_file_id.to_le_bytes());
        buf.extend_from_slice(&(self.files.len() as u32).to_le_bytes());
        for (name, id) in &self.files {
            buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&id.as_u32().to_le_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes metadata written by [`EnvMeta::encode`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for bad magic, a newer version, a checksum
    /// mismatch or a truncated file.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 8 || data[0..4] != ENV_MAGIC {
            return Err(CoreError::invalid_format("invalid environment magic"));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32fast::hash(body) != stored {
            return Err(CoreError::invalid_format("environment metadata checksum mismatch"));
        }

        let mut r = Reader { data: body, pos: 4 };
        let version = r.u16()?;
        if version > ENV_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported environment version: {version}"
            )));
        }
        let page_size = r.u32()?;
        let env_id = Uuid::from_slice(r.bytes(16)?)
            .map_err(|e| CoreError::invalid_format(format!("bad environment id: {e}")))?;
        let epoch = r.u64()?;
        let last_checkpoint = Lsn::from_u64(r.u64()?);
        let next_file_id = r.u32()?;
        let count = r.u32()?;
        let mut files = BTreeMap::new();
        for _ in 0..count {
            let len = r.u16()? as usize;
            let name = std::str::from_utf8(r.bytes(len)?)
                .map_err(|_| CoreError::invalid_format("invalid database name"))?
                .to_string();
            files.insert(name, FileId::new(r.u32()?));
        }
        if r.pos != body.len() {
            return Err(CoreError::invalid_format("trailing bytes in environment metadata"));
        }

        Ok(Self {
            page_size,
            env_id,
            epoch,
            last_checkpoint,
            next_file_id,
            files,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(CoreError::invalid_format("environment metadata too short"));
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_increasing_ids() {
        let mut meta = EnvMeta::new(4096);
        assert_eq!(meta.register("a"), FileId::new(1));
        assert_eq!(meta.register("b"), FileId::new(2));
        meta.files.remove("a");
        assert_eq!(meta.register("c"), FileId::new(3));
    }

    #[test]
    fn encode_decode() {
        let mut meta = EnvMeta::new(8192);
        meta.register("users");
        meta.register("orders");
        meta.epoch = 7;
        meta.last_checkpoint = Lsn::new(3, 4096);
        let decoded = EnvMeta::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn corruption_is_detected() {
        let meta = EnvMeta::new(4096);
        let mut bytes = meta.encode();
        bytes[10] ^= 0xff;
        assert!(matches!(
            EnvMeta::decode(&bytes),
            Err(CoreError::InvalidFormat { .. })
        ));
        assert!(EnvMeta::decode(b"NOPE").is_err());
        assert!(EnvMeta::decode(&meta.encode()[..20]).is_err());
    }
}
