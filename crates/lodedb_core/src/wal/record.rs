//! Log record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{FileId, Lsn, PageKey, PageNo, TransactionId};

/// Magic bytes identifying a log record.
pub const RECORD_MAGIC: [u8; 4] = *b"LREC";

/// Current log record format version.
pub const RECORD_VERSION: u16 = 1;

/// Envelope header: magic (4) + version (2) + type (1) + length (4).
pub const RECORD_HEADER_SIZE: usize = 11;

/// Trailing CRC size.
pub const RECORD_CRC_SIZE: usize = 4;

/// Type of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// Physical change to a page.
    Update = 1,
    /// Compensation written while undoing an update.
    Compensation = 2,
    /// Transaction commit.
    Commit = 3,
    /// Transaction abort (written after all its updates were undone).
    Abort = 4,
    /// Checkpoint.
    Checkpoint = 5,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Update),
            2 => Some(Self::Compensation),
            3 => Some(Self::Commit),
            4 => Some(Self::Abort),
            5 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A byte-range change to one page.
///
/// `before` and `after` cover the same range starting at `offset`, so the
/// change can be applied in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDelta {
    /// Database file.
    pub file: FileId,
    /// Page number.
    pub pgno: PageNo,
    /// LSN the page carried before this change.
    pub page_lsn: Lsn,
    /// First changed byte.
    pub offset: u32,
    /// Bytes before the change.
    pub before: Vec<u8>,
    /// Bytes after the change.
    pub after: Vec<u8>,
}

impl PageDelta {
    /// The page this delta applies to.
    #[must_use]
    pub fn page(&self) -> PageKey {
        PageKey::new(self.file, self.pgno)
    }
}

/// A transaction that was running when a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTxn {
    /// Transaction ID.
    pub txid: TransactionId,
    /// Its first log record.
    pub first_lsn: Lsn,
    /// Its most recent log record.
    pub last_lsn: Lsn,
}

/// A log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Physical page change made by a transaction.
    Update {
        /// Transaction ID.
        txid: TransactionId,
        /// Previous record of the same transaction (ZERO for the first).
        prev_lsn: Lsn,
        /// The change.
        delta: PageDelta,
    },

    /// Undo of an earlier update. Never undone itself.
    Compensation {
        /// Transaction ID.
        txid: TransactionId,
        /// Previous record of the same transaction.
        prev_lsn: Lsn,
        /// Next record to undo (the undone update's `prev_lsn`).
        undo_next: Lsn,
        /// The change that restores the before-image.
        delta: PageDelta,
    },

    /// Commit.
    Commit {
        /// Transaction ID.
        txid: TransactionId,
        /// Previous record of the same transaction.
        prev_lsn: Lsn,
        /// Wall clock time of the commit, milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// Abort, written once every update has been compensated.
    Abort {
        /// Transaction ID.
        txid: TransactionId,
        /// Previous record of the same transaction.
        prev_lsn: Lsn,
    },

    /// Checkpoint.
    Checkpoint {
        /// Redo for pages dirtied before this LSN is unnecessary.
        redo_lsn: Lsn,
        /// Next transaction ID to hand out.
        next_txid: TransactionId,
        /// Transactions running when the checkpoint was taken.
        active: Vec<ActiveTxn>,
    },
}

impl WalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Update { .. } => WalRecordType::Update,
            Self::Compensation { .. } => WalRecordType::Compensation,
            Self::Commit { .. } => WalRecordType::Commit,
            Self::Abort { .. } => WalRecordType::Abort,
            Self::Checkpoint { .. } => WalRecordType::Checkpoint,
        }
    }

    /// Returns the transaction ID if this record belongs to one.
    #[must_use]
    pub fn txid(&self) -> Option<TransactionId> {
        match self {
            Self::Update { txid, .. }
            | Self::Compensation { txid, .. }
            | Self::Commit { txid, .. }
            | Self::Abort { txid, .. } => Some(*txid),
            Self::Checkpoint { .. } => None,
        }
    }

    /// Previous record of the same transaction.
    #[must_use]
    pub fn prev_lsn(&self) -> Lsn {
        match self {
            Self::Update { prev_lsn, .. }
            | Self::Compensation { prev_lsn, .. }
            | Self::Commit { prev_lsn, .. }
            | Self::Abort { prev_lsn, .. } => *prev_lsn,
            Self::Checkpoint { .. } => Lsn::ZERO,
        }
    }

    /// The page change carried by update and compensation records.
    #[must_use]
    pub fn delta(&self) -> Option<&PageDelta> {
        match self {
            Self::Update { delta, .. } | Self::Compensation { delta, .. } => Some(delta),
            _ => None,
        }
    }

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a page delta is malformed.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            Self::Update {
                txid,
                prev_lsn,
                delta,
            } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                put_lsn(&mut buf, *prev_lsn);
                put_delta(&mut buf, delta)?;
            }

            Self::Compensation {
                txid,
                prev_lsn,
                undo_next,
                delta,
            } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                put_lsn(&mut buf, *prev_lsn);
                put_lsn(&mut buf, *undo_next);
                put_delta(&mut buf, delta)?;
            }

            Self::Commit {
                txid,
                prev_lsn,
                timestamp,
            } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                put_lsn(&mut buf, *prev_lsn);
                buf.extend_from_slice(&timestamp.to_le_bytes());
            }

            Self::Abort { txid, prev_lsn } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                put_lsn(&mut buf, *prev_lsn);
            }

            Self::Checkpoint {
                redo_lsn,
                next_txid,
                active,
            } => {
                put_lsn(&mut buf, *redo_lsn);
                buf.extend_from_slice(&next_txid.as_u64().to_le_bytes());
                let count = u32::try_from(active.len())
                    .map_err(|_| CoreError::invalid_argument("too many active transactions"))?;
                buf.extend_from_slice(&count.to_le_bytes());
                for a in active {
                    buf.extend_from_slice(&a.txid.as_u64().to_le_bytes());
                    put_lsn(&mut buf, a.first_lsn);
                    put_lsn(&mut buf, a.last_lsn);
                }
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    ///
    /// `lsn` is only used to position errors.
    ///
    /// # Errors
    ///
    /// Returns `LogCorruption` if the payload is short or has trailing bytes.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8], lsn: Lsn) -> CoreResult<Self> {
        let mut r = PayloadReader {
            payload,
            cursor: 0,
            lsn,
        };

        let record = match record_type {
            WalRecordType::Update => Self::Update {
                txid: TransactionId::new(r.u64()?),
                prev_lsn: r.lsn()?,
                delta: r.delta()?,
            },
            WalRecordType::Compensation => Self::Compensation {
                txid: TransactionId::new(r.u64()?),
                prev_lsn: r.lsn()?,
                undo_next: r.lsn()?,
                delta: r.delta()?,
            },
            WalRecordType::Commit => Self::Commit {
                txid: TransactionId::new(r.u64()?),
                prev_lsn: r.lsn()?,
                timestamp: r.u64()?,
            },
            WalRecordType::Abort => Self::Abort {
                txid: TransactionId::new(r.u64()?),
                prev_lsn: r.lsn()?,
            },
            WalRecordType::Checkpoint => {
                let redo_lsn = r.lsn()?;
                let next_txid = TransactionId::new(r.u64()?);
                let count = r.u32()? as usize;
                // Each entry is 24 bytes; reject counts the payload cannot hold.
                if count > payload.len() / 24 {
                    return Err(CoreError::log_corruption(lsn, "bad checkpoint entry count"));
                }
                let mut active = Vec::with_capacity(count);
                for _ in 0..count {
                    active.push(ActiveTxn {
                        txid: TransactionId::new(r.u64()?),
                        first_lsn: r.lsn()?,
                        last_lsn: r.lsn()?,
                    });
                }
                Self::Checkpoint {
                    redo_lsn,
                    next_txid,
                    active,
                }
            }
        };

        if r.cursor != payload.len() {
            return Err(CoreError::log_corruption(
                lsn,
                format!(
                    "trailing bytes in {record_type:?} record: expected {} bytes, got {}",
                    r.cursor,
                    payload.len()
                ),
            ));
        }
        Ok(record)
    }

    /// Serializes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds 4 GiB.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_argument("log record payload too large"))?;

        let mut data = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + RECORD_CRC_SIZE);
        data.extend_from_slice(&RECORD_MAGIC);
        data.extend_from_slice(&RECORD_VERSION.to_le_bytes());
        data.push(self.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        // CRC32 over everything before it
        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Decodes the enveloped record at the start of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` ends before the record does, which is
    /// how a torn write at the tail of the log looks. Returns the record and
    /// its encoded length otherwise.
    ///
    /// # Errors
    ///
    /// Returns `LogCorruption` for bad magic, a future version, an unknown
    /// type or a CRC mismatch.
    pub fn decode(buf: &[u8], lsn: Lsn) -> CoreResult<Option<(Self, usize)>> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        if buf[0..4] != RECORD_MAGIC {
            return Err(CoreError::log_corruption(lsn, "invalid record magic"));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > RECORD_VERSION {
            return Err(CoreError::log_corruption(
                lsn,
                format!("unsupported record version {version}"),
            ));
        }
        let record_type = WalRecordType::from_byte(buf[6]).ok_or_else(|| {
            CoreError::log_corruption(lsn, format!("unknown record type {}", buf[6]))
        })?;
        let len = u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]) as usize;
        let total = RECORD_HEADER_SIZE + len + RECORD_CRC_SIZE;
        if buf.len() < total {
            return Ok(None);
        }

        let crc_at = RECORD_HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            buf[crc_at],
            buf[crc_at + 1],
            buf[crc_at + 2],
            buf[crc_at + 3],
        ]);
        let computed = crc32fast::hash(&buf[..crc_at]);
        if stored != computed {
            return Err(CoreError::log_corruption(
                lsn,
                format!("crc mismatch: stored {stored:08x}, computed {computed:08x}"),
            ));
        }

        let record = Self::decode_payload(record_type, &buf[RECORD_HEADER_SIZE..crc_at], lsn)?;
        Ok(Some((record, total)))
    }
}

fn put_lsn(buf: &mut Vec<u8>, lsn: Lsn) {
    buf.extend_from_slice(&lsn.file().to_le_bytes());
    buf.extend_from_slice(&lsn.offset().to_le_bytes());
}

fn put_delta(buf: &mut Vec<u8>, delta: &PageDelta) -> CoreResult<()> {
    if delta.before.len() != delta.after.len() {
        return Err(CoreError::invalid_argument(format!(
            "page delta images differ in length: {} vs {}",
            delta.before.len(),
            delta.after.len()
        )));
    }
    let len = u32::try_from(delta.after.len())
        .map_err(|_| CoreError::invalid_argument("page delta too large"))?;
    buf.extend_from_slice(&delta.file.as_u32().to_le_bytes());
    buf.extend_from_slice(&delta.pgno.to_le_bytes());
    put_lsn(buf, delta.page_lsn);
    buf.extend_from_slice(&delta.offset.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&delta.before);
    buf.extend_from_slice(&delta.after);
    Ok(())
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
    lsn: Lsn,
}

impl PayloadReader<'_> {
    fn take(&mut self, n: usize) -> CoreResult<&[u8]> {
        if self.cursor + n > self.payload.len() {
            return Err(CoreError::log_corruption(self.lsn, "unexpected end of payload"));
        }
        let bytes = &self.payload[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(bytes)
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn lsn(&mut self) -> CoreResult<Lsn> {
        Ok(Lsn::new(self.u32()?, self.u32()?))
    }

    fn delta(&mut self) -> CoreResult<PageDelta> {
        let file = FileId::new(self.u32()?);
        let pgno = self.u32()?;
        let page_lsn = self.lsn()?;
        let offset = self.u32()?;
        let len = self.u32()? as usize;
        let before = self.take(len)?.to_vec();
        let after = self.take(len)?.to_vec();
        Ok(PageDelta {
            file,
            pgno,
            page_lsn,
            offset,
            before,
            after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update() -> WalRecord {
        WalRecord::Update {
            txid: TransactionId::new(7),
            prev_lsn: Lsn::new(1, 16),
            delta: PageDelta {
                file: FileId::new(2),
                pgno: 5,
                page_lsn: Lsn::new(1, 16),
                offset: 40,
                before: vec![0, 0, 0],
                after: vec![1, 2, 3],
            },
        }
    }

    #[test]
    fn record_type_bytes() {
        assert_eq!(WalRecordType::from_byte(3), Some(WalRecordType::Commit));
        assert_eq!(WalRecordType::from_byte(0), None);
        assert_eq!(WalRecordType::from_byte(6), None);
    }

    #[test]
    fn update_record_envelope() {
        let record = update();
        let bytes = record.encode().unwrap();
        let (decoded, len) = WalRecord::decode(&bytes, Lsn::new(1, 16)).unwrap().unwrap();
        assert_eq!(decoded, record);
        assert_eq!(len, bytes.len());
        assert_eq!(decoded.prev_lsn(), Lsn::new(1, 16));
        assert_eq!(decoded.delta().unwrap().page().pgno, 5);
    }

    #[test]
    fn checkpoint_record_payload() {
        let record = WalRecord::Checkpoint {
            redo_lsn: Lsn::new(3, 1000),
            next_txid: TransactionId::new(42),
            active: vec![ActiveTxn {
                txid: TransactionId::new(40),
                first_lsn: Lsn::new(2, 16),
                last_lsn: Lsn::new(3, 900),
            }],
        };
        let payload = record.encode_payload().unwrap();
        let decoded =
            WalRecord::decode_payload(WalRecordType::Checkpoint, &payload, Lsn::ZERO).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.txid(), None);
    }

    #[test]
    fn mismatched_delta_lengths_rejected() {
        let mut record = update();
        if let WalRecord::Update { delta, .. } = &mut record {
            delta.after.push(9);
        }
        assert!(record.encode().is_err());
    }

    #[test]
    fn truncated_record_is_none() {
        let bytes = update().encode().unwrap();
        assert!(WalRecord::decode(&bytes[..5], Lsn::ZERO).unwrap().is_none());
        assert!(WalRecord::decode(&bytes[..bytes.len() - 1], Lsn::ZERO)
            .unwrap()
            .is_none());
    }

    #[test]
    fn crc_mismatch_is_corruption() {
        let mut bytes = update().encode().unwrap();
        bytes[RECORD_HEADER_SIZE + 2] ^= 0xff;
        let err = WalRecord::decode(&bytes, Lsn::new(1, 16)).unwrap_err();
        assert!(matches!(err, CoreError::LogCorruption { .. }));
    }

    #[test]
    fn bad_magic_and_type_are_corruption() {
        let mut bytes = update().encode().unwrap();
        bytes[0] = b'X';
        assert!(WalRecord::decode(&bytes, Lsn::ZERO).is_err());

        let mut bytes = update().encode().unwrap();
        bytes[6] = 99;
        assert!(WalRecord::decode(&bytes, Lsn::ZERO).is_err());
    }

    #[test]
    fn trailing_payload_bytes_rejected() {
        let record = WalRecord::Abort {
            txid: TransactionId::new(1),
            prev_lsn: Lsn::new(1, 16),
        };
        let mut payload = record.encode_payload().unwrap();
        payload.push(0);
        assert!(WalRecord::decode_payload(WalRecordType::Abort, &payload, Lsn::ZERO).is_err());
    }
}
