//! Replication messages and their CBOR encoding.
//!
//! LSNs travel as their packed `u64` form ([`Lsn::to_u64`]); `gen` is the
//! master generation the sender believes in.

use crate::error::ReplResult;
use lodedb_core::Lsn;
use serde::{Deserialize, Serialize};

/// Identifier of a site in a replication group.
pub type SiteId = u32;

/// A message exchanged between sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// One log record shipped by the master.
    Log {
        /// Master generation.
        gen: u32,
        /// Position of the record.
        lsn: u64,
        /// The encoded record.
        #[serde(with = "serde_bytes_compat")]
        bytes: Vec<u8>,
    },
    /// A client has applied everything up to and including the commit at
    /// `lsn`.
    Ack {
        /// Master generation.
        gen: u32,
        /// Commit record applied.
        lsn: u64,
    },
    /// A client asks for every record from `from` on.
    LogRequest {
        /// Master generation.
        gen: u32,
        /// First missing position.
        from: u64,
    },
    /// A client asks the master for the record at one of its commit LSNs.
    VerifyRequest {
        /// Master generation.
        gen: u32,
        /// Commit LSN on the client.
        lsn: u64,
    },
    /// The master's record at `lsn`, `None` if it has none there.
    VerifyReply {
        /// Master generation.
        gen: u32,
        /// Position asked for.
        lsn: u64,
        /// Master's record bytes.
        bytes: Option<Vec<u8>>,
    },
    /// A vote in election `egen`.
    Vote {
        /// Election generation.
        egen: u32,
        /// Voter's newest commit LSN.
        last_commit: u64,
        /// Voter's priority.
        priority: u32,
    },
    /// `site` is master in generation `gen`.
    NewMaster {
        /// Master generation.
        gen: u32,
        /// The master.
        site: SiteId,
    },
    /// Asks the current master to announce itself.
    MasterQuery,
}

impl Message {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Log { .. } => "log",
            Message::Ack { .. } => "ack",
            Message::LogRequest { .. } => "log_request",
            Message::VerifyRequest { .. } => "verify_request",
            Message::VerifyReply { .. } => "verify_reply",
            Message::Vote { .. } => "vote",
            Message::NewMaster { .. } => "new_master",
            Message::MasterQuery => "master_query",
        }
    }

    /// Encodes the message as CBOR.
    ///
    /// # Errors
    ///
    /// `ReplError::Codec` if serialization fails.
    pub fn encode(&self) -> ReplResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Decodes a CBOR message.
    ///
    /// # Errors
    ///
    /// `ReplError::Codec` for malformed input.
    pub fn decode(bytes: &[u8]) -> ReplResult<Self> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

/// A decoded message and its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sending site.
    pub from: SiteId,
    /// The message.
    pub message: Message,
}

/// Converts a wire LSN.
pub(crate) fn lsn(raw: u64) -> Lsn {
    Lsn::from_u64(raw)
}

/// Record bytes as a CBOR byte string rather than an array of integers.
mod serde_bytes_compat {
    use serde::de::{Deserializer, Error, SeqAccess, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        d.deserialize_bytes(BytesVisitor)
    }
}
