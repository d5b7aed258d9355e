//! Transaction operation log records.
//!
//! A commit record's body is a run of sub-records, one per operation
//! the transaction performed. Every sub-record is framed as
//! `{ optype, opsize, fields }` with both framing integers varints, so
//! a reader that doesn't know an operation type can skip it by size.

use shale_core::{Error, PackStream, Result, UnpackStream};

const OP_COL_PUT: u64 = 2;
const OP_COL_REMOVE: u64 = 3;
const OP_COL_TRUNCATE: u64 = 4;
const OP_ROW_PUT: u64 = 5;
const OP_ROW_REMOVE: u64 = 6;
const OP_ROW_TRUNCATE: u64 = 7;

/// Which ends of a row truncation were bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TruncMode {
    /// Truncate the whole file
    All = 0,
    /// Both start and stop keys are set
    Both = 1,
    /// Only the start key is set
    Start = 2,
    /// Only the stop key is set
    Stop = 3,
}

impl TruncMode {
    fn from_u64(v: u64) -> Result<TruncMode> {
        match v {
            0 => Ok(TruncMode::All),
            1 => Ok(TruncMode::Both),
            2 => Ok(TruncMode::Start),
            3 => Ok(TruncMode::Stop),
            _ => Err(Error::CorruptFile(format!("bad truncate mode {v}"))),
        }
    }
}

/// One logged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Column-store insert or update
    ColPut {
        /// Target file id
        fileid: u32,
        /// Record number
        recno: u64,
        /// Value bytes
        value: Vec<u8>,
    },
    /// Column-store remove
    ColRemove {
        /// Target file id
        fileid: u32,
        /// Record number
        recno: u64,
    },
    /// Column-store range truncate
    ColTruncate {
        /// Target file id
        fileid: u32,
        /// First record number
        start: u64,
        /// Last record number
        stop: u64,
    },
    /// Row-store insert or update
    RowPut {
        /// Target file id
        fileid: u32,
        /// Key bytes
        key: Vec<u8>,
        /// Value bytes
        value: Vec<u8>,
    },
    /// Row-store remove
    RowRemove {
        /// Target file id
        fileid: u32,
        /// Key bytes
        key: Vec<u8>,
    },
    /// Row-store range truncate
    RowTruncate {
        /// Target file id
        fileid: u32,
        /// Start key, meaningful per `mode`
        start: Vec<u8>,
        /// Stop key, meaningful per `mode`
        stop: Vec<u8>,
        /// Which bounds are set
        mode: TruncMode,
    },
}

impl TxnOp {
    /// The file this operation applies to.
    pub fn fileid(&self) -> u32 {
        match self {
            TxnOp::ColPut { fileid, .. }
            | TxnOp::ColRemove { fileid, .. }
            | TxnOp::ColTruncate { fileid, .. }
            | TxnOp::RowPut { fileid, .. }
            | TxnOp::RowRemove { fileid, .. }
            | TxnOp::RowTruncate { fileid, .. } => *fileid,
        }
    }

    fn optype(&self) -> u64 {
        match self {
            TxnOp::ColPut { .. } => OP_COL_PUT,
            TxnOp::ColRemove { .. } => OP_COL_REMOVE,
            TxnOp::ColTruncate { .. } => OP_COL_TRUNCATE,
            TxnOp::RowPut { .. } => OP_ROW_PUT,
            TxnOp::RowRemove { .. } => OP_ROW_REMOVE,
            TxnOp::RowTruncate { .. } => OP_ROW_TRUNCATE,
        }
    }

    /// Append this operation as a framed sub-record.
    pub fn pack_into(&self, buf: &mut PackStream) {
        let mut fields = PackStream::new();
        match self {
            TxnOp::ColPut { fileid, recno, value } => {
                fields.put_uint(*fileid as u64).put_uint(*recno).put_bytes(value);
            }
            TxnOp::ColRemove { fileid, recno } => {
                fields.put_uint(*fileid as u64).put_uint(*recno);
            }
            TxnOp::ColTruncate { fileid, start, stop } => {
                fields.put_uint(*fileid as u64).put_uint(*start).put_uint(*stop);
            }
            TxnOp::RowPut { fileid, key, value } => {
                fields.put_uint(*fileid as u64).put_bytes(key).put_bytes(value);
            }
            TxnOp::RowRemove { fileid, key } => {
                fields.put_uint(*fileid as u64).put_bytes(key);
            }
            TxnOp::RowTruncate {
                fileid,
                start,
                stop,
                mode,
            } => {
                fields
                    .put_uint(*fileid as u64)
                    .put_bytes(start)
                    .put_bytes(stop)
                    .put_uint(*mode as u64);
            }
        }
        buf.put_uint(self.optype());
        buf.put_bytes(fields.as_bytes());
    }

    /// Pack a whole operation list.
    pub fn pack_list(ops: &[TxnOp]) -> Vec<u8> {
        let mut pack = PackStream::new();
        for op in ops {
            op.pack_into(&mut pack);
        }
        pack.into_bytes()
    }
}

/// Streaming reader over a packed operation list.
///
/// Sub-records with unknown type tags are skipped by their recorded
/// size; the engine stays readable by older builds that way.
#[derive(Debug)]
pub struct OpReader<'a> {
    stream: UnpackStream<'a>,
}

impl<'a> OpReader<'a> {
    /// Read ops from a commit record's packed body.
    pub fn new(ops: &'a [u8]) -> Self {
        OpReader {
            stream: UnpackStream::new(ops),
        }
    }

    fn read_one(&mut self) -> Result<Option<TxnOp>> {
        while !self.stream.is_exhausted() {
            let optype = self.stream.get_uint().map_err(Error::from)?;
            let fields = self.stream.get_bytes().map_err(Error::from)?;
            let mut f = UnpackStream::new(fields);

            let op = match optype {
                OP_COL_PUT => TxnOp::ColPut {
                    fileid: f.get_uint().map_err(Error::from)? as u32,
                    recno: f.get_uint().map_err(Error::from)?,
                    value: f.get_bytes().map_err(Error::from)?.to_vec(),
                },
                OP_COL_REMOVE => TxnOp::ColRemove {
                    fileid: f.get_uint().map_err(Error::from)? as u32,
                    recno: f.get_uint().map_err(Error::from)?,
                },
                OP_COL_TRUNCATE => TxnOp::ColTruncate {
                    fileid: f.get_uint().map_err(Error::from)? as u32,
                    start: f.get_uint().map_err(Error::from)?,
                    stop: f.get_uint().map_err(Error::from)?,
                },
                OP_ROW_PUT => TxnOp::RowPut {
                    fileid: f.get_uint().map_err(Error::from)? as u32,
                    key: f.get_bytes().map_err(Error::from)?.to_vec(),
                    value: f.get_bytes().map_err(Error::from)?.to_vec(),
                },
                OP_ROW_REMOVE => TxnOp::RowRemove {
                    fileid: f.get_uint().map_err(Error::from)? as u32,
                    key: f.get_bytes().map_err(Error::from)?.to_vec(),
                },
                OP_ROW_TRUNCATE => TxnOp::RowTruncate {
                    fileid: f.get_uint().map_err(Error::from)? as u32,
                    start: f.get_bytes().map_err(Error::from)?.to_vec(),
                    stop: f.get_bytes().map_err(Error::from)?.to_vec(),
                    mode: TruncMode::from_u64(f.get_uint().map_err(Error::from)?)?,
                },
                unknown => {
                    tracing::warn!(
                        target: "shale::wal",
                        optype = unknown,
                        "skipping unknown operation type"
                    );
                    continue;
                }
            };
            return Ok(Some(op));
        }
        Ok(None)
    }
}

impl Iterator for OpReader<'_> {
    type Item = Result<TxnOp>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_one().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ops() -> Vec<TxnOp> {
        vec![
            TxnOp::RowPut {
                fileid: 9,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
            TxnOp::RowRemove {
                fileid: 9,
                key: b"dead".to_vec(),
            },
            TxnOp::ColPut {
                fileid: 3,
                recno: 17,
                value: b"cell".to_vec(),
            },
            TxnOp::ColRemove { fileid: 3, recno: 18 },
            TxnOp::ColTruncate {
                fileid: 3,
                start: 100,
                stop: 200,
            },
            TxnOp::RowTruncate {
                fileid: 9,
                start: b"a".to_vec(),
                stop: b"m".to_vec(),
                mode: TruncMode::Both,
            },
        ]
    }

    #[test]
    fn test_op_list_roundtrip() {
        let ops = sample_ops();
        let packed = TxnOp::pack_list(&ops);
        let read: Vec<TxnOp> = OpReader::new(&packed).collect::<Result<_>>().unwrap();
        assert_eq!(read, ops);
    }

    #[test]
    fn test_unknown_op_skipped() {
        let mut pack = PackStream::new();
        TxnOp::RowPut {
            fileid: 1,
            key: b"a".to_vec(),
            value: b"1".to_vec(),
        }
        .pack_into(&mut pack);

        // A sub-record from the future: unknown tag, well-formed size.
        pack.put_uint(999);
        pack.put_bytes(&[0xde, 0xad, 0xbe, 0xef]);

        TxnOp::RowRemove {
            fileid: 1,
            key: b"b".to_vec(),
        }
        .pack_into(&mut pack);

        let packed = pack.into_bytes();
        let read: Vec<TxnOp> = OpReader::new(&packed).collect::<Result<_>>().unwrap();
        assert_eq!(read.len(), 2);
        assert!(matches!(read[0], TxnOp::RowPut { .. }));
        assert!(matches!(read[1], TxnOp::RowRemove { .. }));
    }

    #[test]
    fn test_truncated_op_reported() {
        let ops = sample_ops();
        let packed = TxnOp::pack_list(&ops);
        let results: Vec<_> = OpReader::new(&packed[..packed.len() - 2]).collect();
        assert!(results.last().unwrap().is_err());
    }

    #[test]
    fn test_empty_list() {
        let read: Vec<TxnOp> = OpReader::new(&[]).collect::<Result<_>>().unwrap();
        assert!(read.is_empty());
    }
}
