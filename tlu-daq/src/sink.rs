//! Persistent run data: a self-describing container holding the `raw_data`
//! and `meta_data` tables plus free-form attributes. Raw records are packed
//! with the fastest lossless codec (snappy), meta rows and attributes with a
//! general-purpose one (zstd).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use zerocopy::byteorder::little_endian::{F64, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::device::TriggerRecord;
use crate::readout::DataChunk;

const MAGIC: &[u8; 8] = b"TLUTBL01";

const BLOCK_RAW: u8 = 1;
const BLOCK_META: u8 = 2;
const BLOCK_ATTR: u8 = 3;

const ZSTD_LEVEL: i32 = 5;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("snappy codec failed: {0}")]
    Snappy(#[from] snap::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("bad table file: {0}")]
    Format(String),
}

/// One row of the `meta_data` table: bookkeeping for a single readout chunk.
/// `raw_data[index_start..index_stop]` is the chunk's span in the raw table.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct MetaRow {
    index_start: U32,
    index_stop: U32,
    data_length: U32,
    timestamp_start: F64,
    timestamp_stop: F64,
    error: U32,
    skipped_triggers: U64,
}

impl MetaRow {
    pub const SIZE: usize = 40;

    pub fn index_start(&self) -> u32 {
        self.index_start.get()
    }

    pub fn index_stop(&self) -> u32 {
        self.index_stop.get()
    }

    pub fn data_length(&self) -> u32 {
        self.data_length.get()
    }

    pub fn timestamp_start(&self) -> f64 {
        self.timestamp_start.get()
    }

    pub fn timestamp_stop(&self) -> f64 {
        self.timestamp_stop.get()
    }

    pub fn error(&self) -> u32 {
        self.error.get()
    }

    pub fn skipped_triggers(&self) -> u64 {
        self.skipped_triggers.get()
    }
}

impl PartialEq for MetaRow {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl std::fmt::Debug for MetaRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaRow")
            .field("index_start", &self.index_start())
            .field("index_stop", &self.index_stop())
            .field("data_length", &self.data_length())
            .field("timestamp_start", &self.timestamp_start())
            .field("timestamp_stop", &self.timestamp_stop())
            .field("error", &self.error())
            .field("skipped_triggers", &self.skipped_triggers())
            .finish()
    }
}

fn schema_json() -> serde_json::Value {
    serde_json::json!({
        "tables": {
            "raw_data": {
                "row_bytes": TriggerRecord::SIZE,
                "codec": "snappy",
                "columns": [
                    { "name": "le0", "type": "u1" },
                    { "name": "le1", "type": "u1" },
                    { "name": "le2", "type": "u1" },
                    { "name": "le3", "type": "u1" },
                    { "name": "time_stamp", "type": "<u8" },
                    { "name": "trigger_id", "type": "<u4" },
                ],
            },
            "meta_data": {
                "row_bytes": MetaRow::SIZE,
                "codec": "zstd",
                "columns": [
                    { "name": "index_start", "type": "<u4" },
                    { "name": "index_stop", "type": "<u4" },
                    { "name": "data_length", "type": "<u4" },
                    { "name": "timestamp_start", "type": "<f8" },
                    { "name": "timestamp_stop", "type": "<f8" },
                    { "name": "error", "type": "<u4" },
                    { "name": "skipped_triggers", "type": "<u8" },
                ],
            },
        },
    })
}

/// Append-only writer. Every chunk becomes one raw block plus one meta row;
/// both are flushed before `append_chunk` returns.
pub struct TableFile {
    writer: BufWriter<File>,
    path: PathBuf,
    raw_rows: u64,
    meta_rows: u64,
}

impl TableFile {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        let schema = serde_json::to_vec(&schema_json())?;
        writer.write_all(MAGIC)?;
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, schema.len() as u32);
        writer.write_all(&len)?;
        writer.write_all(&schema)?;
        writer.flush()?;
        Ok(TableFile { writer, path, raw_rows: 0, meta_rows: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw_rows(&self) -> u64 {
        self.raw_rows
    }

    pub fn meta_rows(&self) -> u64 {
        self.meta_rows
    }

    fn write_block(&mut self, tag: u8, raw_len: usize, payload: &[u8]) -> Result<(), SinkError> {
        let mut header = [0u8; 9];
        header[0] = tag;
        LittleEndian::write_u32(&mut header[1..5], raw_len as u32);
        LittleEndian::write_u32(&mut header[5..9], payload.len() as u32);
        self.writer.write_all(&header)?;
        self.writer.write_all(payload)?;
        Ok(())
    }

    /// Named attribute (JSON text), e.g. the invocation arguments or the
    /// final register snapshot.
    pub fn set_attr(&mut self, name: &str, value: &serde_json::Value) -> Result<(), SinkError> {
        let blob = serde_json::to_vec(&serde_json::json!({ "name": name, "value": value }))?;
        self.write_block(BLOCK_ATTR, blob.len(), &blob)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn append_chunk(&mut self, chunk: &DataChunk) -> Result<MetaRow, SinkError> {
        let raw_bytes = chunk.data.as_bytes();
        let packed = snap::raw::Encoder::new().compress_vec(raw_bytes)?;
        self.write_block(BLOCK_RAW, raw_bytes.len(), &packed)?;

        let index_start = self.raw_rows;
        let data_length = chunk.data.len() as u64;
        let row = MetaRow {
            index_start: U32::new(index_start as u32),
            index_stop: U32::new((index_start + data_length) as u32),
            data_length: U32::new(data_length as u32),
            timestamp_start: F64::new(chunk.timestamp_start),
            timestamp_stop: F64::new(chunk.timestamp_stop),
            error: U32::new(chunk.error),
            skipped_triggers: U64::new(chunk.skipped_triggers),
        };
        let packed = zstd::bulk::compress(row.as_bytes(), ZSTD_LEVEL)?;
        self.write_block(BLOCK_META, MetaRow::SIZE, &packed)?;
        self.writer.flush()?;

        self.raw_rows += data_length;
        self.meta_rows += 1;
        Ok(row)
    }
}

/// Whole-file reader, used by the replay producer and the tests.
pub struct TableReader {
    pub raw_data: Vec<TriggerRecord>,
    pub meta_data: Vec<MetaRow>,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl TableReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(SinkError::Format("wrong magic".into()));
        }
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let schema_len = LittleEndian::read_u32(&len) as usize;
        let mut schema = vec![0u8; schema_len];
        reader.read_exact(&mut schema)?;
        let _: serde_json::Value = serde_json::from_slice(&schema)?;

        let mut raw_data = Vec::new();
        let mut meta_data = Vec::new();
        let mut attributes = BTreeMap::new();

        loop {
            let mut tag = [0u8; 1];
            match reader.read_exact(&mut tag) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let mut lens = [0u8; 8];
            reader.read_exact(&mut lens)?;
            let raw_len = LittleEndian::read_u32(&lens[0..4]) as usize;
            let comp_len = LittleEndian::read_u32(&lens[4..8]) as usize;
            let mut payload = vec![0u8; comp_len];
            reader.read_exact(&mut payload)?;

            match tag[0] {
                BLOCK_RAW => {
                    let bytes = snap::raw::Decoder::new().decompress_vec(&payload)?;
                    if bytes.len() != raw_len {
                        return Err(SinkError::Format("raw block length mismatch".into()));
                    }
                    let records = <[TriggerRecord]>::ref_from_bytes(&bytes)
                        .map_err(|_| SinkError::Format("raw block is not record aligned".into()))?;
                    raw_data.extend_from_slice(records);
                }
                BLOCK_META => {
                    let bytes = zstd::bulk::decompress(&payload, raw_len)?;
                    let rows = <[MetaRow]>::ref_from_bytes(&bytes)
                        .map_err(|_| SinkError::Format("meta block is not row aligned".into()))?;
                    meta_data.extend_from_slice(rows);
                }
                BLOCK_ATTR => {
                    let blob: serde_json::Value = serde_json::from_slice(&payload)?;
                    let name = blob
                        .get("name")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| SinkError::Format("attribute without name".into()))?
                        .to_string();
                    let value =
                        blob.get("value").cloned().unwrap_or(serde_json::Value::Null);
                    attributes.insert(name, value);
                }
                other => return Err(SinkError::Format(format!("unknown block tag {}", other))),
            }
        }

        Ok(TableReader { raw_data, meta_data, attributes })
    }

    /// Records belonging to one meta row.
    pub fn chunk_records(&self, row: &MetaRow) -> &[TriggerRecord] {
        &self.raw_data[row.index_start() as usize..row.index_stop() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(ids: std::ops::Range<u32>, t0: f64, skipped: u64) -> DataChunk {
        DataChunk {
            data: ids.map(|i| TriggerRecord::new([i as u8; 4], 1000 + i as u64, i)).collect(),
            timestamp_start: t0,
            timestamp_stop: t0 + 0.05,
            error: 0,
            skipped_triggers: skipped,
        }
    }

    #[test]
    fn chunks_round_trip_with_consistent_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.tlu");

        let mut file = TableFile::create(&path).unwrap();
        file.set_attr("kwargs", &serde_json::json!({ "threshold": 5 })).unwrap();
        let chunks = [chunk(0..30, 1.0, 0), chunk(30..45, 1.05, 2), chunk(45..100, 1.10, 7)];
        for c in &chunks {
            file.append_chunk(c).unwrap();
        }
        assert_eq!(file.raw_rows(), 100);
        assert_eq!(file.meta_rows(), 3);
        drop(file);

        let back = TableReader::open(&path).unwrap();
        assert_eq!(back.raw_data.len(), 100);
        assert_eq!(back.meta_data.len(), 3);
        assert_eq!(back.attributes["kwargs"]["threshold"], 5);

        let mut expected_start = 0u32;
        for (row, c) in back.meta_data.iter().zip(&chunks) {
            assert_eq!(row.index_stop() - row.index_start(), row.data_length());
            assert_eq!(row.index_start(), expected_start);
            assert_eq!(row.data_length() as usize, c.data.len());
            assert_eq!(row.skipped_triggers(), c.skipped_triggers);
            expected_start = row.index_stop();

            let span = back.chunk_records(row);
            assert_eq!(span.len(), c.data.len());
            assert_eq!(span[0].trigger_id(), c.data[0].trigger_id());
        }

        // the concatenation of all spans reproduces the raw table in order
        let concat: Vec<_> =
            back.meta_data.iter().flat_map(|m| back.chunk_records(m).iter().copied()).collect();
        assert_eq!(concat.len(), back.raw_data.len());
        assert!(concat.iter().zip(&back.raw_data).all(|(a, b)| a == b));
    }

    #[test]
    fn meta_row_survives_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.tlu");

        let mut file = TableFile::create(&path).unwrap();
        let written = file.append_chunk(&chunk(0..7, 1234.5678, 42)).unwrap();
        drop(file);

        let back = TableReader::open(&path).unwrap();
        assert_eq!(back.meta_data.len(), 1);
        assert_eq!(back.meta_data[0], written);
        assert_eq!(back.meta_data[0].as_bytes(), written.as_bytes());
    }

    #[test]
    fn rejects_wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.tlu");
        std::fs::write(&path, b"NOTATABLEFILE---").unwrap();
        assert!(TableReader::open(&path).is_err());
    }
}
