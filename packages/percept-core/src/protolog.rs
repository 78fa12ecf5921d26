//! Length-delimited protobuf log I/O.
//!
//! Wire format: repeated `[u32 big-endian length N][N bytes serialized
//! message]`. Used for both frame recordings (`.pb`) and annotation sidecars
//! (`.seg.pb`). The sidecar is written one record at a time as results arrive,
//! so [`ProtoLog::write_file`] appends rather than overwrites, and
//! [`ProtoLog::read_file`] re-syncs past corrupt length prefixes so a partial
//! write can't destroy the tail of a log.

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::marker::PhantomData;
use std::path::Path;

use prost::Message;

use crate::constants::RECORD_SIZE_LIMIT;

/// Result of reading a log file: the recovered messages plus counts of what
/// had to be skipped along the way.
#[derive(Debug)]
pub struct ReadSummary<M> {
    /// Messages recovered, in file order.
    pub messages: Vec<M>,
    /// Records whose length prefix was fine but whose payload failed to parse.
    pub corrupt_records: usize,
    /// Resync episodes: runs of bytes skipped after a zero or oversized
    /// length prefix until a plausible record boundary was found.
    pub resyncs: usize,
}

/// Encoder/decoder/reader/writer for one message type's length-delimited logs.
pub struct ProtoLog<M> {
    _msg: PhantomData<fn() -> M>,
}

impl<M: Message + Default> ProtoLog<M> {
    pub fn new() -> Self {
        Self { _msg: PhantomData }
    }

    /// Serializes messages with length prefixes into one buffer.
    pub fn encode<'a, I>(&self, messages: I) -> Vec<u8>
    where
        I: IntoIterator<Item = &'a M>,
        M: 'a,
    {
        let mut buf = Vec::new();
        for msg in messages {
            let raw = msg.encode_to_vec();
            buf.extend_from_slice(&(raw.len() as u32).to_be_bytes());
            buf.extend_from_slice(&raw);
        }
        buf
    }

    /// Decodes length-delimited messages from an in-memory buffer.
    ///
    /// Stops cleanly at end-of-buffer or on a zero/oversized length prefix.
    /// Individually malformed records are skipped.
    pub fn decode(&self, data: &[u8]) -> Vec<M> {
        let mut messages = Vec::new();
        let mut offset = 0usize;
        let mut errors = 0usize;
        while offset + 4 <= data.len() {
            let length = read_len(data, offset);
            offset += 4;
            if length == 0 || length > RECORD_SIZE_LIMIT || offset + length > data.len() {
                break;
            }
            match M::decode(&data[offset..offset + length]) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    errors += 1;
                    log::warn!(
                        "[ProtoLog] Skipping corrupt record at byte offset {} (length={}): {}",
                        offset - 4,
                        length,
                        e
                    );
                }
            }
            offset += length;
        }
        if errors > 0 {
            log::warn!(
                "[ProtoLog] Decoded {} records, skipped {} corrupt record(s)",
                messages.len(),
                errors
            );
        }
        messages
    }

    /// Reads all messages from a length-delimited file with corruption
    /// recovery.
    ///
    /// A zero or impossibly-large length prefix triggers a forward scan, one
    /// byte at a time, until a plausible record boundary re-syncs with the
    /// stream. A legitimately truncated file (header intact but payload bytes
    /// missing) ends the read; records that fail to parse are counted and
    /// skipped without stopping.
    pub fn read_file(&self, path: &Path) -> io::Result<ReadSummary<M>> {
        let data = fs::read(path)?;
        let mut summary = ReadSummary {
            messages: Vec::new(),
            corrupt_records: 0,
            resyncs: 0,
        };

        let mut offset = 0usize;
        while offset + 4 <= data.len() {
            let length = read_len(data.as_slice(), offset);

            if length == 0 || length > RECORD_SIZE_LIMIT {
                summary.resyncs += 1;
                log::warn!(
                    "[ProtoLog] Suspicious length {} at offset {}, scanning forward",
                    length,
                    offset
                );
                match scan_for_boundary(&data, offset + 1) {
                    Some(next) => {
                        offset = next;
                        continue;
                    }
                    None => break,
                }
            }

            if offset + 4 + length > data.len() {
                break; // truncated tail
            }

            let start = offset + 4;
            match M::decode(&data[start..start + length]) {
                Ok(msg) => summary.messages.push(msg),
                Err(e) => {
                    summary.corrupt_records += 1;
                    log::warn!(
                        "[ProtoLog] Corrupt record at offset {} (length={}): {}",
                        offset,
                        length,
                        e
                    );
                }
            }
            // Advance past the record whether it parsed or not.
            offset = start + length;
        }

        if summary.corrupt_records > 0 || summary.resyncs > 0 {
            log::warn!(
                "[ProtoLog] Recovered {} records from {} ({} corrupt, {} resync(s))",
                summary.messages.len(),
                path.display(),
                summary.corrupt_records,
                summary.resyncs
            );
        }
        Ok(summary)
    }

    /// Appends messages to a length-delimited file, creating parent
    /// directories as needed. Returns the number of messages written.
    pub fn write_file<'a, I>(&self, path: &Path, messages: I) -> io::Result<usize>
    where
        I: IntoIterator<Item = &'a M>,
        M: 'a,
    {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let messages: Vec<&M> = messages.into_iter().collect();
        let buf = self.encode(messages.iter().copied());
        let mut file = OpenOptions::new().append(true).create(true).open(path)?;
        file.write_all(&buf)?;
        Ok(messages.len())
    }
}

impl<M: Message + Default> Default for ProtoLog<M> {
    fn default() -> Self {
        Self::new()
    }
}

fn read_len(data: &[u8], offset: usize) -> usize {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]) as usize
}

/// Finds the next offset whose length prefix is plausible: non-zero, under
/// the record cap, and small enough that the record fits the remaining bytes.
fn scan_for_boundary(data: &[u8], start: usize) -> Option<usize> {
    let mut pos = start;
    while pos + 4 <= data.len() {
        let length = read_len(data, pos);
        if length > 0 && length <= RECORD_SIZE_LIMIT && pos + 4 + length <= data.len() {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{FrameId, SensorFrame};

    fn frame(n: u64) -> SensorFrame {
        SensorFrame {
            id: Some(FrameId {
                device_id: "test-device".into(),
                frame_number: n,
                timestamp_ns: 1_000_000 * n,
            }),
            ..Default::default()
        }
    }

    fn frame_log() -> ProtoLog<SensorFrame> {
        ProtoLog::new()
    }

    #[test]
    fn encode_decode_round_trip() {
        let frames: Vec<SensorFrame> = (0..5).map(frame).collect();
        let log = frame_log();
        let decoded = log.decode(&log.encode(frames.iter()));
        assert_eq!(decoded, frames);
    }

    #[test]
    fn decode_stops_at_truncated_record() {
        let frames = vec![frame(1), frame(2)];
        let log = frame_log();
        let mut buf = log.encode(frames.iter());
        buf.truncate(buf.len() - 3);
        // Only the first record survives; the truncated tail ends the decode.
        assert_eq!(log.decode(&buf), vec![frame(1)]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.pb");
        let frames: Vec<SensorFrame> = (0..10).map(frame).collect();

        let log = frame_log();
        let written = log.write_file(&path, frames.iter()).unwrap();
        assert_eq!(written, 10);

        let summary = log.read_file(&path).unwrap();
        assert_eq!(summary.messages, frames);
        assert_eq!(summary.corrupt_records, 0);
        assert_eq!(summary.resyncs, 0);
    }

    #[test]
    fn write_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.pb");
        let log = frame_log();

        log.write_file(&path, [frame(1)].iter()).unwrap();
        log.write_file(&path, [frame(2)].iter()).unwrap();

        let summary = log.read_file(&path).unwrap();
        assert_eq!(summary.messages, vec![frame(1), frame(2)]);
    }

    #[test]
    fn read_resyncs_past_oversized_length_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.pb");
        let log = frame_log();

        let mut bytes = log.encode([frame(1)].iter());
        bytes.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        bytes.extend_from_slice(&log.encode([frame(2)].iter()));
        fs::write(&path, &bytes).unwrap();

        let summary = log.read_file(&path).unwrap();
        assert_eq!(summary.messages, vec![frame(1), frame(2)]);
        assert_eq!(summary.resyncs, 1);
    }

    #[test]
    fn read_resyncs_past_garbage_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pb");
        let log = frame_log();

        // Garbage whose every 4-byte window reads as an oversized prefix.
        let mut bytes = log.encode([frame(1), frame(2)].iter());
        bytes.extend_from_slice(&[0xfe; 64]);
        bytes.extend_from_slice(&log.encode([frame(3)].iter()));
        fs::write(&path, &bytes).unwrap();

        let summary = log.read_file(&path).unwrap();
        assert_eq!(summary.messages, vec![frame(1), frame(2), frame(3)]);
        assert_eq!(summary.resyncs, 1);
    }

    #[test]
    fn read_treats_truncated_tail_as_clean_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.pb");
        let log = frame_log();

        let mut bytes = log.encode([frame(1), frame(2)].iter());
        bytes.truncate(bytes.len() - 2);
        fs::write(&path, &bytes).unwrap();

        let summary = log.read_file(&path).unwrap();
        assert_eq!(summary.messages, vec![frame(1)]);
        assert_eq!(summary.corrupt_records, 0);
    }

    #[test]
    fn read_skips_zero_length_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zeroed.pb");
        let log = frame_log();

        let mut bytes = vec![0u8; 4];
        bytes.extend_from_slice(&log.encode([frame(7)].iter()));
        fs::write(&path, &bytes).unwrap();

        let summary = log.read_file(&path).unwrap();
        assert_eq!(summary.messages, vec![frame(7)]);
        assert_eq!(summary.resyncs, 1);
    }

    #[test]
    fn read_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = frame_log()
            .read_file(&dir.path().join("absent.pb"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
