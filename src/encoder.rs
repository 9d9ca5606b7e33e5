use std::path::Path;

use tokio::{fs::File, io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter}};

use crate::{error::{DecodeError, EncodeError}, models::{MemoryUsage, StatSnapshot}};


pub const RECORD_TAG: u8 = b'P';
const LEN_SIZE: usize = 4;
const PAYLOAD_SIZE: usize = 8 * 8;
/// Longest foreign payload skipped by its prefix. Anything longer is a
/// corrupt header.
const MAX_PAYLOAD_SIZE: usize = 4096;
/// tag + payload length + payload + newline
pub const RECORD_SIZE: usize = 1 + LEN_SIZE + PAYLOAD_SIZE + 1;

const CHUNK_SIZE: usize = 1024 * 8;


pub fn encode_snapshot(snapshot: &StatSnapshot, buffer: &mut Vec<u8>) {
    buffer.reserve(RECORD_SIZE);

    buffer.push(RECORD_TAG);
    buffer.extend_from_slice(&(PAYLOAD_SIZE as u32).to_le_bytes());
    buffer.extend_from_slice(&snapshot.timestamp.to_le_bytes());
    buffer.extend_from_slice(&snapshot.cpu.to_bits().to_le_bytes());
    buffer.extend_from_slice(&snapshot.memory.rss.to_le_bytes());
    buffer.extend_from_slice(&snapshot.memory.heap_total.to_le_bytes());
    buffer.extend_from_slice(&snapshot.memory.heap_used.to_le_bytes());
    buffer.extend_from_slice(&snapshot.memory.external.to_le_bytes());
    buffer.extend_from_slice(&snapshot.handles.to_le_bytes());
    buffer.extend_from_slice(&snapshot.delay.to_bits().to_le_bytes());
    buffer.push(b'\n');
}

fn read_u64(payload: &[u8], field: usize) -> u64 {
    let start = field * 8;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&payload[start..start + 8]);
    u64::from_le_bytes(bytes)
}

fn decode_payload(payload: &[u8]) -> StatSnapshot {
    StatSnapshot {
        timestamp: read_u64(payload, 0),
        cpu: f64::from_bits(read_u64(payload, 1)),
        memory: MemoryUsage {
            rss: read_u64(payload, 2),
            heap_total: read_u64(payload, 3),
            heap_used: read_u64(payload, 4),
            external: read_u64(payload, 5),
        },
        handles: read_u64(payload, 6),
        delay: f64::from_bits(read_u64(payload, 7)),
    }
}


/// Append-only writer of stat records. The sink is owned exclusively by the
/// encoder until `end()` hands it back.
pub struct StatEncoder<W> {
    writer: Option<BufWriter<W>>,
    buffer: Vec<u8>,
    records: u64,
}

impl<W: AsyncWrite + Unpin> StatEncoder<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: Some(BufWriter::new(sink)),
            buffer: Vec::with_capacity(RECORD_SIZE),
            records: 0,
        }
    }

    pub async fn write(&mut self, snapshot: &StatSnapshot) -> Result<(), EncodeError> {
        let writer = self.writer.as_mut().ok_or(EncodeError::Ended)?;

        self.buffer.clear();
        encode_snapshot(snapshot, &mut self.buffer);
        writer.write_all(&self.buffer).await?;

        self.records += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), EncodeError> {
        let writer = self.writer.as_mut().ok_or(EncodeError::Ended)?;
        writer.flush().await?;
        Ok(())
    }

    /// Flushes everything buffered and returns the sink. Durability of the
    /// sink itself (fsync) is up to the caller.
    pub async fn end(&mut self) -> Result<W, EncodeError> {
        let mut writer = self.writer.take().ok_or(EncodeError::Ended)?;
        writer.flush().await?;
        Ok(writer.into_inner())
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn is_ended(&self) -> bool {
        self.writer.is_none()
    }
}


pub struct StatDecoder {
    buffer: Vec<u8>,
    offset: usize,
    consumed: u64,
    skipped: u64,
}

impl StatDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            offset: 0,
            consumed: 0,
            skipped: 0,
        }
    }

    /// Feed more data into the decoder
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next record. `None` means more data is needed.
    pub fn next_record(&mut self) -> Option<Result<StatSnapshot, DecodeError>> {
        loop {
            if self.offset >= self.buffer.len() {
                return None;
            }

            let tag = self.buffer[self.offset];
            match tag {
                b'\n' => {
                    self.advance(1);
                    continue;
                }
                RECORD_TAG => {}
                _ => {
                    let offset = self.consumed;
                    // step over the bad byte so the caller can resync
                    self.advance(1);
                    return Some(Err(DecodeError::UnknownTag { tag, offset }));
                }
            }

            let header_end = self.offset + 1 + LEN_SIZE;
            if header_end > self.buffer.len() {
                return None;
            }

            let mut len_bytes = [0u8; LEN_SIZE];
            len_bytes.copy_from_slice(&self.buffer[self.offset + 1..header_end]);
            let payload_len = u32::from_le_bytes(len_bytes) as usize;

            if payload_len > MAX_PAYLOAD_SIZE {
                let offset = self.consumed;
                self.advance(1);
                return Some(Err(DecodeError::BadLength { len: payload_len, offset }));
            }

            if header_end + payload_len > self.buffer.len() {
                return None;
            }

            let payload = &self.buffer[header_end..header_end + payload_len];
            if payload_len != PAYLOAD_SIZE {
                tracing::warn!(
                    "Skipping stat record with payload of {} bytes at byte {}",
                    payload_len,
                    self.consumed
                );
                self.skipped += 1;
                self.advance(1 + LEN_SIZE + payload_len);
                continue;
            }

            let snapshot = decode_payload(payload);
            self.advance(1 + LEN_SIZE + payload_len);

            // Skip newline if present
            if self.offset < self.buffer.len() && self.buffer[self.offset] == b'\n' {
                self.advance(1);
            }

            return Some(Ok(snapshot));
        }
    }

    fn advance(&mut self, n: usize) {
        self.offset += n;
        self.consumed += n as u64;
    }

    /// Bytes fed but not yet part of a complete record. Non-zero at end of
    /// input means the final record was truncated.
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.offset
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Clear processed data from buffer
    pub fn compact(&mut self) {
        if self.offset > 0 {
            self.buffer.drain(0..self.offset);
            self.offset = 0;
        }
    }
}

impl Default for StatDecoder {
    fn default() -> Self {
        Self::new()
    }
}


/// Streams records out of a reader in fixed size chunks.
pub struct StatReader<R> {
    reader: R,
    decoder: StatDecoder,
    chunk: Vec<u8>,
    eof: bool,
}

impl StatReader<File> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let file = File::open(path.as_ref()).await?;
        Ok(Self::new(file))
    }
}

impl<R: AsyncRead + Unpin> StatReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: StatDecoder::new(),
            chunk: vec![0u8; CHUNK_SIZE],
            eof: false,
        }
    }

    pub async fn next(&mut self) -> Result<Option<StatSnapshot>, DecodeError> {
        loop {
            if let Some(result) = self.decoder.next_record() {
                return result.map(Some);
            }

            if self.eof {
                return Ok(None);
            }

            self.decoder.compact();

            let bytes_read = self.reader.read(&mut self.chunk).await?;
            if bytes_read == 0 {
                self.eof = true;
                if self.decoder.pending() > 0 {
                    tracing::warn!(
                        "Stat stream ends with a truncated record ({} bytes), skipping it",
                        self.decoder.pending()
                    );
                }
                continue;
            }

            self.decoder.feed(&self.chunk[..bytes_read]);
        }
    }

    pub async fn read_all(mut self) -> Result<Vec<StatSnapshot>, DecodeError> {
        let mut snapshots = Vec::new();
        while let Some(snapshot) = self.next().await? {
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    pub fn truncated_bytes(&self) -> usize {
        if self.eof { self.decoder.pending() } else { 0 }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(timestamp: u64) -> StatSnapshot {
        StatSnapshot {
            timestamp,
            cpu: 0.37,
            memory: MemoryUsage { rss: 52_428_800, heap_total: 20_971_520, heap_used: 10_485_760, external: 4096 },
            handles: 17,
            delay: 1.25,
        }
    }

    fn extreme() -> StatSnapshot {
        StatSnapshot {
            timestamp: u64::MAX,
            cpu: f64::MAX,
            memory: MemoryUsage { rss: u64::MAX, heap_total: u64::MAX, heap_used: u64::MAX, external: u64::MAX },
            handles: u64::MAX,
            delay: f64::MIN_POSITIVE,
        }
    }

    async fn encode_all(snapshots: &[StatSnapshot]) -> Vec<u8> {
        let mut encoder = StatEncoder::new(Vec::new());
        for s in snapshots {
            encoder.write(s).await.unwrap();
        }
        encoder.end().await.unwrap()
    }

    fn decode_all(bytes: &[u8]) -> (Vec<StatSnapshot>, usize) {
        let mut decoder = StatDecoder::new();
        decoder.feed(bytes);
        let mut out = Vec::new();
        while let Some(result) = decoder.next_record() {
            out.push(result.unwrap());
        }
        (out, decoder.pending())
    }

    #[tokio::test]
    async fn decodes_exact_values_including_bounds() {
        let input = vec![StatSnapshot::default(), snapshot(1_700_000_000_000), extreme()];
        let bytes = encode_all(&input).await;
        assert_eq!(bytes.len(), RECORD_SIZE * input.len());

        let (output, pending) = decode_all(&bytes);
        assert_eq!(pending, 0);
        assert_eq!(output.len(), 3);
        for (a, b) in input.iter().zip(&output) {
            assert_eq!(a.timestamp, b.timestamp);
            assert_eq!(a.cpu.to_bits(), b.cpu.to_bits());
            assert_eq!(a.delay.to_bits(), b.delay.to_bits());
            assert_eq!(a.memory, b.memory);
            assert_eq!(a.handles, b.handles);
        }
    }

    #[tokio::test]
    async fn write_after_end_fails() {
        let mut encoder = StatEncoder::new(Vec::new());
        encoder.write(&snapshot(1)).await.unwrap();
        let sink = encoder.end().await.unwrap();
        assert_eq!(sink.len(), RECORD_SIZE);
        assert!(encoder.is_ended());

        assert!(matches!(encoder.write(&snapshot(2)).await, Err(EncodeError::Ended)));
        assert!(matches!(encoder.end().await, Err(EncodeError::Ended)));
        assert_eq!(encoder.records_written(), 1);
    }

    #[tokio::test]
    async fn truncated_tail_is_detected_and_skipped() {
        let bytes = encode_all(&[snapshot(1), snapshot(2), snapshot(3)]).await;
        let cut = &bytes[..bytes.len() - 20];

        let (output, pending) = decode_all(cut);
        assert_eq!(output.iter().map(|s| s.timestamp).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(pending, RECORD_SIZE - 20);
    }

    #[tokio::test]
    async fn records_split_across_feeds() {
        let bytes = encode_all(&[snapshot(10), snapshot(20)]).await;
        let mut decoder = StatDecoder::new();
        let mut out = Vec::new();

        for piece in bytes.chunks(7) {
            decoder.feed(piece);
            while let Some(result) = decoder.next_record() {
                out.push(result.unwrap().timestamp);
            }
            decoder.compact();
        }

        assert_eq!(out, vec![10, 20]);
        assert_eq!(decoder.pending(), 0);
    }

    #[tokio::test]
    async fn foreign_length_is_skipped_by_prefix() {
        let mut bytes = encode_all(&[snapshot(1)]).await;
        bytes.push(RECORD_TAG);
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        bytes.extend(encode_all(&[snapshot(2)]).await);

        let mut decoder = StatDecoder::new();
        decoder.feed(&bytes);
        let mut out = Vec::new();
        while let Some(result) = decoder.next_record() {
            out.push(result.unwrap().timestamp);
        }
        assert_eq!(out, vec![1, 2]);
        assert_eq!(decoder.skipped(), 1);
    }

    #[test]
    fn unknown_tag_reports_offset_and_resyncs() {
        let mut bytes = vec![b'X'];
        let mut record = Vec::new();
        encode_snapshot(&snapshot(5), &mut record);
        bytes.extend(record);

        let mut decoder = StatDecoder::new();
        decoder.feed(&bytes);

        match decoder.next_record() {
            Some(Err(DecodeError::UnknownTag { tag: b'X', offset: 0 })) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(decoder.next_record().unwrap().unwrap().timestamp, 5);
    }

    #[tokio::test]
    async fn corrupt_length_prefix_does_not_swallow_the_stream() {
        let mut bytes = vec![RECORD_TAG];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend(encode_all(&(0..100).map(snapshot).collect::<Vec<_>>()).await);

        let mut decoder = StatDecoder::new();
        decoder.feed(&bytes);

        match decoder.next_record() {
            Some(Err(DecodeError::BadLength { len, offset: 0 })) => assert_eq!(len, u32::MAX as usize),
            other => panic!("unexpected {other:?}"),
        }

        let mut out = Vec::new();
        while let Some(result) = decoder.next_record() {
            if let Ok(s) = result {
                out.push(s.timestamp);
            }
        }
        assert_eq!(out, (0..100).collect::<Vec<_>>());
        assert_eq!(decoder.pending(), 0);
    }

    #[tokio::test]
    async fn reader_continues_after_a_bad_byte() {
        let mut bytes = encode_all(&[snapshot(1)]).await;
        bytes.push(b'X');
        bytes.extend(encode_all(&[snapshot(2)]).await);

        let mut reader = StatReader::new(bytes.as_slice());
        assert_eq!(reader.next().await.unwrap().unwrap().timestamp, 1);
        assert!(matches!(reader.next().await, Err(DecodeError::UnknownTag { tag: b'X', .. })));
        assert_eq!(reader.next().await.unwrap().unwrap().timestamp, 2);
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_streams_and_reports_truncation() {
        let mut bytes = encode_all(&(0..2000).map(snapshot).collect::<Vec<_>>()).await;
        bytes.truncate(bytes.len() - 3);

        let mut reader = StatReader::new(bytes.as_slice());
        let mut count = 0u64;
        while let Some(s) = reader.next().await.unwrap() {
            assert_eq!(s.timestamp, count);
            count += 1;
        }
        assert_eq!(count, 1999);
        assert_eq!(reader.truncated_bytes(), RECORD_SIZE - 3);
    }
}
