//! Split wire format
//!
//! Records are framed by a one-byte tag. All integers are big-endian.
//!
//! ```text
//! field switch   0x01 | type u8 (0 int, 1 string) | name_len u32 | name
//! int term       0x02 | term i64 | doc_freq u64
//! bytes term     0x03 | len u32 | bytes | doc_freq u64
//! group          0x04 | group u32 | stat i64 × num_stats
//! ```
//!
//! The stream ends when the transport reaches EOF on a record boundary.
//! `num_stats` and `num_groups` travel out of band.

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};

use bytes::{BufMut, BytesMut};

use super::FtgsIterator;
use crate::error::{Error, Result};
use crate::types::{DocFreq, Field, FieldType, GroupId, TermRef};

const TAG_FIELD: u8 = 0x01;
const TAG_INT_TERM: u8 = 0x02;
const TAG_BYTES_TERM: u8 = 0x03;
const TAG_GROUP: u8 = 0x04;

/// Encoder buffer is drained to the sink once it grows past this
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Upper bound on a single name or term length accepted by the decoder
const MAX_BYTES_LEN: usize = 64 * 1024 * 1024;

// ============================================================================
// FtgsSink
// ============================================================================

/// Transport endpoint an FTGS stream is written into
///
/// `close` ends the stream for the peer. The default only flushes.
pub trait FtgsSink: Write + Send {
    /// Flush and end the stream
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl FtgsSink for Vec<u8> {}

impl FtgsSink for std::fs::File {
    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_data()
    }
}

impl FtgsSink for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.shutdown(Shutdown::Write)
    }
}

impl<S: FtgsSink + ?Sized> FtgsSink for Box<S> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl<S: FtgsSink + ?Sized> FtgsSink for &mut S {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

// ============================================================================
// FtgsWriter
// ============================================================================

/// Streaming FTGS encoder
pub struct FtgsWriter<W: FtgsSink> {
    sink: W,
    buf: BytesMut,
    num_stats: usize,
    closed: bool,
}

impl<W: FtgsSink> FtgsWriter<W> {
    /// Create an encoder for groups carrying `num_stats` values
    pub fn new(sink: W, num_stats: usize) -> Self {
        Self {
            sink,
            buf: BytesMut::with_capacity(FLUSH_THRESHOLD),
            num_stats,
            closed: false,
        }
    }

    /// Stats per group
    pub fn num_stats(&self) -> usize {
        self.num_stats
    }

    /// Start a new field
    pub fn switch_field(&mut self, field: &Field) -> Result<()> {
        self.check_open()?;
        let name = field.name.as_bytes();
        self.buf.put_u8(TAG_FIELD);
        self.buf.put_u8(field.field_type.wire_flag());
        self.buf.put_u32(name.len() as u32);
        self.buf.put_slice(name);
        self.maybe_drain()
    }

    /// Start a new integer term
    pub fn switch_int_term(&mut self, term: i64, doc_freq: DocFreq) -> Result<()> {
        self.check_open()?;
        self.buf.put_u8(TAG_INT_TERM);
        self.buf.put_i64(term);
        self.buf.put_u64(doc_freq);
        self.maybe_drain()
    }

    /// Start a new byte-string term
    pub fn switch_bytes_term(&mut self, term: &[u8], doc_freq: DocFreq) -> Result<()> {
        self.check_open()?;
        self.buf.put_u8(TAG_BYTES_TERM);
        self.buf.put_u32(term.len() as u32);
        self.buf.put_slice(term);
        self.buf.put_u64(doc_freq);
        self.maybe_drain()
    }

    /// Start a new term of either type
    pub fn switch_term(&mut self, term: TermRef<'_>, doc_freq: DocFreq) -> Result<()> {
        match term {
            TermRef::Int(v) => self.switch_int_term(v, doc_freq),
            TermRef::Bytes(b) => self.switch_bytes_term(b, doc_freq),
        }
    }

    /// Emit one group of the current term with its stats
    pub fn write_group(&mut self, group: GroupId, stats: &[i64]) -> Result<()> {
        self.check_open()?;
        if stats.len() != self.num_stats {
            return Err(Error::InvalidArgument(format!(
                "group {} carries {} stats, stream expects {}",
                group,
                stats.len(),
                self.num_stats
            )));
        }
        self.buf.put_u8(TAG_GROUP);
        self.buf.put_u32(group);
        for &stat in stats {
            self.buf.put_i64(stat);
        }
        self.maybe_drain()
    }

    /// Copy the current term of `input` with all of its groups
    pub fn copy_term<I: FtgsIterator + ?Sized>(
        &mut self,
        input: &mut I,
        stats: &mut [i64],
    ) -> Result<()> {
        self.switch_term(input.term(), input.term_doc_freq())?;
        while input.next_group()? {
            input.group_stats(stats);
            self.write_group(input.group(), stats)?;
        }
        Ok(())
    }

    /// Push buffered records to the sink and flush it
    pub fn flush(&mut self) -> Result<()> {
        self.drain()?;
        self.sink.flush()?;
        Ok(())
    }

    /// Flush and close the sink. Later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let drained = self.drain();
        let closed = self.sink.close().map_err(Error::from);
        drained.and(closed)
    }

    /// Close the sink without draining buffered records
    pub fn abort(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buf.clear();
        self.sink.close()?;
        Ok(())
    }

    /// Recover the sink
    pub fn into_inner(self) -> W {
        self.sink
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("FTGS writer".to_string()));
        }
        Ok(())
    }

    fn maybe_drain(&mut self) -> Result<()> {
        if self.buf.len() >= FLUSH_THRESHOLD {
            self.drain()?;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let result = self.sink.write_all(&self.buf);
            self.buf.clear();
            result?;
        }
        Ok(())
    }
}

// ============================================================================
// FtgsReader
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Field,
    Term,
    Eof,
}

/// Header decoded ahead of the caller
#[derive(Debug)]
struct Staged {
    field: Field,
    int_term: i64,
    bytes_term: Vec<u8>,
    doc_freq: DocFreq,
}

/// Streaming FTGS decoder
///
/// Implements [`FtgsIterator`] over any byte source. A term or field record
/// that ends a group run is decoded into a staging slot and held back; the
/// current field and term only change when the caller advances that level.
pub struct FtgsReader<R: Read> {
    input: BufReader<R>,
    num_stats: usize,
    num_groups: u32,
    field: Field,
    int_term: i64,
    bytes_term: Vec<u8>,
    doc_freq: DocFreq,
    group: GroupId,
    stats: Vec<i64>,
    staged: Staged,
    pending: Pending,
}

impl<R: Read> std::fmt::Debug for FtgsReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtgsReader")
            .field("num_stats", &self.num_stats)
            .field("num_groups", &self.num_groups)
            .field("field", &self.field)
            .field("pending", &self.pending)
            .finish()
    }
}

impl<R: Read + Send> FtgsReader<R> {
    /// Create a decoder; stream shape is agreed out of band
    pub fn new(input: R, num_stats: usize, num_groups: u32) -> Self {
        Self {
            input: BufReader::new(input),
            num_stats,
            num_groups,
            field: Field::int(""),
            int_term: 0,
            bytes_term: Vec::new(),
            doc_freq: 0,
            group: 0,
            stats: vec![0; num_stats],
            staged: Staged {
                field: Field::int(""),
                int_term: 0,
                bytes_term: Vec::new(),
                doc_freq: 0,
            },
            pending: Pending::None,
        }
    }

    fn commit_field(&mut self) {
        self.field.clone_from(&self.staged.field);
    }

    fn commit_term(&mut self) {
        self.int_term = self.staged.int_term;
        self.bytes_term.clear();
        self.bytes_term.extend_from_slice(&self.staged.bytes_term);
        self.doc_freq = self.staged.doc_freq;
    }

    /// Read the next record header and its payload.
    ///
    /// Returns the kind that was decoded; group payloads land in
    /// `group`/`stats`, field and term payloads in the staging slot.
    fn read_record(&mut self) -> Result<Pending> {
        let mut tag = [0u8; 1];
        loop {
            match self.input.read(&mut tag) {
                Ok(0) => return Ok(Pending::Eof),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        match tag[0] {
            TAG_FIELD => {
                let flag = self.read_u8()?;
                let field_type = FieldType::from_wire_flag(flag)
                    .ok_or_else(|| Error::Corrupt(format!("unknown field type flag {}", flag)))?;
                let len = self.read_len()?;
                let mut name = vec![0u8; len];
                self.read_exact(&mut name)?;
                let name = String::from_utf8(name)
                    .map_err(|e| Error::Corrupt(format!("field name is not UTF-8: {}", e)))?;
                self.staged.field = Field::new(name, field_type);
                Ok(Pending::Field)
            }
            TAG_INT_TERM => {
                self.expect_field_type(FieldType::Int)?;
                self.staged.int_term = self.read_u64()? as i64;
                self.staged.doc_freq = self.read_u64()?;
                Ok(Pending::Term)
            }
            TAG_BYTES_TERM => {
                self.expect_field_type(FieldType::String)?;
                let len = self.read_len()?;
                let mut term = std::mem::take(&mut self.staged.bytes_term);
                term.resize(len, 0);
                let read = self.read_exact(&mut term);
                self.staged.bytes_term = term;
                read?;
                self.staged.doc_freq = self.read_u64()?;
                Ok(Pending::Term)
            }
            TAG_GROUP => {
                self.group = self.read_u32()?;
                if self.group >= self.num_groups {
                    return Err(Error::Corrupt(format!(
                        "group {} outside [0, {})",
                        self.group, self.num_groups
                    )));
                }
                for i in 0..self.num_stats {
                    self.stats[i] = self.read_u64()? as i64;
                }
                // Group records are only meaningful inside a term
                Ok(Pending::None)
            }
            other => Err(Error::Corrupt(format!("unknown record tag 0x{:02x}", other))),
        }
    }

    fn expect_field_type(&self, expected: FieldType) -> Result<()> {
        if self.staged.field.field_type != expected {
            return Err(Error::Corrupt(format!(
                "{} term inside {} field",
                expected, self.staged.field
            )));
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.input.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::Corrupt("stream truncated inside a record".to_string())
            } else {
                Error::Io(e)
            }
        })
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    fn read_len(&mut self) -> Result<usize> {
        let len = self.read_u32()? as usize;
        if len > MAX_BYTES_LEN {
            return Err(Error::Corrupt(format!("length {} exceeds limit", len)));
        }
        Ok(len)
    }

    fn take_pending(&mut self) -> Result<Pending> {
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::None => self.read_record(),
            held => Ok(held),
        }
    }
}

impl<R: Read + Send> FtgsIterator for FtgsReader<R> {
    fn num_stats(&self) -> usize {
        self.num_stats
    }

    fn num_groups(&self) -> u32 {
        self.num_groups
    }

    fn next_field(&mut self) -> Result<bool> {
        loop {
            match self.take_pending()? {
                Pending::Field => {
                    self.commit_field();
                    return Ok(true);
                }
                Pending::Eof => {
                    self.pending = Pending::Eof;
                    return Ok(false);
                }
                Pending::Term | Pending::None => continue,
            }
        }
    }

    fn field(&self) -> &Field {
        &self.field
    }

    fn next_term(&mut self) -> Result<bool> {
        loop {
            match self.take_pending()? {
                Pending::Term => {
                    self.commit_term();
                    return Ok(true);
                }
                Pending::None => continue,
                held @ (Pending::Field | Pending::Eof) => {
                    self.pending = held;
                    return Ok(false);
                }
            }
        }
    }

    fn term(&self) -> TermRef<'_> {
        match self.field.field_type {
            FieldType::Int => TermRef::Int(self.int_term),
            FieldType::String => TermRef::Bytes(&self.bytes_term),
        }
    }

    fn term_doc_freq(&self) -> DocFreq {
        self.doc_freq
    }

    fn next_group(&mut self) -> Result<bool> {
        match self.take_pending()? {
            Pending::None => Ok(true),
            held => {
                self.pending = held;
                Ok(false)
            }
        }
    }

    fn group(&self) -> GroupId {
        self.group
    }

    fn group_stats(&self, stats: &mut [i64]) {
        stats.copy_from_slice(&self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftgs::{collect_ftgs, FtgsField, FtgsGroup, FtgsTerm};
    use crate::types::Term;

    fn encode_sample() -> Vec<u8> {
        let mut writer = FtgsWriter::new(Vec::new(), 2);
        writer.switch_field(&Field::int("price")).unwrap();
        writer.switch_int_term(-5, 3).unwrap();
        writer.write_group(1, &[10, 20]).unwrap();
        writer.write_group(3, &[-1, 0]).unwrap();
        writer.switch_int_term(8, 1).unwrap();
        writer.switch_field(&Field::string("country")).unwrap();
        writer.switch_bytes_term(b"us", 7).unwrap();
        writer.write_group(2, &[1, 1]).unwrap();
        writer.flush().unwrap();
        writer.into_inner()
    }

    #[test]
    fn test_field_record_layout() {
        let mut writer = FtgsWriter::new(Vec::new(), 0);
        writer.switch_field(&Field::string("ab")).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.into_inner(), vec![0x01, 1, 0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_decode_nested_stream() {
        let bytes = encode_sample();
        let mut reader = FtgsReader::new(bytes.as_slice(), 2, 4);
        let fields = collect_ftgs(&mut reader).unwrap();

        assert_eq!(
            fields,
            vec![
                FtgsField {
                    field: Field::int("price"),
                    terms: vec![
                        FtgsTerm {
                            term: Term::Int(-5),
                            doc_freq: 3,
                            groups: vec![
                                FtgsGroup::new(1, vec![10, 20]),
                                FtgsGroup::new(3, vec![-1, 0]),
                            ],
                        },
                        FtgsTerm {
                            term: Term::Int(8),
                            doc_freq: 1,
                            groups: vec![],
                        },
                    ],
                },
                FtgsField {
                    field: Field::string("country"),
                    terms: vec![FtgsTerm {
                        term: Term::from("us"),
                        doc_freq: 7,
                        groups: vec![FtgsGroup::new(2, vec![1, 1])],
                    }],
                },
            ]
        );
    }

    #[test]
    fn test_skip_levels() {
        let bytes = encode_sample();
        let mut reader = FtgsReader::new(bytes.as_slice(), 2, 4);

        // Skip every term of the first field without reading groups
        assert!(reader.next_field().unwrap());
        assert!(reader.next_field().unwrap());
        assert_eq!(reader.field(), &Field::string("country"));
        assert!(reader.next_term().unwrap());
        assert_eq!(reader.term(), TermRef::Bytes(b"us"));
        assert!(!reader.next_field().unwrap());
        assert!(!reader.next_field().unwrap());
    }

    #[test]
    fn test_current_level_survives_read_ahead() {
        let mut writer = FtgsWriter::new(Vec::new(), 1);
        writer.switch_field(&Field::int("price")).unwrap();
        writer.switch_int_term(5, 3).unwrap();
        writer.write_group(1, &[7]).unwrap();
        writer.switch_int_term(9, 4).unwrap();
        writer.write_group(2, &[8]).unwrap();
        writer.switch_field(&Field::string("country")).unwrap();
        writer.switch_bytes_term(b"de", 1).unwrap();
        writer.flush().unwrap();
        let bytes = writer.into_inner();

        let mut reader = FtgsReader::new(bytes.as_slice(), 1, 3);
        assert!(reader.next_field().unwrap());
        assert!(reader.next_term().unwrap());
        assert!(reader.next_group().unwrap());
        // The next term header has been decoded but not entered
        assert!(!reader.next_group().unwrap());
        assert_eq!(reader.term(), TermRef::Int(5));
        assert_eq!(reader.term_doc_freq(), 3);
        assert_eq!(reader.field(), &Field::int("price"));

        assert!(reader.next_term().unwrap());
        assert_eq!(reader.term(), TermRef::Int(9));
        assert!(reader.next_group().unwrap());
        assert!(!reader.next_group().unwrap());
        assert!(!reader.next_term().unwrap());
        assert_eq!(reader.field(), &Field::int("price"));
        assert_eq!(reader.term(), TermRef::Int(9));
        assert_eq!(reader.term_doc_freq(), 4);

        assert!(reader.next_field().unwrap());
        assert_eq!(reader.field(), &Field::string("country"));
        assert!(reader.next_term().unwrap());
        assert_eq!(reader.term(), TermRef::Bytes(b"de"));
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let mut bytes = encode_sample();
        bytes.truncate(bytes.len() - 3);
        let mut reader = FtgsReader::new(bytes.as_slice(), 2, 4);
        let err = collect_ftgs(&mut reader).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_group_out_of_range_is_corrupt() {
        let bytes = encode_sample();
        let mut reader = FtgsReader::new(bytes.as_slice(), 2, 2);
        assert!(matches!(collect_ftgs(&mut reader), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_wrong_stat_count_rejected() {
        let mut writer = FtgsWriter::new(Vec::new(), 2);
        writer.switch_field(&Field::int("f")).unwrap();
        writer.switch_int_term(1, 1).unwrap();
        assert!(writer.write_group(1, &[1]).is_err());
    }

    #[test]
    fn test_write_after_close() {
        let mut writer = FtgsWriter::new(Vec::new(), 0);
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.switch_field(&Field::int("f")),
            Err(Error::Closed(_))
        ));
    }
}
