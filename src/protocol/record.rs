//! Record framing.
//!
//! Every unit on a FastCGI connection is a record: a fixed 8-byte header,
//! `content_length` bytes of content and `padding_length` bytes of padding.
//! The header is (de)serialized with `bincode` configured for big-endian,
//! fixed-width integers, which lays the [`Header`] struct out exactly as the
//! wire format expects.
//!
//! ```text
//! +---------+------+------------+----------------+----------------+----------+
//! | version | type | request id | content length | padding length | reserved |
//! |   u8    |  u8  |   u16 BE   |     u16 BE     |       u8       |    u8    |
//! +---------+------+------------+----------------+----------------+----------+
//! ```
//!
//! Content longer than [`MAX_CONTENT_LEN`] is split into consecutive records
//! of the same type and request id by [`encode_record`].
use std::{
    fmt,
    io::{self, Read, Write},
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice, encode_into_slice,
};
use log::trace;

use super::{ConnectionError, ProtocolError};

/// The only protocol version this engine speaks.
pub const VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;
/// Request id reserved for connection management records.
pub const MANAGEMENT_ID: u16 = 0;

const ALIGNMENT: usize = 8;

pub(crate) fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    /// A type code this engine does not understand; kept so it can be
    /// reported back to the peer.
    Unknown(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            code => RecordType::Unknown(code),
        }
    }
}

impl From<RecordType> for u8 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Unknown(code) => code,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Unknown(code) => write!(f, "Unknown({code})"),
            kind => write!(f, "{kind:?}"),
        }
    }
}

/// Fixed-size record header as laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Header {
    pub version: u8,
    pub kind: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
    pub reserved: u8,
}

impl Header {
    /// Builds a header whose padding rounds the whole frame up to the
    /// 8-byte alignment.
    pub fn new(kind: RecordType, request_id: u16, content_length: u16) -> Self {
        let padding = (ALIGNMENT - (content_length as usize % ALIGNMENT)) % ALIGNMENT;
        Self {
            version: VERSION_1,
            kind: kind.into(),
            request_id,
            content_length,
            padding_length: padding as u8,
            reserved: 0,
        }
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let (header, _): (Header, usize) = decode_from_slice(bytes, wire_config())?;
        if header.version != VERSION_1 {
            return Err(ProtocolError::BadVersion(header.version));
        }
        Ok(header)
    }

    pub fn encode(&self) -> Result<[u8; HEADER_LEN], bincode::error::EncodeError> {
        let mut out = [0u8; HEADER_LEN];
        encode_into_slice(*self, &mut out, wire_config())?;
        Ok(out)
    }

    pub fn record_type(&self) -> RecordType {
        self.kind.into()
    }
}

/// One decoded record; padding has already been discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordType,
    pub request_id: u16,
    pub content: Vec<u8>,
}

impl Record {
    pub fn new(kind: RecordType, request_id: u16, content: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            request_id,
            content: content.into(),
        }
    }

    /// Zero-length record closing the `kind` stream of a request.
    pub fn end_of_stream(kind: RecordType, request_id: u16) -> Self {
        Self::new(kind, request_id, Vec::new())
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.content.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        encode_record(self.kind, self.request_id, &self.content)
    }
}

/// Frames `content` as one or more records of `kind`. Content above
/// [`MAX_CONTENT_LEN`] is split; empty content yields a single
/// zero-length record.
pub fn encode_record(
    kind: RecordType,
    request_id: u16,
    content: &[u8],
) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let mut out = Vec::with_capacity(content.len() + HEADER_LEN + ALIGNMENT);
    if content.is_empty() {
        push_frame(&mut out, kind, request_id, &[])?;
        return Ok(out);
    }
    for chunk in content.chunks(MAX_CONTENT_LEN) {
        push_frame(&mut out, kind, request_id, chunk)?;
    }
    Ok(out)
}

fn push_frame(
    out: &mut Vec<u8>,
    kind: RecordType,
    request_id: u16,
    chunk: &[u8],
) -> Result<(), bincode::error::EncodeError> {
    let header = Header::new(kind, request_id, chunk.len() as u16);
    out.extend_from_slice(&header.encode()?);
    out.extend_from_slice(chunk);
    out.resize(out.len() + header.padding_length as usize, 0);
    Ok(())
}

/// Frames a whole output stream: `data` split into records, followed by the
/// zero-length end marker.
pub fn stream_records(kind: RecordType, request_id: u16, data: &[u8]) -> Vec<Record> {
    let mut records = data
        .chunks(MAX_CONTENT_LEN)
        .map(|chunk| Record::new(kind, request_id, chunk))
        .collect::<Vec<_>>();
    records.push(Record::end_of_stream(kind, request_id));
    records
}

/// Reads `content_length` bytes of content and discards `padding_length`
/// bytes of padding.
pub fn read_body<R: Read>(
    reader: &mut R,
    content_length: u16,
    padding_length: u8,
) -> Result<Vec<u8>, ConnectionError> {
    let mut content = vec![0u8; content_length as usize];
    let read = fill(reader, &mut content)?;
    if read < content.len() {
        return Err(ProtocolError::Truncated {
            expected: content.len(),
            read,
        }
        .into());
    }

    let mut padding = [0u8; u8::MAX as usize];
    let padding = &mut padding[..padding_length as usize];
    let read = fill(reader, padding)?;
    if read < padding.len() {
        return Err(ProtocolError::Truncated {
            expected: padding.len(),
            read,
        }
        .into());
    }
    Ok(content)
}

/// Reads the next record. `Ok(None)` means the peer closed the stream
/// cleanly on a record boundary.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>, ConnectionError> {
    let mut bytes = [0u8; HEADER_LEN];
    match fill(reader, &mut bytes)? {
        0 => return Ok(None),
        HEADER_LEN => {}
        read => {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN,
                read,
            }
            .into());
        }
    }

    let header = Header::decode(&bytes)?;
    let content = read_body(reader, header.content_length, header.padding_length)?;
    let record = Record::new(header.record_type(), header.request_id, content);
    trace!(
        "read {} record for request {} ({} bytes)",
        record.kind,
        record.request_id,
        record.content.len()
    );
    Ok(Some(record))
}

pub fn write_record<W: Write>(writer: &mut W, record: &Record) -> Result<(), ConnectionError> {
    let bytes = record.encode()?;
    writer.write_all(&bytes)?;
    trace!(
        "wrote {} record for request {} ({} bytes)",
        record.kind,
        record.request_id,
        record.content.len()
    );
    Ok(())
}

/// Reads until `buf` is full or the stream ends, returning the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let header = Header::new(RecordType::Stdout, 0x0102, 0x0304);
        let bytes = header.encode().unwrap();

        assert_eq!(bytes, [1, 6, 0x01, 0x02, 0x03, 0x04, 4, 0]);
        assert_eq!(Header::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn header_rejects_foreign_version() {
        let bytes = [2, 1, 0, 1, 0, 8, 0, 0];
        let err = Header::decode(&bytes).unwrap_err();

        assert!(matches!(err, ProtocolError::BadVersion(2)));
    }

    #[test]
    fn record_round_trip() {
        let lengths = (0..=9).chain([MAX_CONTENT_LEN, MAX_CONTENT_LEN + 1]);
        for len in lengths {
            for (kind, id) in [
                (RecordType::Params, 1),
                (RecordType::Stdout, 0x0102),
                (RecordType::Unknown(200), u16::MAX),
            ] {
                let content = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
                let bytes = encode_record(kind, id, &content).unwrap();
                assert_eq!(bytes.len() % ALIGNMENT, 0, "length {len}");

                let mut cursor = Cursor::new(bytes);
                let mut decoded = Vec::new();
                while let Some(record) = read_record(&mut cursor).unwrap() {
                    assert_eq!((record.kind, record.request_id), (kind, id));
                    assert!(record.content.len() <= MAX_CONTENT_LEN);
                    decoded.push(record);
                }

                let frames = len.div_ceil(MAX_CONTENT_LEN).max(1);
                assert_eq!(decoded.len(), frames, "length {len}");
                assert_eq!(
                    decoded.into_iter().flat_map(|r| r.content).collect::<Vec<_>>(),
                    content,
                    "length {len}"
                );
            }
        }
    }

    #[test]
    fn padding_covers_every_remainder() {
        for len in 0..16u16 {
            let header = Header::new(RecordType::Stdin, 1, len);
            let total = HEADER_LEN + len as usize + header.padding_length as usize;

            assert!(header.padding_length < ALIGNMENT as u8);
            assert_eq!(total % ALIGNMENT, 0, "length {len}");
        }
    }

    #[test]
    fn empty_record_has_no_padding() {
        let bytes = encode_record(RecordType::Stdin, 3, &[]).unwrap();
        assert_eq!(bytes, vec![1, 5, 0, 3, 0, 0, 0, 0]);
    }

    #[test]
    fn oversized_content_is_split() {
        let content = vec![0xAB; MAX_CONTENT_LEN + 10];
        let bytes = encode_record(RecordType::Stdout, 1, &content).unwrap();
        let mut cursor = Cursor::new(bytes);

        let first = read_record(&mut cursor).unwrap().unwrap();
        let second = read_record(&mut cursor).unwrap().unwrap();
        assert!(read_record(&mut cursor).unwrap().is_none());

        assert_eq!(first.content.len(), MAX_CONTENT_LEN);
        assert_eq!(second.content.len(), 10);
        assert_eq!([first.content, second.content].concat(), content);
    }

    #[test]
    fn stream_records_end_with_marker() {
        let records = stream_records(RecordType::Stdout, 4, b"hit");

        assert_eq!(
            records,
            vec![
                Record::new(RecordType::Stdout, 4, b"hit".to_vec()),
                Record::end_of_stream(RecordType::Stdout, 4),
            ]
        );
        assert_eq!(stream_records(RecordType::Stderr, 4, b"").len(), 1);
    }

    #[test]
    fn accepts_arbitrary_padding_from_peer() {
        let mut bytes = vec![1, 5, 0, 9, 0, 2, 13, 0];
        bytes.extend_from_slice(b"ok");
        bytes.extend_from_slice(&[0xFF; 13]);
        bytes.extend_from_slice(&[1, 5, 0, 9, 0, 0, 0, 0]);
        let mut cursor = Cursor::new(bytes);

        let first = read_record(&mut cursor).unwrap().unwrap();
        let second = read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(first.content, b"ok");
        assert!(second.is_end_of_stream());
        assert_eq!(second.request_id, 9);
    }

    #[test]
    fn clean_eof_yields_none() {
        assert!(read_record(&mut Cursor::new(Vec::new())).unwrap().is_none());
    }

    #[test]
    fn truncated_body_is_a_protocol_error() {
        let mut bytes = vec![1, 4, 0, 1, 0, 10, 0, 0];
        bytes.extend_from_slice(b"abc");

        let err = read_record(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::Truncated {
                expected: 10,
                read: 3
            })
        ));
    }

    #[test]
    fn truncated_header_is_a_protocol_error() {
        let err = read_record(&mut Cursor::new(vec![1, 4, 0])).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::Truncated { expected: 8, read: 3 })
        ));
    }

    #[test]
    fn unknown_type_codes_survive() {
        assert_eq!(RecordType::from(42), RecordType::Unknown(42));
        assert_eq!(u8::from(RecordType::Unknown(42)), 42);
        assert_eq!(RecordType::from(u8::from(RecordType::GetValues)), RecordType::GetValues);
    }
}
