//! Typed server packages and the incremental package stream
use bytes::{Buf, Bytes, BytesMut};

use crate::{
    connection::{ConnectionErrorContent, ConnectionResult, WithLoc},
    package_parser::PackageParser,
    row::Field,
};

/// The greeting sent by the server when the connection is established
#[derive(Debug)]
pub struct Greeting {
    /// Handshake protocol version, we only speak version 10
    pub protocol_version: u8,
    /// Human readable server version string
    pub server_version: String,
    /// Id of the server thread serving this connection
    pub thread_id: u32,
    /// The 20 byte authentication scramble, both 8 and 12 byte parts
    pub scramble: Vec<u8>,
    /// Lower 16 capability bits announced by the server
    pub capabilities: u16,
    /// Default collation of the server
    pub language: u8,
    /// Server status flags
    pub status: u16,
}

/// An OK package ending a handshake or a rowless statement
#[derive(Debug)]
pub struct OkPackage {
    /// Number of rows affected by the statement
    pub affected_rows: u64,
    /// Id of the last inserted row
    pub last_insert_id: u64,
    /// Server status flags, see [crate::constants::server_status]
    pub server_status: u16,
    /// Number of warnings produced by the statement
    pub warnings: u16,
    /// Human readable info message
    pub message: String,
}

/// An error package
#[derive(Debug)]
pub struct ErrPackage {
    /// 2-byte mysql error code
    pub code: u16,
    /// 5-byte sql state, absent in pre-4.1 style errors
    pub sql_state: Option<String>,
    /// Error message
    pub message: String,
}

/// An EOF package ending the field or row phase of a result set
#[derive(Debug)]
pub struct EofPackage {
    /// Number of warnings produced so far
    pub warnings: u16,
    /// Server status flags, see [crate::constants::server_status]
    pub server_status: u16,
}

/// One complete package received from the server
#[derive(Debug)]
pub enum Package {
    /// The initial server greeting
    Greeting(Greeting),
    /// Handshake accepted or rowless statement outcome
    Ok(OkPackage),
    /// The server reported an error
    Error(ErrPackage),
    /// The server wants the pre-4.1 password scramble instead
    UseOldPassword,
    /// A result set follows with this many columns
    ResultSetHeader {
        /// Number of field packages that will follow
        field_count: u64,
    },
    /// One column definition of the current result set
    Field(Field),
    /// End of the field or row phase
    Eof(EofPackage),
    /// One row of values, NULL encoded as [None], in declared column order
    Row(Vec<Option<Bytes>>),
}

/// Which kind of package the stream expects next
#[derive(Clone, Copy)]
enum Phase {
    /// Waiting for the server greeting
    Greeting,
    /// Between statements, or waiting for the handshake outcome
    Command,
    /// Inside a result set, receiving field packages
    Fields,
    /// Inside a result set, receiving row packages
    Rows,
    /// A protocol error occurred, the stream is unusable
    Broken,
}

/// Incremental parser turning raw socket bytes into [Package] values
///
/// Bytes are appended with [Self::feed] in chunks of any size, single bytes
/// included; [Self::try_next] pops complete packages in order. The emitted
/// sequence only depends on the byte stream, never on how it was chunked.
///
/// The stream owns the protocol phase flags: whether the greeting has been
/// seen, whether the first OK has arrived (before that a lone `0xFE` means
/// the old password protocol, after it means EOF), and whether a result set
/// is in its field or row phase. Any package that does not fit the current
/// phase is a fatal protocol error; there is no resynchronization.
pub struct PackageStream {
    /// Bytes received but not yet parsed
    buff: BytesMut,
    /// The kind of package expected next
    phase: Phase,
    /// True once the first OK package has been seen
    authenticated: bool,
    /// Number of columns in the current result set
    field_count: usize,
    /// Sequence number of the most recently popped package
    last_seq: u8,
}

impl PackageStream {
    /// Construct a stream expecting the server greeting
    pub fn new() -> Self {
        PackageStream {
            buff: BytesMut::with_capacity(1234),
            phase: Phase::Greeting,
            authenticated: false,
            field_count: 0,
            last_seq: 0,
        }
    }

    /// Append one chunk of socket data
    pub fn feed(&mut self, data: &[u8]) {
        self.buff.extend_from_slice(data);
    }

    /// The receive buffer, for reading socket data directly into the stream
    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buff
    }

    /// Sequence number of the most recently popped package
    pub fn last_sequence(&self) -> u8 {
        self.last_seq
    }

    /// Pop the next complete package, or None if more bytes are needed
    pub fn try_next(&mut self) -> ConnectionResult<Option<Package>> {
        let Some(payload) = self.take_frame()? else {
            return Ok(None);
        };
        match self.classify(payload) {
            Ok(package) => Ok(Some(package)),
            Err(e) => {
                self.phase = Phase::Broken;
                Err(e)
            }
        }
    }

    /// Pop the next complete package payload without classifying it
    ///
    /// Used for the one command whose response is a bare string
    /// (COM_STATISTICS) and therefore has no package type byte.
    pub fn try_next_raw(&mut self) -> ConnectionResult<Option<Bytes>> {
        self.take_frame()
    }

    /// Split the next complete framed payload off the buffer
    fn take_frame(&mut self) -> ConnectionResult<Option<Bytes>> {
        if matches!(self.phase, Phase::Broken) {
            return Err(ConnectionErrorContent::ProtocolError(
                "previous protocol error reported".to_string(),
            )
            .into());
        }
        if self.buff.len() < 4 {
            return Ok(None);
        }
        let header = u32::from_le_bytes(self.buff[..4].try_into().unwrap());
        let len: usize = (header & 0xFFFFFF).try_into().unwrap();
        if len == 0xFFFFFF {
            self.phase = Phase::Broken;
            return Err(ConnectionErrorContent::ProtocolError(
                "Extended packages not supported".to_string(),
            )
            .into());
        }
        if self.buff.len() < 4 + len {
            return Ok(None);
        }
        self.buff.advance(4);
        self.last_seq = (header >> 24) as u8;
        Ok(Some(self.buff.split_to(len).freeze()))
    }

    /// Decode one payload according to the current phase
    fn classify(&mut self, payload: Bytes) -> ConnectionResult<Package> {
        let first = *payload.first().ok_or_else(|| {
            ConnectionErrorContent::ProtocolError("empty package".to_string())
        })?;
        match self.phase {
            Phase::Greeting => {
                self.phase = Phase::Command;
                if first == 0xFF {
                    // The server can refuse the connection before greeting us
                    Ok(Package::Error(parse_err(&payload)?))
                } else {
                    Ok(Package::Greeting(parse_greeting(&payload)?))
                }
            }
            Phase::Command => match first {
                0xFF => Ok(Package::Error(parse_err(&payload)?)),
                0x00 => {
                    self.authenticated = true;
                    Ok(Package::Ok(parse_ok(&payload)?))
                }
                0xFE if !self.authenticated => {
                    if payload.len() == 1 {
                        Ok(Package::UseOldPassword)
                    } else {
                        Err(ConnectionErrorContent::ProtocolError(
                            "unsupported authentication switch request".to_string(),
                        )
                        .into())
                    }
                }
                0xFB => Err(ConnectionErrorContent::ProtocolError(
                    "LOCAL INFILE requests are not supported".to_string(),
                )
                .into()),
                _ => {
                    let mut p = PackageParser::new(&payload);
                    let field_count = p.get_lenenc().loc("field count")?;
                    self.field_count = field_count.try_into().map_err(|_| {
                        ConnectionErrorContent::ProtocolError(format!(
                            "unsupported field count {field_count}"
                        ))
                    })?;
                    self.phase = Phase::Fields;
                    Ok(Package::ResultSetHeader { field_count })
                }
            },
            Phase::Fields => {
                if first == 0xFE && payload.len() < 9 {
                    self.phase = Phase::Rows;
                    Ok(Package::Eof(parse_eof(&payload)?))
                } else if first == 0xFF {
                    self.phase = Phase::Command;
                    Ok(Package::Error(parse_err(&payload)?))
                } else {
                    Ok(Package::Field(parse_field(&payload)?))
                }
            }
            Phase::Rows => {
                if first == 0xFE && payload.len() < 9 {
                    self.phase = Phase::Command;
                    Ok(Package::Eof(parse_eof(&payload)?))
                } else if first == 0xFF {
                    self.phase = Phase::Command;
                    Ok(Package::Error(parse_err(&payload)?))
                } else {
                    Ok(Package::Row(parse_row(&payload, self.field_count)?))
                }
            }
            Phase::Broken => unreachable!("take_frame rejects a broken stream"),
        }
    }
}

impl Default for PackageStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a greeting payload
fn parse_greeting(payload: &[u8]) -> ConnectionResult<Greeting> {
    let mut p = PackageParser::new(payload);
    let protocol_version = p.get_u8().loc("protocol version")?;
    let server_version = p.get_null_str().loc("server version")?.to_string();
    let thread_id = p.get_u32().loc("thread id")?;
    let mut scramble = p.get_bytes(8).loc("scramble part 1")?.to_vec();
    p.get_u8().loc("scramble filler")?;
    let capabilities = p.get_u16().loc("capability flags")?;
    let language = p.get_u8().loc("language")?;
    let status = p.get_u16().loc("status flags")?;
    p.get_bytes(13).loc("greeting filler")?;
    scramble.extend_from_slice(p.get_bytes(12).loc("scramble part 2")?);
    Ok(Greeting {
        protocol_version,
        server_version,
        thread_id,
        scramble,
        capabilities,
        language,
        status,
    })
}

/// Parse an OK payload, the leading 0x00 included
fn parse_ok(payload: &[u8]) -> ConnectionResult<OkPackage> {
    let mut p = PackageParser::new(payload);
    p.get_u8().loc("ok header")?;
    let affected_rows = p.get_lenenc().loc("affected rows")?;
    let last_insert_id = p.get_lenenc().loc("last insert id")?;
    // Pre-4.1 servers end the package here
    let server_status = if p.remaining() >= 2 {
        p.get_u16().loc("server status")?
    } else {
        0
    };
    let warnings = if p.remaining() >= 2 {
        p.get_u16().loc("warnings")?
    } else {
        0
    };
    let message = String::from_utf8_lossy(p.get_bytes(p.remaining()).loc("message")?).into_owned();
    Ok(OkPackage {
        affected_rows,
        last_insert_id,
        server_status,
        warnings,
        message,
    })
}

/// Parse an error payload, the leading 0xFF included
fn parse_err(payload: &[u8]) -> ConnectionResult<ErrPackage> {
    let mut p = PackageParser::new(payload);
    p.get_u8().loc("error header")?;
    let code = p.get_u16().loc("error code")?;
    let sql_state = if p.peek_u8() == Some(b'#') {
        p.get_u8().loc("sharp")?;
        Some(
            String::from_utf8_lossy(p.get_bytes(5).loc("sql state")?).into_owned(),
        )
    } else {
        None
    };
    let message = String::from_utf8_lossy(p.get_bytes(p.remaining()).loc("error message")?)
        .into_owned();
    Ok(ErrPackage {
        code,
        sql_state,
        message,
    })
}

/// Parse an EOF payload, the leading 0xFE included
fn parse_eof(payload: &[u8]) -> ConnectionResult<EofPackage> {
    let mut p = PackageParser::new(payload);
    p.get_u8().loc("eof header")?;
    // Pre-4.1 servers send a bare 0xFE
    let warnings = if p.remaining() >= 2 {
        p.get_u16().loc("eof warnings")?
    } else {
        0
    };
    let server_status = if p.remaining() >= 2 {
        p.get_u16().loc("eof status")?
    } else {
        0
    };
    Ok(EofPackage {
        warnings,
        server_status,
    })
}

/// Parse a field payload into a column definition
fn parse_field(payload: &[u8]) -> ConnectionResult<Field> {
    let mut p = PackageParser::new(payload);
    p.skip_lenenc_str().loc("catalog")?;
    p.skip_lenenc_str().loc("schema")?;
    let table = p.get_lenenc_str().loc("table")?.to_string();
    p.skip_lenenc_str().loc("org table")?;
    let name = p.get_lenenc_str().loc("name")?.to_string();
    p.skip_lenenc_str().loc("org name")?;
    p.get_lenenc().loc("length of fixed length fields")?;
    let charset = p.get_u16().loc("character set")?;
    let column_length = p.get_u32().loc("column length")?;
    let r#type = p.get_u8().loc("type")?;
    let flags = p.get_u16().loc("flags")?;
    let decimals = p.get_u8().loc("decimals")?;
    Ok(Field {
        table,
        name,
        charset,
        column_length,
        r#type,
        flags,
        decimals,
    })
}

/// Parse a row payload into one raw value per column
///
/// The values are zero-copy slices of the payload; NULL (length code 0xFB)
/// stays distinct from a zero length value.
fn parse_row(payload: &Bytes, field_count: usize) -> ConnectionResult<Vec<Option<Bytes>>> {
    let mut p = PackageParser::new(payload);
    let mut values = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        let value = p
            .get_lenenc_blob_opt()
            .loc("row value")?
            .map(|v| payload.slice_ref(v));
        values.push(value);
    }
    if p.remaining() != 0 {
        return Err(ConnectionErrorContent::ProtocolError(format!(
            "{} trailing bytes after the last row value",
            p.remaining()
        ))
        .into());
    }
    Ok(values)
}
