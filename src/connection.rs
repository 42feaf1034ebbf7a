//! Handle a single connection to Mariadb/Mysql
use std::{borrow::Cow, sync::Arc, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::{debug, warn};

use crate::{
    auth::{scramble323, token},
    constants::{CHARSET_UTF8_UNICODE_CI, PROTOCOL_VERSION, client, com, server_status},
    package::{ErrPackage, Package, PackageStream},
    package_parser::{DecodeError, DecodeResult, PackageParser},
    row::{QueryResult, ResultSet, Row},
};

/// Error handling connection
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectionErrorContent {
    /// An error returned by Mariadb/Mysql while executing a statement
    ///
    /// The connection stays usable after this error
    #[error("mysql error {code} while executing `{sql}`: {message}")]
    Server {
        /// 2-byte mysql error code
        code: u16,
        /// Error message
        message: String,
        /// The statement that failed
        sql: String,
    },
    /// The server rejected the credentials during the handshake
    #[error("access denied for {user}@{host}:{port}: mysql error {code}: {message}")]
    Auth {
        /// 2-byte mysql error code
        code: u16,
        /// Error message
        message: String,
        /// The user we tried to authenticate as
        user: String,
        /// The host we connected to
        host: String,
        /// The port we connected to
        port: u16,
    },
    /// Network error from tokio, the connection is broken
    #[error(transparent)]
    Io(#[from] tokio::io::Error),
    /// Error decoding a package field, the connection is broken
    #[error("error reading {0}: {1}")]
    Decode(&'static str, DecodeError),
    /// Mariadb/Mysql did not speak the protocol correctly, the connection is
    /// broken
    #[error("protocol error {0}")]
    ProtocolError(String),
    /// No connection was freed before a queued pool request's deadline
    #[error("timed out waiting for a pooled connection for {user}@{host}:{port}")]
    PoolTimeout {
        /// The host of the pool key the request waited on
        host: String,
        /// The port of the pool key the request waited on
        port: u16,
        /// The user of the pool key the request waited on
        user: String,
    },
    /// A length-coded value did not fit the supported encodings
    ///
    /// The 8-byte length-coded form is not implemented; values of 2^24 and
    /// above are rejected rather than silently truncated.
    #[error("length-coded value {0} does not fit in 3 bytes")]
    LenencTooLarge(u64),
    /// You executed a statement that does not return any rows
    #[error("fetch returned no rows")]
    ExpectedRows,
    /// You executed a statement that does return rows, use query instead
    #[error("rows returned for execute")]
    UnexpectedRows,
}

/// Error handling connection
///
/// This type is a Box around [ConnectionErrorContent], to make sure
/// that the error type is as small as possible
pub struct ConnectionError(Box<ConnectionErrorContent>);

const _: () = {
    assert!(size_of::<ConnectionError>() == size_of::<usize>());
};

impl ConnectionError {
    /// Return the content of the error
    pub fn content(&self) -> &ConnectionErrorContent {
        &self.0
    }
}

impl std::ops::Deref for ConnectionError {
    type Target = ConnectionErrorContent;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<E: Into<ConnectionErrorContent>> From<E> for ConnectionError {
    fn from(value: E) -> Self {
        ConnectionError(Box::new(value.into()))
    }
}

impl std::fmt::Debug for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ConnectionError {}

/// Result returned by the connection
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Convert [crate::package_parser::DecodeError] into
/// [ConnectionErrorContent::Decode] with an attached location
pub trait WithLoc<T> {
    /// Convert [crate::package_parser::DecodeError] into
    /// [ConnectionErrorContent::Decode] with an attached location
    fn loc(self, loc: &'static str) -> ConnectionResult<T>;
}

impl<T> WithLoc<T> for DecodeResult<T> {
    fn loc(self, loc: &'static str) -> ConnectionResult<T> {
        self.map_err(|v| ConnectionErrorContent::Decode(loc, v).into())
    }
}

/// Reader used to read packages from Mariadb/Mysql
struct Reader {
    /// Socket to read from
    read: OwnedReadHalf,
    /// Incremental parser the socket bytes are pushed through
    stream: PackageStream,
    /// Socket inactivity timeout, a read stalled longer than this breaks the
    /// connection
    timeout: Duration,
}

impl Reader {
    /// Construct a new reader instance
    fn new(read: OwnedReadHalf, timeout: Duration) -> Self {
        Self {
            read,
            stream: PackageStream::new(),
            timeout,
        }
    }

    /// Read the next complete package
    async fn next_package(&mut self) -> ConnectionResult<Package> {
        loop {
            if let Some(package) = self.stream.try_next()? {
                return Ok(package);
            }
            self.fill().await?;
        }
    }

    /// Read the next complete package payload without classifying it
    async fn next_raw(&mut self) -> ConnectionResult<Bytes> {
        loop {
            if let Some(payload) = self.stream.try_next_raw()? {
                return Ok(payload);
            }
            self.fill().await?;
        }
    }

    /// Sequence number of the most recently received package
    fn last_sequence(&self) -> u8 {
        self.stream.last_sequence()
    }

    /// Read one chunk of socket data into the stream
    async fn fill(&mut self) -> ConnectionResult<()> {
        let read = tokio::time::timeout(self.timeout, self.read.read_buf(self.stream.buffer_mut()))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "socket inactivity timeout")
            })?;
        if read? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )
            .into());
        }
        Ok(())
    }
}

/// Writer used to send packages to Mariadb/Mysql
struct Writer {
    /// Writer to write package to
    write: OwnedWriteHalf,
    /// Buffer containing package
    buff: BytesMut,
    /// Sequence number of package
    seq: u8,
}

impl Writer {
    /// Construct a new [Writer] instance
    fn new(write: OwnedWriteHalf) -> Self {
        Writer {
            write,
            buff: BytesMut::with_capacity(1234),
            seq: 1,
        }
    }

    /// Compose a new package
    fn compose(&mut self) -> Composer<'_> {
        self.buff.clear();
        self.buff.put_u32(0);
        Composer {
            buff: &mut self.buff,
            seq: &mut self.seq,
        }
    }

    /// Send the last composed package
    async fn send(&mut self) -> ConnectionResult<()> {
        Ok(self.write.write_all_buf(&mut self.buff).await?)
    }
}

/// Struct used to compose a single network package in a [Writer]
struct Composer<'a> {
    /// Buffer to compose the package into, the first 4 bytes are the header
    buff: &'a mut BytesMut,
    /// Sequence number for the package, advanced by finalize
    seq: &'a mut u8,
}

impl<'a> Composer<'a> {
    /// Write a u32 to the package
    fn put_u32(&mut self, v: u32) {
        self.buff.put_u32_le(v)
    }

    /// Write a 3-byte little-endian integer to the package
    fn put_u24(&mut self, v: u32) {
        self.buff.put_u8(v as u8);
        self.buff.put_u8((v >> 8) as u8);
        self.buff.put_u8((v >> 16) as u8);
    }

    /// Write a u16 to the package
    fn put_u16(&mut self, v: u16) {
        self.buff.put_u16_le(v)
    }

    /// Write a u8 to the package
    fn put_u8(&mut self, v: u8) {
        self.buff.put_u8(v)
    }

    /// Write the given number of zero filler bytes to the package
    fn fill(&mut self, count: usize) {
        for _ in 0..count {
            self.buff.put_u8(0);
        }
    }

    /// Write a null terminated string to the package
    fn put_str_null(&mut self, s: &str) {
        self.buff.put(s.as_bytes());
        self.buff.put_u8(0);
    }

    /// Write some bytes to the package
    fn put_bytes(&mut self, s: &[u8]) {
        self.buff.put(s);
    }

    /// Write a length-coded integer to the package
    ///
    /// The 8-byte form is not implemented; values of 2^24 and above are an
    /// explicit error
    fn put_lenenc_uint(&mut self, v: u64) -> ConnectionResult<()> {
        if v <= 250 {
            self.put_u8(v as u8);
        } else if v < 1 << 16 {
            self.put_u8(0xFC);
            self.put_u16(v as u16);
        } else if v < 1 << 24 {
            self.put_u8(0xFD);
            self.put_u24(v as u32);
        } else {
            return Err(ConnectionErrorContent::LenencTooLarge(v).into());
        }
        Ok(())
    }

    /// Write a length-coded byte string to the package
    fn put_lenenc_bytes(&mut self, s: &[u8]) -> ConnectionResult<()> {
        self.put_lenenc_uint(s.len() as u64)?;
        self.put_bytes(s);
        Ok(())
    }

    /// Finalize the package header
    fn finalize(self) {
        let len = self.buff.len();
        let mut x = &mut self.buff[..4];
        x.put_u32_le((len - 4) as u32 | ((*self.seq as u32) << 24));
        *self.seq = self.seq.wrapping_add(1);
    }
}

/// Options used to establish a connection to Mariadb/Mysql
pub struct ConnectionOptions<'a> {
    /// The host to connect to
    pub host: Cow<'a, str>,
    /// The port to connect to
    pub port: u16,
    /// The user to connect as
    pub user: Cow<'a, str>,
    /// The password for the user
    pub password: Cow<'a, str>,
    /// The database to connect to, empty for none
    pub database: Cow<'a, str>,
    /// Socket inactivity timeout, a read stalled longer than this breaks the
    /// connection
    pub socket_timeout: Duration,
}

impl<'a> ConnectionOptions<'a> {
    /// New default connection options
    pub fn new() -> Self {
        Self::default()
    }

    /// The host to connect to
    pub fn host(self, host: impl Into<Cow<'a, str>>) -> Self {
        ConnectionOptions {
            host: host.into(),
            ..self
        }
    }

    /// The port to connect to
    pub fn port(self, port: u16) -> Self {
        ConnectionOptions { port, ..self }
    }

    /// The user to connect as
    pub fn user(self, user: impl Into<Cow<'a, str>>) -> Self {
        ConnectionOptions {
            user: user.into(),
            ..self
        }
    }

    /// The password for the user
    pub fn password(self, password: impl Into<Cow<'a, str>>) -> Self {
        ConnectionOptions {
            password: password.into(),
            ..self
        }
    }

    /// The database to connect to
    pub fn database(self, database: impl Into<Cow<'a, str>>) -> Self {
        ConnectionOptions {
            database: database.into(),
            ..self
        }
    }

    /// Socket inactivity timeout
    pub fn socket_timeout(self, socket_timeout: Duration) -> Self {
        ConnectionOptions {
            socket_timeout,
            ..self
        }
    }
}

impl<'a> Default for ConnectionOptions<'a> {
    fn default() -> Self {
        Self {
            host: Cow::Borrowed("127.0.0.1"),
            port: 3306,
            user: Cow::Borrowed("root"),
            password: Cow::Borrowed(""),
            database: Cow::Borrowed(""),
            socket_timeout: Duration::from_secs(600),
        }
    }
}

/// State of a connection
///
/// The TCP connect itself precedes the connection object; a constructed
/// connection starts out waiting for the greeting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the server greeting
    AwaitingGreeting,
    /// The handshake response has been sent
    Authenticating,
    /// The connection can accept a statement
    Ready,
    /// A statement is in flight, left behind by an abandoned statement future
    Busy,
    /// A transport or protocol error occurred, the connection is unusable
    Broken,
}

/// A connection to Mariadb/Mysql
///
/// At most one statement is in flight at a time; statements take the
/// connection by mutable reference, so the package stream of an executing
/// statement is owned by exactly one caller.
pub struct Connection {
    /// The reader to read packages from
    reader: Reader,
    /// The writer to write packages to
    writer: Writer,
    /// The current state of the connection
    state: ConnectionState,
    /// The host given at connect time
    host: String,
    /// The port given at connect time
    port: u16,
    /// The user given at connect time
    user: String,
    /// The database the connection currently has selected
    database: String,
    /// Version string sent by the server in the greeting
    server_version: String,
    /// Server thread id sent in the greeting
    thread_id: u32,
    /// Lower 16 capability bits sent in the greeting
    capabilities: u16,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("server_version", &self.server_version)
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to Mariadb/Mysql and perform the authentication handshake
    pub async fn connect(options: &ConnectionOptions<'_>) -> ConnectionResult<Self> {
        let stream = TcpStream::connect((options.host.as_ref(), options.port)).await?;
        let (read, write) = stream.into_split();
        let mut connection = Connection {
            reader: Reader::new(read, options.socket_timeout),
            writer: Writer::new(write),
            state: ConnectionState::AwaitingGreeting,
            host: options.host.to_string(),
            port: options.port,
            user: options.user.to_string(),
            database: options.database.to_string(),
            server_version: String::new(),
            thread_id: 0,
            capabilities: 0,
        };
        connection.handshake(options).await?;
        Ok(connection)
    }

    /// Drive the connection from AwaitingGreeting to Ready
    async fn handshake(&mut self, options: &ConnectionOptions<'_>) -> ConnectionResult<()> {
        let greeting = match self.reader.next_package().await? {
            Package::Greeting(greeting) => greeting,
            Package::Error(e) => return Err(self.auth_error(e)),
            _ => {
                return Err(ConnectionErrorContent::ProtocolError(
                    "unexpected package while awaiting the greeting".to_string(),
                )
                .into());
            }
        };
        if greeting.protocol_version != PROTOCOL_VERSION {
            return Err(ConnectionErrorContent::ProtocolError(format!(
                "unsupported protocol version {}",
                greeting.protocol_version
            ))
            .into());
        }
        self.server_version = greeting.server_version;
        self.thread_id = greeting.thread_id;
        self.capabilities = greeting.capabilities;
        self.state = ConnectionState::Authenticating;

        let mut p = self.writer.compose();
        p.put_u32(
            client::LONG_PASSWORD
                | client::FOUND_ROWS
                | client::CONNECT_WITH_DB
                | client::PROTOCOL_41
                | client::SECURE_CONNECTION
                | client::TRANSACTIONS
                | client::MULTI_STATEMENTS
                | client::MULTI_RESULTS,
        );
        p.put_u32(0x1000000); // Max package size
        p.put_u8(CHARSET_UTF8_UNICODE_CI);
        p.fill(23);
        p.put_str_null(&options.user);
        p.put_lenenc_bytes(&token(&options.password, &greeting.scramble))?;
        p.put_str_null(&options.database);
        p.finalize();
        self.writer.send().await?;

        loop {
            match self.reader.next_package().await? {
                Package::Ok(_) => break,
                Package::UseOldPassword => {
                    debug!(
                        host = %self.host,
                        user = %self.user,
                        "server requested the pre-4.1 password scramble"
                    );
                    self.writer.seq = self.reader.last_sequence().wrapping_add(1);
                    let mut p = self.writer.compose();
                    p.put_bytes(&scramble323(&greeting.scramble, &options.password));
                    p.put_u8(0);
                    p.finalize();
                    self.writer.send().await?;
                }
                Package::Error(e) => return Err(self.auth_error(e)),
                _ => {
                    return Err(ConnectionErrorContent::ProtocolError(
                        "unexpected package during authentication".to_string(),
                    )
                    .into());
                }
            }
        }
        self.state = ConnectionState::Ready;
        debug!(
            host = %self.host,
            port = self.port,
            user = %self.user,
            thread_id = self.thread_id,
            "connection ready"
        );
        Ok(())
    }

    /// The current state of the connection
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Return true if the connection can accept a statement
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// The database the connection currently has selected
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Version string sent by the server in the greeting
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Server thread id sent in the greeting
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Wrap an error package received during the handshake
    fn auth_error(&self, e: ErrPackage) -> ConnectionError {
        ConnectionErrorContent::Auth {
            code: e.code,
            message: e.message,
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
        }
        .into()
    }

    /// Wrap an error package received while executing a statement
    fn server_error(&self, e: ErrPackage, sql: &str) -> ConnectionError {
        ConnectionErrorContent::Server {
            code: e.code,
            message: e.message,
            sql: sql.to_string(),
        }
        .into()
    }

    /// Enter the Busy state and reset the command sequence number
    fn begin_command(&mut self) -> ConnectionResult<()> {
        match self.state {
            ConnectionState::Ready => {
                self.state = ConnectionState::Busy;
                self.writer.seq = 0;
                Ok(())
            }
            ConnectionState::Busy => Err(ConnectionErrorContent::ProtocolError(
                "connection left busy by an abandoned statement".to_string(),
            )
            .into()),
            ConnectionState::Broken => Err(ConnectionErrorContent::ProtocolError(
                "previous protocol error reported".to_string(),
            )
            .into()),
            _ => Err(ConnectionErrorContent::ProtocolError(
                "connection is not ready".to_string(),
            )
            .into()),
        }
    }

    /// Leave the Busy state
    ///
    /// A server error keeps the connection usable; everything else breaks it
    fn finish_command<T>(&mut self, r: ConnectionResult<T>) -> ConnectionResult<T> {
        match &r {
            Ok(_) => self.state = ConnectionState::Ready,
            Err(e) => match e.content() {
                ConnectionErrorContent::Server { .. } => self.state = ConnectionState::Ready,
                _ => {
                    warn!(
                        host = %self.host,
                        port = self.port,
                        user = %self.user,
                        error = %e,
                        "connection broken"
                    );
                    self.state = ConnectionState::Broken;
                }
            },
        }
        r
    }

    /// Execute a statement with the text protocol and assemble every result
    /// set it produces
    pub async fn query(&mut self, sql: &str) -> ConnectionResult<QueryResult> {
        self.begin_command()?;
        let r = self.run_query(sql).await;
        self.finish_command(r)
    }

    /// Send COM_QUERY and read result sets until the server reports no more
    async fn run_query(&mut self, sql: &str) -> ConnectionResult<QueryResult> {
        let mut p = self.writer.compose();
        p.put_u8(com::QUERY);
        p.put_bytes(sql.as_bytes());
        p.finalize();
        self.writer.send().await?;

        let mut sets = Vec::new();
        loop {
            match self.reader.next_package().await? {
                Package::Ok(ok) => {
                    let more = ok.server_status & server_status::MORE_RESULTS_EXISTS != 0;
                    sets.push(ResultSet {
                        fields: Arc::new(Vec::new()),
                        rows: Vec::new(),
                        affected_rows: ok.affected_rows,
                        last_insert_id: ok.last_insert_id,
                        warnings: ok.warnings,
                    });
                    if !more {
                        break;
                    }
                }
                Package::ResultSetHeader { field_count } => {
                    let (set, status) = self.read_result_set(field_count, sql).await?;
                    sets.push(set);
                    if status & server_status::MORE_RESULTS_EXISTS == 0 {
                        break;
                    }
                }
                Package::Error(e) => return Err(self.server_error(e, sql)),
                _ => {
                    return Err(ConnectionErrorContent::ProtocolError(
                        "unexpected package in response to query".to_string(),
                    )
                    .into());
                }
            }
        }
        Ok(QueryResult { sets })
    }

    /// Read the field and row phases of one result set
    async fn read_result_set(
        &mut self,
        field_count: u64,
        sql: &str,
    ) -> ConnectionResult<(ResultSet, u16)> {
        let mut fields = Vec::with_capacity(usize::try_from(field_count).unwrap_or(0));
        loop {
            match self.reader.next_package().await? {
                Package::Field(field) => fields.push(field),
                Package::Eof(_) => break,
                Package::Error(e) => return Err(self.server_error(e, sql)),
                _ => {
                    return Err(ConnectionErrorContent::ProtocolError(
                        "unexpected package while reading fields".to_string(),
                    )
                    .into());
                }
            }
        }
        let fields = Arc::new(fields);
        let mut rows = Vec::new();
        loop {
            match self.reader.next_package().await? {
                Package::Row(values) => rows.push(Row::new(fields.clone(), values)),
                Package::Eof(eof) => {
                    return Ok((
                        ResultSet {
                            fields,
                            rows,
                            affected_rows: 0,
                            last_insert_id: 0,
                            warnings: eof.warnings,
                        },
                        eof.server_status,
                    ));
                }
                Package::Error(e) => return Err(self.server_error(e, sql)),
                _ => {
                    return Err(ConnectionErrorContent::ProtocolError(
                        "unexpected package while reading rows".to_string(),
                    )
                    .into());
                }
            }
        }
    }

    /// Execute a statement that returns no rows
    pub async fn execute(&mut self, sql: &str) -> ConnectionResult<ExecuteResult> {
        let r = self.query(sql).await?;
        let Some(set) = r.sets.into_iter().next() else {
            return Err(ConnectionErrorContent::ProtocolError(
                "statement produced no outcome".to_string(),
            )
            .into());
        };
        if !set.fields.is_empty() {
            return Err(ConnectionErrorContent::UnexpectedRows.into());
        }
        Ok(ExecuteResult {
            affected_rows: set.affected_rows,
            last_insert_id: set.last_insert_id,
        })
    }

    /// Switch the default database of the connection with COM_INIT_DB
    ///
    /// Reuses the live socket, the connection is not re-established
    pub async fn init_db(&mut self, database: &str) -> ConnectionResult<()> {
        self.begin_command()?;
        let r = self.run_init_db(database).await;
        self.finish_command(r)
    }

    /// Send COM_INIT_DB and wait for its outcome
    async fn run_init_db(&mut self, database: &str) -> ConnectionResult<()> {
        let mut p = self.writer.compose();
        p.put_u8(com::INIT_DB);
        p.put_bytes(database.as_bytes());
        p.finalize();
        self.writer.send().await?;
        match self.reader.next_package().await? {
            Package::Ok(_) => {
                self.database = database.to_string();
                Ok(())
            }
            Package::Error(e) => Err(self.server_error(e, &format!("USE `{database}`"))),
            _ => Err(ConnectionErrorContent::ProtocolError(
                "unexpected package in response to init db".to_string(),
            )
            .into()),
        }
    }

    /// Request the server statistics string with COM_STATISTICS
    pub async fn statistics(&mut self) -> ConnectionResult<String> {
        self.begin_command()?;
        let r = self.run_statistics().await;
        self.finish_command(r)
    }

    /// Send COM_STATISTICS and read the bare string response
    async fn run_statistics(&mut self) -> ConnectionResult<String> {
        let mut p = self.writer.compose();
        p.put_u8(com::STATISTICS);
        p.finalize();
        self.writer.send().await?;
        let payload = self.reader.next_raw().await?;
        let mut p = PackageParser::new(&payload);
        Ok(p.get_eof_str().loc("statistics")?.to_string())
    }
}

/// The outcome of a rowless statement
#[derive(Debug)]
pub struct ExecuteResult {
    /// The number of rows affected by the statement
    pub affected_rows: u64,
    /// The id of the last row inserted
    pub last_insert_id: u64,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::missing_docs_in_private_items)]
    use super::*;
    use crate::package_parser::PackageParser;

    fn composer<'a>(buff: &'a mut BytesMut, seq: &'a mut u8) -> Composer<'a> {
        buff.clear();
        buff.put_u32(0);
        Composer { buff, seq }
    }

    #[test]
    fn finalize_back_patches_header() {
        let mut buff = BytesMut::new();
        let mut seq = 3;
        let mut p = composer(&mut buff, &mut seq);
        p.put_u8(0x03);
        p.put_bytes(b"abc");
        p.finalize();
        assert_eq!(&buff[..], &[4, 0, 0, 3, 0x03, b'a', b'b', b'c']);
        assert_eq!(seq, 4);
    }

    #[test]
    fn lenenc_uint_encodings() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (250, &[0xFA]),
            (251, &[0xFC, 0xFB, 0x00]),
            (65535, &[0xFC, 0xFF, 0xFF]),
            (65536, &[0xFD, 0x00, 0x00, 0x01]),
            (16777215, &[0xFD, 0xFF, 0xFF, 0xFF]),
        ];
        for (value, expected) in cases {
            let mut buff = BytesMut::new();
            let mut seq = 0;
            let mut p = composer(&mut buff, &mut seq);
            p.put_lenenc_uint(*value).unwrap();
            assert_eq!(&buff[4..], *expected, "encoding {value}");
        }
    }

    #[test]
    fn lenenc_uint_round_trips() {
        for value in [0u64, 1, 250, 65535, 16777215] {
            let mut buff = BytesMut::new();
            let mut seq = 0;
            let mut p = composer(&mut buff, &mut seq);
            p.put_lenenc_uint(value).unwrap();
            let mut parser = PackageParser::new(&buff[4..]);
            assert_eq!(parser.get_lenenc().unwrap(), value);
        }
    }

    #[test]
    fn lenenc_uint_rejects_8_byte_form() {
        let mut buff = BytesMut::new();
        let mut seq = 0;
        let mut p = composer(&mut buff, &mut seq);
        let e = p.put_lenenc_uint(1 << 24).unwrap_err();
        assert!(matches!(
            e.content(),
            ConnectionErrorContent::LenencTooLarge(v) if *v == 1 << 24
        ));
    }

    #[test]
    fn lenenc_bytes_prefixes_length() {
        let mut buff = BytesMut::new();
        let mut seq = 0;
        let mut p = composer(&mut buff, &mut seq);
        p.put_lenenc_bytes(b"token").unwrap();
        assert_eq!(&buff[4..], b"\x05token");
    }

    #[test]
    fn str_null_terminates() {
        let mut buff = BytesMut::new();
        let mut seq = 0;
        let mut p = composer(&mut buff, &mut seq);
        p.put_str_null("root");
        p.put_str_null("");
        assert_eq!(&buff[4..], b"root\0\0");
    }

    #[test]
    fn fill_writes_zeros() {
        let mut buff = BytesMut::new();
        let mut seq = 0;
        let mut p = composer(&mut buff, &mut seq);
        p.put_u24(0x030201);
        p.fill(3);
        assert_eq!(&buff[4..], &[1, 2, 3, 0, 0, 0]);
    }
}
