//! In-process mysql server speaking just enough of the protocol to test the
//! driver against: greeting, native and pre-4.1 auth, COM_QUERY with a few
//! canned statements, COM_INIT_DB and COM_STATISTICS.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use mylink::connection::ConnectionOptions;

/// The 20 byte scramble the mock always greets with
pub const SCRAMBLE: &[u8; 20] = b"0123456789abcdefghij";

/// Server status flag for autocommit
pub const STATUS_AUTOCOMMIT: u16 = 0x0002;

/// Server status flag announcing another result set
pub const STATUS_MORE_RESULTS: u16 = 0x0008;

/// A mysql server listening on a random local port
pub struct MockServer {
    /// The address the server listens on
    addr: SocketAddr,
    /// Number of sockets accepted so far
    accepted: Arc<AtomicUsize>,
    /// Databases selected through COM_INIT_DB, in order
    init_dbs: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    /// Spawn a server speaking mysql_native_password
    pub async fn spawn() -> MockServer {
        Self::start(false).await
    }

    /// Spawn a server that insists on the pre-4.1 password scramble
    pub async fn spawn_old_password() -> MockServer {
        Self::start(true).await
    }

    /// Bind a listener and start accepting connections
    async fn start(old_password: bool) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let init_dbs = Arc::new(Mutex::new(Vec::new()));
        {
            let accepted = accepted.clone();
            let init_dbs = init_dbs.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        break;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let init_dbs = init_dbs.clone();
                    tokio::spawn(async move {
                        let _ = serve(socket, old_password, init_dbs).await;
                    });
                }
            });
        }
        MockServer {
            addr,
            accepted,
            init_dbs,
        }
    }

    /// Connection options pointing at this server
    pub fn options(&self) -> ConnectionOptions<'static> {
        ConnectionOptions::new()
            .host(self.addr.ip().to_string())
            .port(self.addr.port())
            .user("root")
            .password("test")
    }

    /// Number of sockets accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Databases selected through COM_INIT_DB, in order
    pub fn init_dbs(&self) -> Vec<String> {
        self.init_dbs.lock().unwrap().clone()
    }
}

/// Serve one client socket
async fn serve(
    mut socket: TcpStream,
    old_password: bool,
    init_dbs: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    send_package(&mut socket, 0, &greeting_payload()).await?;
    let Some((_, _auth)) = read_package(&mut socket).await? else {
        return Ok(());
    };
    if old_password {
        send_package(&mut socket, 2, &[0xFE]).await?;
        let Some((_, token)) = read_package(&mut socket).await? else {
            return Ok(());
        };
        // 8 scramble bytes and a trailing nul
        assert_eq!(token.len(), 9, "unexpected old password token");
        send_package(&mut socket, 4, &ok_payload(0, 0, STATUS_AUTOCOMMIT, 0)).await?;
    } else {
        send_package(&mut socket, 2, &ok_payload(0, 0, STATUS_AUTOCOMMIT, 0)).await?;
    }

    loop {
        let Some((_, command)) = read_package(&mut socket).await? else {
            return Ok(());
        };
        match command.first() {
            // COM_INIT_DB
            Some(0x02) => {
                let db = String::from_utf8_lossy(&command[1..]).into_owned();
                init_dbs.lock().unwrap().push(db);
                send_package(&mut socket, 1, &ok_payload(0, 0, STATUS_AUTOCOMMIT, 0)).await?;
            }
            // COM_QUERY
            Some(0x03) => {
                let sql = String::from_utf8_lossy(&command[1..]).into_owned();
                respond_query(&mut socket, &sql).await?;
            }
            // COM_STATISTICS
            Some(0x09) => {
                send_package(&mut socket, 1, b"Uptime: 113  Threads: 1  Questions: 7").await?;
            }
            _ => {
                send_package(&mut socket, 1, &err_payload(1047, "Unknown command")).await?;
            }
        }
    }
}

/// Answer one canned COM_QUERY statement
async fn respond_query(socket: &mut TcpStream, sql: &str) -> std::io::Result<()> {
    match sql {
        "SELECT 1 AS x" => {
            send_result_set(
                socket,
                1,
                &[field_payload("x", 0x03, 0)],
                &[vec![Some("1")]],
                STATUS_AUTOCOMMIT,
            )
            .await
            .map(|_| ())
        }
        "SELECT '' AS e, NULL AS n" => {
            send_result_set(
                socket,
                1,
                &[field_payload("e", 0xFD, 0), field_payload("n", 0xFD, 0)],
                &[vec![Some(""), None]],
                STATUS_AUTOCOMMIT,
            )
            .await
            .map(|_| ())
        }
        "SELECT 1 AS x; SELECT 2 AS y" => {
            let seq = send_result_set(
                socket,
                1,
                &[field_payload("x", 0x03, 0)],
                &[vec![Some("1")]],
                STATUS_AUTOCOMMIT | STATUS_MORE_RESULTS,
            )
            .await?;
            send_result_set(
                socket,
                seq,
                &[field_payload("y", 0x03, 0)],
                &[vec![Some("2")]],
                STATUS_AUTOCOMMIT,
            )
            .await?;
            Ok(())
        }
        "BOOM" => {
            send_package(
                socket,
                1,
                &err_payload(1064, "You have an error in your SQL syntax"),
            )
            .await
        }
        // Drop the socket without answering, simulating a dying server
        "KILL" => Err(std::io::Error::other("connection killed")),
        sql if sql.starts_with("INSERT") => {
            send_package(socket, 1, &ok_payload(1, 5, STATUS_AUTOCOMMIT, 0)).await
        }
        _ => send_package(socket, 1, &ok_payload(0, 0, STATUS_AUTOCOMMIT, 0)).await,
    }
}

/// Send one full result set, returns the next free sequence number
async fn send_result_set(
    socket: &mut TcpStream,
    mut seq: u8,
    fields: &[Vec<u8>],
    rows: &[Vec<Option<&str>>],
    final_status: u16,
) -> std::io::Result<u8> {
    send_package(socket, seq, &[fields.len() as u8]).await?;
    seq += 1;
    for field in fields {
        send_package(socket, seq, field).await?;
        seq += 1;
    }
    send_package(socket, seq, &eof_payload(0, STATUS_AUTOCOMMIT)).await?;
    seq += 1;
    for row in rows {
        send_package(socket, seq, &row_payload(row)).await?;
        seq += 1;
    }
    send_package(socket, seq, &eof_payload(0, final_status)).await?;
    Ok(seq + 1)
}

/// Write one framed package to the socket
pub async fn send_package(
    socket: &mut TcpStream,
    seq: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    socket.write_all(&frame_header(seq, payload.len())).await?;
    socket.write_all(payload).await
}

/// Read one framed package from the socket, None on a clean close
pub async fn read_package(socket: &mut TcpStream) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; 4];
    match socket.read_exact(&mut header).await {
        Ok(_) => (),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
    let mut payload = vec![0; len];
    socket.read_exact(&mut payload).await?;
    Ok(Some((header[3], payload)))
}

/// The 4 byte package header for a payload of the given length
pub fn frame_header(seq: u8, len: usize) -> [u8; 4] {
    [len as u8, (len >> 8) as u8, (len >> 16) as u8, seq]
}

/// One framed package as raw bytes
pub fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = frame_header(seq, payload.len()).to_vec();
    out.extend_from_slice(payload);
    out
}

/// The greeting payload of the mock server
pub fn greeting_payload() -> Vec<u8> {
    let mut p = vec![10];
    p.extend_from_slice(b"5.5.2-m2\0");
    p.extend_from_slice(&42u32.to_le_bytes());
    p.extend_from_slice(&SCRAMBLE[..8]);
    p.push(0);
    p.extend_from_slice(&0xF7FFu16.to_le_bytes());
    p.push(33);
    p.extend_from_slice(&STATUS_AUTOCOMMIT.to_le_bytes());
    p.extend_from_slice(&[0; 13]);
    p.extend_from_slice(&SCRAMBLE[8..]);
    p.push(0);
    p
}

/// An OK payload
pub fn ok_payload(affected_rows: u64, last_insert_id: u64, status: u16, warnings: u16) -> Vec<u8> {
    let mut p = vec![0x00];
    put_lenenc(&mut p, affected_rows);
    put_lenenc(&mut p, last_insert_id);
    p.extend_from_slice(&status.to_le_bytes());
    p.extend_from_slice(&warnings.to_le_bytes());
    p
}

/// An error payload with sql state 42000
pub fn err_payload(code: u16, message: &str) -> Vec<u8> {
    let mut p = vec![0xFF];
    p.extend_from_slice(&code.to_le_bytes());
    p.push(b'#');
    p.extend_from_slice(b"42000");
    p.extend_from_slice(message.as_bytes());
    p
}

/// An EOF payload
pub fn eof_payload(warnings: u16, status: u16) -> Vec<u8> {
    let mut p = vec![0xFE];
    p.extend_from_slice(&warnings.to_le_bytes());
    p.extend_from_slice(&status.to_le_bytes());
    p
}

/// A field payload for a column of table `t`
pub fn field_payload(name: &str, r#type: u8, flags: u16) -> Vec<u8> {
    let mut p = Vec::new();
    put_lenenc_str(&mut p, "def");
    put_lenenc_str(&mut p, "");
    put_lenenc_str(&mut p, "t");
    put_lenenc_str(&mut p, "t");
    put_lenenc_str(&mut p, name);
    put_lenenc_str(&mut p, name);
    put_lenenc(&mut p, 0x0C);
    p.extend_from_slice(&33u16.to_le_bytes());
    p.extend_from_slice(&11u32.to_le_bytes());
    p.push(r#type);
    p.extend_from_slice(&flags.to_le_bytes());
    p.push(0);
    p.extend_from_slice(&0u16.to_le_bytes());
    p
}

/// A row payload, None encodes NULL
pub fn row_payload(values: &[Option<&str>]) -> Vec<u8> {
    let mut p = Vec::new();
    for value in values {
        match value {
            Some(v) => put_lenenc_str(&mut p, v),
            None => p.push(0xFB),
        }
    }
    p
}

/// Append a length-coded integer
pub fn put_lenenc(out: &mut Vec<u8>, v: u64) {
    if v < 251 {
        out.push(v as u8);
    } else if v < 1 << 16 {
        out.push(0xFC);
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else if v < 1 << 24 {
        out.push(0xFD);
        out.extend_from_slice(&(v as u32).to_le_bytes()[..3]);
    } else {
        out.push(0xFE);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Append a length-coded string
pub fn put_lenenc_str(out: &mut Vec<u8>, s: &str) {
    put_lenenc(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}
