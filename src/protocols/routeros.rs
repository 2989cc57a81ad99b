//! MikroTik RouterOS API wire protocol.
//!
//! A sentence is a sequence of length-prefixed words terminated by an empty
//! word. Replies start with `!re`, `!done`, `!trap` or `!fatal`; attributes
//! are `=key=value` words.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a single word; anything larger is treated as a desync
const MAX_WORD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RouterOsError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Trap(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection out of sync after an interrupted command")]
    Desynced,
}

pub type Attributes = HashMap<String, String>;

/// Append the variable-length prefix for `len`
pub fn encode_length(len: usize, out: &mut Vec<u8>) {
    let len = len as u32;
    if len < 0x80 {
        out.push(len as u8);
    } else if len < 0x4000 {
        out.extend_from_slice(&((len | 0x8000) as u16).to_be_bytes());
    } else if len < 0x20_0000 {
        let v = len | 0xC0_0000;
        out.extend_from_slice(&v.to_be_bytes()[1..]);
    } else if len < 0x1000_0000 {
        out.extend_from_slice(&(len | 0xE000_0000).to_be_bytes());
    } else {
        out.push(0xF0);
        out.extend_from_slice(&len.to_be_bytes());
    }
}

pub fn encode_sentence<S: AsRef<str>>(words: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for word in words {
        let bytes = word.as_ref().as_bytes();
        encode_length(bytes.len(), &mut out);
        out.extend_from_slice(bytes);
    }
    out.push(0);
    out
}

async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, RouterOsError> {
    let first = reader.read_u8().await?;
    let len = if first & 0x80 == 0 {
        first as u32
    } else if first & 0xC0 == 0x80 {
        let b = reader.read_u8().await? as u32;
        ((first as u32 & 0x3F) << 8) | b
    } else if first & 0xE0 == 0xC0 {
        let mut b = [0u8; 2];
        reader.read_exact(&mut b).await?;
        ((first as u32 & 0x1F) << 16) | ((b[0] as u32) << 8) | b[1] as u32
    } else if first & 0xF0 == 0xE0 {
        let mut b = [0u8; 3];
        reader.read_exact(&mut b).await?;
        ((first as u32 & 0x0F) << 24) | ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32
    } else if first == 0xF0 {
        reader.read_u32().await?
    } else {
        return Err(RouterOsError::Protocol(format!("reserved length byte 0x{:02x}", first)));
    };
    Ok(len as usize)
}

pub async fn read_sentence<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<String>, RouterOsError> {
    let mut words = Vec::new();
    loop {
        let len = read_length(reader).await?;
        if len == 0 {
            return Ok(words);
        }
        if len > MAX_WORD_LEN {
            return Err(RouterOsError::Protocol(format!("word length {} too large", len)));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        words.push(String::from_utf8_lossy(&buf).into_owned());
    }
}

/// Split `=key=value` words into a map; other words are ignored
pub fn parse_attributes(words: &[String]) -> Attributes {
    words
        .iter()
        .filter_map(|w| {
            let rest = w.strip_prefix('=')?;
            let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Builder for one command sentence
#[derive(Debug, Clone, Default)]
pub struct Command {
    words: Vec<String>,
}

impl Command {
    pub fn new(path: &str) -> Self {
        Self { words: vec![path.to_string()] }
    }

    pub fn attr(mut self, key: &str, value: &str) -> Self {
        self.words.push(format!("={}={}", key, value));
        self
    }

    pub fn attr_opt(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.attr(key, v),
            None => self,
        }
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.words.push(format!("?{}={}", key, value));
        self
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }
}

/// One RouterOS API session over any byte stream
pub struct ApiConnection<S> {
    stream: S,
    timeout: Duration,
    desynced: bool,
}

impl ApiConnection<TcpStream> {
    /// Open a TCP session and log in
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, RouterOsError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RouterOsError::Timeout(timeout))??;
        stream.set_nodelay(true).ok();
        let mut conn = ApiConnection::new(stream, timeout);
        conn.login(username, password).await?;
        Ok(conn)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ApiConnection<S> {
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream,
            timeout,
            desynced: false,
        }
    }

    /// Post-6.43 plaintext login
    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), RouterOsError> {
        let cmd = Command::new("/login")
            .attr("name", username)
            .attr("password", password);
        let done = self.run(&cmd).await?;
        if done.iter().any(|r| r.contains_key("ret")) {
            return Err(RouterOsError::Protocol(
                "router requested legacy challenge login (RouterOS < 6.43)".into(),
            ));
        }
        Ok(())
    }

    /// Run a command and return its `!re` rows plus the `!done` attributes as the last row.
    /// A `!trap` is returned as an error once the trailing `!done` has been consumed.
    pub async fn run(&mut self, cmd: &Command) -> Result<Vec<Attributes>, RouterOsError> {
        if self.desynced {
            return Err(RouterOsError::Desynced);
        }
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.exchange(cmd)).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => {
                if matches!(e, RouterOsError::Io(_) | RouterOsError::Protocol(_) | RouterOsError::Fatal(_)) {
                    self.desynced = true;
                }
                Err(e)
            }
            Err(_) => {
                // A reply may still arrive; the stream can no longer be trusted
                self.desynced = true;
                Err(RouterOsError::Timeout(timeout))
            }
        }
    }

    async fn exchange(&mut self, cmd: &Command) -> Result<Vec<Attributes>, RouterOsError> {
        let bytes = encode_sentence(cmd.words());
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;

        let mut rows = Vec::new();
        let mut trap: Option<String> = None;
        loop {
            let sentence = read_sentence(&mut self.stream).await?;
            let Some(kind) = sentence.first() else {
                continue;
            };
            let attrs = parse_attributes(&sentence[1..]);
            match kind.as_str() {
                "!re" => rows.push(attrs),
                // RouterOS 7.18+ announces a print with no rows before `!done`
                "!empty" => {}
                "!trap" => {
                    let message = attrs
                        .get("message")
                        .cloned()
                        .unwrap_or_else(|| "unknown error".to_string());
                    trap.get_or_insert(message);
                }
                "!done" => {
                    if let Some(message) = trap {
                        return Err(RouterOsError::Trap(message));
                    }
                    if !attrs.is_empty() {
                        rows.push(attrs);
                    }
                    return Ok(rows);
                }
                "!fatal" => {
                    let message = sentence.get(1).cloned().unwrap_or_default();
                    return Err(RouterOsError::Fatal(message));
                }
                other => {
                    return Err(RouterOsError::Protocol(format!("unexpected reply word {}", other)));
                }
            }
        }
    }

    pub fn is_desynced(&self) -> bool {
        self.desynced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn sentence(words: &[&str]) -> Vec<u8> {
        encode_sentence(words)
    }

    #[test]
    fn test_encode_length_boundaries() {
        let cases: &[(usize, &[u8])] = &[
            (0x00, &[0x00]),
            (0x7F, &[0x7F]),
            (0x80, &[0x80, 0x80]),
            (0x3FFF, &[0xBF, 0xFF]),
            (0x4000, &[0xC0, 0x40, 0x00]),
            (0x1F_FFFF, &[0xDF, 0xFF, 0xFF]),
            (0x20_0000, &[0xE0, 0x20, 0x00, 0x00]),
            (0x1000_0000, &[0xF0, 0x10, 0x00, 0x00, 0x00]),
        ];
        for (len, expected) in cases {
            let mut out = Vec::new();
            encode_length(*len, &mut out);
            assert_eq!(&out, expected, "length {:#x}", len);
        }
    }

    #[tokio::test]
    async fn test_read_sentence_with_long_word() {
        let long = "x".repeat(200);
        let bytes = encode_sentence(&["!re", long.as_str()]);
        let mut reader = Builder::new().read(&bytes).build();
        let words = read_sentence(&mut reader).await.unwrap();
        assert_eq!(words, vec!["!re".to_string(), long]);
    }

    #[test]
    fn test_parse_attributes_keeps_equals_in_value() {
        let words = vec![
            "=name=alice".to_string(),
            "=comment=a=b".to_string(),
            ".tag=1".to_string(),
        ];
        let attrs = parse_attributes(&words);
        assert_eq!(attrs.get("name").map(String::as_str), Some("alice"));
        assert_eq!(attrs.get("comment").map(String::as_str), Some("a=b"));
        assert_eq!(attrs.len(), 2);
    }

    #[tokio::test]
    async fn test_login_and_print() {
        let mock = Builder::new()
            .write(&sentence(&["/login", "=name=admin", "=password=secret"]))
            .read(&sentence(&["!done"]))
            .write(&sentence(&["/ppp/secret/print", "?name=alice"]))
            .read(&sentence(&["!re", "=.id=*1", "=name=alice", "=profile=10M"]))
            .read(&sentence(&["!done"]))
            .build();

        let mut conn = ApiConnection::new(mock, Duration::from_secs(1));
        conn.login("admin", "secret").await.unwrap();
        let rows = conn
            .run(&Command::new("/ppp/secret/print").query("name", "alice"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(".id").map(String::as_str), Some("*1"));
        assert_eq!(rows[0].get("profile").map(String::as_str), Some("10M"));
    }

    #[tokio::test]
    async fn test_empty_reply_is_no_rows() {
        let mock = Builder::new()
            .write(&sentence(&["/ppp/secret/print", "?name=ghost"]))
            .read(&sentence(&["!empty"]))
            .read(&sentence(&["!done"]))
            .write(&sentence(&["/system/identity/print"]))
            .read(&sentence(&["!re", "=name=core-1"]))
            .read(&sentence(&["!done"]))
            .build();

        let mut conn = ApiConnection::new(mock, Duration::from_secs(1));
        let rows = conn
            .run(&Command::new("/ppp/secret/print").query("name", "ghost"))
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert!(!conn.is_desynced());
        let rows = conn.run(&Command::new("/system/identity/print")).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_trap_is_error_after_done() {
        let mock = Builder::new()
            .write(&sentence(&["/ppp/secret/add", "=name=bob"]))
            .read(&sentence(&["!trap", "=message=failure: secret with the same name already exists"]))
            .read(&sentence(&["!done"]))
            .write(&sentence(&["/system/identity/print"]))
            .read(&sentence(&["!re", "=name=core-1"]))
            .read(&sentence(&["!done"]))
            .build();

        let mut conn = ApiConnection::new(mock, Duration::from_secs(1));
        let err = conn
            .run(&Command::new("/ppp/secret/add").attr("name", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterOsError::Trap(ref m) if m.contains("already exists")));
        // A trap leaves the stream usable
        assert!(!conn.is_desynced());
        let rows = conn.run(&Command::new("/system/identity/print")).await.unwrap();
        assert_eq!(rows[0].get("name").map(String::as_str), Some("core-1"));
    }

    #[tokio::test]
    async fn test_done_ret_returned_as_row() {
        let mock = Builder::new()
            .write(&sentence(&["/ppp/secret/add", "=name=carol"]))
            .read(&sentence(&["!done", "=ret=*A"]))
            .build();
        let mut conn = ApiConnection::new(mock, Duration::from_secs(1));
        let rows = conn
            .run(&Command::new("/ppp/secret/add").attr("name", "carol"))
            .await
            .unwrap();
        assert_eq!(rows.last().and_then(|r| r.get("ret")).map(String::as_str), Some("*A"));
    }

    #[tokio::test]
    async fn test_timeout_marks_connection_desynced() {
        let mock = Builder::new()
            .write(&sentence(&["/system/resource/print"]))
            .wait(Duration::from_millis(200))
            .build();
        let mut conn = ApiConnection::new(mock, Duration::from_millis(20));
        let err = conn.run(&Command::new("/system/resource/print")).await.unwrap_err();
        assert!(matches!(err, RouterOsError::Timeout(_)));
        assert!(conn.is_desynced());
        let err = conn.run(&Command::new("/system/resource/print")).await.unwrap_err();
        assert!(matches!(err, RouterOsError::Desynced));
    }

    #[tokio::test]
    async fn test_legacy_login_challenge_rejected() {
        let mock = Builder::new()
            .write(&sentence(&["/login", "=name=admin", "=password=pw"]))
            .read(&sentence(&["!done", "=ret=ebddd18303a54111e2dea05a92ab46b4"]))
            .build();
        let mut conn = ApiConnection::new(mock, Duration::from_secs(1));
        let err = conn.login("admin", "pw").await.unwrap_err();
        assert!(matches!(err, RouterOsError::Protocol(_)));
    }
}
