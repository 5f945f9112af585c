//! A scripted byte-level test server.
//!
//! Each accepted connection is handed, together with its index, to the
//! test's closure, which speaks raw HTTP/1.1 over the stream. This keeps
//! full control over framing, partial writes, and resets.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub struct Server {
    addr: SocketAddr,
    conn_count: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl Server {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.conn_count.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start a server; `script` runs once per accepted connection with the
/// connection's zero-based index.
pub async fn start<F, Fut>(script: F) -> Server
where
    F: Fn(usize, Conn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let conn_count = Arc::new(AtomicUsize::new(0));

    let count = conn_count.clone();
    let script = Arc::new(script);
    let handle = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let index = count.fetch_add(1, Ordering::SeqCst);
            let script = script.clone();
            tokio::spawn(async move {
                (*script)(index, Conn::new(stream)).await;
            });
        }
    });

    Server {
        addr,
        conn_count,
        handle,
    }
}

/// One accepted connection, with a read buffer so a request head and its
/// body can be consumed separately even when they share a packet.
pub struct Conn {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Conn {
    pub fn new(stream: TcpStream) -> Conn {
        Conn {
            stream,
            buf: Vec::new(),
        }
    }

    /// Read one request head (through the blank line), skipping any stray
    /// CRLF left over from a previous message. Returns an empty string on
    /// a clean EOF between requests.
    pub async fn read_request(&mut self) -> String {
        loop {
            while self.buf.starts_with(b"\r\n") {
                self.buf.drain(..2);
            }
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head: Vec<u8> = self.buf.drain(..pos + 4).collect();
                return String::from_utf8(head).expect("request head is ascii");
            }
            if self.fill().await == 0 {
                if self.buf.is_empty() {
                    return String::new();
                }
                panic!("client closed while sending a request; got {:?}", self.buf);
            }
        }
    }

    /// Read exactly `len` body bytes.
    pub async fn read_body(&mut self, len: usize) -> Vec<u8> {
        while self.buf.len() < len {
            if self.fill().await == 0 {
                panic!("client closed mid-body");
            }
        }
        self.buf.drain(..len).collect()
    }

    /// True if more bytes arrive within `window`. Consumes nothing.
    pub async fn has_data_within(&mut self, window: Duration) -> bool {
        if !self.buf.is_empty() {
            return true;
        }
        matches!(
            tokio::time::timeout(window, self.fill()).await,
            Ok(n) if n > 0
        )
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("server write");
        self.stream.flush().await.expect("server flush");
    }

    /// Reset the connection instead of closing it cleanly.
    pub fn reset(self) {
        let _ = self.stream.set_linger(Some(Duration::ZERO));
        drop(self.stream);
    }

    /// Park the connection: respond to nothing until the peer goes away.
    pub async fn hold(mut self) {
        loop {
            if self.fill().await == 0 {
                break;
            }
            self.buf.clear();
        }
    }

    /// Read raw bytes off the upgraded stream.
    pub async fn read_exact(&mut self, len: usize) -> Vec<u8> {
        self.read_body(len).await
    }

    async fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 2048];
        match self.stream.read(&mut chunk).await {
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                n
            }
            Err(_) => 0,
        }
    }
}

/// A minimal 200 with a fixed body.
pub fn ok_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}
