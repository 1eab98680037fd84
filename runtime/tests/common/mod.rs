//! Minimal HTTP/1.1 file server for download tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone)]
pub enum Route {
    /// 200 with `body`, written `chunk` bytes at a time with `delay` between writes
    File {
        body: Vec<u8>,
        content_length: bool,
        chunk: usize,
        delay: Duration,
    },
    /// Empty response with this status code
    Status(u16, &'static str),
}

impl Route {
    pub fn file(body: Vec<u8>) -> Self {
        Route::File {
            body,
            content_length: true,
            chunk: 16 * 1024,
            delay: Duration::ZERO,
        }
    }

    pub fn without_length(body: Vec<u8>) -> Self {
        Route::File {
            body,
            content_length: false,
            chunk: 16 * 1024,
            delay: Duration::ZERO,
        }
    }

    /// About `chunks * delay` long.
    pub fn slow(chunks: usize, chunk: usize, delay: Duration) -> Self {
        Route::File {
            body: vec![7u8; chunks * chunk],
            content_length: true,
            chunk,
            delay,
        }
    }
}

pub struct TestServer {
    pub handle: tokio::task::JoinHandle<()>,
    pub addr: SocketAddr,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn start_test_server(routes: Vec<(&str, Route)>) -> TestServer {
    let routes: Arc<HashMap<String, Route>> = Arc::new(
        routes
            .into_iter()
            .map(|(path, route)| (path.to_string(), route))
            .collect(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                // The client hanging up mid-body is expected in cancel tests
                let _ = serve_connection(stream, &routes).await;
            });
        }
    });

    TestServer { handle, addr }
}

async fn serve_connection(
    mut stream: TcpStream,
    routes: &HashMap<String, Route>,
) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
    }

    let head = String::from_utf8_lossy(&head);
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    match routes.get(&path) {
        Some(Route::File {
            body,
            content_length,
            chunk,
            delay,
        }) => {
            let mut response = String::from("HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n");
            if *content_length {
                response.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
            response.push_str("Connection: close\r\n\r\n");
            stream.write_all(response.as_bytes()).await?;

            for piece in body.chunks((*chunk).max(1)) {
                stream.write_all(piece).await?;
                stream.flush().await?;
                if !delay.is_zero() {
                    tokio::time::sleep(*delay).await;
                }
            }
        }
        Some(Route::Status(code, reason)) => {
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                code, reason
            );
            stream.write_all(response.as_bytes()).await?;
        }
        None => {
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
        }
    }

    stream.shutdown().await
}
