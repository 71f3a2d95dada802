//! In-process fake store speaking enough RESP for the echo server.

#![allow(dead_code)]

use bytes::Bytes;
use echo_over_redis::config::{ReplyMode, ServerConfig, StoreConfig};
use echo_over_redis::protocols::resp::Frame;
use echo_over_redis::store::RespConnection;
use echo_over_redis::{Server, StoreClient};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// How the fake store answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// PING <msg> answers <msg>
    Echo,
    /// PING <msg> answers <msg> in upper case
    Upper,
    /// Answers the handshake, then never replies
    Silent,
    /// Delays replies to PINGs carrying this payload
    SlowPayload(&'static [u8], Duration),
    /// Closes the first connection right after the handshake
    DropFirstConnection,
}

pub struct FakeStore {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Bytes>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeStore {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        {
            let received = Arc::clone(&received);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let nth = connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, behavior, nth, Arc::clone(&received)));
                }
            });
        }

        FakeStore {
            addr,
            received,
            connections,
        }
    }

    /// Payloads of every PING received so far.
    pub fn received(&self) -> Vec<Bytes> {
        self.received.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(
    stream: TcpStream,
    behavior: Behavior,
    nth: usize,
    received: Arc<Mutex<Vec<Bytes>>>,
) {
    let mut conn = RespConnection::new(stream);

    while let Ok(Some(frame)) = conn.read_frame().await {
        let args = match frame {
            Frame::Array(Some(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Frame::Bulk(Some(data)) => Some(data),
                    _ => None,
                })
                .collect::<Vec<_>>(),
            _ => return,
        };
        let Some(name) = args.first() else {
            return;
        };

        let reply = match name.to_ascii_uppercase().as_slice() {
            b"HELLO" => {
                let reply = Frame::Map(vec![
                    (
                        Frame::bulk(Bytes::from_static(b"server")),
                        Frame::bulk(Bytes::from_static(b"fake")),
                    ),
                    (Frame::bulk(Bytes::from_static(b"proto")), Frame::integer(3)),
                ]);
                if conn.write_all(&reply.encode()).await.is_err() {
                    return;
                }
                if behavior == Behavior::DropFirstConnection && nth == 0 {
                    return;
                }
                continue;
            }
            b"PING" => {
                let msg = args.get(1).cloned();
                if let Some(msg) = &msg {
                    received.lock().unwrap().push(msg.clone());
                }

                match behavior {
                    Behavior::Silent => continue,
                    Behavior::SlowPayload(slow, delay) if msg.as_deref() == Some(slow) => {
                        tokio::time::sleep(delay).await
                    }
                    _ => {}
                }

                match msg {
                    Some(msg) if behavior == Behavior::Upper => {
                        Frame::bulk(Bytes::from(msg.to_ascii_uppercase()))
                    }
                    Some(msg) => Frame::bulk(msg),
                    None => Frame::simple("PONG"),
                }
            }
            b"SELECT" | b"AUTH" | b"CLIENT" => Frame::simple("OK"),
            _ => Frame::error("ERR unknown command"),
        };

        if conn.write_all(&reply.encode()).await.is_err() {
            return;
        }
    }
}

/// Store settings pointing at `addr`, with short timeouts and no health
/// checks unless a test asks for them.
pub fn store_config(addr: SocketAddr) -> StoreConfig {
    StoreConfig {
        address: addr.to_string(),
        probe_timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_millis(500),
        health_check_interval: None,
        reconnect_wait: Some(Duration::from_millis(50)),
        ..StoreConfig::default()
    }
}

/// An address with nothing listening on it.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Start an echo server on an ephemeral port.
pub async fn start_server(store: StoreClient, reply: ReplyMode) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(
        ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            reply,
            ..ServerConfig::default()
        },
        store,
    ));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener, std::future::pending()).await });
    }

    (server, addr)
}

/// Wait until the store worker has connected and finished its handshake.
pub async fn wait_for_connection(store: &StoreClient) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.stats().connects == 0 {
        assert!(tokio::time::Instant::now() < deadline, "store never connected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the store client completes a probe.
pub async fn wait_until_connected(store: &StoreClient) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.probe(Bytes::from_static(b"warmup")).await.is_err() {
        assert!(tokio::time::Instant::now() < deadline, "store never became ready");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
