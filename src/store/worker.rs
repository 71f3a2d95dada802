//! Store connection worker.
//!
//! Connects, runs the setup handshake, then multiplexes queued commands over
//! the single connection: every written command pushes a waiter and every
//! reply pops the oldest one. Health checks detect a store that stopped
//! answering. After a connection loss the worker waits and reconnects,
//! rejecting commands in the meantime so callers never wait on a dead store.

use super::connection::RespConnection;
use super::{Command, StoreError, StoreStats};
use crate::config::StoreConfig;
use crate::protocols::resp::{Frame, Request};
use socket2::{SockRef, TcpKeepalive};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Who is waiting for the next reply.
enum Waiter {
    Caller(oneshot::Sender<Result<Frame, StoreError>>),
    HealthCheck,
}

/// Why `serve` returned.
enum Disconnect {
    /// Every client handle was dropped.
    Shutdown,
    Lost(StoreError),
}

/// Worker entry point; runs until every `StoreClient` is dropped.
pub(crate) async fn run(
    config: StoreConfig,
    mut commands: mpsc::Receiver<Command>,
    stats: Arc<StoreStats>,
) {
    loop {
        match connect(&config).await {
            Ok(conn) => {
                stats.record_connect();
                info!(address = %config.address, "Connected to store");

                match serve(conn, &mut commands, &config).await {
                    Disconnect::Shutdown => {
                        debug!("Store client dropped, closing store connection");
                        return;
                    }
                    Disconnect::Lost(e) => {
                        warn!(address = %config.address, error = %e, "Store connection lost");
                    }
                }
            }
            Err(e) => {
                warn!(address = %config.address, error = %e, "Failed to connect to store");
            }
        }

        let Some(wait) = config.reconnect_wait else {
            info!("Reconnection disabled, store stays disconnected");
            reject_until(&mut commands, None).await;
            return;
        };

        if !reject_until(&mut commands, Some(Instant::now() + wait)).await {
            return;
        }
        debug!(address = %config.address, "Reconnecting to store");
    }
}

/// Fail incoming commands with `NotConnected` until `deadline`.
///
/// Returns `false` once the command channel is closed.
async fn reject_until(
    commands: &mut mpsc::Receiver<Command>,
    deadline: Option<Instant>,
) -> bool {
    let sleep = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(command) => {
                    let _ = command.reply.send(Err(StoreError::NotConnected));
                }
                None => return false,
            },
        }
    }
}

/// Open the TCP connection and run the setup handshake.
async fn connect(config: &StoreConfig) -> Result<RespConnection<TcpStream>, StoreError> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.address))
        .await
        .map_err(|_| StoreError::Connect("connect timed out".to_string()))?
        .map_err(|e| StoreError::Connect(e.to_string()))?;

    stream
        .set_nodelay(true)
        .map_err(|e| StoreError::Connect(e.to_string()))?;

    if let Some(idle) = config.keepalive {
        let keepalive = TcpKeepalive::new().with_time(idle);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!(error = %e, "Failed to enable TCP keepalive on store connection");
        }
    }

    if let Ok(local) = stream.local_addr() {
        trace!(local = %local, "Store socket connected");
    }

    let mut conn = RespConnection::new(stream);
    tokio::time::timeout(config.connect_timeout, handshake(&mut conn, config))
        .await
        .map_err(|_| StoreError::Handshake("handshake timed out".to_string()))??;

    Ok(conn)
}

/// Build the commands sent right after connecting.
pub(crate) fn setup_request(config: &StoreConfig) -> Request {
    let mut req = Request::new();

    // AUTH is pointless for the default user without a password
    let send_auth = !(config.username.is_empty()
        || (config.username == "default" && config.password.is_empty()));
    let send_setname = !config.client_name.is_empty();

    if config.resp3 {
        let mut args: Vec<&str> = vec!["3"];
        if send_auth {
            args.extend(["AUTH", config.username.as_str(), config.password.as_str()]);
        }
        if send_setname {
            args.extend(["SETNAME", config.client_name.as_str()]);
        }
        req.push("HELLO", args);
    } else {
        if send_auth {
            req.push("AUTH", [&config.username, &config.password]);
        }
        if send_setname {
            req.push("CLIENT", ["SETNAME", config.client_name.as_str()]);
        }
    }

    if let Some(db) = config.database.filter(|&db| db != 0) {
        req.push("SELECT", [db.to_string()]);
    }

    req
}

/// Send the setup request and check every reply.
async fn handshake<S>(conn: &mut RespConnection<S>, config: &StoreConfig) -> Result<(), StoreError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = setup_request(config);
    if req.is_empty() {
        return Ok(());
    }

    conn.write_all(req.as_bytes())
        .await
        .map_err(|e| StoreError::Handshake(e.to_string()))?;

    let mut remaining = req.expected_replies();
    while remaining > 0 {
        match conn.read_frame().await {
            Ok(Some(Frame::Push(_))) => continue,
            Ok(Some(frame)) => {
                if let Some(msg) = frame.as_error() {
                    return Err(StoreError::Handshake(msg));
                }
                trace!(?frame, "Setup reply");
                remaining -= 1;
            }
            Ok(None) => {
                return Err(StoreError::Handshake(
                    "store closed the connection during setup".to_string(),
                ))
            }
            Err(e) => return Err(StoreError::Handshake(e.to_string())),
        }
    }

    Ok(())
}

fn health_interval(period: Option<Duration>) -> Option<Interval> {
    period.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    })
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Write a request, treating a stalled write as a dead connection.
async fn send<S>(
    conn: &mut RespConnection<S>,
    bytes: &[u8],
    limit: Duration,
) -> Result<(), StoreError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, conn.write_all(bytes))
        .await
        .map_err(|_| StoreError::ConnectionLost("write to store timed out".to_string()))?
}

fn fail_all(waiting: &mut VecDeque<Waiter>, error: &StoreError) {
    for waiter in waiting.drain(..) {
        if let Waiter::Caller(reply) = waiter {
            let _ = reply.send(Err(error.clone()));
        }
    }
}

/// Multiplex commands over a connected store until it fails or every
/// client handle is dropped.
async fn serve<S>(
    mut conn: RespConnection<S>,
    commands: &mut mpsc::Receiver<Command>,
    config: &StoreConfig,
) -> Disconnect
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut waiting: VecDeque<Waiter> = VecDeque::new();
    let mut health = health_interval(config.health_check_interval);
    let mut health_pending = false;

    let mut ping = Request::new();
    ping.push("PING", [&config.health_check_id]);

    let error = loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    return Disconnect::Shutdown;
                };
                // Caller gave up (timed out or session closed) before we got to it
                if command.reply.is_closed() {
                    continue;
                }
                if let Err(e) = send(&mut conn, &command.request, config.probe_timeout).await {
                    let _ = command.reply.send(Err(e.clone()));
                    break e;
                }
                waiting.push_back(Waiter::Caller(command.reply));
            }

            frame = conn.read_frame() => match frame {
                Ok(Some(Frame::Push(items))) => {
                    trace!(len = items.len(), "Ignoring push from store");
                }
                Ok(Some(frame)) => match waiting.pop_front() {
                    Some(Waiter::Caller(reply)) => {
                        // The caller may be gone; its reply is discarded
                        let _ = reply.send(Ok(frame));
                    }
                    Some(Waiter::HealthCheck) => {
                        health_pending = false;
                        if let Some(msg) = frame.as_error() {
                            break StoreError::Server(msg);
                        }
                        trace!("Health check answered");
                    }
                    None => {
                        break StoreError::Protocol(format!("unsolicited reply: {frame:?}"));
                    }
                },
                Ok(None) => {
                    break StoreError::ConnectionLost("store closed the connection".to_string());
                }
                Err(e) => break e,
            },

            _ = next_tick(&mut health) => {
                if health_pending {
                    break StoreError::ConnectionLost("health check unanswered".to_string());
                }
                if let Err(e) = send(&mut conn, ping.as_bytes(), config.probe_timeout).await {
                    break e;
                }
                waiting.push_back(Waiter::HealthCheck);
                health_pending = true;
            }
        }
    };

    fail_all(&mut waiting, &error);
    Disconnect::Lost(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_test::io::Builder;

    fn config() -> StoreConfig {
        StoreConfig {
            health_check_interval: None,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_setup_request_defaults() {
        let req = setup_request(&StoreConfig::default());
        assert_eq!(req.expected_replies(), 1);
        assert_eq!(
            req.as_bytes(),
            b"*4\r\n$5\r\nHELLO\r\n$1\r\n3\r\n$7\r\nSETNAME\r\n$15\r\necho-over-redis\r\n"
        );
    }

    #[test]
    fn test_setup_request_auth_and_select() {
        let req = setup_request(&StoreConfig {
            username: "app".into(),
            password: "secret".into(),
            client_name: String::new(),
            database: Some(2),
            ..StoreConfig::default()
        });
        assert_eq!(req.expected_replies(), 2);
        assert_eq!(
            req.as_bytes(),
            &b"*5\r\n$5\r\nHELLO\r\n$1\r\n3\r\n$4\r\nAUTH\r\n$3\r\napp\r\n$6\r\nsecret\r\n\
               *2\r\n$6\r\nSELECT\r\n$1\r\n2\r\n"[..]
        );
    }

    #[test]
    fn test_setup_request_resp2() {
        let req = setup_request(&StoreConfig {
            resp3: false,
            password: "secret".into(),
            client_name: String::new(),
            database: Some(0),
            ..StoreConfig::default()
        });
        assert_eq!(req.expected_replies(), 1);
        assert_eq!(
            req.as_bytes(),
            b"*3\r\n$4\r\nAUTH\r\n$7\r\ndefault\r\n$6\r\nsecret\r\n"
        );

        let req = setup_request(&StoreConfig {
            resp3: false,
            client_name: String::new(),
            ..StoreConfig::default()
        });
        assert!(req.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_error_reply() {
        let cfg = StoreConfig {
            client_name: String::new(),
            ..config()
        };
        let mock = Builder::new()
            .write(b"*2\r\n$5\r\nHELLO\r\n$1\r\n3\r\n")
            .read(b"-NOPROTO unsupported protocol version\r\n")
            .build();
        let mut conn = RespConnection::new(mock);

        let err = handshake(&mut conn, &cfg).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Handshake("NOPROTO unsupported protocol version".into())
        );
    }

    #[tokio::test]
    async fn test_handshake_accepts_map_reply() {
        let cfg = StoreConfig {
            client_name: String::new(),
            ..config()
        };
        let mock = Builder::new()
            .write(b"*2\r\n$5\r\nHELLO\r\n$1\r\n3\r\n")
            .read(b"%1\r\n$5\r\nproto\r\n:3\r\n")
            .build();
        let mut conn = RespConnection::new(mock);

        handshake(&mut conn, &cfg).await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_answers_in_order_and_skips_push() {
        let mock = Builder::new()
            .write(b"*2\r\n$4\r\nPING\r\n$1\r\na\r\n")
            .write(b"*2\r\n$4\r\nPING\r\n$1\r\nb\r\n")
            .read(b">2\r\n$7\r\nmessage\r\n$2\r\nhi\r\n$1\r\na\r\n$1\r\nb\r\n")
            .build();
        let conn = RespConnection::new(mock);
        let (tx, mut rx) = mpsc::channel(8);

        let mut replies = Vec::new();
        for arg in ["a", "b"] {
            let mut req = Request::new();
            req.push("PING", [arg]);
            let (reply, wait) = oneshot::channel();
            tx.send(Command {
                request: req.into_bytes(),
                reply,
            })
            .await
            .unwrap();
            replies.push(wait);
        }

        let served = tokio::spawn(async move {
            let cfg = config();
            serve(conn, &mut rx, &cfg).await
        });

        assert_eq!(
            replies.remove(0).await.unwrap(),
            Ok(Frame::bulk(Bytes::from_static(b"a")))
        );
        assert_eq!(
            replies.remove(0).await.unwrap(),
            Ok(Frame::bulk(Bytes::from_static(b"b")))
        );

        // Mock is exhausted, so the store looks closed
        match served.await.unwrap() {
            Disconnect::Lost(StoreError::ConnectionLost(_)) => {}
            Disconnect::Lost(e) => panic!("unexpected error: {e:?}"),
            Disconnect::Shutdown => panic!("unexpected shutdown"),
        }
        drop(tx);
    }

    #[tokio::test]
    async fn test_reject_until_fails_commands() {
        let (tx, mut rx) = mpsc::channel(8);
        let (reply, wait) = oneshot::channel();
        tx.send(Command {
            request: Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"),
            reply,
        })
        .await
        .unwrap();
        drop(tx);

        assert!(!reject_until(&mut rx, None).await);
        assert_eq!(wait.await.unwrap(), Err(StoreError::NotConnected));
    }
}
