/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! One persistent TCP session per remote engine, shared by every slot that
//! targets it. At most one batch is in flight at a time; additional batches
//! queue in FIFO order. Transport failures fail the in-flight batch and all
//! queued ones, then the worker reconnects with exponential backoff.

use crate::{
    amcp::reply::{PayloadShape, Reply, parse_status_line},
    config::SocketOptions,
    error::{ChannelError, ChannelResult},
};
use socket2::{SockRef, TcpKeepalive};
use std::{io, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select, spawn,
    sync::{mpsc, oneshot, watch},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Busy,
    Reconnecting,
}

struct BatchJob {
    lines: Vec<String>,
    reply_tx: oneshot::Sender<ChannelResult<Vec<Reply>>>,
}

/// Handle to a connection worker. Cloning shares the underlying session.
#[derive(Debug, Clone)]
pub struct AmcpChannel {
    tx: mpsc::UnboundedSender<BatchJob>,
    link: watch::Receiver<LinkState>,
    token: CancellationToken,
}

impl AmcpChannel {
    /// Spawns the connection worker for `host:port`. The worker keeps
    /// reconnecting until `shutdown` is cancelled or [`close`](Self::close)
    /// is called.
    pub fn connect(
        host: String,
        port: u16,
        options: SocketOptions,
        shutdown: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
        let token = shutdown.child_token();

        let worker = ChannelWorker {
            host,
            port,
            options,
            rx,
            link: link_tx,
            token: token.clone(),
        };
        spawn(worker.run());

        AmcpChannel {
            tx,
            link: link_rx,
            token,
        }
    }

    /// Submits one batch (or a single query line) and awaits its replies.
    pub async fn send(&self, lines: Vec<String>) -> ChannelResult<Vec<Reply>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BatchJob { lines, reply_tx })
            .map_err(|_| ChannelError::Closed)?;
        reply_rx.await.map_err(|_| ChannelError::Closed)?
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub fn connected(&self) -> bool {
        matches!(self.link_state(), LinkState::Connected | LinkState::Busy)
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

enum ServeExit {
    Shutdown,
    Reconnect,
}

struct ChannelWorker {
    host: String,
    port: u16,
    options: SocketOptions,
    rx: mpsc::UnboundedReceiver<BatchJob>,
    link: watch::Sender<LinkState>,
    token: CancellationToken,
}

impl ChannelWorker {
    async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;
        let mut reconnecting = false;

        loop {
            self.set_link(if reconnecting {
                LinkState::Reconnecting
            } else {
                LinkState::Connecting
            });

            let connect = TcpStream::connect((self.host.as_str(), self.port));
            let stream = select! {
                _ = self.token.cancelled() => break,
                stream = connect => stream,
            };

            match stream {
                Ok(stream) => {
                    if let Err(e) = configure_socket(&stream, &self.options) {
                        warn!("Could not configure socket for {}:{}: {e}", self.host, self.port);
                    }
                    backoff = INITIAL_BACKOFF;
                    info!("Connected to playout engine at {}:{}.", self.host, self.port);
                    self.set_link(LinkState::Connected);
                    match self.serve(stream).await {
                        ServeExit::Shutdown => break,
                        ServeExit::Reconnect => {
                            reconnecting = true;
                            continue;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Could not connect to playout engine at {}:{}: {e}. Retrying in {:?} …",
                        self.host, self.port, backoff
                    );
                    self.fail_pending(ChannelError::from(e));
                    self.set_link(LinkState::Reconnecting);
                    reconnecting = true;
                    select! {
                        _ = self.token.cancelled() => break,
                        _ = sleep(jittered(backoff)) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        self.fail_pending(ChannelError::Closed);
        self.set_link(LinkState::Disconnected);
        debug!("Connection worker for {}:{} stopped.", self.host, self.port);
    }

    async fn serve(&mut self, stream: TcpStream) -> ServeExit {
        let (read, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read);

        loop {
            let job = select! {
                _ = self.token.cancelled() => return ServeExit::Shutdown,
                job = self.rx.recv() => job,
            };
            let Some(job) = job else {
                return ServeExit::Shutdown;
            };

            self.set_link(LinkState::Busy);
            match execute(&mut reader, &mut writer, &job.lines).await {
                Ok(replies) => {
                    job.reply_tx.send(Ok(replies)).ok();
                    self.set_link(LinkState::Connected);
                }
                Err(e @ ChannelError::Remote { .. }) => {
                    // protocol-level failure, the connection itself is fine
                    job.reply_tx.send(Err(e)).ok();
                    self.set_link(LinkState::Connected);
                }
                Err(e @ ChannelError::Network(_)) => {
                    warn!(
                        "Lost connection to playout engine at {}:{}: {e}",
                        self.host, self.port
                    );
                    job.reply_tx.send(Err(e)).ok();
                    self.fail_pending(ChannelError::Network("connection lost".to_owned()));
                    return ServeExit::Reconnect;
                }
                Err(e) => {
                    // malformed reply, assume the stream is desynced
                    warn!(
                        "Dropping connection to playout engine at {}:{}: {e}",
                        self.host, self.port
                    );
                    job.reply_tx.send(Err(e)).ok();
                    return ServeExit::Reconnect;
                }
            }
        }
    }

    fn fail_pending(&mut self, error: ChannelError) {
        while let Ok(job) = self.rx.try_recv() {
            job.reply_tx.send(Err(error.clone())).ok();
        }
    }

    fn set_link(&self, state: LinkState) {
        self.link.send_replace(state);
    }
}

async fn execute(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    lines: &[String],
) -> ChannelResult<Vec<Reply>> {
    let mut wire = String::new();
    for line in lines {
        wire.push_str(line);
        wire.push_str("\r\n");
    }
    writer.write_all(wire.as_bytes()).await?;
    writer.flush().await?;

    // one reply per command; all of them are read even if one fails, so the
    // stream stays in sync
    let mut replies = Vec::with_capacity(lines.len());
    let mut failure = None;
    for _ in lines {
        let reply = read_reply(reader).await?;
        if !reply.is_success() && failure.is_none() {
            failure = Some(ChannelError::Remote {
                code: reply.code,
                message: remote_message(&reply),
            });
        }
        replies.push(reply);
    }

    match failure {
        Some(error) => Err(error),
        None => Ok(replies),
    }
}

fn remote_message(reply: &Reply) -> String {
    match reply.data.first() {
        Some(data) => format!("{} ({data})", reply.status),
        None => reply.status.clone(),
    }
}

async fn read_reply(reader: &mut BufReader<OwnedReadHalf>) -> ChannelResult<Reply> {
    let line = read_line(reader).await?;
    let (code, status) = parse_status_line(&line)?;

    let mut data = Vec::new();
    match Reply::payload_shape(code) {
        PayloadShape::None => {}
        PayloadShape::OneLine => data.push(read_line(reader).await?),
        PayloadShape::UntilEmptyLine => loop {
            let line = read_line(reader).await?;
            if line.is_empty() {
                break;
            }
            data.push(line);
        },
    }

    Ok(Reply { code, status, data })
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> ChannelResult<String> {
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await?;
    if n == 0 {
        return Err(ChannelError::Network("connection closed by remote".to_owned()));
    }
    while buf.ends_with('\n') || buf.ends_with('\r') {
        buf.pop();
    }
    Ok(buf)
}

fn configure_socket(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let socket = SockRef::from(stream);
    if options.keepalive_time_ms.is_some()
        || options.keepalive_interval_ms.is_some()
        || options.keepalive_retries.is_some()
    {
        let mut keepalive = TcpKeepalive::new();
        if let Some(ms) = options.keepalive_time_ms {
            keepalive = keepalive.with_time(Duration::from_millis(ms));
        }
        if let Some(ms) = options.keepalive_interval_ms {
            keepalive = keepalive.with_interval(Duration::from_millis(ms));
        }
        if let Some(retries) = options.keepalive_retries {
            keepalive = keepalive.with_retries(retries);
        }
        socket.set_tcp_keepalive(&keepalive)?;
    }
    socket.set_tcp_user_timeout(options.user_timeout_ms.map(Duration::from_millis))?;
    Ok(())
}

fn jittered(backoff: Duration) -> Duration {
    backoff.mul_f64(0.8 + rand::random::<f64>() * 0.4)
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    async fn mock_engine(respond: impl Fn(usize, &str) -> String + Send + 'static) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut n = 0;
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = respond(n, &line);
                write.write_all(reply.as_bytes()).await.unwrap();
                n += 1;
            }
        });
        addr.ip().to_string() + ":" + &addr.port().to_string()
    }

    fn split(addr: &str) -> (String, u16) {
        let (host, port) = addr.split_once(':').unwrap();
        (host.to_owned(), port.parse().unwrap())
    }

    #[tokio::test]
    async fn batches_round_trip_against_a_mock_engine() {
        let addr = mock_engine(|_, _| "202 OK\r\n".to_owned()).await;
        let (host, port) = split(&addr);
        let token = CancellationToken::new();
        let channel = AmcpChannel::connect(host, port, SocketOptions::default(), &token);

        let replies = channel
            .send(vec![
                "DEFER".to_owned(),
                "PLAY 1-10".to_owned(),
                "RESUME".to_owned(),
            ])
            .await
            .unwrap();

        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(Reply::is_success));
        channel.close();
    }

    #[tokio::test]
    async fn remote_failure_fails_the_batch_but_keeps_the_connection() {
        let addr = mock_engine(|n, line| {
            if n == 1 {
                format!("400 ERROR\r\n{line}\r\n")
            } else {
                "202 OK\r\n".to_owned()
            }
        })
        .await;
        let (host, port) = split(&addr);
        let token = CancellationToken::new();
        let channel = AmcpChannel::connect(host, port, SocketOptions::default(), &token);

        let result = channel
            .send(vec![
                "DEFER".to_owned(),
                "LOADBG 1-20 \"a.mov\" SEEK 0 LOOP".to_owned(),
                "RESUME".to_owned(),
            ])
            .await;
        match result {
            Err(ChannelError::Remote { code: 400, .. }) => {}
            other => panic!("expected remote error, got {other:?}"),
        }

        // the session survives a remote error
        let replies = channel.send(vec!["PLAY 1-10".to_owned()]).await.unwrap();
        assert_eq!(replies.len(), 1);
        channel.close();
    }

    #[tokio::test]
    async fn query_replies_carry_the_frame_payload() {
        let addr = mock_engine(|_, _| "201 CALL OK\r\n7500\r\n".to_owned()).await;
        let (host, port) = split(&addr);
        let token = CancellationToken::new();
        let channel = AmcpChannel::connect(host, port, SocketOptions::default(), &token);

        let replies = channel.send(vec!["CALL 1-10 FRAME".to_owned()]).await.unwrap();
        assert_eq!(replies[0].frame(), Some(7500));
        channel.close();
    }

    #[tokio::test]
    async fn closed_remote_yields_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let token = CancellationToken::new();
        let channel = AmcpChannel::connect(
            addr.ip().to_string(),
            addr.port(),
            SocketOptions::default(),
            &token,
        );

        let result = channel.send(vec!["PLAY 1-10".to_owned()]).await;
        assert!(matches!(result, Err(ChannelError::Network(_))));
        channel.close();
    }
}
