//! One server connection: identity, handshake state, transport and the
//! receive loop.
//!
//! Writes go through a per-connection queue drained by a single writer task,
//! so lines sent from the receive loop (handlers) and from other tasks
//! (shutdown, callers) never interleave on the wire.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::caps::CapabilitySet;
use crate::dispatch::{Dispatcher, Event};
use crate::error::{ReactorError, Result};
use crate::handshake::{Identity, Phase, Session};
use crate::message::{MAX_LINE_LEN, Message, ParseError};
use crate::transport::{self, BoxedReader, BoxedWriter, TlsOptions};

/// Coarse lifecycle of a connection. `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unconnected,
    Connected,
    Registered,
    Terminated,
}

struct Writer {
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

pub struct ServerConnection {
    name: String,
    dispatcher: Arc<Dispatcher>,
    identity: RwLock<Identity>,
    session: Mutex<Session>,
    writer: Mutex<Option<Writer>>,
    reader: Mutex<Option<BufReader<BoxedReader>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl ServerConnection {
    pub(crate) fn new(name: &str, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        let identity = Identity::default();
        let session = Session {
            nick: identity.nick.clone(),
            ..Default::default()
        };
        Arc::new(Self {
            name: name.to_string(),
            dispatcher,
            identity: RwLock::new(identity),
            session: Mutex::new(session),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            closed: Arc::new(closed),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    /// Set the nick, user and real name to register with. Only allowed
    /// before the connection has a transport.
    pub fn set_identity(&self, identity: Identity) -> Result<()> {
        let mut current = self.identity.write();
        if self.lifecycle() != Lifecycle::Unconnected {
            return Err(ReactorError::AlreadyConnected(self.name.clone()));
        }
        self.session.lock().nick = identity.nick.clone();
        *current = identity;
        Ok(())
    }

    /// Current nickname: the desired one until the server confirms another.
    pub fn nick(&self) -> String {
        self.session.lock().nick.clone()
    }

    pub fn is_registered(&self) -> bool {
        self.session.lock().is_registered()
    }

    pub fn phase(&self) -> Phase {
        self.session.lock().phase
    }

    /// Snapshot of the capability bookkeeping.
    pub fn caps(&self) -> CapabilitySet {
        self.session.lock().caps.clone()
    }

    /// Adjust capability policy, e.g. [`CapabilitySet::restrict_to`], before
    /// negotiation completes.
    pub fn configure_caps<R>(&self, f: impl FnOnce(&mut CapabilitySet) -> R) -> R {
        f(&mut self.session.lock().caps)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if *self.closed.borrow() {
            Lifecycle::Terminated
        } else if self.is_registered() {
            Lifecycle::Registered
        } else if self.writer.lock().is_some() {
            Lifecycle::Connected
        } else {
            Lifecycle::Unconnected
        }
    }

    pub fn is_terminated(&self) -> bool {
        *self.closed.borrow()
    }

    /// Connect to `addr`, over TLS when `tls` is given, and send `CAP LS 302`.
    ///
    /// Dispatch does not start until [`receive_loop`](Self::receive_loop) runs.
    pub async fn connect(&self, addr: &str, tls: Option<TlsOptions>) -> Result<()> {
        if self.lifecycle() != Lifecycle::Unconnected {
            return Err(ReactorError::AlreadyConnected(self.name.clone()));
        }
        let established = transport::establish(addr, tls.as_ref()).await?;
        tracing::info!(server = %self.name, addr, tls = established.is_tls(), "connected");
        let (reader, writer) = established.into_split();
        self.install(reader, writer)
    }

    /// Use an already-connected stream as this connection's transport and
    /// open negotiation on it. Must be called from within a tokio runtime.
    pub fn attach<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.install(Box::new(reader), Box::new(writer))
    }

    fn install(&self, reader: BoxedReader, writer: BoxedWriter) -> Result<()> {
        {
            let mut slot = self.writer.lock();
            if slot.is_some() || self.is_terminated() {
                return Err(ReactorError::AlreadyConnected(self.name.clone()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(write_loop(
                self.name.clone(),
                writer,
                rx,
                Arc::clone(&self.closed),
            ));
            *slot = Some(Writer { tx, task });
            *self.reader.lock() = Some(BufReader::new(reader));
        }
        self.advance(|session, identity| session.begin(identity))
    }

    /// Queue one message for writing.
    ///
    /// Fails if the message cannot be framed or the transport is gone. A
    /// write that fails later closes the connection and makes subsequent
    /// sends fail.
    pub fn send(&self, message: &Message) -> Result<()> {
        let line = message.encode()?;
        let slot = self.writer.lock();
        let writer = slot
            .as_ref()
            .ok_or_else(|| ReactorError::NotConnected(self.name.clone()))?;
        tracing::debug!(server = %self.name, line = line.trim_end(), "->");
        writer
            .tx
            .send(line)
            .map_err(|_| ReactorError::NotConnected(self.name.clone()))
    }

    pub fn send_command(&self, command: &str, params: &[&str]) -> Result<()> {
        self.send(&Message::new(command, params.iter().copied()))
    }

    /// Run one handshake transition and send what it produced.
    pub(crate) fn advance<F>(&self, transition: F) -> Result<()>
    where
        F: FnOnce(&mut Session, &Identity) -> Vec<Message>,
    {
        let identity = self.identity();
        let (before, after, outbound) = {
            let mut session = self.session.lock();
            let before = session.phase;
            let outbound = transition(&mut *session, &identity);
            (before, session.phase, outbound)
        };
        if before != after {
            tracing::debug!(server = %self.name, from = ?before, to = ?after, "handshake");
            if after == Phase::Registered {
                tracing::info!(server = %self.name, nick = %self.nick(), "registered");
            }
        }
        for message in &outbound {
            self.send(message)?;
        }
        Ok(())
    }

    /// Send `QUIT :<comment>` and close the transport. The quit line is
    /// queued and the queue closed under the same lock, so nothing can be
    /// written after it. Returns once the writer has flushed and shut down.
    pub async fn quit(&self, comment: &str) -> Result<()> {
        let line = Message::new("QUIT", [comment]).with_trailing().encode()?;
        let task = {
            let mut slot = self.writer.lock();
            let Writer { tx, task } = slot
                .take()
                .ok_or_else(|| ReactorError::NotConnected(self.name.clone()))?;
            tracing::debug!(server = %self.name, line = line.trim_end(), "->");
            // A send error means the writer already died; closing below still applies.
            let _ = tx.send(line);
            task
        };
        self.mark_terminated();
        if let Err(e) = task.await {
            tracing::warn!(server = %self.name, error = %e, "writer task failed");
        }
        Ok(())
    }

    /// Close the transport without sending anything. Queued lines are still
    /// flushed by the writer.
    pub fn close(&self) {
        drop(self.writer.lock().take());
        self.mark_terminated();
    }

    fn mark_terminated(&self) {
        // Releases the read half if no receive loop ever took it.
        drop(self.reader.lock().take());
        if !self.closed.send_replace(true) {
            tracing::info!(server = %self.name, "connection terminated");
        }
    }

    /// Read lines until the transport closes, dispatching one event per line.
    ///
    /// Blank lines are skipped. A line that fails to decode is logged and
    /// skipped. Returns `Ok` on a clean close (EOF, [`quit`](Self::quit),
    /// [`close`](Self::close)) and the I/O error on a read failure; either
    /// way the connection is terminated afterwards.
    pub async fn receive_loop(self: Arc<Self>) -> Result<()> {
        let taken = self.reader.lock().take();
        let mut reader = match taken {
            Some(reader) => reader,
            None if matches!(self.lifecycle(), Lifecycle::Unconnected | Lifecycle::Terminated) => {
                return Err(ReactorError::NotConnected(self.name.clone()));
            }
            None => return Err(ReactorError::ReceiveLoopRunning(self.name.clone())),
        };

        let mut closed = self.closed.subscribe();
        let mut buf = Vec::with_capacity(512);
        let result = loop {
            buf.clear();
            let read = tokio::select! {
                read = read_line_bounded(&mut reader, &mut buf) => Some(read),
                _ = closed.wait_for(|closed| *closed) => None,
            };
            let Some(read) = read else {
                break Ok(());
            };
            match read {
                Ok(0) => {
                    tracing::info!(server = %self.name, "server closed the connection");
                    break Ok(());
                }
                Ok(_) => self.handle_line(&buf),
                Err(e) => {
                    tracing::warn!(server = %self.name, error = %e, "read failed");
                    break Err(ReactorError::Io(e));
                }
            }
        };
        self.close();
        result
    }

    fn handle_line(self: &Arc<Self>, raw: &[u8]) {
        let decoded = std::str::from_utf8(raw).map_err(|_| ParseError::InvalidUtf8);
        let line = match decoded {
            Ok(line) if line.trim().is_empty() => return,
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "dropping undecodable line");
                return;
            }
        };
        let message = match Message::parse(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, line = line.trim_end(), "dropping malformed line");
                return;
            }
        };
        tracing::debug!(server = %self.name, line = line.trim_end(), "<-");
        let event = Event::new(Arc::clone(self), message);
        // Handler faults are logged by the dispatcher and never end the loop.
        let _ = self.dispatcher.dispatch(&event.name, &event);
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

/// `read_until` for one line, buffering at most `MAX_LINE_LEN` plus CRLF.
/// The rest of a longer line is read and thrown away; what was kept fails
/// to parse as too long.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_LINE_LEN as u64 + 2;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read as u64 == limit && buf.last() != Some(&b'\n') {
        let mut discard = Vec::new();
        loop {
            discard.clear();
            let n = (&mut *reader).take(limit).read_until(b'\n', &mut discard).await?;
            if n == 0 || discard.last() == Some(&b'\n') {
                break;
            }
        }
    }
    Ok(read)
}

async fn write_loop(
    name: String,
    mut writer: BoxedWriter,
    mut rx: mpsc::UnboundedReceiver<String>,
    closed: Arc<watch::Sender<bool>>,
) {
    while let Some(line) = rx.recv().await {
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::warn!(server = %name, error = %e, "write failed, closing connection");
            closed.send_replace(true);
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(server = %name, error = %e, "transport shutdown failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ALL_EVENTS;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::time::timeout;

    fn connection() -> Arc<ServerConnection> {
        ServerConnection::new("local", Arc::new(Dispatcher::with_defaults()))
    }

    async fn next_line(reader: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        line
    }

    #[tokio::test]
    async fn attach_opens_negotiation() {
        let conn = connection();
        assert_eq!(conn.lifecycle(), Lifecycle::Unconnected);
        let (client, server) = tokio::io::duplex(4096);
        conn.attach(client).unwrap();
        assert_eq!(conn.lifecycle(), Lifecycle::Connected);
        assert_eq!(conn.phase(), Phase::AwaitingCapList);

        let mut server = BufReader::new(server);
        assert_eq!(next_line(&mut server).await, "CAP LS 302\r\n");
    }

    #[tokio::test]
    async fn identity_is_frozen_once_connected() {
        let conn = connection();
        let identity = Identity {
            nick: "n".into(),
            user: "u".into(),
            realname: "r".into(),
        };
        conn.set_identity(identity.clone()).unwrap();
        let (client, _server) = tokio::io::duplex(4096);
        conn.attach(client).unwrap();
        let err = conn.set_identity(Identity::default()).unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(conn.identity(), identity);
        assert_eq!(conn.nick(), "n");

        let (again, _other) = tokio::io::duplex(4096);
        assert!(matches!(conn.attach(again), Err(ReactorError::AlreadyConnected(_))));
    }

    #[tokio::test]
    async fn nick_starts_as_the_desired_nick() {
        let conn = connection();
        assert_eq!(conn.nick(), Identity::default().nick);
        conn.set_identity(Identity {
            nick: "early".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(conn.nick(), "early");
        assert_eq!(conn.phase(), Phase::Start);
    }

    #[tokio::test]
    async fn blank_and_undecodable_lines_dispatch_nothing() {
        let dispatcher = Arc::new(Dispatcher::with_defaults());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.register(ALL_EVENTS, move |ev| {
            sink.lock().push(ev.name.clone());
            Ok(())
        });
        let conn = ServerConnection::new("local", dispatcher);
        let (client, server) = tokio::io::duplex(4096);
        conn.attach(client).unwrap();
        let task = tokio::spawn(Arc::clone(&conn).receive_loop());

        let (server_read, mut server_write) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);
        let mut line = String::new();
        server_read.read_line(&mut line).await.unwrap();

        server_write
            .write_all(b"\r\n\n   \r\n\xff\r\n:p\r\nPING :a\r\n")
            .await
            .unwrap();
        let mut line = String::new();
        timeout(Duration::from_secs(2), server_read.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "PONG :a\r\n");

        drop(server_write);
        drop(server_read);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert_eq!(*seen.lock(), vec!["PING".to_string()]);
    }

    #[tokio::test]
    async fn overlong_lines_are_skipped() {
        let conn = connection();
        let (client, server) = tokio::io::duplex(4096);
        conn.attach(client).unwrap();
        let _task = tokio::spawn(Arc::clone(&conn).receive_loop());

        let (server_read, mut server_write) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);
        let mut line = String::new();
        server_read.read_line(&mut line).await.unwrap();

        let mut flood = vec![b'a'; MAX_LINE_LEN * 2];
        flood.extend_from_slice(b"\r\nPING :ok\r\n");
        server_write.write_all(&flood).await.unwrap();
        let mut line = String::new();
        timeout(Duration::from_secs(2), server_read.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "PONG :ok\r\n");
        assert_eq!(conn.lifecycle(), Lifecycle::Connected);
    }

    #[tokio::test]
    async fn line_reads_are_bounded() {
        let mut input = vec![b'x'; MAX_LINE_LEN * 3];
        input.extend_from_slice(b"\r\nNEXT\r\n");
        let mut reader = &input[..];
        let mut buf = Vec::new();
        let read = read_line_bounded(&mut reader, &mut buf).await.unwrap();
        assert_eq!(read, MAX_LINE_LEN + 2);
        assert_eq!(buf.len(), MAX_LINE_LEN + 2);

        buf.clear();
        read_line_bounded(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf, b"NEXT\r\n");
        buf.clear();
        assert_eq!(read_line_bounded(&mut reader, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn quit_without_receive_loop_releases_the_stream() {
        let conn = connection();
        let (client, server) = tokio::io::duplex(4096);
        conn.attach(client).unwrap();
        conn.quit("bye").await.unwrap();

        let mut server = BufReader::new(server);
        assert_eq!(next_line(&mut server).await, "CAP LS 302\r\n");
        assert_eq!(next_line(&mut server).await, "QUIT :bye\r\n");
        assert_eq!(next_line(&mut server).await, "");
        // Both halves of the client stream are gone, so writes fail.
        assert!(server.get_mut().write_all(b"PING :x\r\n").await.is_err());

        let err = Arc::clone(&conn).receive_loop().await.unwrap_err();
        assert!(matches!(err, ReactorError::NotConnected(_)));
    }

    #[tokio::test]
    async fn send_requires_transport() {
        let conn = connection();
        let err = conn.send_command("PING", &["x"]).unwrap_err();
        assert!(matches!(err, ReactorError::NotConnected(_)));
        let err = Arc::clone(&conn).receive_loop().await.unwrap_err();
        assert!(matches!(err, ReactorError::NotConnected(_)));
    }

    #[tokio::test]
    async fn malformed_lines_do_not_stop_the_loop() {
        let conn = connection();
        let (client, server) = tokio::io::duplex(4096);
        conn.attach(client).unwrap();
        let task = tokio::spawn(Arc::clone(&conn).receive_loop());

        let (server_read, mut server_write) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);
        let mut line = String::new();
        server_read.read_line(&mut line).await.unwrap();

        server_write
            .write_all(b"\r\n:srv CAP *\r\n\xff\xfe\r\n:only-prefix\r\n@tags-only\r\nPING :still-here\r\n")
            .await
            .unwrap();
        let mut line = String::new();
        timeout(Duration::from_secs(2), server_read.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "PONG :still-here\r\n");
        assert_eq!(conn.phase(), Phase::AwaitingCapList);

        drop(server_write);
        drop(server_read);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert_eq!(conn.lifecycle(), Lifecycle::Terminated);
    }

    #[tokio::test]
    async fn second_receive_loop_is_refused() {
        let conn = connection();
        let (client, _server) = tokio::io::duplex(4096);
        conn.attach(client).unwrap();
        let _running = tokio::spawn(Arc::clone(&conn).receive_loop());
        tokio::task::yield_now().await;
        let err = Arc::clone(&conn).receive_loop().await.unwrap_err();
        assert!(matches!(err, ReactorError::ReceiveLoopRunning(_)));
    }

    #[tokio::test]
    async fn quit_flushes_then_closes() {
        let conn = connection();
        let (client, server) = tokio::io::duplex(4096);
        conn.attach(client).unwrap();
        let loop_task = tokio::spawn(Arc::clone(&conn).receive_loop());

        conn.quit("bye").await.unwrap();
        assert!(conn.is_terminated());
        assert!(conn.send_command("PING", &["x"]).is_err());
        timeout(Duration::from_secs(2), loop_task).await.unwrap().unwrap().unwrap();

        let mut server = BufReader::new(server);
        assert_eq!(next_line(&mut server).await, "CAP LS 302\r\n");
        assert_eq!(next_line(&mut server).await, "QUIT :bye\r\n");
        assert_eq!(next_line(&mut server).await, "");
        assert!(matches!(conn.quit("again").await, Err(ReactorError::NotConnected(_))));
    }
}
