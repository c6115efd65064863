//! Connection task and the handle consumers talk to.
//!
//! This is the main entry point for SDK consumers. [`connect`] opens the
//! transport, starts capability negotiation and spawns one task that owns
//! the [`Session`] and the socket. Everything else goes through the
//! cloneable [`ClientHandle`].
//!
//! ## Reconnection
//!
//! The SDK does not reconnect on its own. Consumers watch for
//! `ConnectionState { phase: Disconnected, .. }` and call [`connect`] again
//! with whatever backoff they like.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::{CAP_TIMEOUT, ConnectionConfig};
use crate::envelope::EncryptionService;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::framer::LineFramer;
use crate::session::{Phase, Session};
use crate::transport::{self, Transport};

/// Silence after which a keepalive PING is sent.
pub const PING_INTERVAL: Duration = Duration::from_secs(60);
/// Silence after which the connection is considered dead.
pub const PING_TIMEOUT: Duration = Duration::from_secs(120);

const READ_BUFFER: usize = 8192;
const COMMAND_QUEUE: usize = 256;

/// Commands the consumer can send to the connection task.
pub enum Command {
    Subscribe(mpsc::UnboundedSender<Event>),
    Join { channel: String, key: Option<String> },
    Part { channel: String, reason: Option<String> },
    Message { target: String, text: String },
    /// Raw user input: `/command` or plain text.
    Input { input: String, target: Option<String> },
    Ctcp { target: String, command: String, args: Option<String> },
    Monitor(String),
    Unmonitor(String),
    Names(String),
    SetActive(Option<String>),
    Raw(String),
    SetEncryption(Box<dyn EncryptionService>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Subscribe(_) => f.write_str("Subscribe"),
            Command::Join { channel, .. } => write!(f, "Join({channel})"),
            Command::Part { channel, .. } => write!(f, "Part({channel})"),
            Command::Message { target, .. } => write!(f, "Message({target})"),
            Command::Input { .. } => f.write_str("Input"),
            Command::Ctcp { target, command, .. } => write!(f, "Ctcp({target}, {command})"),
            Command::Monitor(nick) => write!(f, "Monitor({nick})"),
            Command::Unmonitor(nick) => write!(f, "Unmonitor({nick})"),
            Command::Names(channel) => write!(f, "Names({channel})"),
            Command::SetActive(target) => write!(f, "SetActive({target:?})"),
            Command::Raw(_) => f.write_str("Raw"),
            Command::SetEncryption(_) => f.write_str("SetEncryption"),
        }
    }
}

/// One-shot manual disconnect flag shared by every handle of a connection.
/// The first reason set wins.
#[derive(Debug, Clone)]
pub struct DisconnectToken {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for DisconnectToken {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }
}

impl DisconnectToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a disconnect. Returns false if one was already requested.
    pub fn disconnect(&self, reason: Option<&str>) -> bool {
        let reason = reason.filter(|r| !r.is_empty()).unwrap_or("Leaving").to_string();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_disconnected(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

/// Handle for sending commands to a running connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    network: String,
    cmd_tx: mpsc::Sender<Command>,
    token: DisconnectToken,
}

impl ClientHandle {
    pub fn network(&self) -> &str {
        &self.network
    }

    /// The connection task has ended.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub fn disconnect_token(&self) -> DisconnectToken {
        self.token.clone()
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::Closed)
    }

    /// Attach an event subscriber. The first one also receives everything
    /// emitted before it attached.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Event>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(Command::Subscribe(tx)).await?;
        Ok(rx)
    }

    /// Send QUIT (if connected) and close the transport.
    pub fn disconnect(&self, reason: Option<&str>) {
        if self.token.disconnect(reason) {
            tracing::info!(network = %self.network, "Disconnect requested");
        }
    }

    pub async fn join_channel(&self, channel: &str, key: Option<&str>) -> Result<()> {
        self.send(Command::Join {
            channel: channel.to_string(),
            key: key.map(str::to_string),
        })
        .await
    }

    pub async fn part_channel(&self, channel: &str, reason: Option<&str>) -> Result<()> {
        self.send(Command::Part {
            channel: channel.to_string(),
            reason: reason.map(str::to_string),
        })
        .await
    }

    pub async fn send_message(&self, target: &str, text: &str) -> Result<()> {
        self.send(Command::Message {
            target: target.to_string(),
            text: text.to_string(),
        })
        .await
    }

    /// A `/command` or plain text for `target` (the active target if `None`).
    pub async fn send_command(&self, input: &str, target: Option<&str>) -> Result<()> {
        self.send(Command::Input {
            input: input.to_string(),
            target: target.map(str::to_string),
        })
        .await
    }

    pub async fn send_ctcp_request(&self, target: &str, command: &str, args: Option<&str>) -> Result<()> {
        self.send(Command::Ctcp {
            target: target.to_string(),
            command: command.to_string(),
            args: args.map(str::to_string),
        })
        .await
    }

    pub async fn monitor_nick(&self, nick: &str) -> Result<()> {
        self.send(Command::Monitor(nick.to_string())).await
    }

    pub async fn unmonitor_nick(&self, nick: &str) -> Result<()> {
        self.send(Command::Unmonitor(nick.to_string())).await
    }

    pub async fn request_channel_users(&self, channel: &str) -> Result<()> {
        self.send(Command::Names(channel.to_string())).await
    }

    pub async fn set_active_target(&self, target: Option<&str>) -> Result<()> {
        self.send(Command::SetActive(target.map(str::to_string))).await
    }

    pub async fn set_encryption(&self, service: impl EncryptionService) -> Result<()> {
        self.send(Command::SetEncryption(Box::new(service))).await
    }

    /// Send a raw IRC line.
    pub async fn raw(&self, line: &str) -> Result<()> {
        self.send(Command::Raw(line.to_string())).await
    }
}

/// Connect to an IRC server and run the client.
///
/// Resolves once the transport is usable and `CAP LS` is queued; fails on
/// socket, proxy or TLS errors and after [`crate::config::CONNECT_TIMEOUT`].
/// Phase changes during setup are buffered for the first subscriber.
pub async fn connect(config: ConnectionConfig, network: &str) -> Result<ClientHandle> {
    connect_session(Session::new(config, network)).await
}

pub async fn connect_with_encryption(
    config: ConnectionConfig,
    network: &str,
    service: impl EncryptionService,
) -> Result<ClientHandle> {
    connect_session(Session::new(config, network).with_encryption(service)).await
}

async fn connect_session(mut session: Session) -> Result<ClientHandle> {
    let config = session.config().clone();
    config.validate()?;
    let network = session.network().to_string();

    let transport = match transport::establish(&config, |phase| session.set_phase(phase, None)).await {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(%network, error = %e, "Connection failed");
            return Err(e);
        }
    };
    session.start();

    Ok(match transport {
        Transport::Plain(tcp) => spawn_session(session, tcp),
        Transport::Tls(tls) => spawn_session(session, *tls),
    })
}

/// Start the connection task on an established stream. The session must
/// already be started.
fn spawn_session<S>(session: Session, stream: S) -> ClientHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let network = session.network().to_string();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let token = DisconnectToken::new();
    tokio::spawn(run(session, stream, cmd_rx, token.clone()));
    ClientHandle {
        network,
        cmd_tx,
        token,
    }
}

/// How the read loop ended.
enum Exit {
    /// Disconnect token or local QUIT.
    Manual(String),
    /// Server asked to close (ERROR, banned numerics).
    Requested(String),
    /// The socket failed or timed out.
    Lost(String, Option<Error>),
    /// Every handle is gone.
    Abandoned,
}

async fn run<S>(
    mut session: Session,
    stream: S,
    mut cmd_rx: mpsc::Receiver<Command>,
    token: DisconnectToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let addr = session.config().server_addr();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut cancel = token.watch();
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut last_activity = Instant::now();
    let cap_deadline = Instant::now() + CAP_TIMEOUT;

    let exit = loop {
        if let Err(e) = flush(&mut session, &mut writer, &addr).await {
            break Exit::Lost("Write failed".into(), Some(e));
        }
        if let Some(reason) = token.reason() {
            break Exit::Manual(reason);
        }
        if let Some(reason) = session.close_requested() {
            break Exit::Requested(reason.to_string());
        }

        let keepalive_at = if session.awaiting_pong.is_some() {
            last_activity + PING_TIMEOUT
        } else {
            last_activity + PING_INTERVAL
        };

        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed by server");
                    break Exit::Lost("Connection closed by server".into(), Some(Error::transport(addr.clone(), eof)));
                }
                Ok(n) => {
                    last_activity = Instant::now();
                    for line in framer.push(&buf[..n]) {
                        session.handle_line(&line);
                    }
                }
                Err(e) => break Exit::Lost(e.to_string(), Some(Error::transport(addr.clone(), e))),
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => {
                    let quitting = matches!(&cmd, Command::Input { input, .. } if is_quit(input));
                    apply(&mut session, cmd);
                    if quitting && let Some(reason) = session.close_requested() {
                        let _ = token.disconnect(Some(reason));
                    }
                }
                None => break Exit::Abandoned,
            },
            _ = tokio::time::sleep_until(cap_deadline), if session.cap_pending() => {
                session.on_cap_timeout();
            }
            _ = tokio::time::sleep_until(keepalive_at) => {
                if last_activity.elapsed() >= PING_TIMEOUT {
                    let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "ping timeout");
                    break Exit::Lost("Ping timeout".into(), Some(Error::transport(addr.clone(), timeout)));
                }
                session.send_keepalive(chrono::Utc::now().timestamp_millis());
            }
            _ = cancel.changed() => {}
        }
    };

    match exit {
        Exit::Manual(reason) => {
            if session.close_requested().is_none() {
                session.quit(Some(&reason));
            }
            let _ = flush(&mut session, &mut writer, &addr).await;
            let _ = writer.shutdown().await;
            session.on_transport_closed(&reason, None);
        }
        Exit::Abandoned => {
            session.quit(None);
            let _ = flush(&mut session, &mut writer, &addr).await;
            let _ = writer.shutdown().await;
            session.on_transport_closed("Client dropped", None);
        }
        Exit::Requested(reason) => {
            let _ = writer.shutdown().await;
            drop((reader, writer));
            session.on_transport_closed(&reason, None);
            linger(session, cmd_rx, token).await;
        }
        Exit::Lost(reason, error) => {
            tracing::warn!(network = %session.network(), %reason, "Connection lost");
            drop((reader, writer));
            session.on_transport_closed(&reason, error.as_ref());
            linger(session, cmd_rx, token).await;
        }
    }
}

/// After an unexpected close the session stays reachable so sends are
/// reported (plain text as `QueueMessage`) until the consumer lets go or
/// types `/quit`.
async fn linger(mut session: Session, mut cmd_rx: mpsc::Receiver<Command>, token: DisconnectToken) {
    let mut cancel = token.watch();
    if token.is_disconnected() {
        return;
    }
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => {
                    let quitting = matches!(&cmd, Command::Input { input, .. } if is_quit(input));
                    apply(&mut session, cmd);
                    if quitting {
                        return;
                    }
                }
                None => return,
            },
            _ = cancel.changed() => return,
        }
    }
}

fn is_quit(input: &str) -> bool {
    let word = input.split_whitespace().next().unwrap_or("");
    word.eq_ignore_ascii_case("/quit")
}

fn apply(session: &mut Session, cmd: Command) {
    tracing::trace!(network = %session.network(), ?cmd, "Command");
    match cmd {
        Command::Subscribe(tx) => session.attach(tx),
        Command::Join { channel, key } => session.join_channel(&channel, key.as_deref()),
        Command::Part { channel, reason } => session.part_channel(&channel, reason.as_deref()),
        Command::Message { target, text } => session.send_message(&target, &text),
        Command::Input { input, target } => session.send_command(&input, target.as_deref()),
        Command::Ctcp { target, command, args } => session.send_ctcp_request(&target, &command, args.as_deref()),
        Command::Monitor(nick) => session.monitor_nick(&nick),
        Command::Unmonitor(nick) => session.unmonitor_nick(&nick),
        Command::Names(channel) => session.request_channel_users(&channel),
        Command::SetActive(target) => session.set_active_target(target),
        Command::Raw(line) => session.send_raw(&line),
        Command::SetEncryption(service) => session.set_encryption(service),
    }
}

async fn flush<W>(session: &mut Session, writer: &mut W, addr: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let lines = session.take_outgoing();
    if lines.is_empty() || session.phase() == Phase::Disconnected {
        return Ok(());
    }
    for line in lines {
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::transport(addr, e))?;
    }
    writer.flush().await.map_err(|e| Error::transport(addr, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_one_shot() {
        let token = DisconnectToken::new();
        assert!(!token.is_disconnected());
        assert!(token.disconnect(Some("first")));
        assert!(!token.disconnect(Some("second")));
        assert_eq!(token.reason().as_deref(), Some("first"));
        assert!(token.clone().is_disconnected());
    }

    #[test]
    fn empty_reason_defaults() {
        let token = DisconnectToken::new();
        token.disconnect(Some(""));
        assert_eq!(token.reason().as_deref(), Some("Leaving"));
    }

    #[test]
    fn quit_detection() {
        assert!(is_quit("/quit bye"));
        assert!(is_quit("/QUIT"));
        assert!(!is_quit("//quit"));
        assert!(!is_quit("quit"));
    }

    struct Peer {
        lines: tokio::io::Lines<tokio::io::BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
        writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    }

    impl Peer {
        async fn next(&mut self) -> Option<String> {
            self.lines.next_line().await.unwrap()
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
        }
    }

    fn spawn_over_pipe(nick: &str) -> (ClientHandle, Peer) {
        use tokio::io::AsyncBufReadExt;

        let (client, server) = tokio::io::duplex(4096);
        let mut session = Session::new(ConnectionConfig::new("irc.example.net", 6667, nick), "test");
        session.start();
        let handle = spawn_session(session, client);
        let (r, writer) = tokio::io::split(server);
        let peer = Peer {
            lines: tokio::io::BufReader::new(r).lines(),
            writer,
        };
        (handle, peer)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>, pred: impl Fn(&Event) -> bool) -> Event {
        loop {
            let ev = rx.recv().await.unwrap();
            if pred(&ev) {
                return ev;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cap_watchdog_registers_without_cap_reply() {
        let (handle, mut peer) = spawn_over_pipe("tester");
        let started = Instant::now();
        assert_eq!(peer.next().await.as_deref(), Some("CAP LS 302"));

        assert_eq!(peer.next().await.as_deref(), Some("CAP END"));
        assert!(started.elapsed() >= CAP_TIMEOUT);
        assert_eq!(peer.next().await.as_deref(), Some("NICK tester"));
        assert_eq!(peer.next().await.as_deref(), Some("USER tester 0 * :drift IRC client"));
        handle.disconnect(None);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_gets_pinged_then_dropped() {
        let (handle, mut peer) = spawn_over_pipe("tester");
        let mut events = handle.subscribe().await.unwrap();
        assert_eq!(peer.next().await.as_deref(), Some("CAP LS 302"));
        peer.send(":srv CAP * LS :").await;
        assert_eq!(peer.next().await.as_deref(), Some("CAP END"));
        assert_eq!(peer.next().await.as_deref(), Some("NICK tester"));
        assert_eq!(peer.next().await.as_deref(), Some("USER tester 0 * :drift IRC client"));
        peer.send(":srv 001 tester :Welcome").await;
        next_event(&mut events, |e| matches!(e, Event::Registered { .. })).await;
        let registered_at = Instant::now();

        let ping = peer.next().await.unwrap();
        assert!(ping.starts_with("PING :drift-"), "{ping}");
        assert!(registered_at.elapsed() >= PING_INTERVAL);

        let err = next_event(&mut events, |e| matches!(e, Event::Error { .. })).await;
        assert!(matches!(err, Event::Error { kind: crate::error::ErrorKind::Transport, .. }));
        let closed = next_event(&mut events, |e| {
            matches!(e, Event::ConnectionState { phase: Phase::Disconnected, .. })
        })
        .await;
        assert!(matches!(
            closed,
            Event::ConnectionState { detail: Some(ref d), .. } if d == "Ping timeout"
        ));
        assert!(registered_at.elapsed() >= PING_TIMEOUT);

        // The socket is released while the task lingers.
        assert_eq!(peer.next().await, None);
        assert!(!handle.is_closed());
        handle.send_command("/quit", None).await.unwrap();
        while !handle.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pong_keeps_connection_alive() {
        let (handle, mut peer) = spawn_over_pipe("tester");
        let mut events = handle.subscribe().await.unwrap();
        peer.next().await;
        peer.send(":srv CAP * LS :").await;
        for _ in 0..3 {
            peer.next().await;
        }
        peer.send(":srv 001 tester :Welcome").await;

        for _ in 0..3 {
            let ping = peer.next().await.unwrap();
            let token = ping.strip_prefix("PING :").unwrap().to_string();
            peer.send(&format!(":srv PONG srv :{token}")).await;
            next_event(&mut events, |e| matches!(e, Event::Pong { token: t, .. } if *t == token)).await;
        }
        handle.disconnect(Some("done"));
        assert_eq!(peer.next().await.as_deref(), Some("QUIT :done"));
    }

    #[tokio::test]
    async fn connect_rejects_invalid_config() {
        let err = connect(ConnectionConfig::new("", 6667, "me"), "test").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
