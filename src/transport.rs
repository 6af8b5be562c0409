//! Socket transport: newline-delimited JSON over TCP or unix sockets.
//!
//! Socket tasks own only `Send` data and run as regular tokio tasks. They
//! talk to the bus task through channels.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commander::PeerSender;
use crate::config::{BusConfig, HordeConfig};
use crate::error::BusError;
use crate::identity::generate_orc_name;
use crate::message::{parse_envelope, Envelope, Message};
use crate::notifier::{orc_topic, Notification, Notifier, REGISTRY_CHANGED};
use crate::registry::RegistrySnapshot;
use crate::router::AUTOCONNECT;

/// Delay before a horde link tries again.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const MAX_BIND_ATTEMPTS: u16 = 100;

/// Where a socket ended up listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Endpoint {
    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Tcp(addr) => Some(addr.port()),
            Endpoint::Unix(_) => None,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}

/// Bind `host:port`, moving to the next port while the address is taken.
/// Any other failure is fatal.
pub async fn bind_with_retry(host: &str, port: u16) -> Result<TcpListener, BusError> {
    let mut port = port;
    for _ in 0..MAX_BIND_ATTEMPTS {
        let address = format!("{}:{}", host, port);
        match TcpListener::bind(&address).await {
            Ok(listener) => {
                debug!(address = %address, "socket bound");
                return Ok(listener);
            }
            Err(e) if is_retryable(&e) => {
                warn!(address = %address, error = %e, "cannot bind, trying next port");
                port = port
                    .checked_add(1)
                    .ok_or_else(|| BusError::PortsExhausted(host.to_string()))?;
            }
            Err(e) => return Err(BusError::Bind { address, source: e }),
        }
    }
    Err(BusError::PortsExhausted(host.to_string()))
}

/// Both bus sockets and their serving tasks.
pub struct Sockets {
    pub commander: Endpoint,
    pub notifier: Endpoint,
    tasks: Vec<JoinHandle<()>>,
}

impl Sockets {
    /// Stop serving and remove unix socket files.
    pub fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
        for endpoint in [&self.commander, &self.notifier] {
            if let Endpoint::Unix(path) = endpoint {
                let _ = std::fs::remove_file(path);
            }
        }
        info!("sockets closed");
    }
}

/// Bind the command and notification sockets described by `config`.
pub async fn open(
    config: &BusConfig,
    inbound: mpsc::Sender<Envelope>,
    notifier: &Notifier,
    accept: Arc<AtomicBool>,
) -> Result<Sockets, BusError> {
    if config.tls_requested() {
        warn!("TLS material configured; sockets are plain, terminate TLS in front of the bus");
    }

    if let Some(id) = &config.unix_socket_id {
        return open_unix(config, id, inbound, notifier, accept).await;
    }

    let commander = bind_with_retry(config.commander_host(), config.commander_port).await?;
    let notifier_listener = bind_with_retry(config.notifier_host(), config.notifier_port).await?;
    let commander_addr = commander.local_addr()?;
    let notifier_addr = notifier_listener.local_addr()?;
    info!(commander = %commander_addr, notifier = %notifier_addr, "bus sockets bound");

    let notifier = notifier.clone();
    let tasks = vec![
        tokio::spawn(serve_commands(commander, inbound, accept)),
        tokio::spawn(serve_notifications(notifier_listener, notifier)),
    ];
    Ok(Sockets {
        commander: Endpoint::Tcp(commander_addr),
        notifier: Endpoint::Tcp(notifier_addr),
        tasks,
    })
}

#[cfg(unix)]
async fn open_unix(
    config: &BusConfig,
    id: &str,
    inbound: mpsc::Sender<Envelope>,
    notifier: &Notifier,
    accept: Arc<AtomicBool>,
) -> Result<Sockets, BusError> {
    use tokio::net::UnixListener;

    std::fs::create_dir_all(&config.run_dir)?;
    let commander_path = config.run_dir.join(format!("{}-commander.sock", id));
    let notifier_path = config.run_dir.join(format!("{}-notifier.sock", id));

    let bind = |path: &PathBuf| -> Result<UnixListener, BusError> {
        // a previous run may have left its socket file behind
        let _ = std::fs::remove_file(path);
        UnixListener::bind(path).map_err(|source| BusError::Bind {
            address: path.display().to_string(),
            source,
        })
    };
    let commander = bind(&commander_path)?;
    let notifier_listener = bind(&notifier_path)?;
    info!(
        commander = %commander_path.display(),
        notifier = %notifier_path.display(),
        "bus unix sockets bound"
    );

    let notifier = notifier.clone();
    let tasks = vec![
        tokio::spawn(async move {
            loop {
                match commander.accept().await {
                    Ok((stream, _)) => {
                        if !accept.load(Ordering::Relaxed) {
                            debug!("incoming connection refused");
                            continue;
                        }
                        tokio::spawn(read_commands(stream, inbound.clone(), "unix".to_string()));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }),
        tokio::spawn(async move {
            loop {
                match notifier_listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(write_notifications(stream, notifier.subscribe()));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }),
    ];
    Ok(Sockets {
        commander: Endpoint::Unix(commander_path),
        notifier: Endpoint::Unix(notifier_path),
        tasks,
    })
}

#[cfg(not(unix))]
async fn open_unix(
    _config: &BusConfig,
    id: &str,
    _inbound: mpsc::Sender<Envelope>,
    _notifier: &Notifier,
    _accept: Arc<AtomicBool>,
) -> Result<Sockets, BusError> {
    Err(BusError::Transport(format!(
        "unix socket {} requested on a platform without unix sockets",
        id
    )))
}

/// Accept command connections and feed their frames to `inbound`. While
/// `accept` is false new connections are dropped.
pub async fn serve_commands(
    listener: TcpListener,
    inbound: mpsc::Sender<Envelope>,
    accept: Arc<AtomicBool>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if !accept.load(Ordering::Relaxed) {
                    debug!(peer = %peer, "incoming connection refused");
                    continue;
                }
                debug!(peer = %peer, "commander connection");
                tokio::spawn(read_commands(stream, inbound.clone(), peer.to_string()));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn read_commands<R>(reader: R, inbound: mpsc::Sender<Envelope>, peer: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_envelope(line.as_bytes()) {
                    Ok(envelope) => {
                        if inbound.send(envelope).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "failed to parse command"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %peer, error = %e, "connection error");
                break;
            }
        }
    }
    debug!(peer = %peer, "commander connection closed");
}

/// Accept subscribers; each one receives every notification from now on.
pub async fn serve_notifications(listener: TcpListener, notifier: Notifier) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "notifier subscriber");
                tokio::spawn(write_notifications(stream, notifier.subscribe()));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn write_notifications<W>(mut writer: W, mut rx: broadcast::Receiver<Notification>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        match rx.recv().await {
            Ok(notification) => {
                let line = match encode_line(&notification) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(topic = %notification.topic, error = %e, "cannot encode notification");
                        continue;
                    }
                };
                if writer.write_all(&line).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "slow subscriber, notifications dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// One JSON frame followed by a newline.
pub fn encode_line<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, BusError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

async fn connect(address: &str, timeout_ms: u64) -> io::Result<TcpStream> {
    if timeout_ms == 0 {
        return TcpStream::connect(address).await;
    }
    tokio::time::timeout(Duration::from_millis(timeout_ms), TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))?
}

/// What horde links report back to the bus task.
#[derive(Debug, Clone)]
pub enum HordeEvent {
    Registry {
        horde: String,
        registry: RegistrySnapshot,
    },
    Lost(String),
}

/// State shared by the two tasks of one horde link.
#[derive(Debug, Clone, Default)]
struct LinkState {
    /// Bumped every time the subscription (re)connects
    generation: u64,
    /// Token the horde handed out on autoconnect
    token: Option<String>,
}

/// Push links and registry subscriptions towards every configured horde.
pub struct HordeLinks {
    orc_name: String,
    pushes: HashMap<String, mpsc::UnboundedSender<Envelope>>,
    tasks: Vec<JoinHandle<()>>,
}

impl HordeLinks {
    pub fn connect(
        hordes: &[HordeConfig],
        timeout_ms: u64,
        events: mpsc::UnboundedSender<HordeEvent>,
    ) -> Self {
        let orc_name = generate_orc_name();
        let mut pushes = HashMap::new();
        let mut tasks = Vec::new();

        for horde in hordes {
            let (tx, rx) = mpsc::unbounded_channel();
            let (state_tx, state_rx) = watch::channel(LinkState::default());
            let commander = format!("{}:{}", horde.host, horde.commander_port);
            let notifier = format!("{}:{}", horde.host, horde.notifier_port);
            info!(horde = %horde.name, commander = %commander, notifier = %notifier, "linking horde");

            tasks.push(tokio::spawn(push_link(
                horde.name.clone(),
                commander,
                timeout_ms,
                orc_name.clone(),
                rx,
                state_rx,
            )));
            tasks.push(tokio::spawn(subscription(
                horde.name.clone(),
                notifier,
                timeout_ms,
                orc_name.clone(),
                state_tx,
                events.clone(),
            )));
            pushes.insert(horde.name.clone(), tx);
        }

        Self {
            orc_name,
            pushes,
            tasks,
        }
    }

    /// Identity this bus uses when talking to its hordes.
    pub fn orc_name(&self) -> &str {
        &self.orc_name
    }

    pub fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for HordeLinks {
    fn drop(&mut self) {
        self.close();
    }
}

impl PeerSender for HordeLinks {
    fn forward(&self, horde: &str, cmd: &str, msg: &Message) -> Result<(), BusError> {
        let push = self
            .pushes
            .get(horde)
            .ok_or_else(|| BusError::UnknownPeer(horde.to_string()))?;
        push.send(Envelope::new(cmd, msg.clone()))
            .map_err(|_| BusError::Transport(format!("link to {} is closed", horde)))
    }
}

async fn push_link(
    horde: String,
    address: String,
    timeout_ms: u64,
    orc_name: String,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut state: watch::Receiver<LinkState>,
) {
    let mut pending: Option<Envelope> = None;
    loop {
        let mut stream = match connect(&address, timeout_ms).await {
            Ok(stream) => {
                info!(horde = %horde, "connected to horde commander");
                stream
            }
            Err(e) => {
                warn!(horde = %horde, error = %e, "cannot reach horde commander, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        let mut announced = 0;
        loop {
            let generation = state.borrow_and_update().generation;
            if generation > announced {
                // ask for the registry once the subscription can hear the answer
                announced = generation;
                let hello = Envelope::new(
                    AUTOCONNECT,
                    Message::new(AUTOCONNECT, json!(orc_name)).with_orc_name(orc_name.clone()),
                );
                if write_envelope(&mut stream, &hello).await.is_err() {
                    break;
                }
            }

            let mut envelope = match pending.take() {
                Some(envelope) => envelope,
                None => tokio::select! {
                    next = rx.recv() => match next {
                        Some(envelope) => envelope,
                        None => return,
                    },
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                },
            };

            if let Some(token) = state.borrow().token.clone() {
                envelope.msg.token = token;
            }
            if let Err(e) = write_envelope(&mut stream, &envelope).await {
                warn!(horde = %horde, cmd = %envelope.cmd, error = %e, "forward failed, reconnecting");
                pending = Some(envelope);
                break;
            }
            debug!(horde = %horde, cmd = %envelope.cmd, "forwarded");
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn write_envelope(stream: &mut TcpStream, envelope: &Envelope) -> Result<(), BusError> {
    let line = encode_line(envelope)?;
    stream.write_all(&line).await?;
    Ok(())
}

async fn subscription(
    horde: String,
    address: String,
    timeout_ms: u64,
    orc_name: String,
    state: watch::Sender<LinkState>,
    events: mpsc::UnboundedSender<HordeEvent>,
) {
    let welcome = orc_topic(&orc_name, &format!("{}.finished", AUTOCONNECT));
    loop {
        match connect(&address, timeout_ms).await {
            Ok(stream) => {
                info!(horde = %horde, "subscribed to horde notifier");
                state.send_modify(|s| s.generation += 1);

                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let notification: Notification = match serde_json::from_str(&line) {
                        Ok(n) => n,
                        Err(e) => {
                            debug!(horde = %horde, error = %e, "unreadable notification");
                            continue;
                        }
                    };

                    let registry = if notification.topic == REGISTRY_CHANGED {
                        notification.payload
                    } else if notification.topic == welcome {
                        if let Some(token) = notification.payload["token"].as_str() {
                            let token = token.to_string();
                            state.send_modify(|s| s.token = Some(token));
                        }
                        notification.payload["commands"].clone()
                    } else {
                        continue;
                    };

                    if registry == Value::Null {
                        continue;
                    }
                    match serde_json::from_value::<RegistrySnapshot>(registry) {
                        Ok(registry) => {
                            let event = HordeEvent::Registry {
                                horde: horde.clone(),
                                registry,
                            };
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(horde = %horde, error = %e, "unreadable horde registry"),
                    }
                }

                warn!(horde = %horde, "horde notifier lost");
                if events.send(HordeEvent::Lost(horde.clone())).is_err() {
                    return;
                }
            }
            Err(e) => warn!(horde = %horde, error = %e, "cannot reach horde notifier, retrying"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CommandPolicy, CommandSpec};
    use tokio::io::AsyncReadExt;

    async fn read_line(stream: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_bind_moves_to_next_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let listener = bind_with_retry("127.0.0.1", port).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_bind_other_errors_are_fatal() {
        // not an address of this host
        let err = bind_with_retry("192.0.2.1", 0).await.unwrap_err();
        assert!(matches!(err, BusError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_command_frames_reach_inbound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(serve_commands(listener, tx, Arc::new(AtomicBool::new(true))));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let envelope = Envelope::new(
            "math.add",
            Message::new("math.add", json!({"a": 1})).with_token("t"),
        );
        client.write_all(b"not json\n\n").await.unwrap();
        client.write_all(&encode_line(&envelope).unwrap()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.cmd, "math.add");
        assert_eq!(received.msg.token, "t");
        assert_eq!(received.msg.data["a"], 1);
    }

    #[tokio::test]
    async fn test_refused_when_not_accepting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        tokio::spawn(serve_commands(listener, tx, Arc::new(AtomicBool::new(false))));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        // the server drops the connection right away
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_notifications_reach_subscribers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notifier = Notifier::default();
        tokio::spawn(serve_notifications(listener, notifier.clone()));

        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        while notifier.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        notifier.send("orc::math.add.finished", json!(3));

        let line = read_line(&mut client).await;
        let notification: Notification = serde_json::from_str(&line).unwrap();
        assert_eq!(notification.topic, "orc::math.add.finished");
        assert_eq!(notification.payload, json!(3));
    }

    #[tokio::test]
    async fn test_horde_link_learns_registry_and_forwards() {
        let commander = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let notifier = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let horde = HordeConfig {
            name: "east".into(),
            host: "127.0.0.1".into(),
            commander_port: commander.local_addr().unwrap().port(),
            notifier_port: notifier.local_addr().unwrap().port(),
            tribe: None,
        };
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let links = HordeLinks::connect(&[horde], 0, events_tx);

        let (sub, _) = notifier.accept().await.unwrap();
        let (push, _) = commander.accept().await.unwrap();
        let mut sub = sub;
        let mut push = BufReader::new(push);

        let hello: Envelope = serde_json::from_str(&read_line(&mut push).await).unwrap();
        assert_eq!(hello.cmd, AUTOCONNECT);
        assert_eq!(hello.msg.orc_name, links.orc_name());

        let mut commands = RegistrySnapshot::new();
        commands.insert(
            "desk.open".into(),
            CommandSpec {
                name: "desk.open".into(),
                module: "desk".into(),
                version: "1.0.0".into(),
                hot: true,
                location: None,
                policy: CommandPolicy::default(),
                horde: None,
            },
        );
        let welcome = Notification::new(
            orc_topic(links.orc_name(), "autoconnect.finished"),
            json!({"orcName": links.orc_name(), "token": "east-token", "commands": commands}),
        );
        sub.write_all(&encode_line(&welcome).unwrap()).await.unwrap();

        match events.recv().await.unwrap() {
            HordeEvent::Registry { horde, registry } => {
                assert_eq!(horde, "east");
                assert!(registry.contains_key("desk.open"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // the token update may race the forward, so wait for it to land
        tokio::time::sleep(Duration::from_millis(50)).await;
        links
            .forward("east", "desk.open", &Message::new("desk.open", json!({})).with_token("ours"))
            .unwrap();
        let forwarded: Envelope = serde_json::from_str(&read_line(&mut push).await).unwrap();
        assert_eq!(forwarded.cmd, "desk.open");
        assert_eq!(forwarded.msg.token, "east-token");

        assert!(matches!(
            links.forward("west", "desk.open", &Message::default()),
            Err(BusError::UnknownPeer(_))
        ));
    }
}
