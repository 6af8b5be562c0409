//! The bus: wires the commander, the module registry and the transport
//! together and owns the built-in commands.

use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commander::{Commander, CommanderSettings, PeerSender, ERROR};
use crate::config::{BusConfig, RunRecord};
use crate::error::{BusError, BusResult};
use crate::identity::{generate_great_hall, generate_orc_name};
use crate::message::{Envelope, Message};
use crate::modules::{ModuleCatalog, ModuleRegistry};
use crate::notifier::{orc_topic, GAMEOVER, ORCNAME_ADDED, ORCNAME_REMOVED};
use crate::registry::Handler;
use crate::response::Response;
use crate::router::{HordeTable, RoutingPolicy, AUTOCONNECT};
use crate::transport::{self, Endpoint, HordeEvent, HordeLinks, Sockets};

pub const DISCONNECT: &str = "disconnect";
pub const SHUTDOWN: &str = "shutdown";
pub const MOTD: &str = "motd";
pub const MODULE_LOAD: &str = "bus.module.load";
pub const MODULE_UNLOAD: &str = "bus.module.unload";
pub const MODULE_RELOAD: &str = "bus.module.reload";
pub const COMMANDS_REGISTRY: &str = "bus.commands.registry";

const INBOUND_CAPACITY: usize = 1024;

/// Time left to subscribers to receive `gameover` before sockets close.
const STOP_GRACE: Duration = Duration::from_millis(100);

/// Receiving ends of the channels the transport feeds.
pub struct Inbound {
    pub commands: mpsc::Receiver<Envelope>,
    pub hordes: mpsc::UnboundedReceiver<HordeEvent>,
}

impl Inbound {
    /// Fresh channels, for buses driven without sockets.
    pub fn channel() -> (
        mpsc::Sender<Envelope>,
        mpsc::UnboundedSender<HordeEvent>,
        Self,
    ) {
        let (commands_tx, commands) = mpsc::channel(INBOUND_CAPACITY);
        let (hordes_tx, hordes) = mpsc::unbounded_channel();
        (commands_tx, hordes_tx, Self { commands, hordes })
    }
}

pub struct Bus {
    config: BusConfig,
    commander: Commander,
    modules: Rc<ModuleRegistry>,
    orcs: Rc<RefCell<BTreeSet<String>>>,
    accept: Arc<AtomicBool>,
    shutdown: Rc<Notify>,
    sockets: RefCell<Option<Sockets>>,
    links: Option<Rc<HordeLinks>>,
    heartbeat: RefCell<Option<JoinHandle<()>>>,
}

impl Bus {
    /// Build a bus without sockets. Built-in commands are registered.
    pub fn new(
        config: BusConfig,
        catalog: ModuleCatalog,
        peers: Rc<dyn PeerSender>,
        token: impl Into<String>,
    ) -> BusResult<Self> {
        let settings = CommanderSettings {
            routing: RoutingPolicy::from_config(&config),
            passive: config.passive,
            hordes: HordeTable::from_config(&config.hordes),
        };
        let commander = Commander::new(token, Default::default(), peers, settings);
        let modules = Rc::new(ModuleRegistry::new(
            commander.clone(),
            catalog,
            config.shared_module.clone(),
        ));

        let bus = Self {
            accept: Arc::new(AtomicBool::new(config.accept_incoming)),
            config,
            commander,
            modules,
            orcs: Rc::default(),
            shutdown: Rc::new(Notify::new()),
            sockets: RefCell::new(None),
            links: None,
            heartbeat: RefCell::new(None),
        };
        bus.register_builtins()?;
        Ok(bus)
    }

    /// Generate the token, bind the sockets, persist the run record, link
    /// hordes and load the configured modules.
    pub async fn boot(config: BusConfig, catalog: ModuleCatalog) -> BusResult<(Self, Inbound)> {
        let (commands_tx, hordes_tx, inbound) = Inbound::channel();
        let links = Rc::new(HordeLinks::connect(
            &config.hordes,
            config.timeout_ms,
            hordes_tx,
        ));
        let peers: Rc<dyn PeerSender> = links.clone();

        let mut bus = Self::new(config, catalog, peers, generate_great_hall())?;
        bus.links = Some(links);

        let sockets = transport::open(
            &bus.config,
            commands_tx,
            bus.commander.notifier(),
            Arc::clone(&bus.accept),
        )
        .await?;
        let record = RunRecord {
            host: bus.config.host.clone(),
            commander_port: sockets.commander.port().unwrap_or(0),
            notifier_port: sockets.notifier.port().unwrap_or(0),
            unix_socket_id: bus.config.unix_socket_id.clone(),
            key_path: bus.config.key_path.clone(),
            cert_path: bus.config.cert_path.clone(),
            no_tls: bus.config.no_tls,
            timeout: bus.config.timeout_ms,
        };
        let path = record.save(&bus.config.run_dir)?;
        info!(path = %path.display(), commander = %sockets.commander, notifier = %sockets.notifier, "bus sockets ready");
        *bus.sockets.borrow_mut() = Some(sockets);

        let resp = Response::greathall(bus.commander.clone(), MODULE_LOAD);
        for location in &bus.config.modules {
            if let Err(e) = bus.modules.load_location(Some(&resp), location).await {
                warn!(path = %location.path.display(), error = %e, "cannot load module location");
            }
        }

        if bus.config.heartbeat_ms > 0 {
            let period = Duration::from_millis(bus.config.heartbeat_ms);
            *bus.heartbeat.borrow_mut() = Some(bus.commander.notifier().spawn_heartbeat(period));
        }

        info!(modules = bus.modules.running_module_names(false).len(), "bus booted");
        Ok((bus, inbound))
    }

    /// Process inbound traffic until shutdown is requested or the command
    /// channel closes.
    pub async fn run(&self, mut inbound: Inbound) {
        info!("bus ready, entering main loop");
        loop {
            tokio::select! {
                envelope = inbound.commands.recv() => match envelope {
                    Some(Envelope { cmd, msg }) => self.commander.handle(cmd, msg),
                    None => {
                        warn!("command channel closed");
                        break;
                    }
                },
                Some(event) = inbound.hordes.recv() => self.on_horde_event(event),
                _ = self.shutdown.notified() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }
    }

    /// Announce `gameover`, then tear down timers, links and sockets.
    pub async fn stop(&self) {
        info!("bus stopping");
        self.commander.notifier().send(GAMEOVER, Value::Null);
        tokio::time::sleep(STOP_GRACE).await;

        if let Some(heartbeat) = self.heartbeat.borrow_mut().take() {
            heartbeat.abort();
        }
        if let Some(links) = &self.links {
            links.close();
        }
        let sockets = self.sockets.borrow_mut().take();
        if let Some(sockets) = sockets {
            sockets.close();
        }
    }

    pub fn handle(&self, cmd: impl Into<String>, msg: Message) {
        self.commander.handle(cmd.into(), msg);
    }

    /// Replace the bus token. Returns the new one.
    pub fn rotate_token(&self) -> String {
        let token = generate_great_hall();
        self.commander.set_token(token.clone());
        token
    }

    pub fn token(&self) -> String {
        self.commander.token()
    }

    pub fn set_accept_incoming(&self, accept: bool) {
        info!(accept, "incoming connections");
        self.accept.store(accept, Ordering::Relaxed);
    }

    pub fn accepts_incoming(&self) -> bool {
        self.accept.load(Ordering::Relaxed)
    }

    pub fn commander(&self) -> &Commander {
        &self.commander
    }

    pub fn modules(&self) -> &Rc<ModuleRegistry> {
        &self.modules
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn orc_names(&self) -> Vec<String> {
        self.orcs.borrow().iter().cloned().collect()
    }

    pub fn endpoints(&self) -> Option<(Endpoint, Endpoint)> {
        self.sockets
            .borrow()
            .as_ref()
            .map(|s| (s.commander.clone(), s.notifier.clone()))
    }

    fn on_horde_event(&self, event: HordeEvent) {
        match event {
            HordeEvent::Registry { horde, registry } => {
                if self.commander.update_horde_registry(&horde, registry) {
                    self.commander.notify_registry();
                }
            }
            HordeEvent::Lost(horde) => {
                debug!(horde = %horde, "forgetting horde registry");
                self.commander.clear_horde_registry(&horde);
                self.commander.notify_registry();
            }
        }
    }

    fn register_builtins(&self) -> Result<(), BusError> {
        let commander = &self.commander;

        let orcs = Rc::clone(&self.orcs);
        commander.register_builtin(
            AUTOCONNECT,
            "hand out an orc name and the bus token",
            Handler::sync(move |msg, resp| {
                let orc_name = match msg.data.as_str() {
                    Some(name) if !name.is_empty() => name.to_string(),
                    _ => generate_orc_name(),
                };
                orcs.borrow_mut().insert(orc_name.clone());
                info!(orc = %orc_name, "orc connected");

                let notifier = resp.notifier();
                notifier.send(ORCNAME_ADDED, json!({ "orcName": orc_name }));
                let commands = serde_json::to_value(resp.commander().full_registry())?;
                notifier.send(
                    orc_topic(&orc_name, &format!("{}.finished", AUTOCONNECT)),
                    json!({
                        "orcName": orc_name,
                        "token": resp.commander().token(),
                        "commands": commands,
                    }),
                );
                Ok(())
            }),
        )?;

        let orcs = Rc::clone(&self.orcs);
        commander.register_builtin(
            DISCONNECT,
            "forget the calling orc",
            Handler::sync(move |msg, resp| {
                if orcs.borrow_mut().remove(&msg.orc_name) {
                    info!(orc = %msg.orc_name, "orc disconnected");
                    resp.notifier()
                        .send(ORCNAME_REMOVED, json!({ "orcName": msg.orc_name }));
                }
                resp.finished(Value::Null);
                Ok(())
            }),
        )?;

        let shutdown = Rc::clone(&self.shutdown);
        commander.register_builtin(
            SHUTDOWN,
            "stop the bus",
            Handler::sync(move |_, resp| {
                warn!(orc = %resp.orc_name(), "shutdown command received");
                resp.finished(Value::Null);
                shutdown.notify_one();
                Ok(())
            }),
        )?;

        commander.register_builtin(
            ERROR,
            "report a failed command to its caller",
            Handler::sync(|msg, resp| {
                let cmd = msg.data["cmd"].as_str().unwrap_or(ERROR).to_string();
                resp.events_send(&format!("{}.error", cmd), msg.data);
                Ok(())
            }),
        )?;

        let orcs = Rc::clone(&self.orcs);
        commander.register_builtin(
            MOTD,
            "message of the day",
            Handler::sync(move |_, resp| {
                resp.finished(json!({
                    "motd": format!("orc-bus {} at your service", env!("CARGO_PKG_VERSION")),
                    "orcs": orcs.borrow().len(),
                }));
                Ok(())
            }),
        )?;

        commander.register_builtin(
            COMMANDS_REGISTRY,
            "full commands registry, hordes included",
            Handler::sync(|_, resp| {
                let registry = serde_json::to_value(resp.commander().full_registry())?;
                resp.finished(registry);
                Ok(())
            }),
        )?;

        let default_root = self
            .config
            .modules
            .first()
            .map(|m| m.path.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        let modules = Rc::downgrade(&self.modules);
        let root = default_root.clone();
        commander.register_builtin(
            MODULE_LOAD,
            "load modules: {file|files, path?, hot?}",
            Handler::task(move |msg, resp| {
                let modules = modules.clone();
                let root = root.clone();
                async move {
                    let modules = upgrade(&modules)?;
                    let files = string_list(&msg.data, "file", "files")?;
                    let root = path_arg(&msg.data).unwrap_or(root);
                    let hot = msg.data["hot"].as_bool().unwrap_or(true);
                    let loaded = modules.load(Some(&resp), &files, &root, hot).await?;
                    resp.finished(json!({ "loaded": loaded }));
                    Ok(())
                }
            }),
        )?;

        let modules = Rc::downgrade(&self.modules);
        commander.register_builtin(
            MODULE_UNLOAD,
            "unload modules: {name|names}",
            Handler::task(move |msg, resp| {
                let modules = modules.clone();
                async move {
                    let modules = upgrade(&modules)?;
                    let names = string_list(&msg.data, "name", "names")?;
                    let unloaded = modules.unload(Some(&resp), &names).await;
                    resp.finished(json!({ "unloaded": unloaded }));
                    Ok(())
                }
            }),
        )?;

        let modules = Rc::downgrade(&self.modules);
        let root = default_root;
        commander.register_builtin(
            MODULE_RELOAD,
            "reload modules keeping their hot flag: {file|files, path?}",
            Handler::task(move |msg, resp| {
                let modules = modules.clone();
                let root = root.clone();
                async move {
                    let modules = upgrade(&modules)?;
                    let files = string_list(&msg.data, "file", "files")?;
                    let root = path_arg(&msg.data).unwrap_or(root);
                    let reloaded = modules.reload(Some(&resp), &files, &root).await?;
                    resp.finished(json!({ "reloaded": reloaded }));
                    Ok(())
                }
            }),
        )?;

        Ok(())
    }
}

fn upgrade(modules: &Weak<ModuleRegistry>) -> Result<Rc<ModuleRegistry>, BusError> {
    modules
        .upgrade()
        .ok_or_else(|| BusError::handler("module registry is gone"))
}

/// `data[one]` as a single string or `data[many]` as a list of strings.
fn string_list(data: &Value, one: &str, many: &str) -> Result<Vec<String>, BusError> {
    if let Some(value) = data[one].as_str() {
        return Ok(vec![value.to_string()]);
    }
    let list = data[many]
        .as_array()
        .ok_or_else(|| BusError::BadArguments(format!("expected \"{}\" or \"{}\"", one, many)))?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(String::from)
                .ok_or_else(|| BusError::BadArguments(format!("\"{}\" must hold strings", many)))
        })
        .collect()
}

fn path_arg(data: &Value) -> Option<PathBuf> {
    data["path"].as_str().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commander::NoPeers;
    use crate::modules::{BusModule, ModuleCommands};
    use crate::notifier::{Notification, REGISTRY_CHANGED, TOKEN_CHANGED};
    use crate::registry::{CommandPolicy, CommandSpec, RegistrySnapshot};
    use tokio::sync::broadcast;
    use tokio::task::LocalSet;

    const TOKEN: &str = "great-hall";

    struct Desk;

    impl BusModule for Desk {
        fn commands(&self) -> Result<ModuleCommands, BusError> {
            Ok(ModuleCommands::new().handler(
                "open",
                Handler::sync(|_, resp| {
                    resp.finished(Value::Null);
                    Ok(())
                }),
            ))
        }
    }

    fn bus() -> Bus {
        let mut catalog = ModuleCatalog::new();
        catalog.provide("desk", || Ok(Rc::new(Desk) as Rc<dyn BusModule>));
        Bus::new(BusConfig::default(), catalog, Rc::new(NoPeers), TOKEN).unwrap()
    }

    fn msg(data: Value) -> Message {
        Message::new("", data).with_token(TOKEN).with_orc_name("orc")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    fn find<'a>(events: &'a [Notification], topic: &str) -> &'a Notification {
        events
            .iter()
            .find(|n| n.topic == topic)
            .unwrap_or_else(|| panic!("no {} event", topic))
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoconnect_and_disconnect() {
        LocalSet::new()
            .run_until(async {
                let bus = bus();
                let mut rx = bus.commander().notifier().subscribe();

                bus.handle(AUTOCONNECT, Message::new(AUTOCONNECT, json!("gorbag")));
                settle().await;
                assert_eq!(bus.orc_names(), vec!["gorbag"]);

                let events = drain(&mut rx);
                assert_eq!(find(&events, ORCNAME_ADDED).payload["orcName"], "gorbag");
                let welcome = find(&events, "gorbag::autoconnect.finished");
                assert_eq!(welcome.payload["token"], TOKEN);
                assert!(welcome.payload["commands"]["motd"].is_object());

                let mut bye = msg(Value::Null);
                bye.orc_name = "gorbag".into();
                bus.handle(DISCONNECT, bye);
                settle().await;
                assert!(bus.orc_names().is_empty());
                let events = drain(&mut rx);
                assert_eq!(find(&events, ORCNAME_REMOVED).payload["orcName"], "gorbag");
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoconnect_generates_name() {
        LocalSet::new()
            .run_until(async {
                let bus = bus();
                bus.handle(AUTOCONNECT, Message::new(AUTOCONNECT, Value::Null));
                settle().await;
                let names = bus.orc_names();
                assert_eq!(names.len(), 1);
                assert_eq!(names[0].split('-').count(), 3);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_module_commands() {
        LocalSet::new()
            .run_until(async {
                let bus = bus();
                let mut rx = bus.commander().notifier().subscribe();

                bus.handle(MODULE_LOAD, msg(json!({"file": "desk", "path": "/mods"})));
                settle().await;
                assert!(bus.commander().is_command_registered("desk.open"));
                assert!(bus.modules().record("desk").unwrap().hot);
                let events = drain(&mut rx);
                assert_eq!(
                    find(&events, "orc::bus.module.load.finished").payload["loaded"],
                    json!(["desk"])
                );
                assert!(find(&events, REGISTRY_CHANGED).payload["desk.open"].is_object());

                bus.handle(MODULE_RELOAD, msg(json!({"files": ["desk"], "path": "/mods"})));
                settle().await;
                assert!(bus.modules().record("desk").unwrap().hot);

                bus.handle(MODULE_UNLOAD, msg(json!({"names": ["desk"]})));
                settle().await;
                assert!(!bus.commander().is_module_registered("desk"));

                bus.handle(MODULE_UNLOAD, msg(json!({"names": "desk"})));
                settle().await;
                let events = drain(&mut rx);
                assert!(events
                    .iter()
                    .any(|n| n.topic == "orc::bus.module.unload.error"));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_module_load_without_files_fails() {
        LocalSet::new()
            .run_until(async {
                let bus = bus();
                let mut rx = bus.commander().notifier().subscribe();

                bus.handle(MODULE_LOAD, msg(json!({"files": [], "path": "/mods"})));
                settle().await;

                let events = drain(&mut rx);
                let failure = find(&events, "orc::bus.module.load.error");
                assert!(failure.payload["desc"].as_str().unwrap().contains("bad arguments"));
                assert!(!events
                    .iter()
                    .any(|n| n.topic == "orc::bus.module.load.finished"));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_registry_and_motd() {
        LocalSet::new()
            .run_until(async {
                let bus = bus();
                let mut rx = bus.commander().notifier().subscribe();
                bus.handle(COMMANDS_REGISTRY, msg(Value::Null));
                bus.handle(MOTD, msg(Value::Null));
                settle().await;

                let events = drain(&mut rx);
                let registry = &find(&events, "orc::bus.commands.registry.finished").payload;
                assert_eq!(registry["shutdown"]["module"], "bus");
                assert!(find(&events, "orc::motd.finished").payload["motd"]
                    .as_str()
                    .unwrap()
                    .starts_with("orc-bus"));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        LocalSet::new()
            .run_until(async {
                let bus = bus();
                let (commands, hordes, inbound) = Inbound::channel();

                let mut registry = RegistrySnapshot::new();
                registry.insert(
                    "desk.open".into(),
                    CommandSpec {
                        name: "desk.open".into(),
                        module: "desk".into(),
                        version: "1.0.0".into(),
                        hot: false,
                        location: None,
                        policy: CommandPolicy::default(),
                        horde: None,
                    },
                );
                // unknown horde: ignored
                hordes
                    .send(HordeEvent::Registry {
                        horde: "east".into(),
                        registry,
                    })
                    .unwrap();
                commands
                    .send(Envelope::new(SHUTDOWN, msg(Value::Null)))
                    .await
                    .unwrap();

                tokio::time::timeout(Duration::from_secs(1), bus.run(inbound))
                    .await
                    .unwrap();
                assert!(!bus.commander().full_registry().contains_key("desk.open"));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotate_token_and_stop() {
        LocalSet::new()
            .run_until(async {
                let bus = bus();
                let mut rx = bus.commander().notifier().subscribe();

                let token = bus.rotate_token();
                assert_eq!(bus.token(), token);
                assert_eq!(token.len(), 64);

                bus.stop().await;
                let topics: Vec<String> = drain(&mut rx).into_iter().map(|n| n.topic).collect();
                assert_eq!(topics, vec![TOKEN_CHANGED.to_string(), GAMEOVER.to_string()]);
            })
            .await;
    }

    #[test]
    fn test_string_list() {
        assert_eq!(string_list(&json!({"file": "a"}), "file", "files").unwrap(), vec!["a"]);
        assert_eq!(
            string_list(&json!({"files": ["a", "b"]}), "file", "files").unwrap(),
            vec!["a", "b"]
        );
        assert!(string_list(&json!({"files": [1]}), "file", "files").is_err());
        assert!(string_list(&json!({}), "file", "files").is_err());
    }

    #[test]
    fn test_accept_incoming_toggle() {
        let bus = bus();
        assert!(bus.accepts_incoming());
        bus.set_accept_incoming(false);
        assert!(!bus.accepts_incoming());
    }
}
