//! Commander: the dispatcher behind the command socket.
//!
//! Every inbound message goes through authenticate → resolve → admit → run.
//! The commander exclusively owns the command registry and the horde table;
//! the module registry mutates them only through the methods below. All of
//! it lives on one `LocalSet`, so plain `RefCell`s are enough.

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, error, info, warn};

use crate::activity::{activity_key, ActivityGate, ActivityRun};
use crate::error::{BusError, BusResult};
use crate::executor::{Executor, Priority};
use crate::identity::generate_router_id;
use crate::message::Message;
use crate::notifier::{orc_topic, Notifier, REGISTRY_CHANGED, TOKEN_CHANGED};
use crate::registry::{
    CommandPolicy, CommandRegistry, Handler, HandlerResult, ModuleInfo, RegistrySnapshot,
};
use crate::response::Response;
use crate::router::{self, is_silent_when_missing, HordeTable, Route, RoutingPolicy, AUTOCONNECT};

pub use crate::router::BUS_MODULE;

/// Name of the failure sink.
pub const ERROR: &str = "error";

/// Delivers a message verbatim to a horde.
pub trait PeerSender {
    fn forward(&self, horde: &str, cmd: &str, msg: &Message) -> Result<(), BusError>;
}

/// Used when no horde is configured.
pub struct NoPeers;

impl PeerSender for NoPeers {
    fn forward(&self, horde: &str, _cmd: &str, _msg: &Message) -> Result<(), BusError> {
        Err(BusError::UnknownPeer(horde.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommanderSettings {
    pub routing: RoutingPolicy,
    /// Never forward towards the hierarchy
    pub passive: bool,
    pub hordes: HordeTable,
}

/// How a nested command was carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nested {
    /// The handler ran here and returned.
    Completed,
    /// Nobody serves the lifecycle hook; it counts as done.
    Acknowledged,
    /// Sent to `horde`. The remote outcome is not awaited; it reaches the
    /// caller as `<orc>::<cmd>.finished` or `.error` on the horde's notifier.
    Forwarded(String),
}

enum Dispatch {
    Local,
    Forwarded(String),
    Acknowledge,
    Missing,
}

struct Inner {
    router_id: String,
    token: RefCell<String>,
    registry: RefCell<CommandRegistry>,
    hordes: RefCell<HordeTable>,
    routing: RoutingPolicy,
    passive: bool,
    executor: Executor,
    gate: ActivityGate,
    notifier: Notifier,
    peers: Rc<dyn PeerSender>,
}

#[derive(Clone)]
pub struct Commander {
    inner: Rc<Inner>,
}

impl Commander {
    pub fn new(
        token: impl Into<String>,
        notifier: Notifier,
        peers: Rc<dyn PeerSender>,
        settings: CommanderSettings,
    ) -> Self {
        let executor = Executor::new();
        Self {
            inner: Rc::new(Inner {
                router_id: generate_router_id(),
                token: RefCell::new(token.into()),
                registry: RefCell::new(CommandRegistry::new()),
                hordes: RefCell::new(settings.hordes),
                routing: settings.routing,
                passive: settings.passive,
                gate: ActivityGate::new(executor.clone()),
                executor,
                notifier,
                peers,
            }),
        }
    }

    pub fn token(&self) -> String {
        self.inner.token.borrow().clone()
    }

    pub fn router_id(&self) -> &str {
        &self.inner.router_id
    }

    /// Rotate the bus token. Messages carrying the previous token are
    /// rejected from now on.
    pub fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        *self.inner.token.borrow_mut() = token.clone();
        info!("bus token rotated");
        self.inner
            .notifier
            .send(TOKEN_CHANGED, json!({ "token": token }));
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn register_command(
        &self,
        name: &str,
        location: Option<PathBuf>,
        info: ModuleInfo,
        policy: CommandPolicy,
        handler: Handler,
    ) -> Result<(), BusError> {
        self.inner
            .registry
            .borrow_mut()
            .register(name, location, info, policy, handler)
    }

    /// Register one of the bus's own commands.
    pub fn register_builtin(&self, name: &str, desc: &str, handler: Handler) -> Result<(), BusError> {
        self.register_command(
            name,
            None,
            ModuleInfo::new(BUS_MODULE, env!("CARGO_PKG_VERSION"), false),
            CommandPolicy::builtin(desc),
            handler,
        )
    }

    pub fn is_command_registered(&self, name: &str) -> bool {
        self.inner.registry.borrow().is_registered(name)
    }

    pub fn is_module_registered(&self, module: &str) -> bool {
        self.inner.registry.borrow().is_module_registered(module)
    }

    pub fn unregister_module(&self, module: &str) -> Vec<PathBuf> {
        self.inner.registry.borrow_mut().unregister_module(module)
    }

    /// Run `f` against the registry without exposing a mutable handle.
    pub fn with_registry<R>(&self, f: impl FnOnce(&CommandRegistry) -> R) -> R {
        f(&self.inner.registry.borrow())
    }

    pub fn full_registry(&self) -> RegistrySnapshot {
        let hordes = self.inner.hordes.borrow();
        self.inner
            .registry
            .borrow()
            .full_registry(hordes.registries())
    }

    pub fn update_horde_registry(&self, horde: &str, registry: RegistrySnapshot) -> bool {
        self.inner
            .hordes
            .borrow_mut()
            .update_registry(horde, registry)
    }

    pub fn clear_horde_registry(&self, horde: &str) {
        self.inner.hordes.borrow_mut().clear_registry(horde);
    }

    /// Announce the full registry to every subscriber.
    pub fn notify_registry(&self) {
        match serde_json::to_value(self.full_registry()) {
            Ok(registry) => {
                self.inner.notifier.send(REGISTRY_CHANGED, registry);
            }
            Err(e) => warn!(error = %e, "cannot serialize commands registry"),
        }
    }

    /// Entry point for messages delivered by the transport.
    pub fn handle(&self, cmd: String, mut msg: Message) {
        debug!(cmd = %cmd, "begin command");

        if !self.authenticate(&cmd, &msg) {
            debug!(cmd = %cmd, "invalid token, command discarded");
            return;
        }
        msg.cmd = cmd.clone();

        let (cmd, msg) = match self.route(&cmd, &msg) {
            Dispatch::Forwarded(_) => return,
            Dispatch::Acknowledge => {
                self.acknowledge(&cmd, &msg);
                return;
            }
            Dispatch::Local => (cmd, msg),
            Dispatch::Missing => self.unavailable(cmd, msg),
        };

        self.admit(cmd, msg);
    }

    /// Run a command issued by a running handler. Nested calls never wait on
    /// the activity gate nor on the executor. Local handlers are awaited to
    /// completion; forwarded ones are not.
    pub async fn dispatch_nested(&self, cmd: String, mut msg: Message) -> BusResult<Nested> {
        msg.is_nested = true;
        msg.cmd = cmd.clone();

        match self.route(&cmd, &msg) {
            Dispatch::Forwarded(horde) => Ok(Nested::Forwarded(horde)),
            Dispatch::Acknowledge => Ok(Nested::Acknowledged),
            Dispatch::Local => self.run_command(cmd, msg).await.map(|()| Nested::Completed),
            Dispatch::Missing => {
                let (error_cmd, error_msg) = self.unavailable(cmd.clone(), msg);
                let _ = self.run_command(error_cmd, error_msg).await;
                Err(BusError::CommandUnavailable(cmd))
            }
        }
    }

    fn authenticate(&self, cmd: &str, msg: &Message) -> bool {
        cmd == AUTOCONNECT || msg.token == *self.inner.token.borrow()
    }

    fn route(&self, cmd: &str, msg: &Message) -> Dispatch {
        let route = router::resolve(
            &self.inner.registry.borrow(),
            &self.inner.hordes.borrow(),
            &self.inner.routing,
            cmd,
            msg.tribe(),
        );

        if let Route::Forward(horde) = &route {
            if self.inner.passive {
                debug!(cmd = %cmd, horde = %horde, "passive bus, forwarding suppressed");
            } else {
                let mut forwarded = msg.clone();
                forwarded.router = Some(self.inner.router_id.clone());
                forwarded
                    .origin_router
                    .get_or_insert_with(|| self.inner.router_id.clone());
                match self.inner.peers.forward(horde, cmd, &forwarded) {
                    Ok(()) => {
                        debug!(cmd = %cmd, horde = %horde, "command forwarded");
                        return Dispatch::Forwarded(horde.clone());
                    }
                    Err(e) => warn!(cmd = %cmd, horde = %horde, error = %e, "cannot forward command"),
                }
            }
        }

        if self.is_command_registered(cmd) {
            Dispatch::Local
        } else if is_silent_when_missing(cmd) {
            Dispatch::Acknowledge
        } else {
            Dispatch::Missing
        }
    }

    fn acknowledge(&self, cmd: &str, msg: &Message) {
        debug!(cmd = %cmd, "no handler, acknowledged as finished");
        self.inner.notifier.send(
            orc_topic(&msg.orc_name, &format!("{}.finished", cmd)),
            Value::Null,
        );
    }

    /// Replace an unserved command by an invocation of the error sink.
    fn unavailable(&self, cmd: String, msg: Message) -> (String, Message) {
        let desc = format!("the command \"{}\" is not available", cmd);
        warn!(cmd = %cmd, "{}", desc);
        let data = json!({
            "cmd": cmd,
            "data": msg.data,
            "desc": desc,
        });
        let error_msg = Message {
            cmd: ERROR.to_string(),
            data,
            ..msg
        };
        (ERROR.to_string(), error_msg)
    }

    fn admit(&self, cmd: String, msg: Message) {
        let policy = self
            .inner
            .registry
            .borrow()
            .get(&cmd)
            .map(|c| c.policy.clone())
            .unwrap_or_default();
        let priority = Priority::from_delayed(policy.delayed);

        if policy.activity && !msg.is_nested {
            let key = activity_key(&cmd, &msg, policy.parallel);
            debug!(cmd = %cmd, key = %key, "admitted as activity");
            let commander = self.clone();
            let run: ActivityRun =
                Rc::new(move |cmd: String, msg: Message| -> LocalBoxFuture<'static, ()> {
                    let run = commander.run_command(cmd, msg);
                    Box::pin(async move {
                        let _ = run.await;
                    })
                });
            self.inner.gate.execute(key, cmd, msg, priority, run);
        } else {
            let commander = self.clone();
            self.inner.executor.submit(
                cmd,
                msg,
                Box::new(move |cmd: String, msg: Message| {
                    let run = commander.run_command(cmd, msg);
                    tokio::task::spawn_local(async move {
                        let _ = run.await;
                    });
                }),
                priority,
            );
        }
    }

    /// Invoke the handler of `cmd`, containing its errors and panics.
    pub fn run_command(&self, cmd: String, msg: Message) -> LocalBoxFuture<'static, HandlerResult> {
        let commander = self.clone();
        Box::pin(async move {
            let handler = commander
                .inner
                .registry
                .borrow()
                .get(&cmd)
                .map(|c| c.handler.clone());
            let Some(handler) = handler else {
                warn!(cmd = %cmd, "command vanished before running");
                return Err(BusError::CommandUnavailable(cmd));
            };

            let resp = Response::new(commander.clone(), &cmd, &msg);
            debug!(cmd = %cmd, "running command");

            let outcome = match AssertUnwindSafe(handler.call(msg, resp.clone()))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(BusError::HandlerPanic(panic_message(panic.as_ref()))),
            };

            if let Err(e) = &outcome {
                error!(cmd = %cmd, error = %e, "error with the command");
                resp.error(e);
            }
            outcome
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
