//! Command registry: fully-qualified command names mapped to handlers and
//! their execution policy, plus a per-module reference count so that
//! "is this module loaded" never needs a scan.

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::debug;

use crate::error::{BusError, BusResult};
use crate::message::Message;
use crate::response::Response;

pub type HandlerResult = BusResult<()>;
pub type HandlerFuture = LocalBoxFuture<'static, HandlerResult>;

type SyncFn = dyn Fn(Message, Response) -> HandlerResult;
type TaskFn = dyn Fn(Message, Response) -> HandlerFuture;

/// A command handler: either a plain callable or a task that suspends.
#[derive(Clone)]
pub enum Handler {
    Sync(Rc<SyncFn>),
    Task(Rc<TaskFn>),
}

impl Handler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Message, Response) -> HandlerResult + 'static,
    {
        Handler::Sync(Rc::new(f) as Rc<SyncFn>)
    }

    pub fn task<F, Fut>(f: F) -> Self
    where
        F: Fn(Message, Response) -> Fut + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        Handler::Task(Rc::new(move |msg: Message, resp: Response| -> HandlerFuture {
            Box::pin(f(msg, resp))
        }))
    }

    pub fn is_task(&self) -> bool {
        matches!(self, Handler::Task(_))
    }

    /// Drive either flavour the same way. Sync handlers only run when the
    /// returned future is first polled.
    pub fn call(&self, msg: Message, resp: Response) -> HandlerFuture {
        match self {
            Handler::Sync(f) => {
                let f = Rc::clone(f);
                Box::pin(async move { f(msg, resp) })
            }
            Handler::Task(f) => f(msg, resp),
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Sync(_) => write!(f, "Handler::Sync"),
            Handler::Task(_) => write!(f, "Handler::Task"),
        }
    }
}

/// Execution policy declared by a module for one of its commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandPolicy {
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default = "empty_options")]
    pub options: Value,
    #[serde(default = "default_activity")]
    pub activity: bool,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub delayed: bool,
    /// Registrar that declared the command. Only such commands follow the
    /// tribe of the entity id they address.
    #[serde(default)]
    pub registrar: Option<String>,
    #[serde(default)]
    pub quest_options: Option<Value>,
}

fn empty_options() -> Value {
    Value::Object(Default::default())
}

fn default_activity() -> bool {
    true
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            desc: None,
            options: empty_options(),
            activity: true,
            parallel: false,
            delayed: false,
            registrar: None,
            quest_options: None,
        }
    }
}

impl CommandPolicy {
    /// Policy of the bus's own commands: never serialized, never delayed.
    pub fn builtin(desc: &str) -> Self {
        Self {
            desc: Some(desc.to_string()),
            activity: false,
            ..Default::default()
        }
    }
}

/// Metadata of the module that registered a command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub hot: bool,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>, hot: bool) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            hot,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub location: Option<PathBuf>,
    pub info: ModuleInfo,
    pub policy: CommandPolicy,
    pub handler: Handler,
}

/// Read-only view of one command, as announced to peers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub hot: bool,
    #[serde(default)]
    pub location: Option<PathBuf>,
    #[serde(flatten)]
    pub policy: CommandPolicy,
    /// Set when the command is served by another bus
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horde: Option<String>,
}

pub type RegistrySnapshot = BTreeMap<String, CommandSpec>;

/// Module part of a `<module>.<action>` command name.
pub fn module_of(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Command>,
    module_refs: HashMap<String, usize>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one command. Fails when the name is already taken.
    pub fn register(
        &mut self,
        name: &str,
        location: Option<PathBuf>,
        info: ModuleInfo,
        policy: CommandPolicy,
        handler: Handler,
    ) -> Result<(), BusError> {
        if self.commands.contains_key(name) {
            return Err(BusError::DuplicateCommand(name.to_string()));
        }

        if handler.is_task() {
            debug!(cmd = %name, "task handler registered");
        }

        *self
            .module_refs
            .entry(module_of(name).to_string())
            .or_insert(0) += 1;
        self.commands.insert(
            name.to_string(),
            Command {
                name: name.to_string(),
                location,
                info,
                policy,
                handler,
            },
        );
        debug!(cmd = %name, "command registered");
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn is_module_registered(&self, module: &str) -> bool {
        self.module_refs.contains_key(module)
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    /// Remove every command of `module`. Returns the distinct locations the
    /// removed commands came from so their cached code can be evicted.
    pub fn unregister_module(&mut self, module: &str) -> Vec<PathBuf> {
        let names: Vec<String> = self
            .commands
            .keys()
            .filter(|name| module_of(name) == module)
            .cloned()
            .collect();

        let mut locations = Vec::new();
        for name in names {
            if let Some(cmd) = self.commands.remove(&name) {
                debug!(cmd = %name, "command unregistered");
                if let Some(location) = cmd.location {
                    if !locations.contains(&location) {
                        locations.push(location);
                    }
                }
            }
        }
        self.module_refs.remove(module);
        locations
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    /// Local commands only.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.commands
            .values()
            .map(|cmd| {
                (
                    cmd.name.clone(),
                    CommandSpec {
                        name: cmd.name.clone(),
                        module: cmd.info.name.clone(),
                        version: cmd.info.version.clone(),
                        hot: cmd.info.hot,
                        location: cmd.location.clone(),
                        policy: cmd.policy.clone(),
                        horde: None,
                    },
                )
            })
            .collect()
    }

    /// Local commands merged with the registries of remote peers. Remote
    /// entries are tagged with the horde serving them; local entries win.
    pub fn full_registry<'a, I>(&self, remotes: I) -> RegistrySnapshot
    where
        I: IntoIterator<Item = (&'a str, &'a RegistrySnapshot)>,
    {
        let mut full = RegistrySnapshot::new();
        for (horde, registry) in remotes {
            for (name, spec) in registry {
                full.entry(name.clone()).or_insert_with(|| CommandSpec {
                    horde: Some(horde.to_string()),
                    ..spec.clone()
                });
            }
        }
        full.extend(self.snapshot());
        full
    }
}
