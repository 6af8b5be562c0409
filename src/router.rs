//! Routing resolution: local execution or forwarding to a horde.

use tracing::debug;

use crate::config::{BusConfig, HordeConfig};
use crate::registry::{module_of, CommandRegistry, RegistrySnapshot};

/// Module name of the bus's own commands.
pub const BUS_MODULE: &str = "bus";

/// Core commands that always run where they are received.
pub const DISPATCH_EXEMPT: &[&str] = &["autoconnect", "disconnect", "shutdown", "error", "motd"];

pub const AUTOCONNECT: &str = "autoconnect";
pub const POSTLOAD: &str = "_postload";
pub const PREUNLOAD: &str = "_preunload";
const LIFECYCLE_HOOKS: &[&str] = &[POSTLOAD, PREUNLOAD];

pub fn is_lifecycle_hook(cmd: &str) -> bool {
    cmd.rsplit_once('.')
        .map(|(_, action)| LIFECYCLE_HOOKS.contains(&action))
        .unwrap_or(false)
}

/// Commands that are acknowledged as finished when nobody serves them.
pub fn is_silent_when_missing(cmd: &str) -> bool {
    cmd == AUTOCONNECT || is_lifecycle_hook(cmd)
}

/// Whether a locally registered `cmd` may be rerouted to the tribe its id
/// addresses. Only commands declared by a registrar address tribe-scoped
/// entities; the bus's own commands and lifecycle hooks always stay here.
fn is_tribe_addressable(registry: &CommandRegistry, cmd: &str) -> bool {
    if DISPATCH_EXEMPT.contains(&cmd) || module_of(cmd) == BUS_MODULE || is_lifecycle_hook(cmd) {
        return false;
    }
    registry
        .get(cmd)
        .map(|c| c.policy.registrar.is_some())
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Forward(String),
    Unavailable,
}

/// A configured peer with the last registry it announced.
#[derive(Debug, Clone)]
pub struct Horde {
    pub name: String,
    pub tribe: Option<String>,
    pub registry: RegistrySnapshot,
}

impl Horde {
    pub fn new(name: impl Into<String>, tribe: Option<String>) -> Self {
        Self {
            name: name.into(),
            tribe,
            registry: RegistrySnapshot::new(),
        }
    }

    pub fn provides(&self, cmd: &str) -> bool {
        self.registry.contains_key(cmd)
    }

    /// Whether this horde would itself forward `cmd` further down.
    pub fn reforwards(&self, cmd: &str) -> bool {
        self.registry
            .get(cmd)
            .map(|spec| spec.horde.is_some())
            .unwrap_or(false)
    }
}

/// Peers in configuration order.
#[derive(Debug, Clone, Default)]
pub struct HordeTable {
    hordes: Vec<Horde>,
}

impl HordeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(hordes: &[HordeConfig]) -> Self {
        Self {
            hordes: hordes
                .iter()
                .map(|h| Horde::new(h.name.clone(), h.tribe.clone()))
                .collect(),
        }
    }

    pub fn push(&mut self, horde: Horde) {
        self.hordes.push(horde);
    }

    /// Replace the registry announced by `name`. Unknown hordes are ignored.
    pub fn update_registry(&mut self, name: &str, registry: RegistrySnapshot) -> bool {
        match self.hordes.iter_mut().find(|h| h.name == name) {
            Some(horde) => {
                debug!(horde = %name, commands = registry.len(), "horde registry updated");
                horde.registry = registry;
                true
            }
            None => false,
        }
    }

    pub fn clear_registry(&mut self, name: &str) {
        if let Some(horde) = self.hordes.iter_mut().find(|h| h.name == name) {
            horde.registry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Horde> {
        self.hordes.iter()
    }

    pub fn registries(&self) -> impl Iterator<Item = (&str, &RegistrySnapshot)> {
        self.hordes.iter().map(|h| (h.name.as_str(), &h.registry))
    }

    pub fn is_empty(&self) -> bool {
        self.hordes.is_empty()
    }

    /// First horde serving `cmd` that does not re-forward it, else the first
    /// horde serving it at all. `tribe` restricts the candidates.
    pub fn find(&self, cmd: &str, tribe: Option<Option<&str>>) -> Option<&Horde> {
        let mut first = None;
        for horde in self.hordes.iter().filter(|h| h.provides(cmd)) {
            if let Some(wanted) = tribe {
                if horde.tribe.as_deref() != wanted {
                    continue;
                }
            }
            if !horde.reforwards(cmd) {
                return Some(horde);
            }
            first.get_or_insert(horde);
        }
        first
    }
}

/// Partition settings of the local bus.
#[derive(Debug, Clone, Default)]
pub struct RoutingPolicy {
    pub tribes_enabled: bool,
    pub tribe: Option<String>,
}

impl RoutingPolicy {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            tribes_enabled: config.tribes_enabled(),
            tribe: config.tribe.clone(),
        }
    }
}

/// Decide where `cmd` must run. `extracted` is the tribe carried by the
/// message id, if any.
pub fn resolve(
    registry: &CommandRegistry,
    hordes: &HordeTable,
    policy: &RoutingPolicy,
    cmd: &str,
    extracted: Option<&str>,
) -> Route {
    let registered = registry.is_registered(cmd);

    let mut satisfiable = registered;
    let mut wanted_tribe: Option<Option<&str>> = extracted.map(Some);

    if registered && policy.tribes_enabled && is_tribe_addressable(registry, cmd) {
        // An id without tribe addresses the default partition.
        let target = extracted;
        if target != policy.tribe.as_deref() {
            debug!(cmd = %cmd, target = ?target, "command belongs to another tribe");
            satisfiable = false;
            wanted_tribe = Some(target);
        }
    }

    if satisfiable {
        return Route::Local;
    }

    match hordes.find(cmd, wanted_tribe) {
        Some(horde) => Route::Forward(horde.name.clone()),
        None if registered => Route::Local,
        None => Route::Unavailable,
    }
}
