//! Module registry and hot-reload.
//!
//! Modules are compiled into the binary and made available through a
//! [`ModuleCatalog`], keyed by file name. Resolving a location caches the
//! module instance; unloading evicts it so the next load builds a fresh
//! instance from its factory. Reloading code that changed on disk still
//! needs a rebuild and restart.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, warn};

use crate::commander::{Commander, BUS_MODULE};
use crate::config::ModulePathConfig;
use crate::error::{BusError, BusResult};
use crate::registry::{CommandPolicy, Handler, ModuleInfo};
use crate::response::Response;
use crate::router::{POSTLOAD, PREUNLOAD};

/// Commands exported by a module, keyed by action name.
#[derive(Default)]
pub struct ModuleCommands {
    pub handlers: BTreeMap<String, Handler>,
    /// Policy per action; actions without an entry get the default policy
    pub rc: HashMap<String, CommandPolicy>,
    pub context: Option<Rc<dyn ModuleContext>>,
}

impl ModuleCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(mut self, action: &str, handler: Handler) -> Self {
        self.handlers.insert(action.to_string(), handler);
        self
    }

    pub fn command(mut self, action: &str, policy: CommandPolicy, handler: Handler) -> Self {
        self.rc.insert(action.to_string(), policy);
        self.handler(action, handler)
    }

    pub fn with_context(mut self, context: Rc<dyn ModuleContext>) -> Self {
        self.context = Some(context);
        self
    }
}

/// A loadable unit of commands.
pub trait BusModule {
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Produce the module's commands. Called once per load.
    fn commands(&self) -> Result<ModuleCommands, BusError>;
}

/// Opaque state a module hands over across an unload/load cycle.
#[async_trait(?Send)]
pub trait ModuleContext {
    fn get(&self, module: &str) -> Option<Value>;
    async fn set(&self, module: &str, value: Value, resp: &Response) -> Result<(), BusError>;
}

pub type ModuleFactory = Rc<dyn Fn() -> Result<Rc<dyn BusModule>, BusError>>;

/// Module name of a file: its stem (`math.rs` → `math`).
pub fn module_name_of(file: &str) -> Result<String, BusError> {
    Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| BusError::BadArguments(format!("invalid module file {:?}", file)))
}

/// Plugin table standing in for dynamic code loading.
#[derive(Default)]
pub struct ModuleCatalog {
    factories: BTreeMap<String, ModuleFactory>,
    cache: HashMap<PathBuf, Rc<dyn BusModule>>,
    generations: HashMap<PathBuf, u64>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Rc<dyn BusModule>, BusError> + 'static,
    {
        self.factories.insert(name.to_string(), Rc::new(factory));
    }

    /// Names of the provided modules matching `pattern`, sorted.
    pub fn list(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let re = Regex::new(pattern)?;
        Ok(self
            .factories
            .keys()
            .filter(|name| re.is_match(name))
            .cloned()
            .collect())
    }

    /// Module instance for `location`, built on first use and cached.
    pub fn resolve(&mut self, location: &Path) -> Result<Rc<dyn BusModule>, BusError> {
        if let Some(module) = self.cache.get(location) {
            return Ok(Rc::clone(module));
        }

        let name = module_name_of(&location.to_string_lossy())?;
        let factory = self
            .factories
            .get(&name)
            .cloned()
            .ok_or_else(|| BusError::InvalidModule(location.display().to_string()))?;
        let module = factory()?;

        let generation = self.generations.entry(location.to_path_buf()).or_insert(0);
        *generation += 1;
        debug!(module = %name, generation = *generation, "module instance built");
        self.cache.insert(location.to_path_buf(), Rc::clone(&module));
        Ok(module)
    }

    /// Drop the cached instance. Returns whether one was cached.
    pub fn evict(&mut self, location: &Path) -> bool {
        self.cache.remove(location).is_some()
    }

    /// How many times an instance was built for `location`.
    pub fn generation(&self, location: &Path) -> u64 {
        self.generations.get(location).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRecord {
    pub name: String,
    pub version: String,
    pub hot: bool,
    pub location: PathBuf,
}

pub struct ModuleRegistry {
    commander: Commander,
    catalog: RefCell<ModuleCatalog>,
    records: RefCell<BTreeMap<String, ModuleRecord>>,
    contexts: RefCell<HashMap<String, Rc<dyn ModuleContext>>>,
    saved_contexts: RefCell<HashMap<String, Value>>,
    shared_module: Option<String>,
}

impl ModuleRegistry {
    pub fn new(commander: Commander, catalog: ModuleCatalog, shared_module: Option<String>) -> Self {
        Self {
            commander,
            catalog: RefCell::new(catalog),
            records: RefCell::new(BTreeMap::new()),
            contexts: RefCell::new(HashMap::new()),
            saved_contexts: RefCell::new(HashMap::new()),
            shared_module,
        }
    }

    pub fn catalog(&self) -> std::cell::Ref<'_, ModuleCatalog> {
        self.catalog.borrow()
    }

    pub fn record(&self, name: &str) -> Option<ModuleRecord> {
        self.records.borrow().get(name).cloned()
    }

    /// Load every file of a configured module location.
    pub async fn load_location(
        &self,
        resp: Option<&Response>,
        location: &ModulePathConfig,
    ) -> Result<Vec<String>, BusError> {
        let files = self.catalog.borrow().list(&location.pattern)?;
        info!(path = %location.path.display(), count = files.len(), "loading module location");
        if files.is_empty() {
            return Ok(Vec::new());
        }
        self.load(resp, &files, &location.path, location.hot).await
    }

    /// Load `files` from `root`. Each file is skipped on its own when it
    /// cannot be loaded. Returns the names of the loaded modules.
    pub async fn load(
        &self,
        resp: Option<&Response>,
        files: &[String],
        root: &Path,
        hot: bool,
    ) -> BusResult<Vec<String>> {
        if files.is_empty() {
            return Err(BusError::BadArguments("no module file to load".into()));
        }
        let batch: Vec<(&str, bool)> = files.iter().map(|f| (f.as_str(), hot)).collect();
        Ok(self.load_batch(resp, &batch, root).await)
    }

    /// One registry notification for the whole batch, hooks in file order.
    async fn load_batch(
        &self,
        resp: Option<&Response>,
        batch: &[(&str, bool)],
        root: &Path,
    ) -> Vec<String> {
        let mut loaded = Vec::new();
        for &(file, hot) in batch {
            match self.load_file(file, root, hot) {
                Ok(name) => {
                    info!(module = %name, hot, "module loaded");
                    loaded.push(name);
                }
                Err(e) => warn!(file = %file, error = %e, "module skipped"),
            }
        }

        self.commander.notify_registry();

        if let Some(resp) = resp {
            for name in &loaded {
                if let Err(e) = resp.command(&format!("{}.{}", name, POSTLOAD), Value::Null).await {
                    warn!(module = %name, error = %e, "postload failed");
                }
                self.restore_context(name, resp).await;
            }
        }
        loaded
    }

    fn load_file(&self, file: &str, root: &Path, hot: bool) -> Result<String, BusError> {
        let name = module_name_of(file)?;
        if name == BUS_MODULE {
            return Err(BusError::ModuleLoaded(name));
        }
        let shared = self.shared_module.as_deref() == Some(name.as_str());
        if self.commander.is_module_registered(&name) && !shared {
            return Err(BusError::ModuleLoaded(name));
        }

        let location = root.join(file);
        let module = self.catalog.borrow_mut().resolve(&location)?;
        let exported = match module.commands() {
            Ok(exported) => exported,
            Err(e) => {
                self.catalog.borrow_mut().evict(&location);
                return Err(e);
            }
        };

        // All commands of a file go in, or none of them.
        if let Some(taken) = exported
            .handlers
            .keys()
            .map(|action| format!("{}.{}", name, action))
            .find(|cmd| self.commander.is_command_registered(cmd))
        {
            self.catalog.borrow_mut().evict(&location);
            return Err(BusError::DuplicateCommand(taken));
        }

        let info = ModuleInfo::new(name.as_str(), module.version(), hot);
        let ModuleCommands {
            handlers,
            mut rc,
            context,
        } = exported;
        for (action, handler) in handlers {
            let policy = rc.remove(&action).unwrap_or_default();
            self.commander.register_command(
                &format!("{}.{}", name, action),
                Some(location.clone()),
                info.clone(),
                policy,
                handler,
            )?;
        }

        if let Some(context) = context {
            self.contexts.borrow_mut().insert(name.clone(), context);
        }
        self.records
            .borrow_mut()
            .entry(name.clone())
            .or_insert(ModuleRecord {
                name: name.clone(),
                version: info.version,
                hot,
                location,
            });
        Ok(name)
    }

    async fn restore_context(&self, name: &str, resp: &Response) {
        let context = self.contexts.borrow().get(name).cloned();
        let Some(context) = context else {
            return;
        };
        let saved = self.saved_contexts.borrow_mut().remove(name);
        if let Some(value) = saved {
            debug!(module = %name, "restoring module context");
            if let Err(e) = context.set(name, value, resp).await {
                warn!(module = %name, error = %e, "cannot restore module context");
            }
        }
    }

    /// Unload modules by name. Unknown modules are skipped with a warning.
    /// Returns the names actually unloaded.
    pub async fn unload(&self, resp: Option<&Response>, names: &[String]) -> Vec<String> {
        let mut unloaded = Vec::new();
        for name in names {
            let known = self.records.borrow().contains_key(name);
            if !known || !self.commander.is_module_registered(name) {
                warn!(module = %name, "module not registered, not unloading");
                continue;
            }

            if let Some(resp) = resp {
                if let Err(e) = resp.command(&format!("{}.{}", name, PREUNLOAD), Value::Null).await {
                    warn!(module = %name, error = %e, "preunload failed");
                }
            }

            let context = self.contexts.borrow_mut().remove(name);
            if let Some(value) = context.and_then(|c| c.get(name)) {
                debug!(module = %name, "module context captured");
                self.saved_contexts.borrow_mut().insert(name.clone(), value);
            }

            let locations = self.commander.unregister_module(name);
            {
                let mut catalog = self.catalog.borrow_mut();
                for location in &locations {
                    catalog.evict(location);
                }
            }
            self.records.borrow_mut().remove(name);
            info!(module = %name, "module unloaded");
            unloaded.push(name.clone());
        }

        self.commander.notify_registry();
        unloaded
    }

    /// Unload then load `files`, each module keeping its hot flag.
    pub async fn reload(
        &self,
        resp: Option<&Response>,
        files: &[String],
        root: &Path,
    ) -> BusResult<Vec<String>> {
        if files.is_empty() {
            return Err(BusError::BadArguments("no module file to reload".into()));
        }
        let mut names = Vec::new();
        let mut batch = Vec::new();
        for file in files {
            let name = match module_name_of(file) {
                Ok(name) => name,
                Err(e) => {
                    warn!(file = %file, error = %e, "module skipped");
                    continue;
                }
            };
            let hot = self.records.borrow().get(&name).map(|r| r.hot).unwrap_or(false);
            batch.push((file.as_str(), hot));
            names.push(name);
        }

        self.unload(resp, &names).await;
        Ok(self.load_batch(resp, &batch, root).await)
    }

    pub fn running_module_names(&self, only_hot: bool) -> Vec<String> {
        self.running(only_hot).map(|r| r.name.clone()).collect()
    }

    pub fn running_module_locations(&self, only_hot: bool) -> Vec<PathBuf> {
        self.running(only_hot).map(|r| r.location.clone()).collect()
    }

    fn running(&self, only_hot: bool) -> impl Iterator<Item = ModuleRecord> {
        let records: Vec<ModuleRecord> = self
            .records
            .borrow()
            .values()
            .filter(|r| r.name != BUS_MODULE && (!only_hot || r.hot))
            .cloned()
            .collect();
        records.into_iter()
    }
}
