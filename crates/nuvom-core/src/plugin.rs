//! Plugin subsystem: descriptor parsing, dynamic loading, capability registry
//!
//! A descriptor TOML file at a well-known path enumerates user plugins
//! grouped by capability (§4.5). Each entry names a shared library on
//! disk; the library exports a single `nuvom_plugin_create` symbol that
//! hands back a boxed [`NuvomPlugin`]. Loading happens exactly once at
//! process startup, before any worker is created, and load failures are
//! fatal (surfaced as [`NuvomError::PluginLoadError`]).
//!
//! Dynamic loading of `dyn Trait` objects across a `cdylib` boundary is a
//! well-known, commonly used but not ABI-stable pattern in the Rust
//! ecosystem: both sides must be built with the same compiler version.
//! Documented in `DESIGN.md`.
use crate::error::{NuvomError, Result};
use crate::queue::QueueBackend;
use crate::result::ResultBackend;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

/// The plugin API version this runtime accepts. Plugins declaring a
/// different value are refused at load time.
pub const PLUGIN_API_VERSION: &str = "1.0";

pub type QueueFactory = Arc<dyn Fn() -> Result<Arc<dyn QueueBackend>> + Send + Sync>;
pub type ResultFactory = Arc<dyn Fn() -> Result<Arc<dyn ResultBackend>> + Send + Sync>;

/// Capabilities a plugin may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    QueueBackend,
    ResultBackend,
    Monitoring,
}

impl Capability {
    fn as_str(self) -> &'static str {
        match self {
            Capability::QueueBackend => "queue_backend",
            Capability::ResultBackend => "result_backend",
            Capability::Monitoring => "monitoring",
        }
    }
}

/// Handle passed to a plugin's [`NuvomPlugin::start`], letting it register
/// the backends/sinks it provides without holding a reference to the
/// dispatcher itself (§9: pull model, no cyclic references).
#[derive(Clone, Default)]
pub struct PluginContext {
    queue_factories: Arc<RwLock<HashMap<String, QueueFactory>>>,
    result_factories: Arc<RwLock<HashMap<String, ResultFactory>>>,
}

impl PluginContext {
    pub fn register_queue_backend(&self, name: impl Into<String>, factory: QueueFactory) {
        self.queue_factories.write().unwrap().insert(name.into(), factory);
    }

    pub fn register_result_backend(&self, name: impl Into<String>, factory: ResultFactory) {
        self.result_factories.write().unwrap().insert(name.into(), factory);
    }

    pub fn queue_factory(&self, name: &str) -> Option<QueueFactory> {
        self.queue_factories.read().unwrap().get(name).cloned()
    }

    pub fn result_factory(&self, name: &str) -> Option<ResultFactory> {
        self.result_factories.read().unwrap().get(name).cloned()
    }
}

/// The interface every dynamically-loaded plugin object must implement.
pub trait NuvomPlugin: Send + Sync {
    fn api_version(&self) -> &str;
    fn name(&self) -> &str;
    fn provides(&self) -> Vec<Capability>;
    fn start(&mut self, ctx: &PluginContext) -> std::result::Result<(), String>;
    fn stop(&mut self);
}

/// The `nuvom_plugin_create` symbol every plugin cdylib must export.
pub type PluginEntryPoint = unsafe extern "C" fn() -> *mut dyn NuvomPlugin;

#[derive(Debug, Deserialize, Default)]
struct DescriptorFile {
    #[serde(default)]
    plugins: PluginGroups,
}

#[derive(Debug, Deserialize, Default)]
struct PluginGroups {
    #[serde(default)]
    queue_backend: Vec<String>,
    #[serde(default)]
    result_backend: Vec<String>,
    #[serde(default)]
    monitoring: Vec<String>,
}

struct LoadedPlugin {
    // Declared before `_lib` so it drops (and `stop()`s) first.
    plugin: Box<dyn NuvomPlugin>,
    _lib: libloading::Library,
}

/// Owns every loaded plugin for the process lifetime and exposes the
/// capability registry they populated via [`PluginContext`].
pub struct PluginRegistry {
    ctx: PluginContext,
    loaded: Vec<LoadedPlugin>,
}

impl PluginRegistry {
    /// Parses the descriptor at `descriptor_path` and loads every listed
    /// plugin, calling `start` on each in declaration order. Load failures
    /// are fatal: the whole call fails and nothing partially started is
    /// left running (already-started plugins are stopped before erroring).
    pub fn load(descriptor_path: &Path) -> Result<Self> {
        if !descriptor_path.exists() {
            debug!(
                "No plugin descriptor at \"{}\", starting with no plugins",
                descriptor_path.display()
            );
            return Ok(Self {
                ctx: PluginContext::default(),
                loaded: Vec::new(),
            });
        }
        let raw = std::fs::read_to_string(descriptor_path).map_err(|e| {
            NuvomError::PluginLoadError(format!(
                "failed to read descriptor \"{}\": {e}",
                descriptor_path.display()
            ))
        })?;
        let descriptor: DescriptorFile = toml::from_str(&raw).map_err(|e| {
            NuvomError::PluginLoadError(format!("invalid plugin descriptor: {e}"))
        })?;

        let mut paths: Vec<(String, Capability)> = Vec::new();
        for p in &descriptor.plugins.queue_backend {
            paths.push((p.clone(), Capability::QueueBackend));
        }
        for p in &descriptor.plugins.result_backend {
            paths.push((p.clone(), Capability::ResultBackend));
        }
        for p in &descriptor.plugins.monitoring {
            paths.push((p.clone(), Capability::Monitoring));
        }

        let ctx = PluginContext::default();
        let mut loaded: Vec<LoadedPlugin> = Vec::new();
        let mut seen_paths = std::collections::HashSet::new();

        for (path, expected_capability) in paths {
            if !seen_paths.insert(path.clone()) {
                continue;
            }
            match Self::load_one(&path, &ctx) {
                Ok(lp) => {
                    if !lp.plugin.provides().contains(&expected_capability) {
                        warn!(
                            "Plugin \"{}\" listed under {} but doesn't declare that capability",
                            lp.plugin.name(),
                            expected_capability.as_str()
                        );
                    }
                    info!(
                        "Loaded plugin \"{}\" (api {}) providing {:?}",
                        lp.plugin.name(),
                        lp.plugin.api_version(),
                        lp.plugin.provides()
                    );
                    loaded.push(lp);
                }
                Err(e) => {
                    error!("Plugin load failed for \"{}\": {}", path, e);
                    for mut lp in loaded.into_iter().rev() {
                        lp.plugin.stop();
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self { ctx, loaded })
    }

    fn load_one(path: &str, ctx: &PluginContext) -> Result<LoadedPlugin> {
        let lib = unsafe { libloading::Library::new(path) }.map_err(|e| {
            NuvomError::PluginLoadError(format!("failed to load \"{path}\": {e}"))
        })?;
        let create: libloading::Symbol<PluginEntryPoint> =
            unsafe { lib.get(b"nuvom_plugin_create\0") }.map_err(|e| {
                NuvomError::PluginLoadError(format!(
                    "\"{path}\" does not export nuvom_plugin_create: {e}"
                ))
            })?;
        let raw = unsafe { create() };
        if raw.is_null() {
            return Err(NuvomError::PluginLoadError(format!(
                "\"{path}\" returned a null plugin"
            )));
        }
        let mut plugin = unsafe { Box::from_raw(raw) };
        if plugin.api_version() != PLUGIN_API_VERSION {
            return Err(NuvomError::PluginLoadError(format!(
                "\"{}\" declares api_version {} but runtime requires {}",
                plugin.name(),
                plugin.api_version(),
                PLUGIN_API_VERSION
            )));
        }
        plugin.start(ctx).map_err(|e| {
            NuvomError::PluginLoadError(format!("\"{}\" failed to start: {e}", plugin.name()))
        })?;
        Ok(LoadedPlugin { plugin, _lib: lib })
    }

    pub fn context(&self) -> &PluginContext {
        &self.ctx
    }

    /// Stops every plugin in reverse start order, as required during
    /// graceful shutdown (§4.7 phase 4).
    pub fn stop_all(&mut self) {
        for lp in self.loaded.iter_mut().rev() {
            lp.plugin.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_descriptor_yields_empty_registry() {
        let registry = PluginRegistry::load(Path::new("/nonexistent/nuvom-plugins.toml")).unwrap();
        assert!(registry.context().queue_factory("anything").is_none());
    }

    #[test]
    fn invalid_descriptor_is_a_fatal_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nuvom-plugins.toml");
        std::fs::write(&path, "not valid toml [[[").unwrap();
        let err = PluginRegistry::load(&path).unwrap_err();
        assert!(matches!(err, NuvomError::PluginLoadError(_)));
    }

    #[test]
    fn descriptor_with_unreachable_library_is_a_fatal_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nuvom-plugins.toml");
        std::fs::write(
            &path,
            "[plugins]\nqueue_backend = [\"/nonexistent/libplugin.so\"]\n",
        )
        .unwrap();
        let err = PluginRegistry::load(&path).unwrap_err();
        assert!(matches!(err, NuvomError::PluginLoadError(_)));
    }
}
