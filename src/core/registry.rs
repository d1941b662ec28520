//! Auxiliary registry
//!
//! Maps aliases to live instances together with the parameters they were
//! built from, so that a second instance (a copy) can be built on demand and
//! proxies can resolve their subscribers by name.

use crate::config::{CoreConfig, ProxyEntry};
use crate::core::auxiliary::{Auxiliary, AuxiliaryConfig, AuxiliaryError};
use crate::core::context::ControllerContext;
use crate::core::proxy::{ProxyAuxiliary, ProxyError, ProxyMode, ProxyTarget};
use crate::core::transport::{TransportError, TransportFactory};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Registry error types
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Alias not known, or the instance was not built by a registry
    #[error("Auxiliary {0} is not registered")]
    NotRegistered(String),

    /// Alias or proxy name used twice
    #[error("Auxiliary {0} is already registered")]
    AlreadyRegistered(String),

    /// Overrides do not fit the auxiliary's parameters
    #[error("Incompatible copy parameters for {alias}: {reason}")]
    IncompatibleCopyParameters {
        /// Original alias
        alias: String,
        /// What did not fit
        reason: String,
    },

    /// A copy of this alias is already live
    #[error("A copy of {0} already exists")]
    CopyAlreadyExists(String),

    /// No live copy to destroy
    #[error("No copy of {0} exists")]
    NoCopy(String),

    /// Transport could not be built
    #[error("Cannot build transport for {alias}: {source}")]
    Transport {
        /// Alias
        alias: String,
        /// Cause
        #[source]
        source: TransportError,
    },

    /// Lifecycle failure of the original or the copy
    #[error(transparent)]
    Auxiliary(#[from] AuxiliaryError),

    /// Proxy construction failed
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// What an auxiliary is built from
#[derive(Clone)]
pub struct AuxiliaryParams {
    /// Engine settings
    pub config: AuxiliaryConfig,
    /// Builds a fresh transport per instance
    pub transport: Arc<dyn TransportFactory>,
}

impl AuxiliaryParams {
    /// Parameters from settings and a factory
    pub fn new(config: AuxiliaryConfig, transport: impl TransportFactory + 'static) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
        }
    }
}

struct CopyState {
    instance: Auxiliary,
    original_was_alive: bool,
}

struct Entry {
    params: AuxiliaryParams,
    instance: Auxiliary,
    copy: Option<CopyState>,
    /// A `create_copy` call owns the copy slot but has not filled it yet
    copy_pending: bool,
}

pub(crate) struct RegistryInner {
    ctx: Arc<ControllerContext>,
    entries: RwLock<HashMap<String, Entry>>,
    proxies: Mutex<Vec<ProxyAuxiliary>>,
}

/// Back-reference from an instance to the registry that built it
pub(crate) struct RegistryLink {
    registry: Weak<RegistryInner>,
    pub alias: String,
}

impl RegistryLink {
    pub fn registry(&self) -> Option<Registry> {
        self.registry.upgrade().map(|inner| Registry { inner })
    }
}

/// Process-wide alias → instance lookup.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create an empty registry
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                entries: RwLock::new(HashMap::new()),
                proxies: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build every auxiliary and proxy declared in `config`
    pub fn from_config(
        config: &CoreConfig,
        ctx: Arc<ControllerContext>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new(ctx);
        for entry in &config.auxiliaries {
            registry.register(
                &entry.alias,
                AuxiliaryParams::new(entry.settings.clone(), entry.transport.clone()),
            )?;
        }
        for entry in &config.proxies {
            registry.add_proxy(entry)?;
        }
        tracing::info!(
            auxiliaries = config.auxiliaries.len(),
            proxies = config.proxies.len(),
            "Registry loaded"
        );
        Ok(registry)
    }

    /// Shared controller state
    pub fn context(&self) -> &Arc<ControllerContext> {
        &self.inner.ctx
    }

    /// Build and register a stopped instance under `alias`
    pub fn register(
        &self,
        alias: &str,
        params: AuxiliaryParams,
    ) -> Result<Auxiliary, RegistryError> {
        let mut entries = self.inner.entries.write();
        if entries.contains_key(alias) {
            return Err(RegistryError::AlreadyRegistered(alias.to_string()));
        }

        let instance = self.build(alias, &params)?;
        instance.attach_registry(RegistryLink {
            registry: Arc::downgrade(&self.inner),
            alias: alias.to_string(),
        });
        entries.insert(
            alias.to_string(),
            Entry {
                params,
                instance: instance.clone(),
                copy: None,
                copy_pending: false,
            },
        );
        tracing::debug!(alias, "Auxiliary registered");
        Ok(instance)
    }

    /// Live instance for `alias`
    pub fn get(&self, alias: &str) -> Option<Auxiliary> {
        self.inner.entries.read().get(alias).map(|e| e.instance.clone())
    }

    /// Live copy for `alias`, if any
    pub fn get_copy(&self, alias: &str) -> Option<Auxiliary> {
        self.inner
            .entries
            .read()
            .get(alias)
            .and_then(|e| e.copy.as_ref().map(|c| c.instance.clone()))
    }

    /// Registered aliases, sorted
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<_> = self.inner.entries.read().keys().cloned().collect();
        aliases.sort();
        aliases
    }

    /// Build a second instance of `alias` with `overrides` applied.
    ///
    /// The original is suspended first if it is running. The copy is
    /// returned stopped; the caller creates it.
    pub fn create_copy(
        &self,
        alias: &str,
        overrides: &toml::Table,
    ) -> Result<Auxiliary, RegistryError> {
        let (params, original) = {
            let mut entries = self.inner.entries.write();
            let entry = entries
                .get_mut(alias)
                .ok_or_else(|| RegistryError::NotRegistered(alias.to_string()))?;
            if entry.copy.is_some() || entry.copy_pending {
                return Err(RegistryError::CopyAlreadyExists(alias.to_string()));
            }
            entry.copy_pending = true;
            (entry.params.clone(), entry.instance.clone())
        };

        let built = self.prepare_copy(alias, &params, &original, overrides);

        let mut entries = self.inner.entries.write();
        let Some(entry) = entries.get_mut(alias) else {
            // Torn down while the copy was being built
            return Err(RegistryError::NotRegistered(alias.to_string()));
        };
        entry.copy_pending = false;
        let (copy, original_was_alive) = built?;
        entry.copy = Some(CopyState {
            instance: copy.clone(),
            original_was_alive,
        });
        tracing::info!(alias, copy = %copy.name(), original_was_alive, "Copy created");
        Ok(copy)
    }

    fn prepare_copy(
        &self,
        alias: &str,
        params: &AuxiliaryParams,
        original: &Auxiliary,
        overrides: &toml::Table,
    ) -> Result<(Auxiliary, bool), RegistryError> {
        let config = apply_overrides(alias, &params.config, overrides)?;
        let copy = self.build(
            &format!("{}_copy", alias),
            &AuxiliaryParams {
                config,
                transport: params.transport.clone(),
            },
        )?;

        let original_was_alive = original.is_running();
        if original_was_alive {
            original.suspend()?;
        }
        Ok((copy, original_was_alive))
    }

    /// Delete the copy of `alias` and resume the original if it was running
    /// when the copy was made
    pub fn destroy_copy(&self, alias: &str) -> Result<(), RegistryError> {
        let (state, original) = {
            let mut entries = self.inner.entries.write();
            let entry = entries
                .get_mut(alias)
                .ok_or_else(|| RegistryError::NotRegistered(alias.to_string()))?;
            let state = entry
                .copy
                .take()
                .ok_or_else(|| RegistryError::NoCopy(alias.to_string()))?;
            (state, entry.instance.clone())
        };

        state.instance.delete_instance();
        if state.original_was_alive {
            original.resume()?;
        }
        tracing::info!(alias, "Copy destroyed");
        Ok(())
    }

    /// Attach a proxy whose subscribers are resolved by alias
    pub fn add_proxy(&self, entry: &ProxyEntry) -> Result<(), RegistryError> {
        if self.inner.proxies.lock().iter().any(|p| p.name() == entry.name) {
            return Err(RegistryError::AlreadyRegistered(entry.name.clone()));
        }

        let subscribers = entry
            .subscribers
            .iter()
            .map(|alias| self.get(alias).ok_or_else(|| RegistryError::NotRegistered(alias.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let target = match entry.mode {
            ProxyMode::Thread => {
                let transport = entry.transport.build().map_err(|source| RegistryError::Transport {
                    alias: entry.name.clone(),
                    source,
                })?;
                ProxyTarget::Local(transport)
            }
            ProxyMode::Process => ProxyTarget::Process(entry.transport.clone()),
        };

        let proxy = ProxyAuxiliary::new(&entry.name, target, &subscribers, entry.options.clone())?;
        self.inner.proxies.lock().push(proxy);
        Ok(())
    }

    /// Run `f` against the proxy called `name`
    pub fn with_proxy<R>(&self, name: &str, f: impl FnOnce(&ProxyAuxiliary) -> R) -> Option<R> {
        self.inner.proxies.lock().iter().find(|p| p.name() == name).map(f)
    }

    /// Delete every copy, instance and proxy, then forget them all
    pub fn teardown(&self) {
        let entries: Vec<Entry> = self.inner.entries.write().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            if let Some(copy) = &entry.copy {
                copy.instance.delete_instance();
            }
            entry.instance.delete_instance();
        }

        let proxies: Vec<ProxyAuxiliary> = self.inner.proxies.lock().drain(..).collect();
        for proxy in &proxies {
            proxy.delete_instance();
        }
        tracing::info!(auxiliaries = entries.len(), proxies = proxies.len(), "Registry torn down");
    }

    fn build(&self, name: &str, params: &AuxiliaryParams) -> Result<Auxiliary, RegistryError> {
        let transport = params
            .transport
            .build()
            .map_err(|source| RegistryError::Transport {
                alias: name.to_string(),
                source,
            })?;
        Ok(Auxiliary::new(
            name,
            params.config.clone(),
            transport,
            self.inner.ctx.clone(),
        ))
    }
}

fn apply_overrides(
    alias: &str,
    base: &AuxiliaryConfig,
    overrides: &toml::Table,
) -> Result<AuxiliaryConfig, RegistryError> {
    let incompatible = |reason: String| RegistryError::IncompatibleCopyParameters {
        alias: alias.to_string(),
        reason,
    };

    let mut table = match toml::Value::try_from(base) {
        Ok(toml::Value::Table(table)) => table,
        Ok(other) => return Err(incompatible(format!("not a table: {}", other.type_str()))),
        Err(e) => return Err(incompatible(e.to_string())),
    };
    for (key, value) in overrides {
        table.insert(key.clone(), value.clone());
    }
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| incompatible(e.message().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{LoopbackTransport, Transport};

    fn loopback_params(config: AuxiliaryConfig) -> AuxiliaryParams {
        AuxiliaryParams::new(config, || -> Result<Arc<dyn Transport>, TransportError> {
            Ok(Arc::new(LoopbackTransport::new()))
        })
    }

    fn registry() -> Registry {
        Registry::new(ControllerContext::shared())
    }

    #[test]
    fn test_register_and_get() {
        let reg = registry();
        let aux = reg
            .register("dut", loopback_params(AuxiliaryConfig::default()))
            .unwrap();
        assert!(reg.get("dut").unwrap().same_instance(&aux));
        assert!(reg.get("other").is_none());
        assert!(matches!(
            reg.register("dut", loopback_params(AuxiliaryConfig::default())),
            Err(RegistryError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_overrides_applied_to_copy() {
        let reg = registry();
        reg.register("dut", loopback_params(AuxiliaryConfig::default().without_handshake()))
            .unwrap();

        let mut overrides = toml::Table::new();
        overrides.insert("ack_tries".into(), toml::Value::Integer(7));
        let copy = reg.create_copy("dut", &overrides).unwrap();

        assert_eq!(copy.name(), "dut_copy");
        assert_eq!(copy.config().ack_tries, 7);
        assert!(!copy.config().handshake);
        assert!(reg.get_copy("dut").unwrap().same_instance(&copy));
    }

    #[test]
    fn test_incompatible_overrides() {
        let reg = registry();
        reg.register("dut", loopback_params(AuxiliaryConfig::default())).unwrap();

        let mut unknown = toml::Table::new();
        unknown.insert("baud".into(), toml::Value::Integer(9600));
        assert!(matches!(
            reg.create_copy("dut", &unknown),
            Err(RegistryError::IncompatibleCopyParameters { .. })
        ));

        let mut wrong_type = toml::Table::new();
        wrong_type.insert("ack_tries".into(), toml::Value::String("many".into()));
        assert!(matches!(
            reg.create_copy("dut", &wrong_type),
            Err(RegistryError::IncompatibleCopyParameters { .. })
        ));
        assert!(reg.get_copy("dut").is_none());
    }

    #[test]
    fn test_single_copy_at_a_time() {
        let reg = registry();
        reg.register("dut", loopback_params(AuxiliaryConfig::default())).unwrap();
        reg.create_copy("dut", &toml::Table::new()).unwrap();
        assert!(matches!(
            reg.create_copy("dut", &toml::Table::new()),
            Err(RegistryError::CopyAlreadyExists(_))
        ));

        reg.destroy_copy("dut").unwrap();
        assert!(matches!(reg.destroy_copy("dut"), Err(RegistryError::NoCopy(_))));
        reg.create_copy("dut", &toml::Table::new()).unwrap();
    }

    #[test]
    fn test_copy_through_instance() {
        let reg = registry();
        let aux = reg
            .register("dut", loopback_params(AuxiliaryConfig::default().without_handshake()))
            .unwrap();
        let copy = aux.create_copy(&toml::Table::new()).unwrap();
        // Copies are not registered themselves
        assert!(matches!(
            copy.create_copy(&toml::Table::new()),
            Err(RegistryError::NotRegistered(_))
        ));
        aux.destroy_copy().unwrap();
    }

    #[test]
    fn test_teardown_empties() {
        let reg = registry();
        let aux = reg
            .register("dut", loopback_params(AuxiliaryConfig::default().without_handshake()))
            .unwrap();
        aux.create_instance().unwrap();

        reg.teardown();
        assert!(reg.aliases().is_empty());
        assert!(!aux.is_running());
    }
}
