//! Hosting application configuration and container accessor.
//!
//! An [`AppContext`] is the explicit application object handed to the request pipeline. It
//! owns the one binding [`Container`] of the process once the extension is installed; every
//! clone shares the same container.

use crate::clock::{Clock, SystemClock};
use crate::config::{Settings, ThrottleSettings, DEFAULT_MAX_BODY_BYTES};
use crate::container::{Binder, Container, Module};
use crate::context::RouteContext;
use crate::controller::ControllerRegistry;
use crate::error::{Error, Result};
use crate::redis::RedisStore;
use crate::resolver::Resolver;
use crate::throttling::policy::{PolicyCatalog, PolicyClass};
use crate::throttling::store::{CounterStore, InMemoryStore};
use crate::user::{ExtensionUserLookup, UserLookup};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

struct Installed {
    container: Arc<Container>,
    controllers: ControllerRegistry,
    body_limit: usize,
    memory_store: Option<Arc<InMemoryStore>>,
    cleanup_interval: Duration,
}

#[derive(Clone, Default)]
pub struct AppContext {
    installed: Option<Arc<Installed>>,
}

impl AppContext {
    /// A host application the extension was never installed into.
    pub fn uninitialized() -> Self {
        Self::default()
    }

    /// Install the extension with in-memory throttle history and the system clock.
    pub fn install(settings: ThrottleSettings) -> Result<Self> {
        AppContext::builder(settings).build()
    }

    /// Install the extension from environment settings, using Redis when configured.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut builder = AppContext::builder(settings.throttle()?)
            .body_limit(settings.max_body_bytes)
            .cleanup_interval(settings.cleanup_interval());
        if let Some(url) = &settings.redis_url {
            let store = RedisStore::new(url)?.with_timeout(settings.redis_timeout());
            // Policies admit requests while the store is down, so this is not fatal.
            if let Err(err) = store.ping() {
                warn!(error = %err, "redis is not reachable yet");
            }
            builder = builder.store(Arc::new(store));
        }
        builder.build()
    }

    pub fn builder(settings: ThrottleSettings) -> AppContextBuilder {
        AppContextBuilder {
            settings,
            store: None,
            clock: None,
            user_lookup: None,
            catalog: PolicyCatalog::with_builtins(),
            body_limit: DEFAULT_MAX_BODY_BYTES,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    /// The process-wide binding container.
    pub fn get_container(&self) -> Result<Arc<Container>> {
        self.installed()
            .map(|installed| installed.container.clone())
    }

    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.clone())
    }

    /// Default throttle policies, in configured order.
    pub fn default_throttle_classes(&self) -> Result<Vec<PolicyClass>> {
        let (settings, catalog) = self
            .resolver()
            .resolve::<(ThrottleSettings, PolicyCatalog)>()?;
        settings
            .throttle_classes
            .iter()
            .map(|name| catalog.get(name))
            .collect()
    }

    /// Largest request body a route reads.
    pub fn body_limit(&self) -> usize {
        self.installed
            .as_deref()
            .map_or(DEFAULT_MAX_BODY_BYTES, |installed| installed.body_limit)
    }

    /// Start dropping expired histories from the in-memory store, if that is the bound store.
    /// Must be called from within a tokio runtime.
    pub fn spawn_store_cleanup(&self) -> Option<JoinHandle<()>> {
        let installed = self.installed.as_deref()?;
        let store = installed.memory_store.as_ref()?;
        info!(interval = ?installed.cleanup_interval, "throttle history cleanup scheduled");
        Some(store.spawn_cleanup(installed.cleanup_interval))
    }

    pub(crate) fn controllers(&self) -> Result<&ControllerRegistry> {
        self.installed().map(|installed| &installed.controllers)
    }

    fn installed(&self) -> Result<&Installed> {
        self.installed.as_deref().ok_or_else(|| {
            Error::Configuration(
                "throttling extension is not installed. Did you forget to call `AppContext::install` \
                 before serving requests?"
                    .to_string(),
            )
        })
    }
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("installed", &self.is_installed())
            .finish()
    }
}

pub struct AppContextBuilder {
    settings: ThrottleSettings,
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
    user_lookup: Option<Arc<dyn UserLookup>>,
    catalog: PolicyCatalog,
    body_limit: usize,
    cleanup_interval: Duration,
}

impl AppContextBuilder {
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn user_lookup(mut self, lookup: Arc<dyn UserLookup>) -> Self {
        self.user_lookup = Some(lookup);
        self
    }

    pub fn body_limit(mut self, bytes: usize) -> Self {
        self.body_limit = bytes;
        self
    }

    pub fn cleanup_interval(mut self, every: Duration) -> Self {
        self.cleanup_interval = every;
        self
    }

    /// Make a policy available to `THROTTLE_CLASSES` under `name`.
    pub fn policy(mut self, name: &str, class: PolicyClass) -> Self {
        self.catalog.register(name, class);
        self
    }

    pub fn build(self) -> Result<AppContext> {
        let (store, memory_store) = match self.store {
            Some(store) => (store, None),
            None => {
                let memory = Arc::new(InMemoryStore::new());
                (memory.clone() as Arc<dyn CounterStore>, Some(memory))
            }
        };
        let module = CoreModule {
            settings: Arc::new(self.settings),
            store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            user_lookup: self
                .user_lookup
                .unwrap_or_else(|| Arc::new(ExtensionUserLookup)),
            catalog: Arc::new(self.catalog),
        };

        // Unknown default policy names would only surface on the first request otherwise.
        for name in &module.settings.throttle_classes {
            module.catalog.get(name)?;
        }

        let container = Arc::new(Container::new());
        container.install(&module);
        info!(
            throttle_classes = ?module.settings.throttle_classes,
            "throttling extension installed"
        );

        Ok(AppContext {
            installed: Some(Arc::new(Installed {
                container,
                controllers: ControllerRegistry::default(),
                body_limit: self.body_limit,
                memory_store,
                cleanup_interval: self.cleanup_interval,
            })),
        })
    }
}

/// Bindings every installed application starts with.
struct CoreModule {
    settings: Arc<ThrottleSettings>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    user_lookup: Arc<dyn UserLookup>,
    catalog: Arc<PolicyCatalog>,
}

impl Module for CoreModule {
    fn configure(&self, binder: &mut Binder<'_>) {
        binder
            .bind_instance(self.settings.clone())
            .bind_instance(self.store.clone())
            .bind_instance(self.clock.clone())
            .bind_instance(self.user_lookup.clone())
            .bind_instance(self.catalog.clone())
            .bind_request_scoped::<RouteContext>();
    }
}
