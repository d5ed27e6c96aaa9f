//! Loaded config snapshots.
//!
//! A [`RuntimeConfig`] is the config plus everything resolved from it at load
//! time: the compiled router, one translator factory and auth handler per
//! backend. Exchanges pin the snapshot they started with; a reload swaps in a
//! new one without touching exchanges in flight.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::auth::{BackendAuthHandler, build_auth_handler};
use crate::config::Config;
use crate::router::{RouteSelection, Router};
use crate::translator::{TranslatorFactory, TranslatorOptions};

#[derive(Debug)]
pub struct ResolvedBackend {
    pub name: String,
    pub factory: TranslatorFactory,
    pub auth: Option<Arc<dyn BackendAuthHandler>>,
    pub rate_limits: Vec<String>,
}

#[derive(Debug)]
pub struct RuntimeConfig {
    pub config: Config,
    router: Router,
    /// Indexed like `config.rules[rule].backends[backend]`.
    backends: Vec<Vec<ResolvedBackend>>,
}

impl RuntimeConfig {
    pub async fn build(config: Config, shutdown: &CancellationToken) -> Result<Self> {
        config.validate()?;
        let router = Router::new(&config.rules)?;
        let force_include_usage = !config.request_costs.is_empty();

        let mut backends = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            let mut resolved = Vec::with_capacity(rule.backends.len());
            for backend in &rule.backends {
                let factory = TranslatorFactory::new(
                    &config.schema,
                    &backend.schema,
                    TranslatorOptions {
                        model_name_override: backend.model_name_override.clone(),
                        force_include_usage,
                    },
                )?;
                let auth = match backend.auth.as_ref() {
                    Some(auth) => Some(build_auth_handler(&backend.name, auth, shutdown).await?),
                    None => None,
                };
                resolved.push(ResolvedBackend {
                    name: backend.name.clone(),
                    factory,
                    auth,
                    rate_limits: backend.rate_limits.clone(),
                });
            }
            backends.push(resolved);
        }

        tracing::info!(
            rules = config.rules.len(),
            backends = backends.iter().map(Vec::len).sum::<usize>(),
            "config snapshot built"
        );
        Ok(Self {
            config,
            router,
            backends,
        })
    }

    pub async fn load(path: &Path, shutdown: &CancellationToken) -> Result<Self> {
        Self::build(Config::from_path(path).await?, shutdown).await
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn backend(&self, selection: RouteSelection) -> Option<&ResolvedBackend> {
        self.backends.get(selection.rule)?.get(selection.backend)
    }
}

/// Atomically replaceable handle to the current snapshot.
#[derive(Debug)]
pub struct ConfigHandle {
    current: ArcSwap<RuntimeConfig>,
}

impl ConfigHandle {
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(runtime),
        }
    }

    pub fn load(&self) -> Arc<RuntimeConfig> {
        self.current.load_full()
    }

    pub fn store(&self, runtime: RuntimeConfig) {
        self.current.store(Arc::new(runtime));
    }

    /// Re-reads `path`; on failure the current snapshot stays in place.
    pub async fn reload(&self, path: &Path, shutdown: &CancellationToken) -> Result<()> {
        let runtime = RuntimeConfig::load(path, shutdown).await?;
        self.store(runtime);
        Ok(())
    }
}
