//! The plugin contract and the dependency discoverer.
//!
//! Every component the agent manages implements [`Plugin`]; components that
//! need peer plugins already initialized additionally implement
//! [`PostInitPlugin`]. Whether the extra phase is available is carried by the
//! [`PluginHandle`] variant, decided at composition time, so the lifecycle
//! engine dispatches on the variant instead of probing at runtime.

mod deps;
pub use deps::*;


use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

/// The uniform capability discipline every managed component offers.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable name used for diagnostics and lifecycle logs.
    fn name(&self) -> &str;

    /// Allocates resources that do not require peer plugins already being up.
    async fn init(&self) -> Result<()>;

    /// Idempotent release of resources. Must tolerate being called on a
    /// half-initialized instance: startup-timeout rollback may close a plugin
    /// whose `init` was still in flight when the deadline passed.
    async fn close(&self) -> Result<()>;

    /// Plugins this one depends on, in declaration order. The discoverer
    /// walks these post-order, so dependencies initialize first.
    fn dependencies(&self) -> Vec<PluginHandle> {
        Vec::new()
    }
}

/// Optional second startup phase for work that requires other plugins to
/// have completed `init`. Subscriptions are typically published here.
#[async_trait]
pub trait PostInitPlugin: Plugin {
    async fn after_init(&self) -> Result<()>;
}

#[derive(Clone)]
enum PluginCore {
    Plain(Arc<dyn Plugin>),
    WithPostInit(Arc<dyn PostInitPlugin>),
}

/// A shareable reference to a plugin plus the name it was declared under.
///
/// Identity is the underlying allocation: the same instance handed out twice
/// (even under different declared names) is one plugin to the discoverer.
#[derive(Clone)]
pub struct PluginHandle {
    declared_name: Option<String>,
    core: PluginCore,
}

impl PluginHandle {
    /// Wrap a plugin without the after-init capability.
    pub fn plain(plugin: Arc<dyn Plugin>) -> Self {
        Self {
            declared_name: None,
            core: PluginCore::Plain(plugin),
        }
    }

    /// Wrap a plugin that offers the after-init phase.
    pub fn with_post_init(plugin: Arc<dyn PostInitPlugin>) -> Self {
        Self {
            declared_name: None,
            core: PluginCore::WithPostInit(plugin),
        }
    }

    /// Override the name the plugin is listed under, the way a field name
    /// labels an embedded component.
    pub fn named(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.declared_name = Some(name.into());
        self
    }

    /// Declared name when present, the plugin's own name otherwise.
    pub fn name(&self) -> &str {
        if let Some(ref declared) = self.declared_name {
            return declared;
        }
        match &self.core {
            PluginCore::Plain(p) => p.name(),
            PluginCore::WithPostInit(p) => p.name(),
        }
    }

    pub async fn init(&self) -> Result<()> {
        match &self.core {
            PluginCore::Plain(p) => p.init().await,
            PluginCore::WithPostInit(p) => p.init().await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match &self.core {
            PluginCore::Plain(p) => p.close().await,
            PluginCore::WithPostInit(p) => p.close().await,
        }
    }

    pub fn dependencies(&self) -> Vec<PluginHandle> {
        match &self.core {
            PluginCore::Plain(p) => p.dependencies(),
            PluginCore::WithPostInit(p) => p.dependencies(),
        }
    }

    /// The after-init capability, when the handle carries it.
    pub fn post_init(&self) -> Option<Arc<dyn PostInitPlugin>> {
        match &self.core {
            PluginCore::Plain(_) => None,
            PluginCore::WithPostInit(p) => Some(p.clone()),
        }
    }

    /// Identity of the underlying instance, for deduplication.
    pub(crate) fn instance_id(&self) -> usize {
        match &self.core {
            PluginCore::Plain(p) => Arc::as_ptr(p) as *const () as usize,
            PluginCore::WithPostInit(p) => Arc::as_ptr(p) as *const () as usize,
        }
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name())
            .field(
                "post_init",
                &matches!(self.core, PluginCore::WithPostInit(_)),
            )
            .finish()
    }
}

/// A user-assembled composite: the top-level value whose dependencies
/// collectively describe the agent. It satisfies the plugin contract itself
/// (with no-op phases) and is therefore always last in discovery order.
pub struct Aggregate {
    name: String,
    plugins: Vec<PluginHandle>,
}

impl Aggregate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugins: Vec::new(),
        }
    }

    /// Append a plugin; declaration order is initialization order among
    /// siblings.
    pub fn with(
        mut self,
        handle: PluginHandle,
    ) -> Self {
        self.plugins.push(handle);
        self
    }

    pub fn into_handle(self) -> PluginHandle {
        PluginHandle::plain(Arc::new(self))
    }
}

#[async_trait]
impl Plugin for Aggregate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn dependencies(&self) -> Vec<PluginHandle> {
        self.plugins.clone()
    }
}
