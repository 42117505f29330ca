//! Provider registry mapping kind names to constructors.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use strum::IntoEnumIterator;
use tracing::{debug, warn};

use super::{
    ConfigurationError, Provider, ProviderContext, ProviderKind, ShaarliProvider, WebhookProvider,
};

/// Builds a provider from its configuration blob.
pub type ProviderConstructor = Arc<
    dyn Fn(&Value, &ProviderContext) -> Result<Arc<dyn Provider>, ConfigurationError>
        + Send
        + Sync,
>;

/// Registration entry for a provider kind.
#[derive(Clone)]
pub struct ProviderDef {
    /// Display name.
    pub name: String,
    pub description: String,
    pub constructor: ProviderConstructor,
}

impl ProviderDef {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&Value, &ProviderContext) -> Result<Arc<dyn Provider>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            constructor: Arc::new(constructor),
        }
    }
}

impl std::fmt::Debug for ProviderDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDef")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Public listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderDescriptor {
    pub kind: String,
    pub name: String,
    pub description: String,
}

/// Kind name to [`ProviderDef`] map.
///
/// Registering a kind twice replaces the earlier definition; every later
/// [`build`](Self::build) uses the newest one.
pub struct ProviderRegistry {
    defs: RwLock<HashMap<String, ProviderDef>>,
    context: ProviderContext,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new(context: ProviderContext) -> Self {
        Self {
            defs: RwLock::new(HashMap::new()),
            context,
        }
    }

    /// Registry with every [`ProviderKind`] registered.
    pub fn with_builtins(context: ProviderContext) -> Self {
        let registry = Self::new(context);
        for kind in ProviderKind::iter() {
            registry.register(kind.as_ref(), builtin_def(kind));
        }
        registry
    }

    /// Register (or replace) the definition for `kind`.
    pub fn register(&self, kind: impl Into<String>, def: ProviderDef) {
        let kind = kind.into();
        let mut defs = self.defs.write();
        if let Some(previous) = defs.get(&kind) {
            warn!(
                kind = %kind,
                previous = %previous.name,
                replacement = %def.name,
                "provider kind registered twice, replacing previous definition"
            );
        } else {
            debug!(kind = %kind, name = %def.name, "registered provider");
        }
        defs.insert(kind, def);
    }

    /// Build a provider of `kind` from its configuration blob.
    pub fn build(&self, kind: &str, config: &Value) -> Result<Arc<dyn Provider>, ConfigurationError> {
        let constructor = self
            .defs
            .read()
            .get(kind)
            .map(|def| def.constructor.clone())
            .ok_or_else(|| ConfigurationError::UnknownKind(kind.to_string()))?;

        // The lock is released before running user constructors.
        constructor(config, &self.context)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.defs.read().contains_key(kind)
    }

    /// Registered kinds, sorted by kind name.
    pub fn list(&self) -> Vec<ProviderDescriptor> {
        let mut list: Vec<_> = self
            .defs
            .read()
            .iter()
            .map(|(kind, def)| ProviderDescriptor {
                kind: kind.clone(),
                name: def.name.clone(),
                description: def.description.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.kind.cmp(&b.kind));
        list
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins(ProviderContext::default())
    }
}

fn builtin_def(kind: ProviderKind) -> ProviderDef {
    match kind {
        ProviderKind::Webhook => ProviderDef::new(
            "Webhook",
            "Send article(s) as JSON to an HTTP endpoint.",
            |config, ctx| Ok(Arc::new(WebhookProvider::from_value(config, ctx)?) as Arc<dyn Provider>),
        ),
        ProviderKind::Shaarli => ProviderDef::new(
            "Shaarli",
            "Send article(s) to Shaarli instance.",
            |config, ctx| Ok(Arc::new(ShaarliProvider::from_value(config, ctx)?) as Arc<dyn Provider>),
        ),
    }
}
