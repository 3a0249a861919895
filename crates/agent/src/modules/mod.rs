//! Server-side action modules.
//!
//! A module exposes a map of lower-case action names to handlers. The set of
//! modules is closed: [`KNOWN_MODULES`] lists every module [`module`] can
//! build, and [`registry`] assembles all of them once at startup.

pub mod packagemanagement;

use std::sync::Arc;

use protocol::{ActionResult, Parameters, Registry, RegistryError};

use crate::packages::PackageManager;

/// A server-side action handler.
///
/// Handlers run on the blocking thread pool. Errors are not caught by the
/// registry; the listener turns them into a generic failure result.
pub type Handler = Arc<dyn Fn(Parameters) -> anyhow::Result<ActionResult> + Send + Sync>;

/// Names of every module the agent can serve.
pub const KNOWN_MODULES: &[&str] = &[packagemanagement::NAME];

/// Host services available to modules.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// The host's package manager.
    pub packages: Arc<dyn PackageManager>,
}

/// A server-side module: a named set of action handlers.
pub trait AgentModule: Send + Sync {
    /// Module name, the prefix of its addresses.
    fn name(&self) -> &'static str;

    /// `{action: handler}` for every action of the module.
    fn handlers(&self) -> Vec<(&'static str, Handler)>;
}

/// Build the module with the given name.
pub fn module(name: &str, context: &ModuleContext) -> Option<Box<dyn AgentModule>> {
    match name {
        packagemanagement::NAME => Some(Box::new(packagemanagement::PackageManagement::new(
            Arc::clone(&context.packages),
        ))),
        _ => None,
    }
}

/// Build the registry of every known module.
pub fn registry(context: &ModuleContext) -> Result<Registry<Handler>, RegistryError> {
    let mut builder = Registry::builder();
    for name in KNOWN_MODULES {
        let Some(module) = module(name, context) else {
            continue;
        };
        builder = builder.module(module.name(), module.handlers())?;
    }
    Ok(builder.build())
}
