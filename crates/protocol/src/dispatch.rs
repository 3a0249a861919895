//! Action addressing and the module registry.
//!
//! Commands name their handler with a dotted `module.action` address. The
//! registry is a closed map from module name to its actions, built once at
//! startup; both the agent (handlers) and the client (request builders and
//! response formatters) resolve addresses through it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::messages::StatusCode;

/// Errors from resolving an address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No module with this name.
    #[error("unsupported module: {0}")]
    UnsupportedModule(String),

    /// The address is not `module.action`, or the module has no such action.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
}

impl DispatchError {
    /// Status reported to the peer for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::UnsupportedModule(_) => StatusCode::NotImplemented,
            DispatchError::UnsupportedMethod(_) => StatusCode::MethodNotAllowed,
        }
    }
}

/// Errors from building a registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The module was registered twice.
    #[error("module {0} registered twice")]
    DuplicateModule(String),

    /// The module declares the same action twice.
    #[error("action {module}.{action} registered twice")]
    DuplicateAction {
        /// Module name.
        module: String,
        /// Lower-cased action name.
        action: String,
    },

    /// A module or action name is empty or contains a dot.
    #[error("invalid name: {0:?}")]
    InvalidName(String),
}

/// A parsed `module.action` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Module name, everything before the last dot.
    pub module: String,
    /// Lower-cased action name, everything after the last dot.
    pub action: String,
}

impl Address {
    /// Parses an address, splitting on the last `.`.
    pub fn parse(address: &str) -> Result<Self, DispatchError> {
        let (module, action) = address
            .rsplit_once('.')
            .ok_or_else(|| DispatchError::UnsupportedMethod(address.to_string()))?;
        Ok(Self {
            module: module.to_string(),
            action: action.to_lowercase(),
        })
    }
}

impl FromStr for Address {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.action)
    }
}

/// Closed map from module name to `{action: H}`.
#[derive(Debug, Clone)]
pub struct Registry<H> {
    modules: BTreeMap<String, BTreeMap<String, H>>,
}

impl<H> Registry<H> {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            modules: BTreeMap::new(),
        }
    }

    /// Resolves an address to its entry.
    pub fn resolve(&self, address: &Address) -> Result<&H, DispatchError> {
        let actions = self
            .modules
            .get(&address.module)
            .ok_or_else(|| DispatchError::UnsupportedModule(address.module.clone()))?;
        actions
            .get(&address.action)
            .ok_or_else(|| DispatchError::UnsupportedMethod(address.to_string()))
    }

    /// Registered module names, sorted.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Action names of a module, sorted.
    pub fn actions(&self, module: &str) -> Option<Vec<&str>> {
        self.modules
            .get(module)
            .map(|actions| actions.keys().map(String::as_str).collect())
    }
}

/// Builder for [`Registry`].
pub struct RegistryBuilder<H> {
    modules: BTreeMap<String, BTreeMap<String, H>>,
}

impl<H> RegistryBuilder<H> {
    /// Adds a module with its actions. Action names are lower-cased.
    pub fn module<I, S>(mut self, name: impl Into<String>, actions: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (S, H)>,
        S: AsRef<str>,
    {
        let name = name.into();
        validate_name(&name)?;
        if self.modules.contains_key(&name) {
            return Err(RegistryError::DuplicateModule(name));
        }

        let mut table = BTreeMap::new();
        for (action, handler) in actions {
            let action = action.as_ref().to_lowercase();
            validate_name(&action)?;
            if table.insert(action.clone(), handler).is_some() {
                return Err(RegistryError::DuplicateAction {
                    module: name,
                    action,
                });
            }
        }

        self.modules.insert(name, table);
        Ok(self)
    }

    /// Finishes the registry.
    pub fn build(self) -> Registry<H> {
        Registry {
            modules: self.modules,
        }
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.contains('.') {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}
