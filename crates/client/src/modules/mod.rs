//! Client-side action modules.
//!
//! For each action a module provides a request builder, turning command line
//! arguments into parameters, and optionally a response formatter, turning
//! the node's result into something to print and an exit status.

pub mod packagemanagement;

use protocol::{ActionResult, Parameters, Registry, RegistryError};
use serde_json::Value;
use thiserror::Error;

/// Errors from building a request out of command line arguments.
#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    /// The action takes no such argument.
    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),

    /// The argument is not `key=value` or `--flag`.
    #[error("invalid argument {0:?}: expected key=value or --flag")]
    InvalidArgument(String),
}

/// What to show for a result, and the process exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatted {
    pub display: String,
    pub exit_code: i32,
}

/// Turns command line arguments into command parameters.
pub type Builder = Box<dyn Fn(&[String]) -> Result<Parameters, BuildError> + Send + Sync>;

/// Turns a result into output.
pub type Formatter = Box<dyn Fn(&ActionResult) -> Formatted + Send + Sync>;

/// A client-side action: its builder and formatter.
pub struct ClientAction {
    pub build: Builder,
    pub format: Formatter,
}

impl std::fmt::Debug for ClientAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAction").finish_non_exhaustive()
    }
}

/// Names of every module the client knows.
pub const KNOWN_MODULES: &[&str] = &[packagemanagement::NAME];

/// A client-side module.
pub trait ClientModule: Send + Sync {
    /// Module name, the prefix of its addresses.
    fn name(&self) -> &'static str;

    /// `{action: builder}` for every action of the module.
    fn builders(&self) -> Vec<(&'static str, Builder)>;

    /// `{action: formatter}`; actions without one use [`format_default`].
    fn formatters(&self) -> Vec<(&'static str, Formatter)> {
        Vec::new()
    }
}

/// Build the module with the given name.
pub fn module(name: &str) -> Option<Box<dyn ClientModule>> {
    match name {
        packagemanagement::NAME => Some(Box::new(packagemanagement::PackageManagement)),
        _ => None,
    }
}

/// Build the registry of every known module.
pub fn registry() -> Result<Registry<ClientAction>, RegistryError> {
    let mut builder = Registry::builder();
    for name in KNOWN_MODULES {
        let Some(module) = module(name) else {
            continue;
        };

        let mut formatters = module.formatters();
        let actions: Vec<_> = module
            .builders()
            .into_iter()
            .map(|(action, build)| {
                let format = match formatters.iter().position(|(name, _)| *name == action) {
                    Some(index) => formatters.swap_remove(index).1,
                    None => Box::new(format_default) as Formatter,
                };
                (action, ClientAction { build, format })
            })
            .collect();
        builder = builder.module(module.name(), actions)?;
    }
    Ok(builder.build())
}

/// Parses `key=value` and `--flag` arguments.
///
/// Values are JSON when they parse as JSON and strings otherwise, so
/// `count=3` is a number and `name=web` a string. `--flag` is `flag=true`.
pub fn parse_arguments(args: &[String]) -> Result<Parameters, BuildError> {
    let mut parameters = Parameters::new();
    for arg in args {
        if let Some(flag) = arg.strip_prefix("--") {
            if flag.is_empty() || flag.contains('=') {
                return Err(BuildError::InvalidArgument(arg.clone()));
            }
            parameters.insert(flag.to_string(), Value::Bool(true));
            continue;
        }

        let Some((key, value)) = arg.split_once('=') else {
            return Err(BuildError::InvalidArgument(arg.clone()));
        };
        if key.is_empty() {
            return Err(BuildError::InvalidArgument(arg.clone()));
        }
        let value =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        parameters.insert(key.to_string(), value);
    }
    Ok(parameters)
}

/// Formatter for actions without one of their own: the result data, exit
/// status 0 on success and 1 otherwise.
pub fn format_default(result: &ActionResult) -> Formatted {
    let display = match &result.data {
        Value::String(s) if s.is_empty() => result.message.clone(),
        Value::String(s) => s.clone(),
        Value::Object(o) if o.is_empty() => result.message.clone(),
        data => serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string()),
    };
    Formatted {
        display,
        exit_code: if result.success { 0 } else { 1 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Address, DispatchError};
    use serde_json::json;

    fn args(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_arguments_json_values() {
        let parameters =
            parse_arguments(&args(&["count=3", "upgrade=true", "tags=[\"a\"]"])).unwrap();
        assert_eq!(parameters["count"], json!(3));
        assert_eq!(parameters["upgrade"], json!(true));
        assert_eq!(parameters["tags"], json!(["a"]));
    }

    #[test]
    fn test_parse_arguments_falls_back_to_strings() {
        let parameters = parse_arguments(&args(&["name=web-01", "empty="])).unwrap();
        assert_eq!(parameters["name"], json!("web-01"));
        assert_eq!(parameters["empty"], json!(""));
    }

    #[test]
    fn test_parse_arguments_flags() {
        let parameters = parse_arguments(&args(&["--upgrade"])).unwrap();
        assert_eq!(parameters["upgrade"], json!(true));
    }

    #[test]
    fn test_parse_arguments_rejects_bare_words() {
        assert_eq!(
            parse_arguments(&args(&["upgrade"])),
            Err(BuildError::InvalidArgument("upgrade".to_string()))
        );
        assert!(parse_arguments(&args(&["=1"])).is_err());
        assert!(parse_arguments(&args(&["--"])).is_err());
    }

    #[test]
    fn test_format_default() {
        let formatted = format_default(&ActionResult::new(json!({"a": 1}), true));
        assert_eq!(formatted.exit_code, 0);
        assert!(formatted.display.contains("\"a\": 1"));

        let formatted = format_default(&ActionResult::new(json!(""), false));
        assert_eq!(formatted.exit_code, 1);
    }

    #[test]
    fn test_every_known_module_builds() {
        for name in KNOWN_MODULES {
            let module = module(name).unwrap();
            assert_eq!(module.name(), *name);
            assert!(!module.builders().is_empty());
        }
        assert!(module("wordpress").is_none());
    }

    #[test]
    fn test_registry_resolves_package_actions() {
        let registry = registry().unwrap();

        let refresh = registry
            .resolve(&Address::parse("packagemanagement.Refresh").unwrap())
            .unwrap();
        assert_eq!((refresh.build)(&[]).unwrap(), Parameters::new());

        assert!(matches!(
            registry.resolve(&Address::parse("nomodule.x").unwrap()),
            Err(DispatchError::UnsupportedModule(_))
        ));
    }
}
