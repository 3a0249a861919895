//! Client side of the `packagemanagement` module.

use protocol::{ActionResult, Parameters};
use serde_json::Value;

use super::{parse_arguments, BuildError, Builder, ClientModule, Formatted, Formatter};

/// Module name.
pub const NAME: &str = "packagemanagement";

/// Package management actions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageManagement;

/// `refresh` takes no arguments.
fn build_refresh(args: &[String]) -> Result<Parameters, BuildError> {
    match args.first() {
        Some(arg) => Err(BuildError::UnexpectedArgument(arg.clone())),
        None => Ok(Parameters::new()),
    }
}

/// `update` accepts `--upgrade` or `upgrade=<bool>`.
fn build_update(args: &[String]) -> Result<Parameters, BuildError> {
    let parameters = parse_arguments(args)?;
    if let Some(key) = parameters.keys().find(|key| *key != "upgrade") {
        return Err(BuildError::UnexpectedArgument(key.clone()));
    }
    Ok(parameters)
}

fn format_refresh(result: &ActionResult) -> Formatted {
    if !result.success {
        return Formatted {
            display: "Package index refresh failed".to_string(),
            exit_code: 1,
        };
    }

    let needs_update = result
        .data
        .get("needs_update")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Formatted {
        display: if needs_update {
            "Updates are available".to_string()
        } else {
            "All packages are up to date".to_string()
        },
        exit_code: 0,
    }
}

fn format_update(result: &ActionResult) -> Formatted {
    if result.success {
        Formatted {
            display: "Updates installed".to_string(),
            exit_code: 0,
        }
    } else {
        Formatted {
            display: "Update failed".to_string(),
            exit_code: 1,
        }
    }
}

impl ClientModule for PackageManagement {
    fn name(&self) -> &'static str {
        NAME
    }

    fn builders(&self) -> Vec<(&'static str, Builder)> {
        vec![
            ("refresh", Box::new(build_refresh) as Builder),
            ("update", Box::new(build_update) as Builder),
        ]
    }

    fn formatters(&self) -> Vec<(&'static str, Formatter)> {
        vec![
            ("refresh", Box::new(format_refresh) as Formatter),
            ("update", Box::new(format_update) as Formatter),
        ]
    }
}
