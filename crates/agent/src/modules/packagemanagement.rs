//! The `packagemanagement` module: refresh the package index, install updates.

use std::sync::Arc;

use protocol::{ActionResult, Parameters};
use serde_json::{json, Value};

use super::{AgentModule, Handler};
use crate::packages::PackageManager;

/// Module name.
pub const NAME: &str = "packagemanagement";

/// Package management actions.
#[derive(Debug, Clone)]
pub struct PackageManagement {
    packages: Arc<dyn PackageManager>,
}

impl PackageManagement {
    pub fn new(packages: Arc<dyn PackageManager>) -> Self {
        Self { packages }
    }

    /// Refresh the package index. Data: `{"needs_update": bool}`.
    pub fn refresh(&self, _parameters: Parameters) -> anyhow::Result<ActionResult> {
        let outcome = self.packages.refresh()?;
        tracing::info!(
            "{} refresh: success={} needs_update={}",
            self.packages.name(),
            outcome.success,
            outcome.needs_update
        );
        Ok(ActionResult::new(
            json!({ "needs_update": outcome.needs_update }),
            outcome.success,
        ))
    }

    /// Refresh, then install updates. `{"upgrade": true}` selects a full
    /// upgrade.
    pub fn update(&self, parameters: Parameters) -> anyhow::Result<ActionResult> {
        // Only the update's own outcome is reported
        self.packages.refresh()?;

        let upgrade = parameters
            .get("upgrade")
            .map(is_truthy)
            .unwrap_or(false);
        let success = self.packages.update(upgrade)?;
        tracing::info!(
            "{} update (upgrade={}): success={}",
            self.packages.name(),
            upgrade,
            success
        );
        Ok(ActionResult::new(Value::String(String::new()), success))
    }
}

/// Loose truthiness for flags supplied as JSON values.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

impl AgentModule for PackageManagement {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handlers(&self) -> Vec<(&'static str, Handler)> {
        let refresh = self.clone();
        let update = self.clone();
        vec![
            ("refresh", Arc::new(move |p: Parameters| refresh.refresh(p)) as Handler),
            ("update", Arc::new(move |p: Parameters| update.update(p)) as Handler),
        ]
    }
}
