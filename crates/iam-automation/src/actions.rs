//! Running message actions
//!
//! Messages carry an `actions` document mapping action names to values. The
//! host application decides what an action does by supplying an
//! [`ActionRunner`].

use serde_json::Value;

use iam_core::prelude::*;
use iam_core::JsonMap;

pub trait ActionRunner: Send + Sync {
    fn run(&self, name: &str, value: &Value);
}

/// Logs each action and does nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingActionRunner;

impl ActionRunner for LoggingActionRunner {
    fn run(&self, name: &str, value: &Value) {
        info!("Running action {} with {}", name, value);
    }
}

/// Run every action in the document, in key order
pub fn run_actions(runner: &dyn ActionRunner, actions: &JsonMap) {
    for (name, value) in actions {
        runner.run(name, value);
    }
}
