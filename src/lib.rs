//! In-App Automation Library
//!
//! Root package of the workspace: the headless scenario runner behind the
//! `iamctl` binary. The orchestration core lives in `iam-automation`.

pub mod headless;
pub mod scenario;

pub use headless::runner::{run_headless, run_scenario};
pub use headless::HeadlessEvent;
pub use scenario::{Scenario, ScenarioSchedule, Step};
