//! Decides, without touching the filesystem, what a pass should do with a task.
//!
//! Once a ledger exists its own flags are authoritative: a task missing from
//! the ledger is treated as disabled, regardless of the registry default.
use camino::Utf8Path;

use crate::error::RegistryError;
use crate::ledger::{ResourceLedger, TaskState};
use crate::task::{Registry, Task};

/// What a pass does with a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision<'a> {
    /// The task is pending and should be invoked now.
    Run,
    /// The task already produced this artifact.
    Done(&'a Utf8Path),
    /// Disabled, absent or unreadable.
    Skip,
}

#[derive(Debug, Clone, Copy)]
pub struct Gate<'a> {
    registry: &'a Registry,
}

impl<'a> Gate<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// `true` only when the ledger holds exactly the boolean `true` for the task.
    pub fn should_run(&self, task: &str, ledger: &ResourceLedger) -> Result<bool, RegistryError> {
        let task = self.registry.lookup(task)?;
        Ok(should_run(&task, ledger))
    }

    pub fn existing_output<'l>(
        &self,
        task: &str,
        ledger: &'l ResourceLedger,
    ) -> Result<Option<&'l Utf8Path>, RegistryError> {
        let task = self.registry.lookup(task)?;
        Ok(existing_output(&task, ledger))
    }

    pub fn decide<'l>(
        &self,
        task: &str,
        ledger: &'l ResourceLedger,
    ) -> Result<Decision<'l>, RegistryError> {
        let task = self.registry.lookup(task)?;
        Ok(decide(&task, ledger))
    }
}

pub fn should_run(task: &Task, ledger: &ResourceLedger) -> bool {
    ledger
        .state(task.name())
        .is_some_and(TaskState::is_pending)
}

pub fn existing_output<'l>(task: &Task, ledger: &'l ResourceLedger) -> Option<&'l Utf8Path> {
    ledger.state(task.name()).and_then(TaskState::output)
}

pub fn decide<'l>(task: &Task, ledger: &'l ResourceLedger) -> Decision<'l> {
    match ledger.state(task.name()) {
        Some(TaskState::Pending) => Decision::Run,
        Some(TaskState::Completed(path)) => Decision::Done(path),
        Some(TaskState::Unrecognized(value)) => {
            tracing::warn!(task = task.name(), %value, "unreadable task state, skipping");
            Decision::Skip
        }
        Some(TaskState::Disabled) | None => Decision::Skip,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::task::TaskKind;

    fn ledger_with(value: serde_json::Value) -> ResourceLedger {
        serde_json::from_value(json!({
            "url": "https://x/1",
            "default_tasks": { "apply_watermark": value }
        }))
        .unwrap()
    }

    #[test]
    fn test_should_run_only_for_true() {
        let registry = Registry::default();
        let gate = Gate::new(&registry);

        let cases = [
            (json!(true), true),
            (json!(false), false),
            (json!("/v/1_wm.mp4"), false),
            (json!(""), false),
            (json!(1), false),
            (json!(null), false),
            (json!(["a"]), false),
            (json!({"done": true}), false),
        ];

        for (value, expected) in cases {
            let ledger = ledger_with(value.clone());
            assert_eq!(
                gate.should_run("apply_watermark", &ledger),
                Ok(expected),
                "value {value}"
            );
        }
    }

    #[test]
    fn test_absent_is_not_run() {
        // The registry default says run, the ledger has no entry: don't run.
        let registry = Registry::default();
        let gate = Gate::new(&registry);
        let ledger = ResourceLedger::new("https://x/1");

        assert_eq!(gate.should_run("perform_download", &ledger), Ok(false));
        assert_eq!(gate.decide("perform_download", &ledger), Ok(Decision::Skip));
    }

    #[test]
    fn test_existing_output() {
        let registry = Registry::default();
        let gate = Gate::new(&registry);

        let ledger = ledger_with(json!("/v/1_wm.mp4"));
        assert_eq!(
            gate.existing_output("apply_watermark", &ledger),
            Ok(Some(Utf8Path::new("/v/1_wm.mp4")))
        );
        assert_eq!(
            gate.decide("apply_watermark", &ledger),
            Ok(Decision::Done(Utf8Path::new("/v/1_wm.mp4")))
        );

        for value in [json!(true), json!(false), json!(42)] {
            let ledger = ledger_with(value);
            assert_eq!(gate.existing_output("apply_watermark", &ledger), Ok(None));
        }
    }

    #[test]
    fn test_unknown_task_is_an_error() {
        let registry = Registry::default();
        let gate = Gate::new(&registry);
        let ledger = ledger_with(json!(true));

        assert_eq!(
            gate.should_run("watermark", &ledger),
            Err(RegistryError::UnknownTask("watermark".into()))
        );
    }

    #[test]
    fn test_free_functions_agree() {
        let registry = Registry::default();
        let task = registry.get(TaskKind::Watermark);
        let ledger = ledger_with(json!(true));

        assert!(should_run(&task, &ledger));
        assert_eq!(decide(&task, &ledger), Decision::Run);
        assert_eq!(existing_output(&task, &ledger), None);
    }
}
