//! One pass over the task order for a single resource.
//!
//! The dispatcher resolves the resource's ledger (downloading first when no
//! ledger exists yet), then walks every task after the download in registry
//! order. Pending tasks are handed to their capability with the downloaded
//! file as input, and each success is written back to the store before the
//! next task starts. A failed task is logged and left pending, so the next
//! pass picks it up again.
use std::fmt::{self, Display};

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;
use serde_json::Value;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::capability::{Capabilities, Invocation, Outcome};
use crate::error::{CapabilityError, DispatchError};
use crate::gate::{Decision, Gate};
use crate::io::pass_style;
use crate::ledger::{ResourceLedger, TaskState};
use crate::store::LedgerStore;
use crate::task::{Registry, Task, TaskKind};

const ANSI_GREEN: Style = Style::new().green();
const ANSI_YELLOW: Style = Style::new().yellow();
const ANSI_RED: Style = Style::new().red();
const ANSI_DIM: Style = Style::new().dim();

/// What the pipeline is asked to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// An `http(s)` URL, fetched by the download capability.
    Remote(String),
    /// A media file already on disk. It needs no download.
    Local(Utf8PathBuf),
}

impl Resource {
    pub fn parse(arg: &str) -> Result<Self, DispatchError> {
        if arg.starts_with("http://") || arg.starts_with("https://") {
            return Ok(Resource::Remote(arg.to_string()));
        }

        let path = Utf8Path::new(arg);
        if path.is_file() {
            return Ok(Resource::Local(path.to_path_buf()));
        }

        Err(DispatchError::NotDownloadable(arg.to_string()))
    }

    /// The `url` value of the resource's ledger.
    pub fn key(&self) -> &str {
        match self {
            Resource::Remote(url) => url,
            Resource::Local(path) => path.as_str(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Only report what would run. Nothing is invoked or written.
    pub dry_run: bool,
    /// Where to copy the ledger after each completed task.
    pub backup_dir: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Completed in an earlier pass.
    AlreadyDone(Utf8PathBuf),
    /// Disabled, absent or unreadable.
    Skipped,
    /// Completed in this pass.
    Completed(Utf8PathBuf),
    /// The capability failed; the task stays pending.
    Failed(String),
    /// Would run, in a dry run.
    Planned { input: String, command: String },
}

/// Summary of one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub key: String,
    /// Ledger file of the resource, if one exists.
    pub ledger: Option<Utf8PathBuf>,
    /// Outcome per task, in execution order.
    pub outcomes: Vec<(TaskKind, TaskOutcome)>,
}

impl PassReport {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ledger: None,
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, kind: TaskKind, outcome: TaskOutcome) {
        self.outcomes.push((kind, outcome));
    }

    pub fn outcome(&self, kind: TaskKind) -> Option<&TaskOutcome> {
        self.outcomes
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, outcome)| outcome)
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Completed(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&TaskOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

impl Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (kind, outcome) in &self.outcomes {
            let name = kind.name();
            match outcome {
                TaskOutcome::AlreadyDone(path) => {
                    writeln!(f, "{name:<18} {} {path}", ANSI_DIM.apply_to("done"))?
                }
                TaskOutcome::Skipped => writeln!(f, "{name:<18} {}", ANSI_DIM.apply_to("skip"))?,
                TaskOutcome::Completed(path) => {
                    writeln!(f, "{name:<18} {} {path}", ANSI_GREEN.apply_to("ok  "))?
                }
                TaskOutcome::Failed(reason) => {
                    writeln!(f, "{name:<18} {} {reason}", ANSI_RED.apply_to("fail"))?
                }
                TaskOutcome::Planned { input, command } => writeln!(
                    f,
                    "{name:<18} {} {command} <- {input}",
                    ANSI_YELLOW.apply_to("plan")
                )?,
            }
        }
        Ok(())
    }
}

/// Task states of a ledger, as printed by `--status`.
pub struct Status<'a> {
    pub registry: &'a Registry,
    pub ledger: &'a ResourceLedger,
}

impl Display for Status<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.ledger.url)?;

        for task in self.registry.tasks() {
            let name = task.name();
            match self.ledger.state(name) {
                Some(TaskState::Completed(path)) => {
                    writeln!(f, "  {name:<18} {} {path}", ANSI_GREEN.apply_to("done"))?
                }
                Some(TaskState::Pending) => {
                    writeln!(f, "  {name:<18} {}", ANSI_YELLOW.apply_to("pending"))?
                }
                Some(TaskState::Disabled) => {
                    writeln!(f, "  {name:<18} {}", ANSI_DIM.apply_to("disabled"))?
                }
                Some(TaskState::Unrecognized(value)) => {
                    writeln!(f, "  {name:<18} {} {value}", ANSI_RED.apply_to("invalid"))?
                }
                None => writeln!(f, "  {name:<18} {}", ANSI_DIM.apply_to("absent"))?,
            }
        }

        for name in self.ledger.unknown_tasks() {
            if let Some(state) = self.ledger.state(name) {
                writeln!(
                    f,
                    "  {name:<18} {} {}",
                    ANSI_DIM.apply_to("unknown"),
                    Value::from(state)
                )?;
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    registry: Registry,
    store: LedgerStore,
    capabilities: Capabilities,
    options: Options,
}

impl Dispatcher {
    pub fn new(
        registry: Registry,
        store: LedgerStore,
        capabilities: Capabilities,
        options: Options,
    ) -> Self {
        Self {
            registry,
            store,
            capabilities,
            options,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Runs one pass for `resource`.
    pub fn run(&self, resource: &Resource) -> Result<PassReport, DispatchError> {
        let key = resource.key();

        let span = tracing::info_span!("pass", url = key);
        span.pb_set_length(self.registry.tasks().len() as u64);
        span.pb_set_style(&pass_style());
        span.pb_set_message(key);
        let _enter = span.enter();

        let mut report = PassReport::new(key);

        let (path, mut ledger) = match self.store.find_by_url(key)? {
            Some(found) => found,
            None if self.options.dry_run => return Ok(self.plan_fresh(resource, report)),
            None => {
                self.acquire(resource)?;
                self.resolve(key)?
            }
        };
        report.ledger = Some(path.clone());

        for name in ledger.unknown_tasks() {
            tracing::warn!(task = name, "unknown task in ledger, leaving it alone");
        }

        let download = self.registry.get(TaskKind::Download);
        let gate = Gate::new(&self.registry);

        if gate.should_run(download.name(), &ledger)? {
            if self.options.dry_run {
                report.push(TaskKind::Download, self.planned(download, key));
                span.pb_inc(1);
                self.plan_rest(&ledger, "<download output>", &mut report)?;
                return Ok(report);
            }

            self.redownload(resource, &path, &mut ledger, &mut report)?;
        } else if let Some(output) = gate.existing_output(download.name(), &ledger)? {
            report.push(TaskKind::Download, TaskOutcome::AlreadyDone(output.to_owned()));
        }
        span.pb_inc(1);

        let to_process = match gate.existing_output(download.name(), &ledger)? {
            Some(path) => path.to_owned(),
            None => return Err(DispatchError::DownloadNotComplete(key.to_string())),
        };

        if !to_process.exists() {
            tracing::warn!(path = %to_process, "downloaded file is gone, continuing anyway");
        }

        if self.options.dry_run {
            self.plan_rest(&ledger, to_process.as_str(), &mut report)?;
            return Ok(report);
        }

        for task in self.downstream() {
            let outcome = match gate.decide(task.name(), &ledger)? {
                Decision::Done(output) => {
                    tracing::info!(task = task.name(), path = %output, "already done");
                    TaskOutcome::AlreadyDone(output.to_owned())
                }
                Decision::Skip => {
                    tracing::debug!(task = task.name(), "not enabled, skipping");
                    TaskOutcome::Skipped
                }
                Decision::Run => {
                    let call = Invocation {
                        task: task.kind,
                        input: to_process.as_str(),
                        url: key,
                        ledger: Some(path.as_path()),
                    };

                    match self.perform(&call) {
                        Ok((primary, outcome)) => {
                            record(&mut ledger, task.kind, &primary, outcome);
                            self.persist(key, &path, &ledger)?;
                            tracing::info!(task = task.name(), path = %primary, "task completed");
                            TaskOutcome::Completed(primary)
                        }
                        Err(e) => {
                            tracing::warn!(task = task.name(), "task failed, will retry next pass: {e}");
                            TaskOutcome::Failed(e.to_string())
                        }
                    }
                }
            };

            report.push(task.kind, outcome);
            span.pb_inc(1);
        }

        Ok(report)
    }

    /// Tasks that consume the downloaded file, in order.
    fn downstream(&self) -> impl Iterator<Item = Task> + '_ {
        self.registry
            .tasks()
            .iter()
            .copied()
            .filter(|task| task.kind != TaskKind::Download)
    }

    /// Invokes a capability and checks what it reports. Returns the path to
    /// record as the task's completed state along with the full outcome.
    fn perform(&self, call: &Invocation<'_>) -> Result<(Utf8PathBuf, Outcome), CapabilityError> {
        let span = tracing::info_span!("task", name = call.task.name());
        span.pb_set_message(&format!("Running {}", call.task));
        let _enter = span.enter();

        let outcome = self.capabilities.invoke(call)?;

        if let Some(missing) = outcome.outputs.iter().find(|path| !path.exists()) {
            return Err(CapabilityError::MissingOutput(missing.clone()));
        }

        let primary = outcome.primary().ok_or(CapabilityError::NoOutput)?;
        Ok((primary, outcome))
    }

    /// Looks the ledger up again once the download has run.
    fn resolve(&self, key: &str) -> Result<(Utf8PathBuf, ResourceLedger), DispatchError> {
        self.store
            .find_by_url(key)?
            .ok_or_else(|| DispatchError::MetadataMissing(key.to_string()))
    }

    /// Downloads a resource that had no ledger when the pass started. The
    /// downloader may write the ledger on its own, so the store is searched
    /// again before a new one is created.
    fn acquire(&self, resource: &Resource) -> Result<(), DispatchError> {
        let key = resource.key();

        let (primary, outcome) = match resource {
            Resource::Local(path) => {
                tracing::info!(path = %path, "local media, no download needed");
                (path.clone(), Outcome::single(path.clone()))
            }
            Resource::Remote(url) => {
                let call = Invocation {
                    task: TaskKind::Download,
                    input: url,
                    url,
                    ledger: None,
                };

                self.perform(&call).map_err(|e| {
                    tracing::error!(url = %url, "download failed: {e}");
                    DispatchError::DownloadNotComplete(key.to_string())
                })?
            }
        };

        match self.store.find_by_url(key)? {
            Some((path, mut ledger)) => {
                tracing::debug!(path = %path, "ledger written during download");
                let downloaded = ledger
                    .state(TaskKind::Download.name())
                    .and_then(TaskState::output)
                    .is_some();
                if !downloaded {
                    record(&mut ledger, TaskKind::Download, &primary, outcome);
                }
                ledger.add_defaults(&self.registry);
                self.persist(key, &path, &ledger)?;
            }
            None => {
                let mut ledger = ResourceLedger::new(key);
                record(&mut ledger, TaskKind::Download, &primary, outcome);
                ledger.add_defaults(&self.registry);

                let path = self
                    .store
                    .create(&ledger)
                    .map_err(|e| DispatchError::Persist(key.to_string(), e))?;
                self.backup(&path);
            }
        }

        Ok(())
    }

    /// Runs a download that the existing ledger still marks as pending.
    fn redownload(
        &self,
        resource: &Resource,
        path: &Utf8Path,
        ledger: &mut ResourceLedger,
        report: &mut PassReport,
    ) -> Result<(), DispatchError> {
        let key = resource.key();

        let result = match resource {
            Resource::Local(file) => Ok((file.clone(), Outcome::single(file.clone()))),
            Resource::Remote(url) => self.perform(&Invocation {
                task: TaskKind::Download,
                input: url,
                url,
                ledger: Some(path),
            }),
        };

        match result {
            Ok((primary, outcome)) => {
                record(ledger, TaskKind::Download, &primary, outcome);
                self.persist(key, path, ledger)?;
                report.push(TaskKind::Download, TaskOutcome::Completed(primary));
            }
            Err(e) => {
                tracing::error!(url = key, "download failed: {e}");
                report.push(TaskKind::Download, TaskOutcome::Failed(e.to_string()));
            }
        }

        Ok(())
    }

    fn persist(
        &self,
        key: &str,
        path: &Utf8Path,
        ledger: &ResourceLedger,
    ) -> Result<(), DispatchError> {
        self.store
            .save(path, ledger)
            .map_err(|e| DispatchError::Persist(key.to_string(), e))?;
        self.backup(path);
        Ok(())
    }

    fn backup(&self, path: &Utf8Path) {
        if let Some(dir) = &self.options.backup_dir {
            self.store.backup(path, dir);
        }
    }

    fn planned(&self, task: Task, input: &str) -> TaskOutcome {
        let command = match self.capabilities.get(task.kind) {
            Some(capability) => capability.describe(),
            None => String::from("<no capability>"),
        };

        TaskOutcome::Planned {
            input: input.to_string(),
            command,
        }
    }

    /// Dry run for a resource without a ledger: the plan follows the
    /// registry defaults, with the download first.
    fn plan_fresh(&self, resource: &Resource, mut report: PassReport) -> PassReport {
        let mut ledger = ResourceLedger::new(resource.key());

        let input = match resource {
            Resource::Local(path) => {
                report.push(TaskKind::Download, TaskOutcome::AlreadyDone(path.clone()));
                ledger.record_completion(TaskKind::Download, path.clone());
                path.to_string()
            }
            Resource::Remote(url) => {
                let download = self.registry.get(TaskKind::Download);
                report.push(TaskKind::Download, self.planned(download, url));
                String::from("<download output>")
            }
        };

        ledger.add_defaults(&self.registry);

        for task in self.downstream() {
            let outcome = match ledger.state(task.name()) {
                Some(TaskState::Pending) => self.planned(task, &input),
                _ => TaskOutcome::Skipped,
            };
            report.push(task.kind, outcome);
        }

        report
    }

    fn plan_rest(
        &self,
        ledger: &ResourceLedger,
        input: &str,
        report: &mut PassReport,
    ) -> Result<(), DispatchError> {
        let gate = Gate::new(&self.registry);

        for task in self.downstream() {
            let outcome = match gate.decide(task.name(), ledger)? {
                Decision::Done(output) => TaskOutcome::AlreadyDone(output.to_owned()),
                Decision::Skip => TaskOutcome::Skipped,
                Decision::Run => self.planned(task, input),
            };
            report.push(task.kind, outcome);
        }

        Ok(())
    }
}

/// Folds a successful outcome into the ledger.
fn record(ledger: &mut ResourceLedger, kind: TaskKind, primary: &Utf8Path, outcome: Outcome) {
    ledger.merge_fields(outcome.fields);

    if outcome.outputs.len() > 1 {
        let list = outcome
            .outputs
            .iter()
            .map(|path| Value::String(path.to_string()))
            .collect();
        ledger
            .fields
            .insert(format!("{}_outputs", kind.name()), Value::Array(list));
    }

    ledger.record_completion(kind, primary);
}
