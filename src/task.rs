//! The task registry: the fixed set of pipeline tasks, the order in which a
//! pass walks them, and the default flag each task receives when it is first
//! written into a ledger.
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::error::RegistryError;

/// One named unit of pipeline work.
///
/// The declaration order of the variants is the execution order of a pass.
/// Later tasks consume the artifacts of earlier ones, so this order must never
/// change between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    Download,
    Watermark,
    Clips,
    ExtractAudio,
    Captions,
    PostProcess,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::Download,
        TaskKind::Watermark,
        TaskKind::Clips,
        TaskKind::ExtractAudio,
        TaskKind::Captions,
        TaskKind::PostProcess,
    ];

    /// Name of the task as it appears in ledgers and configuration files.
    pub const fn name(self) -> &'static str {
        match self {
            TaskKind::Download => "perform_download",
            TaskKind::Watermark => "apply_watermark",
            TaskKind::Clips => "make_clips",
            TaskKind::ExtractAudio => "extract_audio",
            TaskKind::Captions => "generate_captions",
            TaskKind::PostProcess => "post_process",
        }
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskKind {
    type Err = RegistryError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| RegistryError::UnknownTask(name.to_string()))
    }
}

/// A registered task together with its default flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub kind: TaskKind,
    pub default_enabled: bool,
}

impl Task {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Immutable after construction. Always holds every [`TaskKind`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    tasks: Vec<Task>,
}

impl Registry {
    /// Builds the registry from a `default_tasks` map. Tasks the map does not
    /// mention are disabled by default; names that are not registered tasks
    /// are rejected.
    pub fn from_defaults<K>(defaults: &BTreeMap<K, bool>) -> Result<Self, RegistryError>
    where
        K: AsRef<str> + Ord,
    {
        let mut flags = BTreeMap::new();
        for (name, &flag) in defaults {
            flags.insert(name.as_ref().parse::<TaskKind>()?, flag);
        }

        let tasks = TaskKind::ALL
            .into_iter()
            .map(|kind| Task {
                kind,
                default_enabled: flags.get(&kind).copied().unwrap_or(false),
            })
            .collect();

        Ok(Self { tasks })
    }

    /// Every registered task in execution order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, kind: TaskKind) -> Task {
        // `tasks` is indexed by declaration order of `TaskKind`.
        self.tasks[kind as usize]
    }

    pub fn lookup(&self, name: &str) -> Result<Task, RegistryError> {
        name.parse().map(|kind| self.get(kind))
    }

    pub fn default_flag(&self, name: &str) -> Result<bool, RegistryError> {
        self.lookup(name).map(|task| task.default_enabled)
    }
}

impl Default for Registry {
    /// Only the download is enabled out of the box.
    fn default() -> Self {
        let tasks = TaskKind::ALL
            .into_iter()
            .map(|kind| Task {
                kind,
                default_enabled: kind == TaskKind::Download,
            })
            .collect();

        Self { tasks }
    }
}
