//! The work behind each task is done by capabilities: external tools that take
//! one input (a URL for the download, a file path for everything else) and
//! report where they left their artifacts.
//!
//! The pipeline only relies on that contract. Capabilities are either plain
//! closures wrapped with [`from_fn`], or external programs described by a
//! [`CommandSpec`].
use std::collections::{BTreeMap, HashMap};
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::CapabilityError;
use crate::task::TaskKind;

/// Environment variable carrying the task's `params` as a JSON object.
pub const PARAMS_ENV: &str = "MIMESIS_PARAMS";

/// Everything a capability gets to know about the call.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub task: TaskKind,
    /// The URL for a download, the downloaded file for every other task.
    pub input: &'a str,
    /// Key of the resource being processed.
    pub url: &'a str,
    /// Ledger file of the resource, if one exists yet.
    pub ledger: Option<&'a Utf8Path>,
}

/// What a capability reports back on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Artifacts produced, most important first.
    pub outputs: Vec<Utf8PathBuf>,
    /// Descriptive fields to fold into the ledger (title, uploader, ...).
    pub fields: Map<String, Value>,
}

impl Outcome {
    pub fn single(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            outputs: vec![path.into()],
            fields: Map::new(),
        }
    }

    pub fn many(paths: impl IntoIterator<Item = impl Into<Utf8PathBuf>>) -> Self {
        Self {
            outputs: paths.into_iter().map(Into::into).collect(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// The path recorded as the task's completed state: the only output, or
    /// the directory all outputs share.
    pub fn primary(&self) -> Option<Utf8PathBuf> {
        match self.outputs.as_slice() {
            [] => None,
            [only] => Some(only.clone()),
            [first, rest @ ..] => match first.parent() {
                Some(parent)
                    if !parent.as_str().is_empty()
                        && rest.iter().all(|p| p.parent() == Some(parent)) =>
                {
                    Some(parent.to_path_buf())
                }
                _ => Some(first.clone()),
            },
        }
    }
}

pub trait Capability {
    fn invoke(&self, call: &Invocation<'_>) -> Result<Outcome, CapabilityError>;

    /// Short human description, used in dry runs.
    fn describe(&self) -> String {
        String::from("<function>")
    }
}

/// A capability backed by a closure. See [`from_fn`].
pub struct FnCapability<F>(F);

pub fn from_fn<F>(func: F) -> FnCapability<F>
where
    F: Fn(&Invocation<'_>) -> anyhow::Result<Outcome>,
{
    FnCapability(func)
}

impl<F> Capability for FnCapability<F>
where
    F: Fn(&Invocation<'_>) -> anyhow::Result<Outcome>,
{
    fn invoke(&self, call: &Invocation<'_>) -> Result<Outcome, CapabilityError> {
        (self.0)(call).map_err(CapabilityError::Userland)
    }
}

/// The capability table handed to the dispatcher.
#[derive(Default)]
pub struct Capabilities {
    table: HashMap<TaskKind, Box<dyn Capability>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: TaskKind, capability: impl Capability + 'static) -> &mut Self {
        self.table.insert(task, Box::new(capability));
        self
    }

    pub fn with(mut self, task: TaskKind, capability: impl Capability + 'static) -> Self {
        self.insert(task, capability);
        self
    }

    pub fn with_fn<F>(self, task: TaskKind, func: F) -> Self
    where
        F: Fn(&Invocation<'_>) -> anyhow::Result<Outcome> + 'static,
    {
        self.with(task, from_fn(func))
    }

    pub fn get(&self, task: TaskKind) -> Option<&dyn Capability> {
        self.table.get(&task).map(Box::as_ref)
    }

    pub fn invoke(&self, call: &Invocation<'_>) -> Result<Outcome, CapabilityError> {
        match self.get(call.task) {
            Some(capability) => capability.invoke(call),
            None => Err(CapabilityError::Missing(call.task.to_string())),
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tasks: Vec<_> = self.table.keys().collect();
        tasks.sort();
        f.debug_struct("Capabilities").field("tasks", &tasks).finish()
    }
}

/// An external program that performs a task.
///
/// `args` may contain the placeholders `{input}`, `{url}`, `{task}` and
/// `{ledger}`. The program must exit successfully, and the last non-empty
/// line it prints is its result: either a bare output path or a JSON object
/// `{"output_path": .., "output_paths": [..], "fields": {..}}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Task parameters (destination hints, clip specs, ...), passed through
    /// [`PARAMS_ENV`].
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    fn render_args(&self, call: &Invocation<'_>) -> Vec<String> {
        self.args.iter().map(|arg| render(arg, call)).collect()
    }
}

/// Fills the placeholders of one argument. Substituted values are copied
/// as-is and never scanned for placeholders themselves.
fn render(template: &str, call: &Invocation<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];

        let value = tail.find('}').and_then(|end| {
            let value = match &tail[1..end] {
                "input" => call.input,
                "url" => call.url,
                "task" => call.task.name(),
                "ledger" => call.ledger.map(Utf8Path::as_str).unwrap_or_default(),
                _ => return None,
            };
            Some((value, end))
        });

        match value {
            Some((value, end)) => {
                out.push_str(value);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

#[derive(Debug, Clone)]
pub struct CommandCapability {
    spec: CommandSpec,
}

impl CommandCapability {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl Capability for CommandCapability {
    fn invoke(&self, call: &Invocation<'_>) -> Result<Outcome, CapabilityError> {
        let program = &self.spec.program;
        let args = self.spec.render_args(call);
        let params = Value::Object(self.spec.params.clone()).to_string();

        tracing::debug!(%program, ?args, "spawning capability");

        let output = Command::new(program)
            .args(&args)
            .env(PARAMS_ENV, params)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| CapabilityError::Spawn(program.clone(), e))?;

        if !output.status.success() {
            return Err(CapabilityError::Failed {
                program: program.clone(),
                status: output.status,
            });
        }

        parse_result(&String::from_utf8(output.stdout)?)
    }

    fn describe(&self) -> String {
        let mut line = self.spec.program.clone();
        for arg in &self.spec.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Deserialize)]
struct Reported {
    #[serde(default)]
    output_path: Option<Utf8PathBuf>,
    #[serde(default)]
    output_paths: Vec<Utf8PathBuf>,
    #[serde(default)]
    fields: Map<String, Value>,
}

/// Interprets the stdout of a capability program.
pub fn parse_result(stdout: &str) -> Result<Outcome, CapabilityError> {
    let Some(line) = stdout.lines().map(str::trim).rfind(|line| !line.is_empty()) else {
        return Err(CapabilityError::NoOutput);
    };

    if !line.starts_with('{') {
        return Ok(Outcome::single(line));
    }

    let reported: Reported = serde_json::from_str(line).map_err(CapabilityError::Protocol)?;

    let mut outputs = Vec::new();
    outputs.extend(reported.output_path);
    for path in reported.output_paths {
        if !outputs.contains(&path) {
            outputs.push(path);
        }
    }

    if outputs.is_empty() {
        return Err(CapabilityError::NoOutput);
    }

    Ok(Outcome {
        outputs,
        fields: reported.fields,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(task: TaskKind) -> Invocation<'static> {
        Invocation {
            task,
            input: "/v/1.mp4",
            url: "https://x/1",
            ledger: Some(Utf8Path::new("metadata/1.json")),
        }
    }

    #[test]
    fn test_parse_plain_path() {
        let outcome = parse_result("encoding...\n/v/1_wm.mp4\n\n").unwrap();
        assert_eq!(outcome, Outcome::single("/v/1_wm.mp4"));
    }

    #[test]
    fn test_parse_json() {
        let stdout = r#"{"output_paths":["/c/clip_1.mp4","/c/clip_2.mp4"],"fields":{"clips":2}}"#;
        let outcome = parse_result(stdout).unwrap();

        assert_eq!(outcome.outputs.len(), 2);
        assert_eq!(outcome.fields["clips"], json!(2));
        assert_eq!(outcome.primary(), Some("/c".into()));
    }

    #[test]
    fn test_parse_empty() {
        assert!(matches!(parse_result(""), Err(CapabilityError::NoOutput)));
        assert!(matches!(parse_result("\n  \n"), Err(CapabilityError::NoOutput)));
        assert!(matches!(
            parse_result(r#"{"fields":{}}"#),
            Err(CapabilityError::NoOutput)
        ));
        assert!(matches!(
            parse_result("{broken"),
            Err(CapabilityError::Protocol(_))
        ));
    }

    #[test]
    fn test_primary() {
        assert_eq!(Outcome::default().primary(), None);
        assert_eq!(
            Outcome::many(["/a/1.mp4", "/b/2.mp4"]).primary(),
            Some("/a/1.mp4".into())
        );
        assert_eq!(
            Outcome::many(["1.mp4", "2.mp4"]).primary(),
            Some("1.mp4".into())
        );
        assert_eq!(
            Outcome::many(["/", "/a.mp4"]).primary(),
            Some("/".into())
        );
    }

    #[test]
    fn test_render_args() {
        let spec = CommandSpec {
            program: "python".into(),
            args: vec![
                "bin/call_watermark.py".into(),
                "{input}".into(),
                "--task={task}".into(),
                "--meta={ledger}".into(),
                "--from={url}".into(),
            ],
            ..Default::default()
        };

        assert_eq!(
            spec.render_args(&call(TaskKind::Watermark)),
            [
                "bin/call_watermark.py",
                "/v/1.mp4",
                "--task=apply_watermark",
                "--meta=metadata/1.json",
                "--from=https://x/1",
            ]
        );
    }

    #[test]
    fn test_render_values_are_not_rescanned() {
        let call = Invocation {
            task: TaskKind::Watermark,
            input: "/v/{url}/{task}.mp4",
            url: "https://x/{input}",
            ledger: None,
        };

        assert_eq!(render("{input}", &call), "/v/{url}/{task}.mp4");
        assert_eq!(render("--from={url}", &call), "--from=https://x/{input}");
        assert_eq!(render("{ledger}", &call), "");
        assert_eq!(render("{other} {input", &call), "{other} {input");
        assert_eq!(render("{{task}}", &call), "{apply_watermark}");
    }

    #[test]
    fn test_closure_capability() {
        let capabilities = Capabilities::new().with_fn(TaskKind::Watermark, |call| {
            Ok(Outcome::single(format!("{}.wm", call.input)))
        });

        let outcome = capabilities.invoke(&call(TaskKind::Watermark)).unwrap();
        assert_eq!(outcome, Outcome::single("/v/1.mp4.wm"));

        assert!(matches!(
            capabilities.invoke(&call(TaskKind::Clips)),
            Err(CapabilityError::Missing(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_capability() {
        let spec = CommandSpec {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                r#"echo working; echo "{input}.$MIMESIS_PARAMS""#.into(),
            ],
            params: Map::from_iter([("n".to_string(), json!(1))]),
            ..Default::default()
        };

        let outcome = CommandCapability::new(spec)
            .invoke(&call(TaskKind::PostProcess))
            .unwrap();
        assert_eq!(outcome, Outcome::single(r#"/v/1.mp4.{"n":1}"#));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_failure() {
        let spec = CommandSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 3".into()],
            ..Default::default()
        };

        let err = CommandCapability::new(spec)
            .invoke(&call(TaskKind::PostProcess))
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Failed { .. }));
    }
}
