use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MimesisError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Misuse of the task registry. Always a configuration or programming error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown task '{0}'")]
    UnknownTask(String),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Couldn't access ledger file {0}.\n{1}")]
    Io(Utf8PathBuf, #[source] std::io::Error),

    #[error("Couldn't parse ledger file {0}: {1}")]
    Parse(Utf8PathBuf, #[source] serde_json::Error),

    #[error("Couldn't encode ledger for {0}: {1}")]
    Encode(String, #[source] serde_json::Error),

    #[error("A ledger for '{url}' already exists at {path}")]
    Duplicate { url: String, path: Utf8PathBuf },

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

/// Failure of a single capability invocation. Recoverable: the task stays
/// pending and the pass moves on.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("No capability is configured for task '{0}'")]
    Missing(String),

    #[error("Couldn't start '{0}'.\n{1}")]
    Spawn(String, #[source] std::io::Error),

    #[error("'{program}' exited with {status}")]
    Failed { program: String, status: std::process::ExitStatus },

    #[error("Capability output is not valid UTF-8.\n{0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Capability returned an unreadable result: {0}")]
    Protocol(#[source] serde_json::Error),

    #[error("Capability reported no output path")]
    NoOutput,

    #[error("Reported output {0} does not exist")]
    MissingOutput(Utf8PathBuf),

    #[error(transparent)]
    Userland(#[from] anyhow::Error),
}

/// Conditions that stop a pass for a resource.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No ledger found for '{0}'")]
    MetadataMissing(String),

    #[error("Download for '{0}' is not complete")]
    DownloadNotComplete(String),

    #[error("'{0}' is neither an http(s) URL nor an existing file")]
    NotDownloadable(String),

    #[error("Couldn't persist ledger for '{0}'.\n{1}")]
    Persist(String, #[source] LedgerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file {0}.\n{1}")]
    Io(Utf8PathBuf, #[source] std::io::Error),

    #[error("Couldn't parse config file {0}: {1}")]
    Parse(Utf8PathBuf, #[source] serde_json::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_error_keeps_message() {
        let err = MimesisError::from(DispatchError::MetadataMissing("https://x/1".into()));
        assert!(matches!(err, MimesisError::Dispatch(DispatchError::MetadataMissing(_))));
        assert_eq!(err.to_string(), "No ledger found for 'https://x/1'");

        let err = MimesisError::from(ConfigError::from(RegistryError::UnknownTask("x".into())));
        assert_eq!(err.to_string(), "Unknown task 'x'");
    }
}
