use thiserror::Error;

/// The leaf error kinds a build can fail with. These get wrapped into a
/// [stacked_errors::Error] via `.stack_err(stage_name)` at the call site that
/// observed them, so a single failure carries both the typed `kind()` (used
/// for exit code mapping) and a human readable stage stack.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("invalid build configuration: {0}")]
    InvalidConfig(String),
    #[error("container runtime is unreachable")]
    RuntimeUnreachable,
    #[error("failed to pull image {image}")]
    PullFailed { image: String },
    #[error("image {image} not found")]
    ImageNotFound { image: String },
    #[error("builder user {uid} is not in the allowed UID set")]
    DisallowedUser { uid: i64 },
    #[error("missing required scripts: {scripts:?}, failed sources: {failed_sources:?}")]
    MissingRequiredScripts {
        scripts: Vec<String>,
        failed_sources: Vec<String>,
    },
    #[error("application source is unavailable: {0}")]
    SourceUnavailable(String),
    #[error("failed to upload input tar stream to container")]
    UploadFailed,
    #[error("failed to start build container")]
    ContainerStartFailed,
    #[error("build script exited with code {exit_code}, tail: {tail}")]
    BuildScriptFailed { exit_code: i64, tail: String },
    #[error("failed to extract prior build artifacts")]
    ArtifactExtractionFailed,
    #[error("failed to commit built image")]
    CommitFailed,
    #[error("operation timed out")]
    Timeout,
    #[error("build was cancelled")]
    Cancelled,
    #[error("filesystem error: {0}")]
    FilesystemError(String),
    #[error("builder image uses ONBUILD triggers and cannot discover scripts beyond `run`")]
    OnBuildIncompatible,
}

impl ErrorKind {
    /// Maps a kind onto the process exit codes documented for the `s2i` CLI:
    /// 0 success, 1 build failure, 2 invalid arguments, 3 runtime unreachable.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::InvalidConfig(_) => 2,
            ErrorKind::RuntimeUnreachable => 3,
            _ => 1,
        }
    }

    /// A short remediation hint shown alongside the error stage/cause, per
    /// the user-visible error format.
    pub fn remediation_hint(&self) -> Option<&'static str> {
        match self {
            ErrorKind::MissingRequiredScripts { .. } => Some(
                "no assemble script found; provide one under .s2i/bin, or set --scripts-url, or \
                 ensure the builder image declares io.openshift.s2i.scripts-url",
            ),
            ErrorKind::DisallowedUser { .. } => {
                Some("set AllowedUIDs to include the builder image's user, or use a different \
                      builder image")
            }
            ErrorKind::OnBuildIncompatible => {
                Some("OnBuild builder images only support a `run` script; remove any assemble, \
                      save-artifacts, or usage scripts")
            }
            _ => None,
        }
    }
}
