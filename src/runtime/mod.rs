//! The `ContainerRuntime` capability interface and the types it speaks in.
//! Two back-ends implement it: [docker::DockerRuntime] (the Docker HTTP API
//! via `bollard`) and [buildah::BuildahRuntime] (the `buildah` CLI as a
//! subprocess, reusing [crate::Command]/[crate::CommandRunner]).
//!
//! No runtime-specific type is allowed to leak into [crate::BuildConfig] or
//! [crate::BuildResult]; everything above this module talks only in terms of
//! the types declared here.

use std::{collections::HashMap, future::Future, pin::Pin};

use serde::{Deserialize, Serialize};
use stacked_errors::Result;

use crate::config::{CGroupLimits, ImageRef, PullPolicy};

pub mod buildah;
#[cfg(feature = "bollard")]
pub mod docker;
pub mod fake;

/// Boxed future alias used for the `ContainerRuntime` trait's async methods.
/// Native `async fn` in traits isn't used here because the trait needs to be
/// object-safe (`&dyn ContainerRuntime`).
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Normalized, runtime-agnostic snapshot of an image's relevant config. The
/// Docker back-end builds this from `bollard::models::ImageInspect`; the
/// Buildah back-end builds it from parsed `buildah inspect` JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuilderImageMetadata {
    pub id: String,
    pub user: String,
    pub env: Vec<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub on_build: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl BuilderImageMetadata {
    pub const SCRIPTS_URL_LABEL: &'static str = "io.openshift.s2i.scripts-url";
    pub const DESTINATION_LABEL: &'static str = "io.openshift.s2i.destination";
    pub const ASSEMBLE_INPUT_FILES_LABEL: &'static str = "io.openshift.s2i.assemble-input-files";
    pub const ASSEMBLE_USER_LABEL: &'static str = "io.openshift.s2i.assemble-user";

    pub fn scripts_url_label(&self) -> Option<&str> {
        self.labels.get(Self::SCRIPTS_URL_LABEL).map(String::as_str)
    }
}

/// Specification passed to `CreateContainer`.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: ImageRef,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub network_mode: Option<String>,
    pub security_opts: Vec<String>,
    pub cap_drop: Vec<String>,
    pub cgroup_limits: CGroupLimits,
    /// host-path -> container-path volume mounts
    pub volumes: HashMap<String, String>,
    /// container paths the caller expects to exist once the container runs
    /// (used by the non-root bootstrap path to validate `Destination`
    /// subpaths ahead of time)
    pub expected_mounts: Vec<String>,
    pub privileged: bool,
}

/// Config committed onto the new image, replacing the source container's own
/// runtime config rather than inheriting it verbatim.
#[derive(Debug, Clone, Default)]
pub struct CommitConfig {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub user: String,
    pub working_dir: String,
}

/// Opaque container handle. The orchestrator is the only owner; every id
/// handed out by `CreateContainer` is passed to `Remove` before `Build`
/// returns (see `orchestrator::ContainerHandle` for the cleanup bookkeeping).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

/// The result of `StartAndWait`.
#[derive(Debug, Clone, Copy)]
pub struct ExitStatus {
    pub code: i64,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// The two streams captured off a container's process, kept separate so a
/// consumer that needs a pristine byte stream (the save-artifacts tar) never
/// sees bytes from the other one.
#[derive(Debug, Clone, Default)]
pub struct ContainerOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ContainerOutput {
    /// Stdout followed by stderr, truncated to the last `n` bytes. Meant for
    /// human-facing diagnostics (`BuildScriptFailed`'s tail), never for
    /// anything that has to stay byte-exact like a tar stream.
    pub fn combined_tail(&self, n: usize) -> Vec<u8> {
        let mut combined = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        combined.extend_from_slice(&self.stdout);
        combined.extend_from_slice(&self.stderr);
        if combined.len() > n {
            let start = combined.len() - n;
            combined.split_off(start)
        } else {
            combined
        }
    }
}

/// Everything the orchestration core needs from a container runtime. See
/// module docs for why this is boxed-future rather than `async fn`.
pub trait ContainerRuntime: Send + Sync {
    /// Never pulls; `None` means not present locally.
    fn inspect<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, Option<BuilderImageMetadata>>;

    fn is_available_locally<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, bool>;

    /// Always attempts a network pull.
    fn pull<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, BuilderImageMetadata>;

    /// Combines `inspect`/`pull` per `policy`.
    fn ensure<'a>(
        &'a self,
        image: &'a ImageRef,
        policy: PullPolicy,
    ) -> BoxFut<'a, BuilderImageMetadata> {
        Box::pin(async move {
            match policy {
                PullPolicy::Always => self.pull(image).await,
                PullPolicy::Never => self.inspect(image).await?.ok_or_else(|| {
                    stacked_errors::Error::from_err(crate::error::ErrorKind::ImageNotFound {
                        image: image.to_string(),
                    })
                }),
                PullPolicy::IfNotPresent => {
                    if let Some(meta) = self.inspect(image).await? {
                        Ok(meta)
                    } else {
                        self.pull(image).await
                    }
                }
            }
        })
    }

    fn create_container<'a>(&'a self, spec: &'a ContainerSpec) -> BoxFut<'a, ContainerId>;

    /// Blocks until process termination; streams must already be attached
    /// before the process is started to avoid losing output. Stdout and
    /// stderr are kept separate: stdout alone is what save-artifacts' tar
    /// stream is read from, and interleaving stderr into it would corrupt
    /// the archive.
    fn start_and_wait<'a>(&'a self, id: &'a ContainerId) -> BoxFut<'a, (ExitStatus, ContainerOutput)>;

    /// Idempotent; failures are logged by the caller but never propagated
    /// when already on an error path.
    fn remove<'a>(&'a self, id: &'a ContainerId) -> BoxFut<'a, ()>;

    /// Removes an image by reference. Idempotent and best-effort, same as
    /// `remove`: callers are expected to log and swallow failures rather than
    /// fail an otherwise-successful build over cleanup.
    fn remove_image<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, ()>;

    fn upload<'a>(
        &'a self,
        id: &'a ContainerId,
        dest_path: &'a str,
        tar_stream: Vec<u8>,
    ) -> BoxFut<'a, ()>;

    fn download<'a>(&'a self, id: &'a ContainerId, src_path: &'a str) -> BoxFut<'a, Vec<u8>>;

    fn commit<'a>(
        &'a self,
        id: &'a ContainerId,
        tag: &'a ImageRef,
        config: &'a CommitConfig,
    ) -> BoxFut<'a, String>;
}
