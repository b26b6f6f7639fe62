//! The top-level `Build(ctx, config) -> BuildResult` state machine. Owns the
//! [Workspace] and every container id created during a build, and guarantees
//! both are cleaned up on every exit path — success, build failure, or
//! cancellation — the same "defer cleanup, never leak" discipline the
//! teacher's own network/container managers apply to resources they create.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use stacked_errors::{Error, Result, StackableErr};
use tokio::sync::watch;

use crate::{
    config::BuildConfig,
    error::ErrorKind,
    runtime::{ContainerId, ContainerRuntime},
    strategy,
    workspace::Workspace,
};

/// One state of the `DockerBuild` lifecycle (or the coarser Dockerfile/OnBuild
/// equivalents). Strategies push one [StageRecord] per transition so
/// [BuildResult::stages] gives an ordered trace of what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStage {
    Init,
    EnsureBuilder,
    ResolveScripts,
    PrepareSource,
    ExtractPriorArtifacts,
    CreateContainer,
    UploadInputs,
    StartContainer,
    AwaitCompletion,
    Commit,
    RemovePrior,
    Cleanup,
    Done,
}

impl BuildStage {
    pub fn name(&self) -> &'static str {
        match self {
            BuildStage::Init => "Init",
            BuildStage::EnsureBuilder => "EnsureBuilder",
            BuildStage::ResolveScripts => "ResolveScripts",
            BuildStage::PrepareSource => "PrepareSource",
            BuildStage::ExtractPriorArtifacts => "ExtractPriorArtifacts",
            BuildStage::CreateContainer => "CreateContainer",
            BuildStage::UploadInputs => "UploadInputs",
            BuildStage::StartContainer => "StartContainer",
            BuildStage::AwaitCompletion => "AwaitCompletion",
            BuildStage::Commit => "Commit",
            BuildStage::RemovePrior => "RemovePrior",
            BuildStage::Cleanup => "Cleanup",
            BuildStage::Done => "Done",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageOutcome {
    Ok,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    #[serde(skip, default)]
    pub started_at: Option<Instant>,
    pub outcome: StageOutcome,
}

/// `Success`, the committed `ImageID` (unset for a usage dry-run or
/// `AsDockerfile` build), the workspace path (only meaningful when
/// `PreserveWorkingDir` was set, otherwise it has already been removed by the
/// time the caller sees this value), and the full stage trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    pub working_dir: Option<std::path::PathBuf>,
    pub image_id: Option<String>,
    pub stages: Vec<StageRecord>,
}

/// A container id the orchestrator is responsible for removing, tagged with
/// whether that has already happened. Kept as a flat `Vec` on [BuildCtx]
/// rather than a global registry, mirroring the "tagged union + defer-style
/// cleanup list, never a global map" note this crate follows throughout.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: ContainerId,
    pub removed: bool,
}

/// Mutable state threaded through a single build's strategy run. Strategies
/// read `config`/`runtime`/`cancel` and push to `stages`/`containers` as they
/// progress; the orchestrator alone decides what happens to `containers` and
/// `workspace` once the strategy returns.
pub struct BuildCtx<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub config: &'a BuildConfig,
    pub workspace: &'a Workspace,
    pub cancel: watch::Receiver<bool>,
    pub stages: Vec<StageRecord>,
    pub containers: Vec<ContainerHandle>,
}

impl<'a> BuildCtx<'a> {
    fn new(
        runtime: &'a dyn ContainerRuntime,
        config: &'a BuildConfig,
        workspace: &'a Workspace,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            runtime,
            config,
            workspace,
            cancel,
            stages: Vec::new(),
            containers: Vec::new(),
        }
    }

    /// `true` once the cancellation signal has fired; checked at every
    /// suspension point a strategy awaits on (container wait, upload,
    /// network calls), per the concurrency model's cancellation semantics.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn record_ok(&mut self, stage: BuildStage, started_at: Instant) {
        self.stages.push(StageRecord {
            name: stage.name().to_owned(),
            started_at: Some(started_at),
            outcome: StageOutcome::Ok,
        });
    }

    pub fn record_skipped(&mut self, stage: BuildStage, reason: impl Into<String>) {
        self.stages.push(StageRecord {
            name: stage.name().to_owned(),
            started_at: None,
            outcome: StageOutcome::Skipped(reason.into()),
        });
    }

    pub fn record_failed(&mut self, stage: BuildStage, started_at: Instant, reason: impl Into<String>) {
        self.stages.push(StageRecord {
            name: stage.name().to_owned(),
            started_at: Some(started_at),
            outcome: StageOutcome::Failed(reason.into()),
        });
    }

    /// Registers a container id as the orchestrator's responsibility to
    /// remove. Every id that flows through this method is guaranteed a
    /// matching `Remove` call (or, under `PreserveWorkingDir`, a logged
    /// retention) before [build] returns.
    pub fn track_container(&mut self, id: ContainerId) {
        self.containers.push(ContainerHandle { id, removed: false });
    }

    /// Removes `id` immediately and marks its handle as removed, used by the
    /// incremental controller to drop the artifact-source container
    /// unconditionally rather than waiting for final cleanup.
    #[tracing::instrument(skip(self), fields(container = %id.0))]
    pub async fn remove_now(&mut self, id: &ContainerId) {
        if let Err(e) = self.runtime.remove(id).await {
            tracing::warn!(error = %e, "failed to remove container, leaking is possible");
        }
        if let Some(handle) = self.containers.iter_mut().find(|h| &h.id == id) {
            handle.removed = true;
        }
    }
}

/// Runs one build to completion. `cancel` is a watch channel the caller
/// flips to `true` on SIGINT/SIGTERM (see `src/bin/s2i.rs` for the `ctrlc`
/// wiring); this function never installs its own signal handler.
#[tracing::instrument(skip(config, runtime, cancel), fields(builder_image = %config.builder_image, tag = ?config.tag))]
pub async fn build(
    config: &BuildConfig,
    runtime: &dyn ContainerRuntime,
    cancel: watch::Receiver<bool>,
) -> Result<BuildResult> {
    config.validate().stack_err("orchestrator::build")?;

    let init_started = Instant::now();
    let workspace = Workspace::create(None)
        .await
        .stack_err("orchestrator::build: creating workspace")?;

    let mut ctx = BuildCtx::new(runtime, config, &workspace, cancel);
    ctx.record_ok(BuildStage::Init, init_started);

    let run_result = strategy::run_build(&mut ctx).await;

    let cancelled = ctx.is_cancelled();
    let cleanup_started = Instant::now();
    cleanup(&mut ctx).await;
    ctx.record_ok(BuildStage::Cleanup, cleanup_started);

    let preserve = config.preserve_working_dir;
    let working_dir = if preserve {
        tracing::info!(workspace = %workspace.root().display(), "PreserveWorkingDir set, leaving workspace on disk");
        Some(workspace.root().to_owned())
    } else if let Err(e) = workspace.remove().await {
        tracing::warn!(error = %e, "failed to remove workspace");
        None
    } else {
        None
    };

    if cancelled {
        return Err(Error::from_err(ErrorKind::Cancelled)).stack_err("orchestrator::build");
    }

    match run_result {
        Ok(image_id) => {
            ctx.record_ok(BuildStage::Done, Instant::now());
            Ok(BuildResult {
                success: true,
                working_dir,
                image_id,
                stages: ctx.stages,
            })
        }
        Err(e) => {
            tracing::error!(error = %e, "build failed");
            Err(e).stack_err("orchestrator::build")
        }
    }
}

/// Removes every tracked container not already removed, unless
/// `PreserveWorkingDir` is set (in which case ids are logged, not removed).
/// Called exactly once per build, on every exit path.
async fn cleanup(ctx: &mut BuildCtx<'_>) {
    if ctx.config.preserve_working_dir {
        for handle in &ctx.containers {
            if !handle.removed {
                tracing::info!(container = %handle.id.0, "PreserveWorkingDir set, leaving container");
            }
        }
        return;
    }
    let pending: Vec<ContainerId> = ctx
        .containers
        .iter()
        .filter(|h| !h.removed)
        .map(|h| h.id.clone())
        .collect();
    for id in pending {
        ctx.remove_now(&id).await;
    }
}
