//! The strategy engine: picks one of `{DockerBuild, Dockerfile, OnBuild}` from
//! config + builder-image metadata, and drives the strategy-specific
//! lifecycle. Each strategy owns its own slice of [crate::orchestrator::BuildStage]
//! transitions and reuses the shared workspace/runtime/resolver/source-preparer
//! plumbing rather than duplicating it.

mod docker_build;
mod dockerfile;
mod onbuild;

use stacked_errors::{Result, StackableErr};

use crate::{
    orchestrator::{BuildCtx, BuildStage},
    runtime::{BoxFut, BuilderImageMetadata},
};

pub use docker_build::DockerBuildStrategy;
pub use dockerfile::DockerfileStrategy;
pub use onbuild::OnBuildStrategy;

/// One selectable build lifecycle. `run` returns the committed image id, or
/// `None` for paths that never commit (usage dry-run, `AsDockerfile`).
pub trait Strategy: Send + Sync {
    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildCtx<'_>,
        metadata: &'a BuilderImageMetadata,
    ) -> BoxFut<'a, Option<String>>;
}

/// Fetches builder-image metadata per the fixed selection table, then runs
/// the matching strategy. `AsDockerfile` mode only ever `Inspect`s the
/// builder (never `Pull`s it, and tolerates it not being local); every other
/// path `Ensure`s it per `BuilderPullPolicy` before picking between
/// `DockerBuild` and `OnBuild`.
pub async fn run_build(ctx: &mut BuildCtx<'_>) -> Result<Option<String>> {
    if ctx.config.as_dockerfile.is_some() {
        let metadata = ctx
            .runtime
            .inspect(&ctx.config.builder_image)
            .await
            .stack_err("strategy::run_build: inspecting builder image for Dockerfile mode")?
            .unwrap_or_default();
        ctx.record_skipped(BuildStage::EnsureBuilder, "AsDockerfile mode never pulls");
        return DockerfileStrategy.run(ctx, &metadata).await;
    }

    let ensure_started = std::time::Instant::now();
    let metadata = match ctx.runtime.ensure(&ctx.config.builder_image, ctx.config.builder_pull_policy).await {
        Ok(metadata) => metadata,
        Err(e) => {
            ctx.record_failed(BuildStage::EnsureBuilder, ensure_started, e.to_string());
            return Err(e).stack_err("strategy::run_build: EnsureBuilder");
        }
    };
    ctx.record_ok(BuildStage::EnsureBuilder, ensure_started);

    if !metadata.on_build.is_empty() {
        OnBuildStrategy.run(ctx, &metadata).await
    } else {
        DockerBuildStrategy.run(ctx, &metadata).await
    }
}
