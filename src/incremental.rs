//! Incremental build controller: extracts the previous image's
//! `save-artifacts` output into `workspace/artifacts` so the next build's
//! assemble step can reuse cached state.

use stacked_errors::{Error, Result, StackableErr};

use crate::{
    config::{BuildConfig, PullPolicy},
    error::ErrorKind,
    orchestrator::{BuildCtx, BuildStage},
    runtime::ContainerSpec,
    scripts::{resolve_script, ResolveCtx, ScriptName},
    tar_io,
};

/// What happened when the controller was asked to extract prior artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncrementalOutcome {
    Extracted,
    Skipped(&'static str),
}

/// Runs the 7-step algorithm from the strategy's `ExtractPriorArtifacts`
/// state. Never starts a build container itself; the artifact-source
/// container it creates is tracked on `ctx` and removed before returning,
/// regardless of outcome.
#[tracing::instrument(skip(ctx))]
pub async fn maybe_extract_artifacts(ctx: &mut BuildCtx<'_>) -> Result<IncrementalOutcome> {
    let config: &BuildConfig = ctx.config;

    if !config.incremental {
        return Ok(IncrementalOutcome::Skipped("Incremental=false"));
    }

    let Some(previous_tag) = config.previous_image_tag_or_default() else {
        return Ok(IncrementalOutcome::Skipped("no PreviousImageTag configured"));
    };

    // step 1/2: resolve the previous image per its pull policy
    let prior_metadata = match config.previous_image_pull_policy {
        PullPolicy::Never => match ctx.runtime.inspect(previous_tag).await? {
            Some(metadata) => metadata,
            None => return Ok(IncrementalOutcome::Skipped("prior image absent, policy=Never")),
        },
        policy => match ctx.runtime.ensure(previous_tag, policy).await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(error = %e, "failed to ensure prior image, degrading to non-incremental");
                return Ok(IncrementalOutcome::Skipped("prior image pull failed"));
            }
        },
    };

    // step 3: does the prior image expose save-artifacts?
    let resolve_ctx = ResolveCtx {
        scripts_url: config.scripts_url.as_deref(),
        source_root: &config.source,
        image_metadata: &prior_metadata,
    };
    let (install, contents) = resolve_script(&resolve_ctx, ScriptName::SaveArtifacts).await;
    if !install.installed {
        tracing::warn!(failed_sources = ?install.failed_sources, "prior image has no save-artifacts, degrading to non-incremental");
        return Ok(IncrementalOutcome::Skipped("prior image lacks save-artifacts"));
    }

    // step 4: run save-artifacts in an ephemeral container from the prior image
    let command_path = if contents.is_some() {
        format!("{}/scripts/save-artifacts", config.destination.display())
    } else {
        install.url.clone()
    };
    let spec = ContainerSpec {
        image: previous_tag.clone(),
        command: vec![command_path],
        ..Default::default()
    };
    let container_id = ctx
        .runtime
        .create_container(&spec)
        .await
        .stack_err("incremental::maybe_extract_artifacts: creating artifact-source container")?;
    ctx.track_container(container_id.clone());

    if let Some(bytes) = &contents {
        let dest = format!("{}/scripts", config.destination.display());
        ctx.runtime
            .upload(&container_id, &dest, bytes.clone())
            .await
            .stack_err("incremental::maybe_extract_artifacts: uploading save-artifacts script")?;
    }

    let run_result = ctx.runtime.start_and_wait(&container_id).await;

    // step 6: the artifact-source container is always removed here, win or lose
    ctx.remove_now(&container_id).await;

    let (status, output) = run_result
        .stack_err("incremental::maybe_extract_artifacts: running save-artifacts")?;
    if !status.success() {
        return Err(Error::from_err(ErrorKind::ArtifactExtractionFailed))
            .stack_err("incremental::maybe_extract_artifacts: save-artifacts exited non-zero");
    }

    // step 5: an empty or malformed tar stream fails the build outright. Only
    // stdout is a candidate tar stream; stderr chatter never belongs in it.
    if output.stdout.is_empty() {
        return Err(Error::from_err(ErrorKind::ArtifactExtractionFailed))
            .stack_err("incremental::maybe_extract_artifacts: save-artifacts produced no output");
    }
    tar_io::extract_tar(&output.stdout, &ctx.workspace.artifacts())
        .stack_err("incremental::maybe_extract_artifacts: unpacking artifacts tar")?;

    ctx.record_ok(BuildStage::ExtractPriorArtifacts, std::time::Instant::now());
    Ok(IncrementalOutcome::Extracted)
}
