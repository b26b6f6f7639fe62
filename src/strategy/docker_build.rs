//! The principal strategy: runs `assemble` inside an ephemeral container and
//! commits that same container as the output image.
//!
//! States: `Init -> EnsureBuilder -> ResolveScripts -> PrepareSource ->
//! (maybe) ExtractPriorArtifacts -> CreateContainer -> UploadInputs ->
//! StartContainer -> AwaitCompletion -> Commit -> (maybe) RemovePrior ->
//! Cleanup -> Done`. `EnsureBuilder` and `Cleanup`/`Done` are recorded by
//! [crate::orchestrator::build]; this module owns everything in between.

use std::{collections::HashMap, time::Instant};

use stacked_errors::{Error, Result, StackableErr};

use crate::{
    error::ErrorKind,
    incremental::{self, IncrementalOutcome},
    orchestrator::{BuildCtx, BuildStage},
    runtime::{BoxFut, BuilderImageMetadata, CommitConfig, ContainerSpec},
    scripts::{self, ResolveCtx},
    source,
    strategy::Strategy,
    tar_io,
};

/// Bytes of stdout+stderr kept for `BuildScriptFailed` diagnosis.
const LOG_TAIL_BYTES: usize = 2048;

pub struct DockerBuildStrategy;

impl Strategy for DockerBuildStrategy {
    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildCtx<'_>,
        metadata: &'a BuilderImageMetadata,
    ) -> BoxFut<'a, Option<String>> {
        Box::pin(run(ctx, metadata))
    }
}

/// Resolves the uid a container will run as: `AssembleUser` override, else
/// the builder image's own `Config.User`. Returns `None` when neither is set
/// or the value isn't numeric, in which case the `AllowedUIDs` check is
/// skipped (there is nothing to check against).
fn resolve_uid(config: &crate::config::BuildConfig, metadata: &BuilderImageMetadata) -> Option<i64> {
    config
        .assemble_user
        .as_deref()
        .or_else(|| {
            if metadata.user.is_empty() {
                None
            } else {
                Some(metadata.user.as_str())
            }
        })
        .and_then(|s| s.parse::<i64>().ok())
}

async fn run(ctx: &mut BuildCtx<'_>, metadata: &BuilderImageMetadata) -> Result<Option<String>> {
    let config = ctx.config;

    // Allowed UIDs must be checked before any container is created.
    if !config.allowed_uids.is_empty() {
        if let Some(uid) = resolve_uid(config, metadata) {
            if !config.allowed_uids.iter().any(|r| r.contains(uid)) {
                return Err(Error::from_err(ErrorKind::DisallowedUser { uid }))
                    .stack_err("docker_build: AllowedUIDs check");
            }
        }
    }

    let resolve_started = Instant::now();
    let resolve_ctx = ResolveCtx {
        scripts_url: config.scripts_url.as_deref(),
        source_root: &config.source,
        image_metadata: metadata,
    };
    let mut contents_by_script = HashMap::new();
    if let Err(e) = scripts::resolve_all(&resolve_ctx, &ctx.workspace.upload_scripts(), &mut contents_by_script).await {
        ctx.record_failed(BuildStage::ResolveScripts, resolve_started, e.to_string());
        return Err(e).stack_err("docker_build: ResolveScripts");
    }
    ctx.record_ok(BuildStage::ResolveScripts, resolve_started);

    let prepare_started = Instant::now();
    source::materialize_source(&config.source, &ctx.workspace.upload_src(), &config.ignore_patterns)
        .await
        .stack_err("docker_build: PrepareSource")?;
    let source_env = source::parse_source_environment(&config.source).await?;
    let environment = source::merge_environment(source_env, &config.environment);
    ctx.record_ok(BuildStage::PrepareSource, prepare_started);

    match incremental::maybe_extract_artifacts(ctx).await {
        Ok(IncrementalOutcome::Skipped(reason)) => ctx.record_skipped(BuildStage::ExtractPriorArtifacts, reason),
        Ok(IncrementalOutcome::Extracted) => {}
        Err(e) => return Err(e).stack_err("docker_build: ExtractPriorArtifacts"),
    }
    let incremental_ran = ctx
        .stages
        .iter()
        .any(|s| s.name == BuildStage::ExtractPriorArtifacts.name() && matches!(s.outcome, crate::orchestrator::StageOutcome::Ok));

    let non_root_user = if metadata.user.is_empty() {
        None
    } else {
        Some(metadata.user.clone())
    };
    let dry_run = config.is_usage_dry_run();
    if non_root_user.is_some() {
        write_bootstrap_script(&*ctx, non_root_user.as_deref().unwrap(), dry_run).await?;
    }

    let create_started = Instant::now();
    let command = build_command(config, non_root_user.as_deref(), dry_run);
    let spec = ContainerSpec {
        image: config.builder_image.clone(),
        command,
        env: environment.clone(),
        working_dir: Some(config.destination.to_string_lossy().into_owned()),
        user: None, // the bootstrap script (if any) runs as root then `su`s; otherwise inherit the image's own user
        network_mode: config.docker_network_mode.clone(),
        security_opts: config.security_opts.clone(),
        cap_drop: config.cap_drop.clone(),
        cgroup_limits: config.cgroup_limits.clone(),
        volumes: HashMap::new(),
        expected_mounts: vec![config.destination.to_string_lossy().into_owned()],
        privileged: false,
    };
    let container_id = ctx.runtime.create_container(&spec).await;
    let container_id = match container_id {
        Ok(id) => id,
        Err(e) => {
            ctx.record_failed(BuildStage::CreateContainer, create_started, e.to_string());
            return Err(e).stack_err("docker_build: CreateContainer");
        }
    };
    ctx.track_container(container_id.clone());
    ctx.record_ok(BuildStage::CreateContainer, create_started);

    let upload_started = Instant::now();
    if let Err(e) = upload_inputs(&*ctx, &container_id, incremental_ran).await {
        ctx.record_failed(BuildStage::UploadInputs, upload_started, e.to_string());
        return Err(e).stack_err("docker_build: UploadInputs");
    }
    ctx.record_ok(BuildStage::UploadInputs, upload_started);

    ctx.record_ok(BuildStage::StartContainer, Instant::now());

    let await_started = Instant::now();
    if ctx.is_cancelled() {
        ctx.record_failed(BuildStage::AwaitCompletion, await_started, "cancelled before start");
        return Err(Error::from_err(ErrorKind::Cancelled)).stack_err("docker_build: AwaitCompletion");
    }
    let (status, output) = ctx
        .runtime
        .start_and_wait(&container_id)
        .await
        .stack_err("docker_build: AwaitCompletion")?;
    if !status.success() {
        let tail = String::from_utf8_lossy(&output.combined_tail(LOG_TAIL_BYTES)).into_owned();
        let err = Error::from_err(ErrorKind::BuildScriptFailed { exit_code: status.code, tail });
        ctx.record_failed(BuildStage::AwaitCompletion, await_started, "assemble script failed");
        return Err(err).stack_err("docker_build: AwaitCompletion");
    }
    ctx.record_ok(BuildStage::AwaitCompletion, await_started);

    if dry_run {
        // usage dry-run: exit code already gates success above, no commit.
        ctx.record_skipped(BuildStage::Commit, "usage dry-run, Tag is unset");
        return Ok(None);
    }

    let commit_started = Instant::now();
    let tag = config
        .tag
        .as_ref()
        .expect("BuildConfig::validate guarantees Tag is set when not a dry-run");
    let commit_config = CommitConfig {
        entrypoint: metadata.entrypoint.clone(),
        cmd: vec![format!("{}/scripts/run", config.destination.display())],
        env: environment,
        labels: build_labels(config),
        user: metadata.user.clone(),
        working_dir: metadata.working_dir.clone(),
    };
    let image_id = match ctx.runtime.commit(&container_id, tag, &commit_config).await {
        Ok(id) => id,
        Err(e) => {
            ctx.record_failed(BuildStage::Commit, commit_started, e.to_string());
            return Err(e).stack_err("docker_build: Commit");
        }
    };
    ctx.record_ok(BuildStage::Commit, commit_started);

    if config.remove_previous_image {
        let remove_started = Instant::now();
        if let Some(previous) = config.previous_image_tag_or_default() {
            if previous.as_str() != tag.as_str() {
                tracing::info!(image = %previous, "removing previous image per RemovePreviousImage");
                if let Err(e) = ctx.runtime.remove_image(previous).await {
                    tracing::warn!(error = %e, image = %previous, "failed to remove previous image, ignoring");
                }
            }
        }
        ctx.record_ok(BuildStage::RemovePrior, remove_started);
    } else {
        ctx.record_skipped(BuildStage::RemovePrior, "RemovePreviousImage not set");
    }

    Ok(Some(image_id))
}

/// The in-container command for this build: the bootstrap script when the
/// image has a non-root user, otherwise the assemble script directly.
fn build_command(config: &crate::config::BuildConfig, non_root_user: Option<&str>, dry_run: bool) -> Vec<String> {
    if non_root_user.is_some() {
        vec![format!("{}/scripts/init.sh", config.destination.display())]
    } else {
        let assemble = format!("{}/scripts/assemble", config.destination.display());
        if dry_run {
            vec![assemble, "-h".to_owned()]
        } else {
            vec![assemble]
        }
    }
}

/// Generates `init.sh`: chowns the destination tree to `user` (root still
/// owns the process at this point) then `su`s into it to run assemble. Only
/// used for non-root builder images with the Docker/Buildah exec path; the
/// Buildah back-end could instead preserve ownership on copy, but a single
/// bootstrap script keeps both runtimes identical here.
async fn write_bootstrap_script(ctx: &BuildCtx<'_>, user: &str, dry_run: bool) -> Result<()> {
    let destination = ctx.config.destination.display();
    let assemble_cmd = if dry_run {
        format!("{destination}/scripts/assemble -h")
    } else {
        format!("{destination}/scripts/assemble")
    };
    let script = format!(
        "#!/bin/sh\nset -e\nchown -R {user} \"{destination}\"\nexec su {user} -s /bin/sh -c '{assemble_cmd}'\n"
    );
    let path = ctx.workspace.upload_scripts().join("init.sh");
    tokio::fs::write(&path, script.as_bytes())
        .await
        .stack_err_with(|| format!("write_bootstrap_script: writing {path:?}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&path).await.stack_err("write_bootstrap_script: stat")?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms)
            .await
            .stack_err("write_bootstrap_script: chmod")?;
    }
    Ok(())
}

/// Tars and uploads `src`, `scripts`, and (if the incremental step ran)
/// `artifacts` into the container at `<Destination>/{src,scripts,artifacts}`.
async fn upload_inputs(ctx: &BuildCtx<'_>, container_id: &crate::runtime::ContainerId, upload_artifacts: bool) -> Result<()> {
    let destination = &ctx.config.destination;

    let src_tar = tar_io::build_tar(&ctx.workspace.upload_src(), &[])
        .stack_err("upload_inputs: tarring src")?;
    ctx.runtime
        .upload(container_id, &format!("{}/src", destination.display()), src_tar)
        .await
        .stack_err("upload_inputs: uploading src")?;

    let scripts_tar = tar_io::build_tar(&ctx.workspace.upload_scripts(), &[])
        .stack_err("upload_inputs: tarring scripts")?;
    ctx.runtime
        .upload(container_id, &format!("{}/scripts", destination.display()), scripts_tar)
        .await
        .stack_err("upload_inputs: uploading scripts")?;

    if upload_artifacts {
        let artifacts_tar = tar_io::build_tar(&ctx.workspace.artifacts(), &[])
            .stack_err("upload_inputs: tarring artifacts")?;
        ctx.runtime
            .upload(container_id, &format!("{}/artifacts", destination.display()), artifacts_tar)
            .await
            .stack_err("upload_inputs: uploading artifacts")?;
    }
    Ok(())
}

/// Build provenance + user-supplied labels applied on commit.
fn build_labels(config: &crate::config::BuildConfig) -> HashMap<String, String> {
    let mut labels = config.labels.clone();
    labels.insert(
        "io.openshift.s2i.build.source-location".to_owned(),
        config.source.display().to_string(),
    );
    labels.insert(
        "io.openshift.s2i.build.image".to_owned(),
        config.builder_image.to_string(),
    );
    if let Some(source_ref) = &config.source_ref {
        labels.insert("io.openshift.s2i.build.commit.ref".to_owned(), source_ref.clone());
    }
    labels
}
