//! Produces a Dockerfile plus a build context directory instead of driving a
//! container through the full assemble lifecycle. No container is ever
//! started, and [crate::incremental]'s artifact-extraction step (which would
//! need one to run `save-artifacts`) is never invoked here; `Incremental=true`
//! is simply a no-op in this strategy.

use std::{collections::HashMap, path::PathBuf, time::Instant};

use stacked_errors::{Result, StackableErr};
use tokio::fs;

use crate::{
    orchestrator::{BuildCtx, BuildStage},
    runtime::{BoxFut, BuilderImageMetadata},
    scripts::{self, InstallResult, ResolveCtx},
    source,
    strategy::Strategy,
};

pub struct DockerfileStrategy;

impl Strategy for DockerfileStrategy {
    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildCtx<'_>,
        metadata: &'a BuilderImageMetadata,
    ) -> BoxFut<'a, Option<String>> {
        Box::pin(run(ctx, metadata))
    }
}

fn script_container_path(destination: &std::path::Path, install: &InstallResult) -> String {
    if install.downloaded {
        format!("{}/scripts/{}", destination.display(), install.script)
    } else {
        install.url.clone()
    }
}

async fn run(ctx: &mut BuildCtx<'_>, metadata: &BuilderImageMetadata) -> Result<Option<String>> {
    let config = ctx.config;
    let as_dockerfile = config
        .as_dockerfile
        .clone()
        .expect("select path guarantees AsDockerfile is set");
    let context_dir = as_dockerfile
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("context");
    fs::create_dir_all(&context_dir)
        .await
        .stack_err_with(|| format!("dockerfile: creating context dir {context_dir:?}"))?;

    let resolve_started = Instant::now();
    let resolve_ctx = ResolveCtx {
        scripts_url: config.scripts_url.as_deref(),
        source_root: &config.source,
        image_metadata: metadata,
    };
    let mut contents_by_script = HashMap::new();
    let context_scripts_dir = context_dir.join("scripts");
    fs::create_dir_all(&context_scripts_dir).await.stack_err("dockerfile: creating context/scripts")?;
    let install_results = scripts::resolve_all(&resolve_ctx, &context_scripts_dir, &mut contents_by_script).await;
    let install_results = match install_results {
        Ok(r) => r,
        Err(e) => {
            ctx.record_failed(BuildStage::ResolveScripts, resolve_started, e.to_string());
            return Err(e).stack_err("dockerfile: ResolveScripts");
        }
    };
    ctx.record_ok(BuildStage::ResolveScripts, resolve_started);

    let prepare_started = Instant::now();
    let context_src_dir = context_dir.join("src");
    source::materialize_source(&config.source, &context_src_dir, &config.ignore_patterns)
        .await
        .stack_err("dockerfile: PrepareSource")?;
    let source_env = source::parse_source_environment(&config.source).await?;
    let environment = source::merge_environment(source_env, &config.environment);
    ctx.record_ok(BuildStage::PrepareSource, prepare_started);

    // AsDockerfile builds never create or start a container, so the
    // incremental controller -- which always spins up an ephemeral container
    // to run save-artifacts -- is never invoked here, unlike DockerBuild.
    ctx.record_skipped(
        BuildStage::ExtractPriorArtifacts,
        "AsDockerfile mode never creates a container",
    );

    let assemble = install_results
        .iter()
        .find(|r| r.script.as_str() == "assemble")
        .map(|r| script_container_path(&config.destination, r));
    let run_script = install_results
        .iter()
        .find(|r| r.script.as_str() == "run")
        .map(|r| script_container_path(&config.destination, r));

    let dockerfile = render_dockerfile(config, metadata, &environment, assemble.as_deref(), run_script.as_deref());
    fs::write(&as_dockerfile, dockerfile.as_bytes())
        .await
        .stack_err_with(|| format!("dockerfile: writing {as_dockerfile:?}"))?;

    ctx.record_skipped(BuildStage::CreateContainer, "Dockerfile strategy never starts a container");
    ctx.record_ok(BuildStage::Done, Instant::now());
    Ok(None)
}

fn render_dockerfile(
    config: &crate::config::BuildConfig,
    metadata: &BuilderImageMetadata,
    environment: &[(String, String)],
    assemble: Option<&str>,
    run_script: Option<&str>,
) -> String {
    let destination = config.destination.display();
    let mut out = String::new();
    out.push_str(&format!("FROM {}\n", config.builder_image));

    let non_root = !metadata.user.is_empty();
    if non_root {
        out.push_str("USER root\n");
    }
    out.push_str(&format!("COPY scripts {destination}/scripts\n"));
    out.push_str(&format!("COPY src {destination}/src\n"));
    if non_root {
        out.push_str(&format!("RUN chown -R {0} {destination}\n", metadata.user));
        out.push_str(&format!("USER {}\n", metadata.user));
    }
    for (key, value) in environment {
        out.push_str(&format!("ENV {key}={value}\n"));
    }
    for (key, value) in &config.labels {
        out.push_str(&format!("LABEL {key}=\"{value}\"\n"));
    }
    out.push_str(&format!(
        "LABEL io.openshift.s2i.build.source-location=\"{}\"\n",
        config.source.display()
    ));
    out.push_str(&format!(
        "LABEL io.openshift.s2i.build.image=\"{}\"\n",
        config.builder_image
    ));
    if let Some(assemble) = assemble {
        out.push_str(&format!("RUN {assemble}\n"));
    }
    if let Some(run_script) = run_script {
        out.push_str(&format!("CMD [\"{run_script}\"]\n"));
    }
    out
}
