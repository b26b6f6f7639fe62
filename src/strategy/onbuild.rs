//! Builder images that use `ONBUILD` triggers instead of a custom assemble.
//! Emits the same shape of Dockerfile as [crate::strategy::dockerfile] but
//! never `RUN`s an assemble script — the image's own `ONBUILD` instructions
//! fire when the emitted file is later built. Discovering anything beyond a
//! `run` script is a hard error: an `OnBuild` image is not supposed to ship
//! (or have one supplied for) `assemble`/`save-artifacts`/`usage`.

use std::{collections::HashMap, path::PathBuf, time::Instant};

use stacked_errors::{Error, Result, StackableErr};
use tokio::fs;

use crate::{
    error::ErrorKind,
    orchestrator::{BuildCtx, BuildStage},
    runtime::{BoxFut, BuilderImageMetadata},
    scripts::{self, ResolveCtx, ScriptName},
    source,
    strategy::Strategy,
};

pub struct OnBuildStrategy;

impl Strategy for OnBuildStrategy {
    fn run<'a>(
        &'a self,
        ctx: &'a mut BuildCtx<'_>,
        metadata: &'a BuilderImageMetadata,
    ) -> BoxFut<'a, Option<String>> {
        Box::pin(run(ctx, metadata))
    }
}

async fn run(ctx: &mut BuildCtx<'_>, metadata: &BuilderImageMetadata) -> Result<Option<String>> {
    let config = ctx.config;
    // Unlike the Dockerfile strategy, this one is also reached when the
    // builder image simply has a non-empty `OnBuild` list and the caller
    // never asked for `AsDockerfile` output. In that case there is nowhere
    // else to put the generated file, so it lands in the build workspace.
    let as_dockerfile = config
        .as_dockerfile
        .clone()
        .unwrap_or_else(|| ctx.workspace.root().join("Dockerfile"));
    let context_dir = as_dockerfile
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("context");
    let context_scripts_dir = context_dir.join("scripts");
    fs::create_dir_all(&context_scripts_dir)
        .await
        .stack_err_with(|| format!("onbuild: creating {context_scripts_dir:?}"))?;

    let resolve_started = Instant::now();
    let resolve_ctx = ResolveCtx {
        scripts_url: config.scripts_url.as_deref(),
        source_root: &config.source,
        image_metadata: metadata,
    };

    for forbidden in [ScriptName::Assemble, ScriptName::SaveArtifacts, ScriptName::Usage] {
        let (install, _) = scripts::resolve_script(&resolve_ctx, forbidden).await;
        if install.installed {
            let err = Error::from_err(ErrorKind::OnBuildIncompatible);
            ctx.record_failed(BuildStage::ResolveScripts, resolve_started, err.to_string());
            return Err(err).stack_err_with(|| {
                format!("onbuild: {forbidden} was discovered, but OnBuild images only support `run`")
            });
        }
    }

    let mut contents_by_script = HashMap::new();
    let (run_install, run_contents) = scripts::resolve_script(&resolve_ctx, ScriptName::Run).await;
    if !run_install.installed {
        let err = Error::from_err(ErrorKind::MissingRequiredScripts {
            scripts: vec![ScriptName::Run.to_string()],
            failed_sources: run_install.failed_sources.iter().map(ToString::to_string).collect(),
        });
        ctx.record_failed(BuildStage::ResolveScripts, resolve_started, err.to_string());
        return Err(err).stack_err("onbuild: ResolveScripts");
    }
    if let Some(contents) = run_contents {
        let dest = context_scripts_dir.join("run");
        fs::write(&dest, &contents)
            .await
            .stack_err_with(|| format!("onbuild: writing {dest:?}"))?;
        scripts::set_executable(&dest).await?;
        contents_by_script.insert(ScriptName::Run, contents);
    }
    ctx.record_ok(BuildStage::ResolveScripts, resolve_started);

    let prepare_started = Instant::now();
    let context_src_dir = context_dir.join("src");
    source::materialize_source(&config.source, &context_src_dir, &config.ignore_patterns)
        .await
        .stack_err("onbuild: PrepareSource")?;
    let source_env = source::parse_source_environment(&config.source).await?;
    let environment = source::merge_environment(source_env, &config.environment);
    ctx.record_ok(BuildStage::PrepareSource, prepare_started);

    let destination = config.destination.display();
    let run_path = if run_install.downloaded {
        format!("{destination}/scripts/run")
    } else {
        run_install.url.clone()
    };

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
    for (key, value) in &environment {
        out.push_str(&format!("ENV {key}={value}\n"));
    }
    for (key, value) in &config.labels {
        out.push_str(&format!("LABEL {key}=\"{value}\"\n"));
    }
    out.push_str(&format!("CMD [\"{run_path}\"]\n"));

    fs::write(&as_dockerfile, out.as_bytes())
        .await
        .stack_err_with(|| format!("onbuild: writing {as_dockerfile:?}"))?;

    ctx.record_skipped(BuildStage::CreateContainer, "OnBuild strategy never starts a container");
    ctx.record_ok(BuildStage::Done, Instant::now());
    Ok(None)
}
