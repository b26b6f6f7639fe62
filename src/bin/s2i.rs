//! Thin CLI dispatcher over the four documented subcommands. Argument
//! validation beyond what `BuildConfig::validate` already does is
//! deliberately not this binary's job; it exists to exercise the library, not
//! to reimplement the upstream `s2i` tool's full flag surface.

use std::{process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use s2i_core::{
    config::{BuildConfig, ImageRef},
    orchestrator,
    runtime::{buildah::BuildahRuntime, fake::FakeRuntime, ContainerRuntime},
};
use tokio::sync::watch;
use tracing::error;

#[cfg(feature = "bollard")]
use s2i_core::runtime::docker::DockerRuntime;

#[derive(Parser, Debug)]
#[command(name = "s2i", about = "Source-to-Image build orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Build `<source>` with `<builder-image>`, committing as `<tag>`.
    Build {
        builder_image: String,
        source: String,
        tag: String,
        #[arg(long)]
        incremental: bool,
        #[arg(long)]
        scripts_url: Option<String>,
        #[arg(long)]
        preserve_working_dir: bool,
    },
    /// Re-run a build using `<tag>` as both the builder and the previous
    /// image, restoring artifacts saved by the prior build.
    Rebuild { tag: String, source: String },
    /// Run `assemble -h` inside `<builder-image>` without committing.
    Usage { builder_image: String, source: String },
    /// Emit a Dockerfile plus build context instead of driving a container.
    Generate {
        builder_image: String,
        source: String,
        dockerfile_path: String,
    },
}

fn select_runtime() -> Arc<dyn ContainerRuntime> {
    match std::env::var("S2I_CONTAINER_MANAGER").as_deref() {
        Ok("buildah") => Arc::new(BuildahRuntime::new()),
        Ok("fake") => Arc::new(FakeRuntime::new()),
        #[cfg(feature = "bollard")]
        _ => Arc::new(DockerRuntime::new()),
        #[cfg(not(feature = "bollard"))]
        _ => Arc::new(BuildahRuntime::new()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().init();
    let cli = Cli::parse();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let runtime = select_runtime();

    let config = match build_config(&cli.command) {
        Ok(config) => config,
        Err(message) => {
            error!(%message, "invalid arguments");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = ctrlc::set_handler(move || {
        let _ = cancel_tx.send(true);
    }) {
        error!(error = %e, "failed to install Ctrl-C handler, cancellation will not work");
    }

    match orchestrator::build(&config, runtime.as_ref(), cancel_rx).await {
        Ok(result) => {
            if let Some(image_id) = &result.image_id {
                println!("{image_id}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e:?}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Best-effort exit code mapping: the taxonomy's `InvalidConfig` and
/// `RuntimeUnreachable` kinds map to 2/3, anything else to 1. Config-shape
/// errors are caught earlier by `build_config`/`BuildConfig::validate`
/// itself, so in practice this mostly resolves to 1 or 3.
fn exit_code_for(e: &stacked_errors::Error) -> u8 {
    let text = format!("{e:?}");
    if text.contains("RuntimeUnreachable") {
        3
    } else if text.contains("InvalidConfig") {
        2
    } else {
        1
    }
}

fn build_config(cmd: &Cmd) -> Result<BuildConfig, String> {
    match cmd {
        Cmd::Build { builder_image, source, tag, incremental, scripts_url, preserve_working_dir } => {
            let mut config = BuildConfig::new(ImageRef::new(builder_image.clone()), source.clone())
                .with_tag(ImageRef::new(tag.clone()))
                .with_incremental(*incremental)
                .with_preserve_working_dir(*preserve_working_dir);
            if let Some(url) = scripts_url {
                config = config.with_scripts_url(url.clone());
            }
            Ok(config)
        }
        Cmd::Rebuild { tag, source } => Ok(BuildConfig::new(ImageRef::new(tag.clone()), source.clone())
            .with_tag(ImageRef::new(tag.clone()))
            .with_previous_image_tag(ImageRef::new(tag.clone()))
            .with_incremental(true)),
        Cmd::Usage { builder_image, source } => {
            Ok(BuildConfig::new(ImageRef::new(builder_image.clone()), source.clone()))
        }
        Cmd::Generate { builder_image, source, dockerfile_path } => {
            Ok(BuildConfig::new(ImageRef::new(builder_image.clone()), source.clone())
                .with_as_dockerfile(dockerfile_path.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_subcommand_sets_tag_and_incremental() {
        let cmd = Cmd::Build {
            builder_image: "ruby:2.5".to_owned(),
            source: "./app".to_owned(),
            tag: "myapp:latest".to_owned(),
            incremental: true,
            scripts_url: None,
            preserve_working_dir: false,
        };
        let config = build_config(&cmd).unwrap();
        assert_eq!(config.tag.as_ref().unwrap().as_str(), "myapp:latest");
        assert!(config.incremental);
        assert!(!config.is_usage_dry_run());
    }

    #[test]
    fn usage_subcommand_leaves_tag_unset() {
        let cmd = Cmd::Usage { builder_image: "ruby:2.5".to_owned(), source: "./app".to_owned() };
        let config = build_config(&cmd).unwrap();
        assert!(config.is_usage_dry_run());
    }

    #[test]
    fn generate_subcommand_sets_as_dockerfile() {
        let cmd = Cmd::Generate {
            builder_image: "ruby:2.5".to_owned(),
            source: "./app".to_owned(),
            dockerfile_path: "./out/Dockerfile".to_owned(),
        };
        let config = build_config(&cmd).unwrap();
        assert!(config.as_dockerfile.is_some());
        assert!(config.validate().is_ok());
    }
}
