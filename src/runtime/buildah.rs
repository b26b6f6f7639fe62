//! The `buildah` CLI backed [ContainerRuntime], wrapping subprocess calls: a
//! [crate::Command] built up with `.arg()`/`.args()`, run to completion, and
//! the exit status checked explicitly rather than relying on a client library.

use std::{collections::HashMap, sync::Mutex};

use serde::Deserialize;
use stacked_errors::{Error, Result, StackableErr};

use crate::{
    config::ImageRef,
    error::ErrorKind,
    runtime::{
        BoxFut, BuilderImageMetadata, CommitConfig, ContainerId, ContainerOutput, ContainerRuntime,
        ContainerSpec, ExitStatus,
    },
    Command,
};

/// Subset of `buildah inspect --type image <img>` we care about, mirroring
/// the docker backend's `ImageInspect` -> `BuilderImageMetadata` mapping.
#[derive(Debug, Deserialize)]
struct BuildahImageInspect {
    #[serde(rename = "FromImageID")]
    id: Option<String>,
    #[serde(rename = "Docker")]
    docker: BuildahDockerSection,
}

#[derive(Debug, Deserialize)]
struct BuildahDockerSection {
    config: BuildahConfigSection,
}

#[derive(Debug, Default, Deserialize)]
struct BuildahConfigSection {
    #[serde(default, rename = "User")]
    user: String,
    #[serde(default, rename = "Env")]
    env: Vec<String>,
    #[serde(default, rename = "Entrypoint")]
    entrypoint: Vec<String>,
    #[serde(default, rename = "Cmd")]
    cmd: Vec<String>,
    #[serde(default, rename = "WorkingDir")]
    working_dir: String,
    #[serde(default, rename = "OnBuild")]
    on_build: Vec<String>,
    #[serde(default, rename = "Labels")]
    labels: HashMap<String, String>,
}

/// `buildah from` gives us a container name but has no notion of "the
/// command this container runs" the way `docker create`'s `Cmd` does;
/// `start_and_wait` needs that command back, so it is stashed here at
/// `create_container` time, keyed by the same name.
pub struct BuildahRuntime {
    commands: Mutex<HashMap<String, Vec<String>>>,
}

impl BuildahRuntime {
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for BuildahRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn metadata_from_inspect(inspect: BuildahImageInspect) -> BuilderImageMetadata {
    let config = inspect.docker.config;
    BuilderImageMetadata {
        id: inspect.id.unwrap_or_default(),
        user: config.user,
        env: config.env,
        entrypoint: config.entrypoint,
        cmd: config.cmd,
        working_dir: config.working_dir,
        on_build: config.on_build,
        labels: config.labels,
    }
}

impl ContainerRuntime for BuildahRuntime {
    fn inspect<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, Option<BuilderImageMetadata>> {
        Box::pin(async move {
            let res = Command::new("buildah inspect")
                .arg("--type")
                .arg("image")
                .arg(image.as_str())
                .run_to_completion()
                .await
                .stack_err_with(|| format!("BuildahRuntime::inspect({image})"))?;
            if !res.successful() {
                return Ok(None);
            }
            let parsed: BuildahImageInspect = serde_json::from_slice(&res.stdout)
                .map_err(Error::from_err)
                .stack_err_with(|| format!("BuildahRuntime::inspect({image}) parsing JSON"))?;
            Ok(Some(metadata_from_inspect(parsed)))
        })
    }

    fn is_available_locally<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, bool> {
        Box::pin(async move { Ok(self.inspect(image).await?.is_some()) })
    }

    fn pull<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, BuilderImageMetadata> {
        Box::pin(async move {
            let res = Command::new("buildah pull")
                .arg(image.as_str())
                .run_to_completion()
                .await
                .stack_err_with(|| format!("BuildahRuntime::pull({image})"))?;
            if !res.successful() {
                return Err(Error::from_err(ErrorKind::PullFailed {
                    image: image.to_string(),
                }))
                .stack_err_with(|| {
                    format!("BuildahRuntime::pull({image}): {}", res.stderr_as_utf8_lossy())
                });
            }
            self.inspect(image).await?.ok_or_else(|| {
                Error::from_err(ErrorKind::PullFailed {
                    image: image.to_string(),
                })
            })
        })
    }

    fn create_container<'a>(&'a self, spec: &'a ContainerSpec) -> BoxFut<'a, ContainerId> {
        Box::pin(async move {
            let name = crate::random_name("s2i-build");
            let mut cmd = Command::new("buildah from")
                .arg("--name")
                .arg(&name)
                .arg("--pull=never");

            if let Some(user) = &spec.user {
                cmd = cmd.arg("--user").arg(user);
            }
            for (k, v) in &spec.env {
                cmd = cmd.arg("--env").arg(format!("{k}={v}"));
            }
            for (host, container) in &spec.volumes {
                cmd = cmd.arg("-v").arg(format!("{host}:{container}"));
            }
            for opt in &spec.security_opts {
                cmd = cmd.arg("--security-opt").arg(opt);
            }
            for cap in &spec.cap_drop {
                cmd = cmd.arg("--cap-drop").arg(cap);
            }
            if spec.privileged {
                cmd = cmd.arg("--privileged");
            }
            if let Some(memory) = spec.cgroup_limits.memory_bytes {
                cmd = cmd.arg("--memory").arg(memory.to_string());
            }
            if let Some(mode) = &spec.network_mode {
                cmd = cmd.arg("--network").arg(mode);
            }
            cmd = cmd.arg(spec.image.as_str());

            let res = cmd
                .run_to_completion()
                .await
                .stack_err("BuildahRuntime::create_container")?;
            res.assert_success()
                .stack_err("BuildahRuntime::create_container")?;
            self.commands
                .lock()
                .unwrap()
                .insert(name.clone(), spec.command.clone());
            Ok(ContainerId(name))
        })
    }

    fn start_and_wait<'a>(
        &'a self,
        id: &'a ContainerId,
    ) -> BoxFut<'a, (ExitStatus, ContainerOutput)> {
        Box::pin(async move {
            let command = self
                .commands
                .lock()
                .unwrap()
                .get(&id.0)
                .cloned()
                .ok_or_else(|| Error::from_err(ErrorKind::ContainerStartFailed))
                .stack_err_with(|| {
                    format!("BuildahRuntime::start_and_wait({}): no command recorded", id.0)
                })?;

            let mut cmd = Command::new("buildah run").arg(&id.0).arg("--");
            for part in &command {
                cmd = cmd.arg(part);
            }

            let res = cmd
                .run_to_completion()
                .await
                .stack_err_with(|| format!("BuildahRuntime::start_and_wait({})", id.0))?;

            let code = res
                .status
                .as_ref()
                .and_then(std::process::ExitStatus::code)
                .unwrap_or(-1) as i64;

            Ok((
                ExitStatus { code },
                ContainerOutput {
                    stdout: res.stdout,
                    stderr: res.stderr,
                },
            ))
        })
    }

    fn remove<'a>(&'a self, id: &'a ContainerId) -> BoxFut<'a, ()> {
        Box::pin(async move {
            if let Ok(res) = Command::new("buildah rm").arg(&id.0).run_to_completion().await {
                if !res.successful() {
                    tracing::warn!(
                        "BuildahRuntime::remove({}) failed, ignoring: {}",
                        id.0,
                        res.stderr_as_utf8_lossy()
                    );
                }
            }
            self.commands.lock().unwrap().remove(&id.0);
            Ok(())
        })
    }

    fn remove_image<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, ()> {
        Box::pin(async move {
            if let Ok(res) = Command::new("buildah rmi").arg(image.as_str()).run_to_completion().await {
                if !res.successful() {
                    tracing::warn!(
                        "BuildahRuntime::remove_image({image}) failed, ignoring: {}",
                        res.stderr_as_utf8_lossy()
                    );
                }
            }
            Ok(())
        })
    }

    fn upload<'a>(
        &'a self,
        id: &'a ContainerId,
        dest_path: &'a str,
        tar_stream: Vec<u8>,
    ) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let mount = Command::new("buildah mount")
                .arg(&id.0)
                .run_to_completion()
                .await
                .stack_err_with(|| format!("BuildahRuntime::upload({}) mount", id.0))?;
            mount
                .assert_success()
                .stack_err_with(|| format!("BuildahRuntime::upload({}) mount", id.0))?;
            let mount_point = mount.stdout_as_utf8_lossy().trim().to_owned();
            let dest = format!("{mount_point}{dest_path}");

            let extract_result = async {
                tokio::fs::create_dir_all(&dest)
                    .await
                    .stack_err_with(|| format!("BuildahRuntime::upload creating {dest}"))?;
                let mut archive = tar::Archive::new(std::io::Cursor::new(tar_stream));
                archive
                    .unpack(&dest)
                    .stack_err_with(|| format!("BuildahRuntime::upload unpacking into {dest}"))
            }
            .await;

            let _ = Command::new("buildah umount")
                .arg(&id.0)
                .run_to_completion()
                .await;

            extract_result
        })
    }

    fn download<'a>(&'a self, id: &'a ContainerId, src_path: &'a str) -> BoxFut<'a, Vec<u8>> {
        Box::pin(async move {
            let mount = Command::new("buildah mount")
                .arg(&id.0)
                .run_to_completion()
                .await
                .stack_err_with(|| format!("BuildahRuntime::download({}) mount", id.0))?;
            mount
                .assert_success()
                .stack_err_with(|| format!("BuildahRuntime::download({}) mount", id.0))?;
            let mount_point = mount.stdout_as_utf8_lossy().trim().to_owned();
            let source = format!("{mount_point}{src_path}");

            let archive_result = async {
                let mut buf = Vec::new();
                {
                    let mut builder = tar::Builder::new(&mut buf);
                    builder
                        .append_dir_all(".", &source)
                        .stack_err_with(|| format!("BuildahRuntime::download archiving {source}"))?;
                    builder
                        .finish()
                        .stack_err_with(|| format!("BuildahRuntime::download archiving {source}"))?;
                }
                Ok(buf)
            }
            .await;

            let _ = Command::new("buildah umount")
                .arg(&id.0)
                .run_to_completion()
                .await;

            archive_result
        })
    }

    fn commit<'a>(
        &'a self,
        id: &'a ContainerId,
        tag: &'a ImageRef,
        config: &'a CommitConfig,
    ) -> BoxFut<'a, String> {
        Box::pin(async move {
            for (k, v) in &config.env {
                Command::new("buildah config")
                    .arg("--env")
                    .arg(format!("{k}={v}"))
                    .arg(&id.0)
                    .run_to_completion()
                    .await
                    .stack_err_with(|| format!("BuildahRuntime::commit({}) config --env", id.0))?
                    .assert_success()
                    .stack_err_with(|| format!("BuildahRuntime::commit({}) config --env", id.0))?;
            }
            for (k, v) in &config.labels {
                Command::new("buildah config")
                    .arg("--label")
                    .arg(format!("{k}={v}"))
                    .arg(&id.0)
                    .run_to_completion()
                    .await
                    .stack_err_with(|| format!("BuildahRuntime::commit({}) config --label", id.0))?
                    .assert_success()
                    .stack_err_with(|| format!("BuildahRuntime::commit({}) config --label", id.0))?;
            }
            if !config.entrypoint.is_empty() {
                let json = serde_json::to_string(&config.entrypoint)
                    .map_err(Error::from_err)
                    .stack_err("BuildahRuntime::commit serializing entrypoint")?;
                Command::new("buildah config")
                    .arg("--entrypoint")
                    .arg(json)
                    .arg(&id.0)
                    .run_to_completion()
                    .await
                    .stack_err_with(|| format!("BuildahRuntime::commit({}) config --entrypoint", id.0))?
                    .assert_success()
                    .stack_err_with(|| {
                        format!("BuildahRuntime::commit({}) config --entrypoint", id.0)
                    })?;
            }
            if !config.cmd.is_empty() {
                Command::new("buildah config")
                    .arg("--cmd")
                    .arg(config.cmd.join(" "))
                    .arg(&id.0)
                    .run_to_completion()
                    .await
                    .stack_err_with(|| format!("BuildahRuntime::commit({}) config --cmd", id.0))?
                    .assert_success()
                    .stack_err_with(|| format!("BuildahRuntime::commit({}) config --cmd", id.0))?;
            }
            if !config.user.is_empty() {
                Command::new("buildah config")
                    .arg("--user")
                    .arg(&config.user)
                    .arg(&id.0)
                    .run_to_completion()
                    .await
                    .stack_err_with(|| format!("BuildahRuntime::commit({}) config --user", id.0))?
                    .assert_success()
                    .stack_err_with(|| format!("BuildahRuntime::commit({}) config --user", id.0))?;
            }
            if !config.working_dir.is_empty() {
                Command::new("buildah config")
                    .arg("--workingdir")
                    .arg(&config.working_dir)
                    .arg(&id.0)
                    .run_to_completion()
                    .await
                    .stack_err_with(|| format!("BuildahRuntime::commit({}) config --workingdir", id.0))?
                    .assert_success()
                    .stack_err_with(|| {
                        format!("BuildahRuntime::commit({}) config --workingdir", id.0)
                    })?;
            }

            let res = Command::new("buildah commit")
                .arg("--squash")
                .arg(&id.0)
                .arg(tag.as_str())
                .run_to_completion()
                .await
                .stack_err_with(|| format!("BuildahRuntime::commit({}, {tag})", id.0))?;
            res.assert_success()
                .stack_err_with(|| format!("BuildahRuntime::commit({}, {tag})", id.0))?;
            Ok(res.stdout_as_utf8_lossy().trim().to_owned())
        })
    }
}
