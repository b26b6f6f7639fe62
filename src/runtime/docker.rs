//! The Docker HTTP-API backed [ContainerRuntime], driving `bollard` directly
//! (container create/attach/start/wait), narrowed to exactly the eleven
//! operations the orchestration core needs.

use std::collections::HashMap;

use bollard::{
    container::{
        AttachContainerOptions, Config as ContainerConfig, CreateContainerOptions,
        DownloadFromContainerOptions, LogOutput, RemoveContainerOptions,
        UploadToContainerOptions,
    },
    image::{CommitContainerOptions, CreateImageOptions, RemoveImageOptions},
    secret::HostConfig,
};
use futures::{StreamExt, TryStreamExt};
use stacked_errors::{Error, StackableErr};

use crate::{
    api_docker::docker_socket::get_or_init_default_docker_instance,
    config::ImageRef,
    error::ErrorKind,
    runtime::{
        BoxFut, BuilderImageMetadata, CommitConfig, ContainerId, ContainerOutput, ContainerRuntime,
        ContainerSpec, ExitStatus,
    },
};

pub struct DockerRuntime;

impl DockerRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn metadata_from_inspect(id: String, inspect: bollard::models::ImageInspect) -> BuilderImageMetadata {
    let config = inspect.config.unwrap_or_default();
    BuilderImageMetadata {
        id,
        user: config.user.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        entrypoint: config.entrypoint.unwrap_or_default(),
        cmd: config.cmd.unwrap_or_default(),
        working_dir: config.working_dir.unwrap_or_default(),
        on_build: config.on_build.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl ContainerRuntime for DockerRuntime {
    fn inspect<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, Option<BuilderImageMetadata>> {
        Box::pin(async move {
            let docker = get_or_init_default_docker_instance()
                .await
                .stack_err("DockerRuntime::inspect")?;
            match docker.inspect_image(image.as_str()).await {
                Ok(inspect) => Ok(Some(metadata_from_inspect(
                    inspect.id.clone().unwrap_or_default(),
                    inspect,
                ))),
                Err(e) if is_not_found(&e) => Ok(None),
                Err(e) => Err(Error::from_err(e))
                    .stack_err_with(|| format!("DockerRuntime::inspect({image})")),
            }
        })
    }

    fn is_available_locally<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, bool> {
        Box::pin(async move { Ok(self.inspect(image).await?.is_some()) })
    }

    fn pull<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, BuilderImageMetadata> {
        Box::pin(async move {
            let docker = get_or_init_default_docker_instance()
                .await
                .stack_err("DockerRuntime::pull")?;
            let mut stream = docker.create_image(
                Some(CreateImageOptions {
                    from_image: image.as_str().to_owned(),
                    ..Default::default()
                }),
                None,
                None,
            );
            while let Some(progress) = stream.next().await {
                progress
                    .map_err(Error::from_err)
                    .stack_err_with(|| format!("DockerRuntime::pull({image})"))?;
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
            let docker = get_or_init_default_docker_instance()
                .await
                .stack_err("DockerRuntime::create_container")?;

            let name = crate::random_name("s2i-build");
            let (volumes, binds): (HashMap<String, HashMap<(), ()>>, Vec<String>) = spec
                .volumes
                .iter()
                .map(|(host, container)| {
                    (
                        (container.clone(), HashMap::new()),
                        format!("{host}:{container}"),
                    )
                })
                .unzip();

            let response = docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: name.clone(),
                        ..Default::default()
                    }),
                    ContainerConfig {
                        image: Some(spec.image.as_str().to_owned()),
                        cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
                        env: Some(
                            spec.env
                                .iter()
                                .map(|(k, v)| format!("{k}={v}"))
                                .collect(),
                        ),
                        user: spec.user.clone(),
                        working_dir: spec.working_dir.clone(),
                        volumes: Some(volumes),
                        attach_stdin: Some(true),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        open_stdin: Some(true),
                        host_config: Some(HostConfig {
                            binds: Some(binds),
                            network_mode: spec.network_mode.clone(),
                            security_opt: Some(spec.security_opts.clone()),
                            cap_drop: Some(spec.cap_drop.clone()),
                            privileged: Some(spec.privileged),
                            memory: spec.cgroup_limits.memory_bytes,
                            memory_swap: spec.cgroup_limits.memory_swap_bytes,
                            cpu_shares: spec.cgroup_limits.cpu_shares,
                            cpu_period: spec.cgroup_limits.cpu_period,
                            cpu_quota: spec.cgroup_limits.cpu_quota,
                            auto_remove: Some(false),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )
                .await
                .map_err(Error::from_err)
                .stack_err("DockerRuntime::create_container")?;

            Ok(ContainerId(response.id))
        })
    }

    fn start_and_wait<'a>(
        &'a self,
        id: &'a ContainerId,
    ) -> BoxFut<'a, (ExitStatus, ContainerOutput)> {
        Box::pin(async move {
            let docker = get_or_init_default_docker_instance()
                .await
                .stack_err("DockerRuntime::start_and_wait")?;

            // must attach and set up the wait stream before starting, or output/exit
            // can be missed entirely
            let wait_stream = docker.wait_container::<String>(&id.0, None);
            let attached = docker
                .attach_container(
                    &id.0,
                    Some(AttachContainerOptions::<String> {
                        stdin: Some(false),
                        stdout: Some(true),
                        stderr: Some(true),
                        stream: Some(true),
                        logs: Some(true),
                        ..Default::default()
                    }),
                )
                .await
                .map_err(Error::from_err)
                .stack_err("DockerRuntime::start_and_wait attach")?;

            docker
                .start_container::<String>(&id.0, None)
                .await
                .map_err(Error::from_err)
                .stack_err("DockerRuntime::start_and_wait start")?;

            let mut captured = ContainerOutput::default();
            let mut output = attached.output;
            while let Some(chunk) = output.next().await {
                let chunk = chunk
                    .map_err(Error::from_err)
                    .stack_err("DockerRuntime::start_and_wait reading output")?;
                match chunk {
                    LogOutput::StdOut { message } => captured.stdout.extend_from_slice(&message),
                    // Console only shows up when the container was created with a
                    // tty, which this backend never requests; routed to stdout
                    // defensively rather than dropped.
                    LogOutput::Console { message } => captured.stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => captured.stderr.extend_from_slice(&message),
                    LogOutput::StdIn { .. } => (),
                }
            }

            let mut wait_stream = std::pin::pin!(wait_stream);
            let mut code = 0i64;
            while let Some(res) = wait_stream.next().await {
                match res {
                    Ok(response) => code = response.status_code,
                    Err(bollard::errors::Error::DockerContainerWaitError {
                        error: _,
                        code: c,
                    }) => code = c,
                    Err(e) => {
                        return Err(Error::from_err(e))
                            .stack_err("DockerRuntime::start_and_wait waiting")
                    }
                }
            }

            Ok((ExitStatus { code }, captured))
        })
    }

    fn remove<'a>(&'a self, id: &'a ContainerId) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let docker = get_or_init_default_docker_instance()
                .await
                .stack_err("DockerRuntime::remove")?;
            if let Err(e) = docker
                .remove_container(
                    &id.0,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::warn!("DockerRuntime::remove({}) failed, ignoring: {e}", id.0);
            }
            Ok(())
        })
    }

    fn remove_image<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, ()> {
        Box::pin(async move {
            let docker = get_or_init_default_docker_instance()
                .await
                .stack_err("DockerRuntime::remove_image")?;
            if let Err(e) = docker
                .remove_image(
                    image.as_str(),
                    Some(RemoveImageOptions {
                        force: true,
                        ..Default::default()
                    }),
                    None,
                )
                .await
            {
                if !is_not_found(&e) {
                    tracing::warn!("DockerRuntime::remove_image({image}) failed, ignoring: {e}");
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
            let docker = get_or_init_default_docker_instance()
                .await
                .stack_err("DockerRuntime::upload")?;
            docker
                .upload_to_container(
                    &id.0,
                    Some(UploadToContainerOptions {
                        path: dest_path.to_owned(),
                        ..Default::default()
                    }),
                    tar_stream.into(),
                )
                .await
                .map_err(Error::from_err)
                .stack_err_with(|| format!("DockerRuntime::upload({}, {dest_path})", id.0))
        })
    }

    fn download<'a>(&'a self, id: &'a ContainerId, src_path: &'a str) -> BoxFut<'a, Vec<u8>> {
        Box::pin(async move {
            let docker = get_or_init_default_docker_instance()
                .await
                .stack_err("DockerRuntime::download")?;
            let chunks = docker
                .download_from_container(
                    &id.0,
                    Some(DownloadFromContainerOptions {
                        path: src_path.to_owned(),
                    }),
                )
                .try_collect::<Vec<_>>()
                .await
                .map_err(Error::from_err)
                .stack_err_with(|| format!("DockerRuntime::download({}, {src_path})", id.0))?;
            Ok(chunks.into_iter().flatten().collect())
        })
    }

    fn commit<'a>(
        &'a self,
        id: &'a ContainerId,
        tag: &'a ImageRef,
        config: &'a CommitConfig,
    ) -> BoxFut<'a, String> {
        Box::pin(async move {
            let docker = get_or_init_default_docker_instance()
                .await
                .stack_err("DockerRuntime::commit")?;

            let (repo, img_tag) = tag
                .as_str()
                .split_once(':')
                .map(|(r, t)| (r.to_owned(), t.to_owned()))
                .unwrap_or_else(|| (tag.as_str().to_owned(), "latest".to_owned()));

            let result = docker
                .commit_container(
                    CommitContainerOptions {
                        container: id.0.clone(),
                        repo,
                        tag: img_tag,
                        ..Default::default()
                    },
                    ContainerConfig {
                        entrypoint: (!config.entrypoint.is_empty())
                            .then(|| config.entrypoint.clone()),
                        cmd: (!config.cmd.is_empty()).then(|| config.cmd.clone()),
                        env: Some(
                            config
                                .env
                                .iter()
                                .map(|(k, v)| format!("{k}={v}"))
                                .collect(),
                        ),
                        labels: Some(config.labels.clone()),
                        user: (!config.user.is_empty()).then(|| config.user.clone()),
                        working_dir: (!config.working_dir.is_empty())
                            .then(|| config.working_dir.clone()),
                        ..Default::default()
                    },
                )
                .await
                .map_err(Error::from_err)
                .stack_err_with(|| format!("DockerRuntime::commit({}, {tag})", id.0))?;

            Ok(result.id)
        })
    }
}
