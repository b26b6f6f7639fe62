//! An in-memory [ContainerRuntime] double used by the orchestrator's own test
//! suite, the same role `FakeRuntime`-style mocks play at a trait seam in the
//! rest of this crate (e.g. the `sh`/`CommandRunner` plumbing is exercised
//! directly rather than mocked, but runtime calls cross a process boundary
//! that tests cannot afford to make real).

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use stacked_errors::{Error, Result, StackableErr};

use crate::{
    config::ImageRef,
    error::ErrorKind,
    runtime::{
        BoxFut, BuilderImageMetadata, CommitConfig, ContainerId, ContainerOutput, ContainerRuntime,
        ContainerSpec, ExitStatus,
    },
};

/// What a fake container does when it is started, keyed by the image it was
/// created from. The captured bytes stand in for stdout, since that is the
/// stream every real caller (save-artifacts' tar output included) actually
/// reads.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Exit(i64, Vec<u8>),
    /// Blocks forever until the runtime is dropped, for cancellation tests.
    Hang,
}

#[derive(Debug)]
struct FakeContainer {
    image: ImageRef,
    files: HashMap<String, Vec<u8>>,
    removed: bool,
}

/// A [ContainerRuntime] that never touches a real container engine. Images
/// are registered with [FakeRuntime::seed_image] ahead of time and file
/// uploads/downloads are backed by an in-memory map keyed by path, so tests
/// can assert on exactly what the orchestrator tried to move in and out of
/// the "container".
pub struct FakeRuntime {
    images: Mutex<HashMap<String, BuilderImageMetadata>>,
    scripted_runs: Mutex<HashMap<String, ScriptedRun>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicU64,
    pub commits: Mutex<Vec<(String, CommitConfig)>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            images: Mutex::new(HashMap::new()),
            scripted_runs: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            commits: Mutex::new(Vec::new()),
        }
    }

    /// Registers `image` as already present locally with the given metadata.
    pub fn seed_image(&self, image: &ImageRef, metadata: BuilderImageMetadata) {
        self.images
            .lock()
            .unwrap()
            .insert(image.as_str().to_owned(), metadata);
    }

    /// Scripts what happens when a container created from `image` is started.
    pub fn seed_run(&self, image: &ImageRef, run: ScriptedRun) {
        self.scripted_runs
            .lock()
            .unwrap()
            .insert(image.as_str().to_owned(), run);
    }

    /// Reads back whatever was last uploaded to `container` at `path`.
    pub fn uploaded_file(&self, container: &ContainerId, path: &str) -> Option<Vec<u8>> {
        self.containers
            .lock()
            .unwrap()
            .get(&container.0)
            .and_then(|c| c.files.get(path).cloned())
    }

    /// Preloads a file at `path` so a subsequent `download` can return it.
    pub fn seed_download(&self, container: &ContainerId, path: &str, contents: Vec<u8>) {
        self.containers
            .lock()
            .unwrap()
            .entry(container.0.clone())
            .or_insert_with(|| FakeContainer {
                image: ImageRef::new(""),
                files: HashMap::new(),
                removed: false,
            })
            .files
            .insert(path.to_owned(), contents);
    }

    pub fn is_removed(&self, container: &ContainerId) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(&container.0)
            .map(|c| c.removed)
            .unwrap_or(true)
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn inspect<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, Option<BuilderImageMetadata>> {
        Box::pin(async move { Ok(self.images.lock().unwrap().get(image.as_str()).cloned()) })
    }

    fn is_available_locally<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, bool> {
        Box::pin(async move { Ok(self.images.lock().unwrap().contains_key(image.as_str())) })
    }

    fn pull<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, BuilderImageMetadata> {
        Box::pin(async move {
            self.images
                .lock()
                .unwrap()
                .get(image.as_str())
                .cloned()
                .ok_or_else(|| {
                    Error::from_err(ErrorKind::PullFailed {
                        image: image.to_string(),
                    })
                })
        })
    }

    fn create_container<'a>(&'a self, spec: &'a ContainerSpec) -> BoxFut<'a, ContainerId> {
        Box::pin(async move {
            if !self.images.lock().unwrap().contains_key(spec.image.as_str()) {
                return Err(Error::from_err(ErrorKind::ImageNotFound {
                    image: spec.image.to_string(),
                }))
                .stack_err("FakeRuntime::create_container");
            }
            let id = ContainerId(format!(
                "fake-{}",
                self.next_id.fetch_add(1, Ordering::SeqCst)
            ));
            self.containers.lock().unwrap().insert(
                id.0.clone(),
                FakeContainer {
                    image: spec.image.clone(),
                    files: HashMap::new(),
                    removed: false,
                },
            );
            Ok(id)
        })
    }

    fn start_and_wait<'a>(
        &'a self,
        id: &'a ContainerId,
    ) -> BoxFut<'a, (ExitStatus, ContainerOutput)> {
        Box::pin(async move {
            let image = self
                .containers
                .lock()
                .unwrap()
                .get(&id.0)
                .map(|c| c.image.clone())
                .ok_or_else(|| Error::from_err(ErrorKind::ContainerStartFailed))
                .stack_err("FakeRuntime::start_and_wait")?;
            match self.scripted_runs.lock().unwrap().get(image.as_str()).cloned() {
                Some(ScriptedRun::Exit(code, stdout)) => Ok((
                    ExitStatus { code },
                    ContainerOutput {
                        stdout,
                        stderr: Vec::new(),
                    },
                )),
                Some(ScriptedRun::Hang) => std::future::pending().await,
                None => Ok((ExitStatus { code: 0 }, ContainerOutput::default())),
            }
        })
    }

    fn remove<'a>(&'a self, id: &'a ContainerId) -> BoxFut<'a, ()> {
        Box::pin(async move {
            if let Some(c) = self.containers.lock().unwrap().get_mut(&id.0) {
                c.removed = true;
            }
            Ok(())
        })
    }

    fn remove_image<'a>(&'a self, image: &'a ImageRef) -> BoxFut<'a, ()> {
        Box::pin(async move {
            self.images.lock().unwrap().remove(image.as_str());
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
            let mut containers = self.containers.lock().unwrap();
            let container = containers
                .get_mut(&id.0)
                .ok_or_else(|| Error::from_err(ErrorKind::UploadFailed))
                .stack_err("FakeRuntime::upload")?;
            container.files.insert(dest_path.to_owned(), tar_stream);
            Ok(())
        })
    }

    fn download<'a>(&'a self, id: &'a ContainerId, src_path: &'a str) -> BoxFut<'a, Vec<u8>> {
        Box::pin(async move {
            self.containers
                .lock()
                .unwrap()
                .get(&id.0)
                .and_then(|c| c.files.get(src_path).cloned())
                .ok_or_else(|| Error::from_err(ErrorKind::ArtifactExtractionFailed))
                .stack_err_with(|| format!("FakeRuntime::download({}, {src_path})", id.0))
        })
    }

    fn commit<'a>(
        &'a self,
        id: &'a ContainerId,
        tag: &'a ImageRef,
        config: &'a CommitConfig,
    ) -> BoxFut<'a, String> {
        Box::pin(async move {
            self.commits
                .lock()
                .unwrap()
                .push((tag.as_str().to_owned(), config.clone()));
            let id_str = format!("sha256:fake-{}", id.0);
            self.images.lock().unwrap().insert(
                tag.as_str().to_owned(),
                BuilderImageMetadata {
                    id: id_str.clone(),
                    user: config.user.clone(),
                    env: config.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
                    entrypoint: config.entrypoint.clone(),
                    cmd: config.cmd.clone(),
                    working_dir: config.working_dir.clone(),
                    on_build: Vec::new(),
                    labels: config.labels.clone(),
                },
            );
            Ok(id_str)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_image_round_trips_through_pull_and_inspect() {
        let runtime = FakeRuntime::new();
        let image = ImageRef::new("builder:latest");
        runtime.seed_image(&image, BuilderImageMetadata::default());
        assert!(runtime.is_available_locally(&image).await.unwrap());
        assert!(runtime.inspect(&image).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_container_rejects_unseeded_image() {
        let runtime = FakeRuntime::new();
        let spec = ContainerSpec {
            image: ImageRef::new("missing:latest"),
            ..Default::default()
        };
        assert!(runtime.create_container(&spec).await.is_err());
    }

    #[tokio::test]
    async fn upload_then_download_is_identity() {
        let runtime = FakeRuntime::new();
        let image = ImageRef::new("builder:latest");
        runtime.seed_image(&image, BuilderImageMetadata::default());
        let spec = ContainerSpec {
            image,
            ..Default::default()
        };
        let id = runtime.create_container(&spec).await.unwrap();
        runtime.upload(&id, "/tmp/src.tar", vec![1, 2, 3]).await.unwrap();
        let back = runtime.download(&id, "/tmp/src.tar").await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn remove_is_observable() {
        let runtime = FakeRuntime::new();
        let image = ImageRef::new("builder:latest");
        runtime.seed_image(&image, BuilderImageMetadata::default());
        let spec = ContainerSpec {
            image,
            ..Default::default()
        };
        let id = runtime.create_container(&spec).await.unwrap();
        assert!(!runtime.is_removed(&id));
        runtime.remove(&id).await.unwrap();
        assert!(runtime.is_removed(&id));
    }
}
