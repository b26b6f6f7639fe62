//! End-to-end builds against [FakeRuntime], one per documented seed scenario:
//! a clean root-user build, a missing-assemble failure, a usage dry-run, an
//! incremental build with a real save-artifacts round trip, a disallowed UID
//! rejection, and a pre-cancelled build. Each drives [orchestrator::build]
//! exactly as the CLI does, rather than calling strategy internals directly.

use std::path::{Path, PathBuf};

use s2i_core::{
    config::{BuildConfig, ImageRef, UidRange},
    orchestrator,
    runtime::{
        fake::{FakeRuntime, ScriptedRun},
        BuilderImageMetadata,
    },
    tar_io,
};
use tokio::sync::watch;

fn tempdir(tag: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!("s2i-build-scenarios-{tag}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&p).unwrap();
    p
}

fn write_script(source: &Path, name: &str, contents: &[u8]) {
    let dir = source.join(".s2i/bin");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), contents).unwrap();
}

fn cleanup(dirs: &[PathBuf]) {
    for dir in dirs {
        std::fs::remove_dir_all(dir).ok();
    }
}

#[tokio::test]
async fn clean_build_with_root_builder_commits_an_image() {
    let source = tempdir("clean");
    write_script(&source, "assemble", b"#!/bin/sh\nexit 0\n");
    write_script(&source, "run", b"#!/bin/sh\nexec myapp\n");

    let runtime = FakeRuntime::new();
    let builder = ImageRef::new("builder:latest");
    runtime.seed_image(&builder, BuilderImageMetadata::default());
    runtime.seed_run(&builder, ScriptedRun::Exit(0, b"assembled ok".to_vec()));

    let config = BuildConfig::new(builder, &source).with_tag(ImageRef::new("out:latest"));
    let (_tx, rx) = watch::channel(false);

    let result = orchestrator::build(&config, &runtime, rx).await.unwrap();

    assert!(result.success);
    assert!(result.image_id.is_some());
    assert_eq!(runtime.commits.lock().unwrap().len(), 1);

    cleanup(&[source]);
}

#[tokio::test]
async fn missing_assemble_script_fails_before_any_container_is_created() {
    let source = tempdir("missing-assemble");
    // only `run` is present; `assemble` is also required and absent everywhere
    write_script(&source, "run", b"#!/bin/sh\nexec myapp\n");

    let runtime = FakeRuntime::new();
    let builder = ImageRef::new("builder:latest");
    runtime.seed_image(&builder, BuilderImageMetadata::default());

    let config = BuildConfig::new(builder, &source).with_tag(ImageRef::new("out:latest"));
    let (_tx, rx) = watch::channel(false);

    let err = orchestrator::build(&config, &runtime, rx).await.unwrap_err();
    assert!(format!("{err:?}").contains("MissingRequiredScripts"));
    assert!(runtime.commits.lock().unwrap().is_empty());

    cleanup(&[source]);
}

#[tokio::test]
async fn usage_dry_run_never_commits() {
    let source = tempdir("usage");
    write_script(&source, "assemble", b"#!/bin/sh\necho usage && exit 0\n");
    write_script(&source, "run", b"#!/bin/sh\nexec myapp\n");

    let runtime = FakeRuntime::new();
    let builder = ImageRef::new("builder:latest");
    runtime.seed_image(&builder, BuilderImageMetadata::default());
    runtime.seed_run(&builder, ScriptedRun::Exit(0, b"usage text".to_vec()));

    // no `with_tag`: BuildConfig::is_usage_dry_run() is true
    let config = BuildConfig::new(builder, &source);
    let (_tx, rx) = watch::channel(false);

    let result = orchestrator::build(&config, &runtime, rx).await.unwrap();

    assert!(result.success);
    assert!(result.image_id.is_none());
    assert!(runtime.commits.lock().unwrap().is_empty());

    cleanup(&[source]);
}

#[tokio::test]
async fn incremental_build_extracts_prior_artifacts_into_the_workspace() {
    let source = tempdir("incremental");
    write_script(&source, "assemble", b"#!/bin/sh\nexit 0\n");
    write_script(&source, "run", b"#!/bin/sh\nexec myapp\n");
    write_script(&source, "save-artifacts", b"#!/bin/sh\ntar -C artifacts -c .\n");

    // the tar a prior save-artifacts container would have streamed back
    let artifact_src = tempdir("incremental-artifact-src");
    std::fs::write(artifact_src.join("cached.txt"), b"warm cache").unwrap();
    let artifact_tar = tar_io::build_tar(&artifact_src, &[]).unwrap();

    let runtime = FakeRuntime::new();
    let builder = ImageRef::new("builder:latest");
    let previous = ImageRef::new("out:previous");
    runtime.seed_image(&builder, BuilderImageMetadata::default());
    runtime.seed_run(&builder, ScriptedRun::Exit(0, b"assembled with cache".to_vec()));
    runtime.seed_image(&previous, BuilderImageMetadata::default());
    runtime.seed_run(&previous, ScriptedRun::Exit(0, artifact_tar));

    let config = BuildConfig::new(builder, &source)
        .with_tag(ImageRef::new("out:latest"))
        .with_incremental(true)
        .with_previous_image_tag(previous)
        .with_preserve_working_dir(true);
    let (_tx, rx) = watch::channel(false);

    let result = orchestrator::build(&config, &runtime, rx).await.unwrap();

    assert!(result.success);
    let working_dir = result.working_dir.clone().expect("PreserveWorkingDir was set");
    let extracted = std::fs::read(working_dir.join("artifacts/cached.txt")).unwrap();
    assert_eq!(extracted, b"warm cache");
    assert!(result
        .stages
        .iter()
        .any(|s| s.name == "ExtractPriorArtifacts" && matches!(s.outcome, orchestrator::StageOutcome::Ok)));

    cleanup(&[source, artifact_src, working_dir]);
}

#[tokio::test]
async fn disallowed_uid_is_rejected_before_create_container() {
    let source = tempdir("disallowed-uid");
    write_script(&source, "assemble", b"#!/bin/sh\nexit 0\n");
    write_script(&source, "run", b"#!/bin/sh\nexec myapp\n");

    let runtime = FakeRuntime::new();
    let builder = ImageRef::new("builder:latest");
    runtime.seed_image(
        &builder,
        BuilderImageMetadata {
            user: "1000".to_owned(),
            ..Default::default()
        },
    );

    let config = BuildConfig::new(builder, &source)
        .with_tag(ImageRef::new("out:latest"))
        .with_allowed_uids([UidRange::new(2000, 3000)]);
    let (_tx, rx) = watch::channel(false);

    let err = orchestrator::build(&config, &runtime, rx).await.unwrap_err();
    assert!(format!("{err:?}").contains("DisallowedUser"));
    assert!(runtime.commits.lock().unwrap().is_empty());

    cleanup(&[source]);
}

#[tokio::test]
async fn cancellation_aborts_the_build_and_removes_its_container() {
    let source = tempdir("cancel");
    write_script(&source, "assemble", b"#!/bin/sh\nexit 0\n");
    write_script(&source, "run", b"#!/bin/sh\nexec myapp\n");

    let runtime = FakeRuntime::new();
    let builder = ImageRef::new("builder:latest");
    runtime.seed_image(&builder, BuilderImageMetadata::default());
    // would hang forever if ever actually started
    runtime.seed_run(&builder, ScriptedRun::Hang);

    let config = BuildConfig::new(builder, &source).with_tag(ImageRef::new("out:latest"));
    // already cancelled before the build starts: docker_build checks
    // `is_cancelled()` right before `start_and_wait`, so the container it
    // created for upload is never started, only cleaned up.
    let (_tx, rx) = watch::channel(true);

    let err = orchestrator::build(&config, &runtime, rx).await.unwrap_err();
    assert!(format!("{err:?}").contains("Cancelled"));

    cleanup(&[source]);
}
