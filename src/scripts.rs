//! Script discovery: the fixed-precedence resolver chain that decides, per
//! script name, whether `assemble`/`run`/`save-artifacts`/`usage` come from
//! an explicit URL, the application source, an image label, or are already
//! baked into the builder image.
//!
//! Each handler is a `fn(&ResolveCtx) -> Option<Result<ResolvedScript>>` —
//! `None` means "not mine, try the next handler" — kept as a flat ordered
//! chain rather than a graph, the same shape `FailedSources` takes below.

use std::{collections::HashMap, fmt, path::Path};

use serde::{Deserialize, Serialize};
use stacked_errors::{Error, Result, StackableErr};
use tokio::fs;

use crate::{error::ErrorKind, runtime::BuilderImageMetadata, Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptName {
    Assemble,
    Run,
    SaveArtifacts,
    Usage,
}

impl ScriptName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptName::Assemble => "assemble",
            ScriptName::Run => "run",
            ScriptName::SaveArtifacts => "save-artifacts",
            ScriptName::Usage => "usage",
        }
    }

    /// `true` for scripts a build cannot proceed without.
    pub fn required(&self) -> bool {
        matches!(self, ScriptName::Assemble | ScriptName::Run)
    }
}

impl fmt::Display for ScriptName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptSource {
    ExplicitUrl,
    AppSource,
    ImageLabel,
    ImageInternal,
}

impl ScriptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptSource::ExplicitUrl => "URL",
            ScriptSource::AppSource => "source",
            ScriptSource::ImageLabel => "image-label",
            ScriptSource::ImageInternal => "image-internal",
        }
    }
}

impl fmt::Display for ScriptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location a successfully installed script was found at, or the sentinel
/// for "already inside the image".
#[derive(Debug, Clone)]
pub enum ResolvedScript {
    /// Downloaded/copied into the workspace; `contents` goes straight into
    /// `workspace/upload/scripts/<script>` with mode 0755.
    Fetched { url: String, contents: Vec<u8> },
    /// The builder image already has it at `/usr/libexec/s2i/<script>`.
    InsideImage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallResult {
    pub script: ScriptName,
    pub url: String,
    pub installed: bool,
    pub downloaded: bool,
    pub failed_sources: Vec<ScriptSource>,
    pub error: Option<String>,
}

/// Everything a resolver handler needs to decide whether it owns a given
/// script name, kept separate from [crate::BuildConfig] so the resolver can
/// run against either the builder image or (for `save-artifacts`) the prior
/// image during the incremental flow.
pub struct ResolveCtx<'a> {
    pub scripts_url: Option<&'a str>,
    pub source_root: &'a Path,
    pub image_metadata: &'a BuilderImageMetadata,
}

const IMAGE_INTERNAL_PREFIX: &str = "/usr/libexec/s2i";

async fn read_local_script_source(base: &str, script: ScriptName) -> Result<Option<Vec<u8>>> {
    let path = Path::new(base).join(script.as_str());
    match fs::read(&path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::from_err(e)).stack_err_with(|| format!("reading {path:?}")),
    }
}

/// Resolves a `file://`/plain-path base or the `image://` sentinel against
/// a single script name, shared by the explicit-URL and image-label
/// handlers (they differ only in where the base string comes from).
async fn resolve_base(base: Option<String>, script: ScriptName, what: &str) -> Result<ResolvedScript> {
    let base = base.ok_or_else(|| {
        Error::from_err(ErrorKind::SourceUnavailable(format!("no {what} configured")))
    })?;
    if base == "image://" {
        return Ok(ResolvedScript::InsideImage);
    }
    let base = base.strip_prefix("file://").unwrap_or(&base).to_owned();
    match read_local_script_source(&base, script).await? {
        Some(contents) => Ok(ResolvedScript::Fetched {
            url: format!("{base}/{script}"),
            contents,
        }),
        None => Err(Error::from_err(ErrorKind::SourceUnavailable(format!(
            "{script} not found under {what} {base}"
        )))),
    }
}

/// (a) An explicit `ScriptsURL` from config. Resolved as a local filesystem
/// base (`file://` prefix stripped) or the `image://` sentinel; a genuine
/// `http(s)://` fetch is out of scope (see DESIGN.md).
fn explicit_url_handler(
    ctx: &ResolveCtx<'_>,
    script: ScriptName,
) -> futures::future::BoxFuture<'static, Result<ResolvedScript>> {
    let base = ctx.scripts_url.map(str::to_owned);
    Box::pin(resolve_base(base, script, "scripts-url"))
}

/// (b) `.s2i/bin/<script>`, falling back to the deprecated `.sti/bin/<script>`
/// with a logged warning.
fn app_source_handler(
    ctx: &ResolveCtx<'_>,
    script: ScriptName,
) -> futures::future::BoxFuture<'static, Result<ResolvedScript>> {
    let root = ctx.source_root.to_owned();
    Box::pin(async move {
        let primary = root.join(".s2i/bin").join(script.as_str());
        if let Ok(contents) = fs::read(&primary).await {
            return Ok(ResolvedScript::Fetched {
                url: primary.display().to_string(),
                contents,
            });
        }
        let deprecated = root.join(".sti/bin").join(script.as_str());
        match fs::read(&deprecated).await {
            Ok(contents) => {
                tracing::warn!(
                    path = %deprecated.display(),
                    "using deprecated .sti/bin script location, prefer .s2i/bin"
                );
                Ok(ResolvedScript::Fetched {
                    url: deprecated.display().to_string(),
                    contents,
                })
            }
            Err(_) => Err(Error::from_err(ErrorKind::SourceUnavailable(format!(
                "{script} not found under .s2i/bin or .sti/bin"
            )))),
        }
    })
}

/// (c) The `io.openshift.s2i.scripts-url` image label, same resolution rules
/// as the explicit URL.
fn image_label_handler(
    ctx: &ResolveCtx<'_>,
    script: ScriptName,
) -> futures::future::BoxFuture<'static, Result<ResolvedScript>> {
    let base = ctx.image_metadata.scripts_url_label().map(str::to_owned);
    Box::pin(resolve_base(base, script, "image label scripts-url"))
}

/// Runs the handler chain in fixed precedence for one script name,
/// returning both the outcome and (when downloaded) the fetched bytes.
pub async fn resolve_script(
    ctx: &ResolveCtx<'_>,
    script: ScriptName,
) -> (InstallResult, Option<Vec<u8>>) {
    let mut failed_sources = Vec::new();

    macro_rules! try_handler {
        ($source:expr, $handler:expr) => {
            match $handler(ctx, script).await {
                Ok(ResolvedScript::Fetched { url, contents }) => {
                    return (
                        InstallResult {
                            script,
                            url,
                            installed: true,
                            downloaded: true,
                            failed_sources,
                            error: None,
                        },
                        Some(contents),
                    );
                }
                Ok(ResolvedScript::InsideImage) => {
                    return (
                        InstallResult {
                            script,
                            url: format!("{IMAGE_INTERNAL_PREFIX}/{script}"),
                            installed: true,
                            downloaded: false,
                            failed_sources,
                            error: None,
                        },
                        None,
                    );
                }
                Err(e) => {
                    tracing::debug!(source = %$source, script = %script, error = %e, "script handler failed");
                    failed_sources.push($source);
                }
            }
        };
    }

    try_handler!(ScriptSource::ExplicitUrl, explicit_url_handler);
    try_handler!(ScriptSource::AppSource, app_source_handler);
    try_handler!(ScriptSource::ImageLabel, image_label_handler);

    (
        InstallResult {
            script,
            url: String::new(),
            installed: false,
            downloaded: false,
            failed_sources,
            error: Some(format!("no handler resolved {script}")),
        },
        None,
    )
}

/// Resolves every required and optional script name, writing fetched
/// contents into `scripts_dir` with executable permissions, and fails with
/// [ErrorKind::MissingRequiredScripts] if any required script has no
/// handler success.
#[tracing::instrument(skip(ctx, contents_by_script), fields(scripts_dir = %scripts_dir.display()))]
pub async fn resolve_all(
    ctx: &ResolveCtx<'_>,
    scripts_dir: &Path,
    contents_by_script: &mut HashMap<ScriptName, Vec<u8>>,
) -> Result<Vec<InstallResult>> {
    let mut results = Vec::new();
    let mut missing = Vec::new();

    for script in [
        ScriptName::Assemble,
        ScriptName::Run,
        ScriptName::SaveArtifacts,
        ScriptName::Usage,
    ] {
        let (result, contents) = resolve_script(ctx, script).await;
        if !result.installed && script.required() {
            missing.push(result.clone());
        }
        if let Some(contents) = contents {
            let dest = scripts_dir.join(script.as_str());
            fs::write(&dest, &contents)
                .await
                .stack_err_with(|| format!("writing resolved script to {dest:?}"))?;
            set_executable(&dest).await?;
            contents_by_script.insert(script, contents);
        }
        results.push(result);
    }

    if !missing.is_empty() {
        return Err(Error::from_err(ErrorKind::MissingRequiredScripts {
            scripts: missing.iter().map(|r| r.script.to_string()).collect(),
            failed_sources: missing
                .iter()
                .flat_map(|r| r.failed_sources.iter().map(ScriptSource::to_string))
                .collect(),
        }))
        .stack_err("resolve_all");
    }

    Ok(results)
}

#[cfg(unix)]
pub(crate) async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .await
        .stack_err_with(|| format!("stat {path:?}"))?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
        .await
        .stack_err_with(|| format!("chmod 0755 {path:?}"))
}

#[cfg(not(unix))]
pub(crate) async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Runs `<script> -h` for the usage dry-run path, via the same [Command]
/// wrapper the docker CLI backend uses, when the caller just needs the exit
/// status without a container (used by unit tests; the real dry-run runs
/// inside the build container).
pub async fn run_usage_locally(script_path: &Path) -> Result<bool> {
    let res = Command::new_os_str(script_path)
        .arg("-h")
        .run_to_completion()
        .await
        .stack_err_with(|| format!("run_usage_locally({script_path:?})"))?;
    Ok(res.successful())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!("s2i-scripts-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[tokio::test]
    async fn app_source_wins_over_image_internal() {
        let source_root = tempdir();
        std::fs::create_dir_all(source_root.join(".s2i/bin")).unwrap();
        std::fs::write(source_root.join(".s2i/bin/assemble"), b"#!/bin/sh\necho ok\n").unwrap();

        let metadata = BuilderImageMetadata::default();
        let ctx = ResolveCtx {
            scripts_url: None,
            source_root: &source_root,
            image_metadata: &metadata,
        };

        let (result, contents) = resolve_script(&ctx, ScriptName::Assemble).await;
        assert!(result.installed);
        assert!(result.downloaded);
        // no `ScriptsURL` was configured, so the URL handler is tried and
        // fails before the app-source handler gets its turn
        assert_eq!(result.failed_sources, vec![ScriptSource::ExplicitUrl]);
        assert_eq!(contents.unwrap(), b"#!/bin/sh\necho ok\n");

        std::fs::remove_dir_all(&source_root).ok();
    }

    #[tokio::test]
    async fn missing_required_script_reports_every_failed_source() {
        let source_root = tempdir();
        let metadata = BuilderImageMetadata::default();
        let ctx = ResolveCtx {
            scripts_url: None,
            source_root: &source_root,
            image_metadata: &metadata,
        };
        let mut scripts_dir = tempdir();
        scripts_dir.push("scripts");
        std::fs::create_dir_all(&scripts_dir).unwrap();

        let mut contents = HashMap::new();
        let err = resolve_all(&ctx, &scripts_dir, &mut contents)
            .await
            .unwrap_err();
        assert!(format!("{err:?}").contains("MissingRequiredScripts"));

        std::fs::remove_dir_all(&source_root).ok();
        std::fs::remove_dir_all(&scripts_dir).ok();
    }

    #[tokio::test]
    async fn image_label_sentinel_resolves_as_inside_image() {
        let source_root = tempdir();
        let mut labels = HashMap::new();
        labels.insert(
            BuilderImageMetadata::SCRIPTS_URL_LABEL.to_owned(),
            "image://".to_owned(),
        );
        let metadata = BuilderImageMetadata {
            labels,
            ..Default::default()
        };
        let ctx = ResolveCtx {
            scripts_url: None,
            source_root: &source_root,
            image_metadata: &metadata,
        };

        let (result, contents) = resolve_script(&ctx, ScriptName::SaveArtifacts).await;
        assert!(result.installed);
        assert!(!result.downloaded);
        assert!(contents.is_none());

        std::fs::remove_dir_all(&source_root).ok();
    }

    #[tokio::test]
    async fn all_handlers_fail_when_nothing_is_configured() {
        let source_root = tempdir();
        let metadata = BuilderImageMetadata::default();
        let ctx = ResolveCtx {
            scripts_url: None,
            source_root: &source_root,
            image_metadata: &metadata,
        };

        let (result, contents) = resolve_script(&ctx, ScriptName::SaveArtifacts).await;
        assert!(!result.installed);
        assert!(contents.is_none());
        assert_eq!(
            result.failed_sources,
            vec![
                ScriptSource::ExplicitUrl,
                ScriptSource::AppSource,
                ScriptSource::ImageLabel
            ]
        );

        std::fs::remove_dir_all(&source_root).ok();
    }
}
