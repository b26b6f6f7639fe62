use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use stacked_errors::{Error, Result, StackableErr};

use crate::error::ErrorKind;

/// A reference to a container image, either `name:tag` or a digest form.
/// Kept as a newtype (mirroring `SuperImage` in the docker backend) so it is
/// never confused with a bare path or container id in function signatures.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ImageRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

/// Governs whether a runtime adapter attempts a network pull before using a
/// local image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    Never,
    #[default]
    IfNotPresent,
}

/// Inclusive UID range used by `AllowedUIDs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidRange {
    pub start: i64,
    pub end: i64,
}

impl UidRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, uid: i64) -> bool {
        (self.start..=self.end).contains(&uid)
    }
}

/// cgroup resource limits passed through to the runtime adapter untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CGroupLimits {
    pub memory_bytes: Option<i64>,
    pub memory_swap_bytes: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub cpu_period: Option<i64>,
    pub cpu_quota: Option<i64>,
}

/// Immutable build request. Constructed with [BuildConfig::new] and chained
/// `with_*` setters (the same owned-builder idiom the runtime adapters use
/// for `Command`/`ContainerCreateOptions`), then checked once with
/// [BuildConfig::validate] before the orchestrator starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub builder_image: ImageRef,
    pub source: PathBuf,
    pub source_ref: Option<String>,
    pub tag: Option<ImageRef>,
    pub incremental: bool,
    pub previous_image_tag: Option<ImageRef>,
    pub remove_previous_image: bool,
    pub scripts_url: Option<String>,
    pub environment: Vec<(String, String)>,
    pub builder_pull_policy: PullPolicy,
    pub previous_image_pull_policy: PullPolicy,
    pub runtime_pull_policy: PullPolicy,
    pub assemble_user: Option<String>,
    pub assemble_runtime_user: Option<String>,
    pub destination: PathBuf,
    pub allowed_uids: Vec<UidRange>,
    pub as_dockerfile: Option<PathBuf>,
    pub ignore_patterns: Vec<String>,
    pub labels: HashMap<String, String>,
    pub docker_network_mode: Option<String>,
    pub security_opts: Vec<String>,
    pub cgroup_limits: CGroupLimits,
    pub cap_drop: Vec<String>,
    pub preserve_working_dir: bool,
    pub pull_timeout: std::time::Duration,
    pub container_start_timeout: std::time::Duration,
    pub build_timeout: Option<std::time::Duration>,
}

impl BuildConfig {
    /// New config for building `source` with `builder_image`. All other
    /// fields take documented defaults; `Tag` is unset, meaning a usage
    /// dry-run unless [BuildConfig::with_tag] is called.
    pub fn new(builder_image: ImageRef, source: impl Into<PathBuf>) -> Self {
        Self {
            builder_image,
            source: source.into(),
            source_ref: None,
            tag: None,
            incremental: false,
            previous_image_tag: None,
            remove_previous_image: false,
            scripts_url: None,
            environment: Vec::new(),
            builder_pull_policy: PullPolicy::default(),
            previous_image_pull_policy: PullPolicy::default(),
            runtime_pull_policy: PullPolicy::default(),
            assemble_user: None,
            assemble_runtime_user: None,
            destination: PathBuf::from("/tmp"),
            allowed_uids: Vec::new(),
            as_dockerfile: None,
            ignore_patterns: Vec::new(),
            labels: HashMap::new(),
            docker_network_mode: None,
            security_opts: Vec::new(),
            cgroup_limits: CGroupLimits::default(),
            cap_drop: Vec::new(),
            preserve_working_dir: false,
            pull_timeout: std::time::Duration::from_secs(300),
            container_start_timeout: std::time::Duration::from_secs(60),
            build_timeout: None,
        }
    }

    pub fn with_tag(mut self, tag: ImageRef) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn with_previous_image_tag(mut self, tag: ImageRef) -> Self {
        self.previous_image_tag = Some(tag);
        self
    }

    pub fn with_remove_previous_image(mut self, remove: bool) -> Self {
        self.remove_previous_image = remove;
        self
    }

    pub fn with_scripts_url(mut self, url: impl Into<String>) -> Self {
        self.scripts_url = Some(url.into());
        self
    }

    pub fn with_environment(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.environment = env.into_iter().collect();
        self
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = destination.into();
        self
    }

    pub fn with_allowed_uids(mut self, ranges: impl IntoIterator<Item = UidRange>) -> Self {
        self.allowed_uids = ranges.into_iter().collect();
        self
    }

    pub fn with_as_dockerfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.as_dockerfile = Some(path.into());
        self
    }

    pub fn with_ignore_patterns(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.ignore_patterns = patterns.into_iter().collect();
        self
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = (String, String)>) -> Self {
        self.labels = labels.into_iter().collect();
        self
    }

    pub fn with_preserve_working_dir(mut self, preserve: bool) -> Self {
        self.preserve_working_dir = preserve;
        self
    }

    /// Path the incremental controller resolves against: defaults to `Tag`
    /// when unset.
    pub fn previous_image_tag_or_default(&self) -> Option<&ImageRef> {
        self.previous_image_tag.as_ref().or(self.tag.as_ref())
    }

    /// `true` when no `Tag` was set, meaning the build is a usage dry-run
    /// (`assemble -h`, no commit).
    pub fn is_usage_dry_run(&self) -> bool {
        self.tag.is_none()
    }

    /// Enforces the static invariants that must hold before the
    /// orchestrator starts: `Tag`/`AsDockerfile` mutual exclusion.
    pub fn validate(&self) -> Result<()> {
        if self.tag.is_some() && self.as_dockerfile.is_some() {
            return Err(Error::from_err(ErrorKind::InvalidConfig(
                "`tag` and `as_dockerfile` are mutually exclusive".to_owned(),
            )))
            .stack_err("BuildConfig::validate");
        }
        Ok(())
    }
}
