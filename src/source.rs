//! Source preparer: copies the application tree into `workspace/upload/src`
//! honoring `.s2iignore`, and merges `.s2i/environment` into the configured
//! environment list. Reuses the same `ignore::gitignore` machinery as
//! [crate::tar_io], but walks the source tree directly rather than producing
//! a tar stream (the Docker/Buildah upload path tars the already-materialized
//! `upload/src` directory itself).

use std::path::Path;

use ignore::{gitignore::GitignoreBuilder, Match};
use stacked_errors::{Error, Result, StackableErr};
use tokio::fs;
use walkdir::WalkDir;

const IGNORE_FILE: &str = ".s2iignore";
const ENVIRONMENT_FILE: &str = ".s2i/environment";

/// Copies every file under `source_root` into `dest`, skipping anything
/// matched by `.s2iignore` or `config.ignore_patterns` (later non-exception
/// rules win; a file restored by a `!` exception can still be re-ignored by a
/// subsequent non-exception rule, the same precedence `.dockerignore` uses).
/// `extra_patterns` (`BuildConfig::ignore_patterns`) is applied after the
/// file, so it can re-ignore anything the file's own exceptions restored.
#[tracing::instrument(skip(source_root, dest, extra_patterns), fields(source_root = %source_root.display(), dest = %dest.display()))]
pub async fn materialize_source(source_root: &Path, dest: &Path, extra_patterns: &[String]) -> Result<()> {
    let mut builder = GitignoreBuilder::new(source_root);
    let ignore_file = source_root.join(IGNORE_FILE);
    if ignore_file.is_file() {
        if let Some(err) = builder.add(&ignore_file) {
            return Err(Error::from_err(err))
                .stack_err_with(|| format!("materialize_source: parsing {ignore_file:?}"));
        }
    }
    for pattern in extra_patterns {
        builder
            .add_line(None, pattern)
            .map_err(Error::from_err)
            .stack_err_with(|| format!("materialize_source: parsing ignore pattern {pattern:?}"))?;
    }
    let matcher = builder
        .build()
        .map_err(Error::from_err)
        .stack_err("materialize_source: building ignore matcher")?;

    for entry in WalkDir::new(source_root).into_iter() {
        let entry = entry
            .map_err(Error::from_err)
            .stack_err_with(|| format!("materialize_source: walking {source_root:?}"))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let rel_path = path
            .strip_prefix(source_root)
            .stack_err_with(|| format!("materialize_source: {path:?} not under {source_root:?}"))?;
        if let Match::Ignore(_) = matcher.matched(rel_path, false) {
            tracing::debug!(path = %rel_path.display(), "skipping ignored file");
            continue;
        }
        let dest_path = dest.join(rel_path);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)
                .await
                .stack_err_with(|| format!("materialize_source: creating {parent:?}"))?;
        }
        fs::copy(path, &dest_path)
            .await
            .stack_err_with(|| format!("materialize_source: copying {path:?} to {dest_path:?}"))?;
    }
    Ok(())
}

/// Parses `.s2i/environment` under `source_root`, if present, into ordered
/// `(name, value)` pairs. Lines without `=` are skipped; `#` lines are
/// comments; the key/value split happens at the first `=`.
pub async fn parse_source_environment(source_root: &Path) -> Result<Vec<(String, String)>> {
    let path = source_root.join(ENVIRONMENT_FILE);
    let contents = match fs::read_to_string(&path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::from_err(e)).stack_err_with(|| format!("reading {path:?}")),
    };

    let mut pairs = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            pairs.push((key.trim().to_owned(), value.trim().to_owned()));
        }
    }
    Ok(pairs)
}

/// Merges `source_env` (parsed from `.s2i/environment`) with `config_env`
/// (from [crate::BuildConfig::environment]); on duplicate keys the config
/// value wins, and config-only keys are appended after the merged set keeps
/// the source's original ordering for keys it doesn't override.
pub fn merge_environment(
    source_env: Vec<(String, String)>,
    config_env: &[(String, String)],
) -> Vec<(String, String)> {
    let mut merged = source_env;
    for (key, value) in config_env {
        if let Some(existing) = merged.iter_mut().find(|(k, _)| k == key) {
            existing.1 = value.clone();
        } else {
            merged.push((key.clone(), value.clone()));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!("s2i-source-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[tokio::test]
    async fn materialize_copies_files_and_honors_ignore() {
        let src = tempdir();
        std::fs::write(src.join(".s2iignore"), b"*.log\n").unwrap();
        std::fs::write(src.join("app.rb"), b"puts 1").unwrap();
        std::fs::write(src.join("debug.log"), b"noisy").unwrap();
        std::fs::create_dir(src.join("lib")).unwrap();
        std::fs::write(src.join("lib/helper.rb"), b"puts 2").unwrap();

        let dest = tempdir();
        materialize_source(&src, &dest, &[]).await.unwrap();

        assert!(dest.join("app.rb").is_file());
        assert!(dest.join("lib/helper.rb").is_file());
        assert!(!dest.join("debug.log").exists());
        // the ignore file itself is not special-cased, so it is copied too
        assert!(dest.join(".s2iignore").is_file());

        std::fs::remove_dir_all(&src).ok();
        std::fs::remove_dir_all(&dest).ok();
    }

    #[tokio::test]
    async fn exception_only_ignore_file_is_a_no_op() {
        let src = tempdir();
        std::fs::write(src.join(".s2iignore"), b"!keep.txt\n").unwrap();
        std::fs::write(src.join("keep.txt"), b"kept").unwrap();
        std::fs::write(src.join("other.txt"), b"also kept").unwrap();

        let dest = tempdir();
        materialize_source(&src, &dest, &[]).await.unwrap();

        assert!(dest.join("keep.txt").is_file());
        assert!(dest.join("other.txt").is_file());

        std::fs::remove_dir_all(&src).ok();
        std::fs::remove_dir_all(&dest).ok();
    }

    #[tokio::test]
    async fn extra_ignore_pattern_from_config_is_applied() {
        let src = tempdir();
        std::fs::write(src.join("keep.txt"), b"kept").unwrap();
        std::fs::write(src.join("secret.pem"), b"nope").unwrap();

        let dest = tempdir();
        materialize_source(&src, &dest, &["*.pem".to_owned()]).await.unwrap();

        assert!(dest.join("keep.txt").is_file());
        assert!(!dest.join("secret.pem").exists());

        std::fs::remove_dir_all(&src).ok();
        std::fs::remove_dir_all(&dest).ok();
    }

    #[tokio::test]
    async fn missing_environment_file_yields_empty_list() {
        let src = tempdir();
        let pairs = parse_source_environment(&src).await.unwrap();
        assert!(pairs.is_empty());
        std::fs::remove_dir_all(&src).ok();
    }

    #[tokio::test]
    async fn environment_file_parses_and_skips_comments() {
        let src = tempdir();
        std::fs::create_dir_all(src.join(".s2i")).unwrap();
        std::fs::write(
            src.join(".s2i/environment"),
            b"# a comment\nFOO=bar\nBAZ=qux=extra\nnotkeyvalue\n",
        )
        .unwrap();

        let pairs = parse_source_environment(&src).await.unwrap();
        assert_eq!(
            pairs,
            vec![
                ("FOO".to_owned(), "bar".to_owned()),
                ("BAZ".to_owned(), "qux=extra".to_owned()),
            ]
        );
        std::fs::remove_dir_all(&src).ok();
    }

    #[test]
    fn config_wins_on_duplicate_keys() {
        let source_env = vec![
            ("FOO".to_owned(), "from-source".to_owned()),
            ("ONLY_SOURCE".to_owned(), "s".to_owned()),
        ];
        let config_env = vec![
            ("FOO".to_owned(), "from-config".to_owned()),
            ("ONLY_CONFIG".to_owned(), "c".to_owned()),
        ];
        let merged = merge_environment(source_env, &config_env);
        assert_eq!(
            merged,
            vec![
                ("FOO".to_owned(), "from-config".to_owned()),
                ("ONLY_SOURCE".to_owned(), "s".to_owned()),
                ("ONLY_CONFIG".to_owned(), "c".to_owned()),
            ]
        );
    }
}
