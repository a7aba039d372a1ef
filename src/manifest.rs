//! Manifest scanning
//!
//! Walks the project tree and lifts dependency pins out of the supported
//! manifests: every `package.json` (dependencies and devDependencies) for
//! npm, and every `requirements*.txt` for pip. Pins that do not normalize
//! to a comparable semantic version are dropped, since the detector cannot
//! order them against a registry version.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

use crate::model::Ecosystem;
use crate::version;

/// Directories never scanned for manifests.
const SKIP_DIRS: &[&str] = &["node_modules", ".venv", ".git", ".remedy", "__pycache__"];

/// A dependency pin lifted from a manifest, before the registry has been
/// consulted for a newer version.
#[derive(Debug, Clone, PartialEq)]
pub struct PinnedDependency {
    pub name: String,
    pub version: String,
    pub ecosystem: Ecosystem,
    pub manifest_path: String,
}

#[derive(Debug, Deserialize)]
struct PackageJson {
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: BTreeMap<String, String>,
}

/// Collect every comparable dependency pin under `root`. Manifests of both
/// ecosystems can live anywhere in the tree (workspace members, service
/// subdirectories) outside the skipped directories.
pub fn scan(root: &Path) -> Result<Vec<PinnedDependency>> {
    // name==version, stopping before extras markers and comments
    let pin_re = Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._-]*)==([^;\s#]+)")
        .context("Invalid requirements pin pattern")?;

    let mut pins = Vec::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| !should_skip(entry));
    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_str();
        if name == Some("package.json") {
            pins.extend(parse_package_json(entry.path())?);
        } else if is_requirements_file(name) {
            pins.extend(parse_requirements(entry.path(), &pin_re));
        }
    }
    Ok(pins)
}

fn parse_package_json(path: &Path) -> Result<Vec<PinnedDependency>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let pkg: PackageJson = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let manifest_path = path.display().to_string();
    let mut pins = Vec::new();
    for (name, raw) in pkg.dependencies.iter().chain(pkg.dev_dependencies.iter()) {
        let pinned = version::normalize(raw);
        if version::parse(pinned).is_some() {
            pins.push(PinnedDependency {
                name: name.clone(),
                version: pinned.to_string(),
                ecosystem: Ecosystem::Npm,
                manifest_path: manifest_path.clone(),
            });
        }
    }
    Ok(pins)
}

fn parse_requirements(path: &Path, pin_re: &Regex) -> Vec<PinnedDependency> {
    let Ok(content) = std::fs::read_to_string(path) else {
        tracing::debug!(path = %path.display(), "skipping unreadable requirements file");
        return Vec::new();
    };

    let manifest_path = path.display().to_string();
    let mut pins = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(caps) = pin_re.captures(line) {
            let pinned = caps[2].to_string();
            if version::parse(version::normalize(&pinned)).is_some() {
                pins.push(PinnedDependency {
                    name: caps[1].to_string(),
                    version: pinned,
                    ecosystem: Ecosystem::Pip,
                    manifest_path: manifest_path.clone(),
                });
            }
        }
    }
    pins
}

fn should_skip(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| SKIP_DIRS.contains(&name))
            .unwrap_or(false)
}

fn is_requirements_file(name: Option<&str>) -> bool {
    matches!(name, Some(n) if n.starts_with("requirements") && n.ends_with(".txt"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn names(pins: &[PinnedDependency]) -> Vec<&str> {
        let mut out: Vec<&str> = pins.iter().map(|p| p.name.as_str()).collect();
        out.sort();
        out
    }

    #[test]
    fn test_scan_package_json_deps_and_dev_deps() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{
                "name": "fixture",
                "dependencies": {"left-pad": "^1.2.0", "express": "4.18.2"},
                "devDependencies": {"jest": "~29.6.0"}
            }"#,
        )
        .unwrap();

        let pins = scan(dir.path()).unwrap();
        assert_eq!(names(&pins), vec!["express", "jest", "left-pad"]);
        let left_pad = pins.iter().find(|p| p.name == "left-pad").unwrap();
        assert_eq!(left_pad.version, "1.2.0");
        assert_eq!(left_pad.ecosystem, Ecosystem::Npm);
        assert!(left_pad.manifest_path.ends_with("package.json"));
    }

    #[test]
    fn test_scan_drops_uncomparable_pins() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"a": "latest", "b": "workspace:*", "c": "*", "ok": "1.0.0"}}"#,
        )
        .unwrap();

        let pins = scan(dir.path()).unwrap();
        assert_eq!(names(&pins), vec!["ok"]);
    }

    #[test]
    fn test_scan_requirements_pins_only() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("requirements.txt"),
            "# pinned deps\nrequests==2.31.0\nflask>=2.0\n\nnumpy==1.26.4  # numeric\n",
        )
        .unwrap();

        let pins = scan(dir.path()).unwrap();
        assert_eq!(names(&pins), vec!["numpy", "requests"]);
        let requests = pins.iter().find(|p| p.name == "requests").unwrap();
        assert_eq!(requests.version, "2.31.0");
        assert_eq!(requests.ecosystem, Ecosystem::Pip);
    }

    #[test]
    fn test_scan_finds_nested_requirements_variants() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("services/api")).unwrap();
        fs::write(
            dir.path().join("services/api/requirements-dev.txt"),
            "pytest==8.0.0\n",
        )
        .unwrap();

        let pins = scan(dir.path()).unwrap();
        assert_eq!(names(&pins), vec!["pytest"]);
    }

    #[test]
    fn test_scan_finds_nested_package_json() {
        let dir = tempdir().unwrap();
        let member = dir.path().join("packages/app");
        fs::create_dir_all(&member).unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"express": "4.18.2"}}"#,
        )
        .unwrap();
        fs::write(
            member.join("package.json"),
            r#"{"dependencies": {"left-pad": "1.3.0"}}"#,
        )
        .unwrap();

        let pins = scan(dir.path()).unwrap();
        assert_eq!(names(&pins), vec!["express", "left-pad"]);
        let left_pad = pins.iter().find(|p| p.name == "left-pad").unwrap();
        assert!(left_pad.manifest_path.contains("packages"));
    }

    #[test]
    fn test_scan_skips_cache_directories() {
        let dir = tempdir().unwrap();
        for skipped in ["node_modules/pkg", ".remedy/sandboxes", ".git"] {
            let sub = dir.path().join(skipped);
            fs::create_dir_all(&sub).unwrap();
            fs::write(sub.join("requirements.txt"), "hidden==1.0.0\n").unwrap();
            fs::write(
                sub.join("package.json"),
                r#"{"dependencies": {"hidden": "1.0.0"}}"#,
            )
            .unwrap();
        }
        fs::write(dir.path().join("requirements.txt"), "visible==1.0.0\n").unwrap();

        let pins = scan(dir.path()).unwrap();
        assert_eq!(names(&pins), vec!["visible"]);
    }

    #[test]
    fn test_scan_ignores_virtualenv_pins() {
        let dir = tempdir().unwrap();
        let venv = dir.path().join(".venv/lib/site");
        fs::create_dir_all(&venv).unwrap();
        fs::write(venv.join("requirements.txt"), "requests==2.31.0\n").unwrap();

        assert!(scan(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_scan_empty_project() {
        let dir = tempdir().unwrap();
        assert!(scan(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_scan_malformed_package_json_errors() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("package.json"), "{not json").unwrap();
        assert!(scan(dir.path()).is_err());
    }
}
