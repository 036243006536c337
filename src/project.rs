//! Per-project version pinning.
//!
//! Projects pin a runtime version through `.nvmrc`, `.node-version` or the
//! `engines.node` field of `package.json`. Discovery walks from the given
//! directory up to the filesystem root and stops at the first pin found;
//! within one directory the dotfiles win over `package.json`.

use crate::error::Result;
use crate::resolver::VersionSpec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A version pin discovered in a project tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectContext {
    pub spec: VersionSpec,
    /// The file the pin was read from.
    pub source: PathBuf,
    /// `name` from the nearest `package.json`, when one exists.
    pub project_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PackageJson {
    name: Option<String>,
    #[serde(default)]
    engines: Engines,
}

#[derive(Debug, Default, Deserialize)]
struct Engines {
    node: Option<String>,
}

/// Find the nearest version pin at or above `start`.
///
/// Returns `Ok(None)` when no ancestor pins a version. A pin file with
/// unparseable content is an error, not a skip: silently ignoring it
/// would run a different runtime than the project asked for.
pub fn discover(start: &Path) -> Result<Option<ProjectContext>> {
    for dir in start.ancestors() {
        if let Some(context) = pin_in_dir(dir)? {
            debug!("project pin {} from {}", context.spec, context.source.display());
            return Ok(Some(context));
        }
    }
    Ok(None)
}

fn pin_in_dir(dir: &Path) -> Result<Option<ProjectContext>> {
    let package = read_package_json(dir)?;
    let project_name = package.as_ref().and_then(|p| p.name.clone());

    for file_name in [".nvmrc", ".node-version"] {
        let path = dir.join(file_name);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            return Ok(Some(ProjectContext {
                spec: VersionSpec::parse(content.trim())?,
                source: path,
                project_name,
            }));
        }
    }

    if let Some(package) = package {
        if let Some(node) = package.engines.node {
            return Ok(Some(ProjectContext {
                spec: VersionSpec::parse(&node)?,
                source: dir.join("package.json"),
                project_name,
            }));
        }
    }
    Ok(None)
}

/// Read and parse `package.json` in `dir`, if present. Malformed JSON is
/// skipped here since the file may not even be a Node manifest.
fn read_package_json(dir: &Path) -> Result<Option<PackageJson>> {
    let path = dir.join("package.json");
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content).ok())
}
