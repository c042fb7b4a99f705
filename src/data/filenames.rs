//! Template-driven data file naming.
//!
//! Templates use `strfmt` syntax and may reference any counter reported by
//! [`AcquisitionContext::get_counters`](crate::data::manager::AcquisitionContext::get_counters)
//! as well as experiment variables:
//!
//! ```text
//! {proposal}_{scancounter:0>8}.dat
//! data_{pointcounter:0>6}.csv
//! ```
//!
//! The first template names the canonical file; every further template becomes a
//! hard link (symbolic link fallback) to it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::{ScanError, ScanResult};

/// A created data file.
#[derive(Debug)]
pub struct DataFile {
    /// File name relative to the data root
    pub shortpath: String,
    /// Absolute path of the canonical file
    pub filepath: PathBuf,
    /// Open handle, truncated on creation
    pub file: File,
}

/// Expands file name templates below a data root.
#[derive(Debug, Clone, Default)]
pub struct FileNamer {
    root: PathBuf,
    vars: HashMap<String, String>,
}

impl FileNamer {
    /// Namer rooted at `root` with the given experiment variables.
    pub fn new(root: impl Into<PathBuf>, vars: HashMap<String, String>) -> Self {
        Self {
            root: root.into(),
            vars,
        }
    }

    /// Data root all names are relative to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Add or replace a template variable.
    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    fn variables(&self, counters: &HashMap<String, u64>) -> HashMap<String, String> {
        let mut vars = self.vars.clone();
        for (key, value) in counters {
            vars.insert(key.clone(), value.to_string());
        }
        vars
    }

    /// Expand every template against counters and experiment variables.
    pub fn expand_name_templates(
        &self,
        templates: &[String],
        counters: &HashMap<String, u64>,
    ) -> ScanResult<Vec<String>> {
        let vars = self.variables(counters);
        templates
            .iter()
            .map(|template| {
                strfmt::strfmt(template, &vars)
                    .map_err(|e| ScanError::Template(format!("'{}': {}", template, e)))
            })
            .collect()
    }

    /// Canonical short name and full paths of all expanded templates.
    ///
    /// Paths are `root/subdirs.../name`.
    pub fn get_filenames(
        &self,
        templates: &[String],
        counters: &HashMap<String, u64>,
        subdirs: &[&str],
    ) -> ScanResult<(String, Vec<PathBuf>)> {
        let names = self.expand_name_templates(templates, counters)?;
        let shortname = names
            .first()
            .cloned()
            .ok_or_else(|| ScanError::Template("no file name templates given".to_string()))?;
        let mut dir = self.root.clone();
        for sub in subdirs {
            dir.push(sub);
        }
        let paths = names.iter().map(|name| dir.join(name)).collect();
        Ok((shortname, paths))
    }

    /// Create the canonical data file and link the remaining names to it.
    pub fn create_data_file(
        &self,
        templates: &[String],
        counters: &HashMap<String, u64>,
        subdirs: &[&str],
    ) -> ScanResult<DataFile> {
        let (shortname, paths) = self.get_filenames(templates, counters, subdirs)?;
        let (filepath, links) = match paths.split_first() {
            Some((first, rest)) => (first.clone(), rest),
            None => return Err(ScanError::Template("no file name templates given".to_string())),
        };
        if let Some(parent) = filepath.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&filepath)?;
        link_files(&filepath, links);

        let shortpath = subdirs
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(shortname))
            .collect::<Vec<_>>()
            .join("/");
        tracing::debug!(path = %filepath.display(), "Created data file");
        Ok(DataFile {
            shortpath,
            filepath,
            file,
        })
    }
}

/// Make every path in `links` refer to `source`.
///
/// Hard links are preferred; where they fail (e.g. across file systems) a symbolic
/// link is tried. Failures are logged and otherwise ignored.
pub fn link_files(source: &Path, links: &[PathBuf]) {
    for link in links {
        if let Some(parent) = link.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                tracing::warn!(link = %link.display(), error = %e, "Cannot create link directory");
                continue;
            }
        }
        if link.exists() {
            let _ = fs::remove_file(link);
        }
        if let Err(hard_err) = fs::hard_link(source, link) {
            if let Err(sym_err) = symlink(source, link) {
                tracing::warn!(
                    source = %source.display(),
                    link = %link.display(),
                    hard = %hard_err,
                    symbolic = %sym_err,
                    "Could not link data file"
                );
            }
        }
    }
}

#[cfg(unix)]
fn symlink(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(windows)]
fn symlink(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(source, link)
}
