//! Directory Layout Module
//!
//! Each capture thread sees its files through two stable logical roots under
//! the base directory, `PKT<id>` and `IDX<id>`, which are symlinks to the
//! physical directories named in its configuration. Index artifacts share
//! their blockfile's base name.

use crate::config::ThreadConfig;
use crate::{Result, TrackerError};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

pub const PACKET_PREFIX: &str = "PKT";
pub const INDEX_PREFIX: &str = "IDX";

/// Logical roots of one capture thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadLayout {
    pub packet_path: PathBuf,
    pub index_path: PathBuf,
}

impl ThreadLayout {
    pub fn for_thread(base_dir: &Path, id: usize) -> Self {
        Self {
            packet_path: base_dir.join(format!("{}{}", PACKET_PREFIX, id)),
            index_path: base_dir.join(format!("{}{}", INDEX_PREFIX, id)),
        }
    }

    pub fn packet_file(&self, name: &str) -> PathBuf {
        self.packet_path.join(name)
    }

    pub fn index_file(&self, name: &str) -> PathBuf {
        self.index_path.join(name)
    }

    /// Create the configured directories if needed and link the logical
    /// roots to them
    pub fn create_links(&self, id: usize, conf: &ThreadConfig) -> Result<()> {
        make_dir_if_necessary(&conf.packets_directory).map_err(|e| {
            TrackerError::SetupError(format!(
                "thread {} could not create packet directory: {}",
                id, e
            ))
        })?;
        link_dir(&conf.packets_directory, &self.packet_path).map_err(|e| {
            TrackerError::SetupError(format!("thread {} packet link: {}", id, e))
        })?;

        make_dir_if_necessary(&conf.index_directory).map_err(|e| {
            TrackerError::SetupError(format!(
                "thread {} could not create index directory: {}",
                id, e
            ))
        })?;
        link_dir(&conf.index_directory, &self.index_path).map_err(|e| {
            TrackerError::SetupError(format!("thread {} index link: {}", id, e))
        })?;

        info!(
            "Thread {} layout: {} -> {}, {} -> {}",
            id,
            self.packet_path.display(),
            conf.packets_directory.display(),
            self.index_path.display(),
            conf.index_directory.display()
        );
        Ok(())
    }
}

/// Create `dir` if it does not exist; fail if it exists and is not a directory
pub fn make_dir_if_necessary(dir: &Path) -> std::result::Result<(), String> {
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(format!("{:?} is not a directory", dir)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("Directory does not exist, creating: {}", dir.display());
            fs::create_dir_all(dir).map_err(|e| {
                error!("Directory creation failed: {}", dir.display());
                format!("could not create directory {:?}: {}", dir, e)
            })?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("could not set permissions on {:?}: {}", dir, e))
        }
        Err(e) => Err(format!("could not stat directory {:?}: {}", dir, e)),
    }
}

/// Symlink `link` to `target`. An existing link that already resolves to
/// `target` is kept.
pub fn link_dir(target: &Path, link: &Path) -> std::result::Result<(), String> {
    if let Ok(existing) = fs::read_link(link) {
        if existing == target {
            debug!("Link {} already points at {}", link.display(), target.display());
            return Ok(());
        }
        return Err(format!(
            "{:?} already links to {:?}, not {:?}",
            link, existing, target
        ));
    }
    symlink(target, link).map_err(|e| {
        format!(
            "couldn't create symlink {:?} to directory {:?}: {}",
            link, target, e
        )
    })
}

/// Map an index artifact's file name back to its blockfile base name.
///
/// Dot-files are the writer's in-progress temporaries and are never
/// blockfiles.
pub fn blockfile_name_from_index_name(index_name: &str) -> Option<&str> {
    if index_name.is_empty() || index_name.starts_with('.') {
        return None;
    }
    Some(index_name)
}

/// Base names of every complete blockfile, by index artifact
pub fn list_blockfile_names(index_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(index_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            debug!("Skipping non UTF-8 index name {:?}", entry.file_name());
            continue;
        };
        if let Some(name) = blockfile_name_from_index_name(file_name) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
