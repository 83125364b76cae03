//! This module owns the "available"/"enabled" directory pairs that nginx reads its
//! configuration from.
//!
//! Everything in a module's available directory is managed by the gateway.  The enabled
//! directory may hold other, unmanaged files (e.g. the distribution's default site); the gateway
//! only ever touches enabled entries whose names it manages.
use crate::util::{absolute, link_or_file_exists, list_file_names, remove_if_present};
use crate::{config_path, error, Result};
use log::{debug, trace};
use snafu::ResultExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// The configuration namespaces the gateway manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigModule {
    /// HTTP server, upstream and location blocks.
    Sites,
    /// TCP/UDP stream blocks.
    Streams,
}

/// A pair of directories: `available` holds the materialized files, `enabled` holds links to
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLayout {
    pub available: PathBuf,
    pub enabled: PathBuf,
}

impl ModuleLayout {
    pub fn new<P1, P2>(available: P1, enabled: P2) -> Self
    where
        P1: Into<PathBuf>,
        P2: Into<PathBuf>,
    {
        Self {
            available: available.into(),
            enabled: enabled.into(),
        }
    }

    /// Creates both directories if they don't exist yet.
    pub async fn ensure(&self) -> Result<()> {
        for directory in [&self.available, &self.enabled] {
            fs::create_dir_all(directory)
                .await
                .context(error::CreateDirectorySnafu { directory })?;
        }
        Ok(())
    }

    /// Names of all managed files, including any leftover temporary files.
    pub async fn managed_files(&self) -> Result<Vec<String>> {
        list_file_names(&self.available).await
    }

    /// Removes every managed file along with its enabled link.  Anything already missing is
    /// treated as cleaned, so this is safe to re-run after an interrupted cycle.  Returns the
    /// number of available files removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for name in self.managed_files().await? {
            // Unlink first: an interruption then leaves an available file behind, which the next
            // clear picks up, rather than an orphaned link.
            if remove_if_present(self.enabled.join(&name)).await? {
                trace!("Removed link '{}'", self.enabled.join(&name).display());
            }
            if remove_if_present(self.available.join(&name)).await? {
                removed += 1;
            }
        }
        self.prune_dangling_links().await?;
        debug!(
            "Cleared {} file(s) from '{}'",
            removed,
            self.available.display()
        );
        Ok(removed)
    }

    /// Removes enabled links that point into our available directory at files that no longer
    /// exist.
    async fn prune_dangling_links(&self) -> Result<()> {
        let available = absolute(&self.available)?;
        for name in list_file_names(&self.enabled).await? {
            let link = self.enabled.join(&name);
            let target = match fs::read_link(&link).await {
                Ok(target) => target,
                // Not a link; not ours.
                Err(e) if e.kind() == ErrorKind::InvalidInput => continue,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e).context(error::ReadLinkSnafu { filepath: link }),
            };
            let target = if target.is_absolute() {
                target
            } else {
                self.enabled.join(target)
            };
            if target.parent() == Some(available.as_path())
                && !link_or_file_exists(&target).await?
            {
                debug!("Pruning dangling link '{}'", link.display());
                remove_if_present(&link).await?;
            }
        }
        Ok(())
    }

    /// Creates or replaces `available/filename`.  The content is written to a hidden temporary
    /// file first and renamed into place.
    pub async fn write<S: AsRef<str>>(&self, filename: &str, content: S) -> Result<PathBuf> {
        let filepath = config_path(&self.available, filename)?;
        let staging = self.available.join(format!(".{}.tmp", filename));

        fs::write(&staging, content.as_ref())
            .await
            .context(error::WriteFileSnafu { filepath: &staging })?;
        fs::rename(&staging, &filepath)
            .await
            .context(error::WriteFileSnafu {
                filepath: &filepath,
            })?;

        debug!("Wrote '{}'", filepath.display());
        Ok(filepath)
    }

    /// Links every managed file into the enabled directory, skipping names that are already
    /// linked.  Returns the number of links created.
    pub async fn enable_all(&self) -> Result<usize> {
        let available = absolute(&self.available)?;
        let mut created = 0;
        for name in self.managed_files().await? {
            if name.starts_with('.') {
                continue;
            }
            let target = available.join(&name);
            let link = self.enabled.join(&name);
            if create_link(&target, &link).await? {
                created += 1;
            }
        }
        Ok(created)
    }
}

/// Symlinks `link` to `target`.  An existing entry at `link` is left alone; returns whether a
/// link was created.
async fn create_link(target: &Path, link: &Path) -> Result<bool> {
    match fs::symlink(target, link).await {
        Ok(()) => {
            debug!("Linked '{}' -> '{}'", link.display(), target.display());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            trace!("'{}' already exists, skipping", link.display());
            Ok(false)
        }
        Err(e) => Err(e).context(error::CreateLinkSnafu { link, target }),
    }
}

/// A single configuration file living outside any managed directory, present or absent as a
/// whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingletonFile {
    pub available: PathBuf,
    pub enabled: PathBuf,
}

impl SingletonFile {
    pub fn new<P1, P2>(available: P1, enabled: P2) -> Self
    where
        P1: Into<PathBuf>,
        P2: Into<PathBuf>,
    {
        Self {
            available: available.into(),
            enabled: enabled.into(),
        }
    }

    pub async fn is_installed(&self) -> Result<bool> {
        Ok(link_or_file_exists(&self.available).await?
            && link_or_file_exists(&self.enabled).await?)
    }

    /// Writes the file and links it, leaving an existing file untouched.  Returns whether
    /// anything changed.
    pub async fn install<S: AsRef<str>>(&self, content: S) -> Result<bool> {
        let mut changed = false;
        if !link_or_file_exists(&self.available).await? {
            if let Some(parent) = self.available.parent() {
                fs::create_dir_all(parent)
                    .await
                    .context(error::CreateDirectorySnafu { directory: parent })?;
            }
            fs::write(&self.available, content.as_ref())
                .await
                .context(error::WriteFileSnafu {
                    filepath: &self.available,
                })?;
            changed = true;
        }
        changed |= create_link(&absolute(&self.available)?, &self.enabled).await?;
        Ok(changed)
    }

    /// Removes the link and the file, tolerating either being absent.  Returns whether anything
    /// was removed.
    pub async fn remove(&self) -> Result<bool> {
        let unlinked = remove_if_present(&self.enabled).await?;
        let removed = remove_if_present(&self.available).await?;
        Ok(unlinked || removed)
    }
}

/// Every path the gateway manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayLayout {
    pub sites: ModuleLayout,
    /// Present only when stream support is enabled.
    pub streams: Option<ModuleLayout>,
    pub exact_server_names: SingletonFile,
}

impl GatewayLayout {
    pub fn module(&self, module: ConfigModule) -> Option<&ModuleLayout> {
        match module {
            ConfigModule::Sites => Some(&self.sites),
            ConfigModule::Streams => self.streams.as_ref(),
        }
    }

    /// The enabled modules, sites first.
    pub fn modules(&self) -> impl Iterator<Item = (ConfigModule, &ModuleLayout)> {
        std::iter::once((ConfigModule::Sites, &self.sites)).chain(
            self.streams
                .iter()
                .map(|streams| (ConfigModule::Streams, streams)),
        )
    }

    pub async fn ensure(&self) -> Result<()> {
        for (_, module) in self.modules() {
            module.ensure().await?;
        }
        Ok(())
    }

    /// Clears every enabled module; returns the total number of files removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for (_, module) in self.modules() {
            removed += module.clear().await?;
        }
        Ok(removed)
    }

    pub async fn enable_all(&self) -> Result<usize> {
        let mut created = 0;
        for (_, module) in self.modules() {
            created += module.enable_all().await?;
        }
        Ok(created)
    }
}
