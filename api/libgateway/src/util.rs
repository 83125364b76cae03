use crate::{error, Result};
use futures::{Stream, StreamExt};
use snafu::ResultExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};
use tokio_stream::wrappers::ReadDirStream;

/// Streams the entries of `dir`.  A directory that doesn't exist is treated as empty.
pub(crate) fn dir_entries<P: AsRef<Path>>(dir: P) -> impl Stream<Item = Result<DirEntry>> {
    let directory = dir.as_ref().to_owned();
    async_stream::stream! {
        let read_dir = match fs::read_dir(&directory).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                yield Err::<DirEntry, _>(e)
                    .context(error::TraverseDirectorySnafu { directory: &directory });
                return;
            }
        };

        let mut entries = ReadDirStream::new(read_dir);
        while let Some(entry) = entries.next().await {
            yield entry.context(error::TraverseDirectorySnafu { directory: &directory });
        }
    }
}

/// Collects the names of every non-directory entry (files and links, dangling or not) in a
/// directory, sorted so callers act on them in a stable order.
pub(crate) async fn list_file_names<P: AsRef<Path>>(dir: P) -> Result<Vec<String>> {
    let entries = dir_entries(dir);
    futures::pin_mut!(entries);

    let mut names = Vec::new();
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        let file_type = entry
            .file_type()
            .await
            .context(error::ReadFileMetadataSnafu {
                filepath: entry.path(),
            })?;
        if !file_type.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Resolves a relative path against the working directory.  Link targets have to be absolute,
/// since a relative target is resolved from the link's own directory.
pub(crate) fn absolute<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        return Ok(path.to_owned());
    }
    let cwd = std::env::current_dir().context(error::CurrentDirectorySnafu)?;
    Ok(cwd.join(path))
}

/// Removes a file or link, treating an already-missing path as success.  Returns whether
/// anything was removed.
pub(crate) async fn remove_if_present<P: AsRef<Path>>(path: P) -> Result<bool> {
    match fs::remove_file(path.as_ref()).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).context(error::RemoveFileSnafu {
            filepath: path.as_ref(),
        }),
    }
}

/// Returns true if something (including a dangling link) exists at the path.
pub(crate) async fn link_or_file_exists<P: AsRef<Path>>(path: P) -> Result<bool> {
    match fs::symlink_metadata(path.as_ref()).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).context(error::ReadFileMetadataSnafu {
            filepath: path.as_ref(),
        }),
    }
}
