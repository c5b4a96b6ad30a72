//! Whole-file replacement through a sibling temp file

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::PersistenceError;

/// Replace `path` with `contents`. Readers see the old file or the new one,
/// never a partial write. The temp file is removed on any failure.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = NamedTempFile::new_in(dir).map_err(|e| PersistenceError::io(dir, e))?;
    temp.write_all(contents)
        .map_err(|e| PersistenceError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| PersistenceError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| PersistenceError::io(path, e.error))?;
    Ok(())
}
