use std::env;
use std::path::PathBuf;

use super::StorageError;

/// Resolves `~/`, `$HOME` and `${HOME}` prefixes against the `HOME` variable.
pub(crate) fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    let home = || env::var("HOME").map_err(|_| StorageError::HomeDirectoryUnavailable);

    if raw_path == "~" {
        return home().map(PathBuf::from);
    }
    if let Some(rest) = raw_path.strip_prefix("~/") {
        return Ok(PathBuf::from(home()?).join(rest));
    }
    for prefix in ["${HOME}", "$HOME"] {
        if let Some(rest) = raw_path.strip_prefix(prefix) {
            if rest.is_empty() || rest.starts_with('/') {
                return Ok(PathBuf::from(format!("{}{rest}", home()?)));
            }
        }
    }

    Ok(PathBuf::from(raw_path))
}

/// Directory holding one database: `<root>/<database>`.
pub(crate) fn resolve_data_path(raw_root: &str, database: &str) -> Result<PathBuf, StorageError> {
    let database = database.trim();
    if database.is_empty() {
        return Err(StorageError::MissingDatabaseName);
    }
    Ok(expand_home_path(raw_root.trim())?.join(database))
}
