// src/infra/paths.rs — Config and data directory resolution
//
// All paths respect the WHARF_HOME environment variable for isolation.
// When WHARF_HOME is set, config and data live under that directory.
// When unset, config uses ~/.wharf/ and data uses XDG_DATA_HOME/wharf.

use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;
use std::sync::OnceLock;

static PROJECT_DIRS: OnceLock<Option<ProjectDirs>> = OnceLock::new();

fn project_dirs() -> Option<&'static ProjectDirs> {
    PROJECT_DIRS
        .get_or_init(|| ProjectDirs::from("", "", "wharf"))
        .as_ref()
}

fn wharf_home() -> Option<PathBuf> {
    std::env::var_os("WHARF_HOME").map(PathBuf::from)
}

/// Home directory, or the working directory when none can be determined.
pub fn dirs_home() -> PathBuf {
    BaseDirs::new()
        .map(|b| b.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Configuration directory: $WHARF_HOME/ or ~/.wharf/
pub fn config_dir() -> PathBuf {
    if let Some(home) = wharf_home() {
        return home;
    }
    dirs_home().join(".wharf")
}

/// Data directory: $WHARF_HOME/data/ or ~/.local/share/wharf/
pub fn data_dir() -> PathBuf {
    if let Some(home) = wharf_home() {
        return home.join("data");
    }
    match project_dirs() {
        Some(dirs) => dirs.data_local_dir().to_path_buf(),
        None => config_dir().join("data"),
    }
}

/// Default database path when `[database]` has no explicit path.
pub fn db_path() -> PathBuf {
    data_dir().join("wharf.db")
}

/// Root for filesystem storage backends without an explicit root.
pub fn storage_dir() -> PathBuf {
    data_dir().join("storage")
}

pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_under_config_dir() {
        assert!(config_file_path().starts_with(config_dir()));
        assert!(config_file_path().ends_with("config.toml"));
    }

    #[test]
    fn test_db_under_data_dir() {
        assert!(db_path().starts_with(data_dir()));
    }
}
