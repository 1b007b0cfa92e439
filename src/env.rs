//! Environment constants and path utilities for autopost.
//!
//! Centralizes the file names, directories and environment variables used by
//! configuration discovery and logging setup.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git, .vscode)
pub const APP_DIR_NAME: &str = ".autopost";

/// Configuration file name inside [`APP_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Stand-alone configuration file looked up in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "autopost.toml";

/// System-wide configuration directory (Unix-like systems)
pub const SYSTEM_CONFIG_DIR: &str = "/etc/autopost";

/// Environment variable holding the tracing filter directive
pub const LOG_ENV_VAR: &str = "AUTOPOST_LOG";

/// Filter used when [`LOG_ENV_VAR`] is unset or invalid
pub const DEFAULT_LOG_FILTER: &str = "autopost=info";

/// Build the .autopost directory path from a base directory
pub fn app_dir_path(base: &Path) -> PathBuf {
    base.join(APP_DIR_NAME)
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    app_dir_path(home_dir)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// `./autopost.toml`
pub fn local_standalone_config_path(current_dir: &Path) -> PathBuf {
    current_dir.join(LOCAL_CONFIG_FILE_NAME)
}

/// `./.autopost/config.toml`
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    app_dir_path(current_dir).join(CONFIG_FILE_NAME)
}

pub fn system_config_file_path() -> PathBuf {
    Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let home_dir = Path::new("/home/user");
        let current_dir = Path::new("/current/project");

        assert_eq!(
            user_config_file_path(home_dir),
            Path::new("/home/user/.autopost/config.toml")
        );
        assert_eq!(
            local_config_file_path(current_dir),
            Path::new("/current/project/.autopost/config.toml")
        );
        assert_eq!(
            local_standalone_config_path(current_dir),
            Path::new("/current/project/autopost.toml")
        );
        assert_eq!(system_config_file_path(), Path::new("/etc/autopost/config.toml"));
    }
}
