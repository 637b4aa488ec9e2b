//! Where a node's configuration layers live.
//!
//! A rhyolite node is configured relative to its **node home**, the
//! directory holding its data and log. Two files live there:
//! `rhyolite.toml` (the node's checked-in configuration) and
//! `rhyolite.local.toml` (machine-local overrides, kept out of version
//! control). A per-user defaults file in the XDG config directory sits
//! below both.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

/// Per-user defaults shared by every node this user runs. `None` when
/// the platform exposes no home directory (e.g. a bare container).
pub fn user_config_file() -> Option<PathBuf> {
    ProjectDirs::from("dev", "Rhyolite", "rhyolite")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// The node's own configuration file.
pub fn node_config_file(node_home: impl AsRef<Path>) -> PathBuf {
    node_home.as_ref().join("rhyolite.toml")
}

/// Machine-local overrides for this node.
pub fn local_config_file(node_home: impl AsRef<Path>) -> PathBuf {
    node_home.as_ref().join("rhyolite.local.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_layers_sit_in_the_node_home() {
        let home = Path::new("/srv/rhyolite/n2");
        assert_eq!(
            node_config_file(home),
            PathBuf::from("/srv/rhyolite/n2/rhyolite.toml")
        );
        assert_eq!(
            local_config_file(home),
            PathBuf::from("/srv/rhyolite/n2/rhyolite.local.toml")
        );
    }

    #[test]
    fn user_config_file_is_named_after_the_project() {
        if let Some(path) = user_config_file() {
            assert!(path.to_string_lossy().contains("rhyolite"));
            assert!(path.ends_with("config.toml"));
        }
    }
}
