use std::path::{Path, PathBuf};

const DEFAULT_KEEL_HOME_DIR_NAME: &str = ".keel";
pub const KEEL_TOML: &str = "keel.toml";

pub fn resolve_keel_home_dir(conf_dir: Option<&Path>) -> PathBuf {
    conf_dir
        .map(resolve_keel_home_arg)
        .unwrap_or_else(default_keel_home_dir)
}

pub fn keel_config_path(keel_home_dir: &Path) -> PathBuf {
    keel_home_dir.join(KEEL_TOML)
}

/// Expands `~` and `~/…`; everything else is returned as given.
pub fn expand_home_path(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed == "~" {
        return home_dir();
    }
    if let Some(suffix) = trimmed.strip_prefix("~/") {
        return home_dir().join(suffix);
    }
    PathBuf::from(trimmed)
}

fn resolve_keel_home_arg(path: &Path) -> PathBuf {
    let expanded = expand_home_path(&path.to_string_lossy());
    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    }
}

fn default_keel_home_dir() -> PathBuf {
    home_dir().join(DEFAULT_KEEL_HOME_DIR_NAME)
}

fn home_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home);
    }
    if let Some(profile) = std::env::var_os("USERPROFILE") {
        return PathBuf::from(profile);
    }
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_override_is_used_directly() {
        let path = resolve_keel_home_dir(Some(Path::new("/tmp/keel-home")));
        assert_eq!(path, PathBuf::from("/tmp/keel-home"));
        assert_eq!(keel_config_path(&path), PathBuf::from("/tmp/keel-home/keel.toml"));
    }

    #[test]
    fn default_home_ends_with_dot_keel() {
        let path = resolve_keel_home_dir(None);
        assert!(
            path.ends_with(".keel"),
            "expected default keel home to end with .keel, got {}",
            path.display()
        );
    }

    #[test]
    fn relative_override_is_anchored_at_current_dir() {
        let path = resolve_keel_home_dir(Some(Path::new("conf")));
        assert!(path.is_absolute());
        assert!(path.ends_with("conf"));
    }
}
