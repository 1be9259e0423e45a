use std::fs;
use std::path::{Path, PathBuf};

use crate::keel_home::{keel_config_path, resolve_keel_home_dir};

const KEEL_TOML_SAMPLE: &str = include_str!("../keel.toml.sample");

pub fn run_config_init(conf_dir: Option<PathBuf>) -> Result<(), String> {
    let keel_home_dir = resolve_keel_home_dir(conf_dir.as_deref());

    for path in init_directories(&keel_home_dir) {
        fs::create_dir_all(&path)
            .map_err(|error| format!("create {} failed: {error}", path.display()))?;
        println!("created: {}", path.display());
    }

    let config_path = keel_config_path(&keel_home_dir);
    if config_path.exists() {
        println!("kept: {}", config_path.display());
    } else {
        fs::write(&config_path, KEEL_TOML_SAMPLE)
            .map_err(|error| format!("write {} failed: {error}", config_path.display()))?;
        println!("created: {}", config_path.display());
    }

    Ok(())
}

fn init_directories(keel_home_dir: &Path) -> Vec<PathBuf> {
    vec![
        keel_home_dir.to_path_buf(),
        keel_home_dir.join("threads"),
        keel_home_dir.join("logs"),
    ]
}
