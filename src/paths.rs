use std::path::PathBuf;

const DATA_DIR: &str = ".tether";

/// Resolve the tether data directory (`~/.tether`), falling back to the
/// current directory when no home is resolvable (containers, stripped envs).
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR)
}

pub fn config_file() -> PathBuf {
    data_dir().join("config.toml")
}

pub fn sessions_file() -> PathBuf {
    data_dir().join("sessions.json")
}

pub fn responses_dir() -> PathBuf {
    data_dir().join("responses")
}
