use blobsync_core::SessionConfig;
use std::{fs, path::Path};
use tracing::warn;

pub const DEFAULT_SESSION_PATH: &str = "config/session.toml";

/// Load the session configuration from the default path.
pub fn load() -> SessionConfig {
    load_from_path(Path::new(DEFAULT_SESSION_PATH))
}

/// Load configuration from an explicit path, falling back to defaults on errors.
pub fn load_from_path(path: &Path) -> SessionConfig {
    match fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<SessionConfig>(&contents) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Failed to parse {}: {err}. Using defaults", path.display());
                SessionConfig::default()
            }
        },
        Err(err) => {
            if path != Path::new(DEFAULT_SESSION_PATH) {
                warn!("Failed to read {}: {err}. Using defaults", path.display());
            } else if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {err}. Using defaults", path.display());
            } else {
                warn!(
                    "Session config not found at {}. Using defaults",
                    path.display()
                );
            }
            SessionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "blobsync-{name}-{}.toml",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let path = temp_path("partial");
        fs::write(&path, "state_port = 6000\ninclude_self_in_broadcast = true\n").unwrap();

        let cfg = load_from_path(&path);
        assert_eq!(cfg.state_port, 6000);
        assert!(cfg.include_self_in_broadcast);
        assert_eq!(cfg.control_port, SessionConfig::default().control_port);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let path = temp_path("invalid");
        fs::write(&path, "state_port = \"not a port\"").unwrap();
        assert_eq!(load_from_path(&path), SessionConfig::default());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        assert_eq!(
            load_from_path(&temp_path("missing")),
            SessionConfig::default()
        );
    }

    #[test]
    fn shipped_config_parses() {
        let contents = include_str!("../config/session.toml");
        let cfg: SessionConfig = toml::from_str(contents).expect("shipped config parses");
        assert_eq!(cfg.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(cfg.control_port, 44446);
        assert_eq!(cfg.state_port, 50000);
        assert_eq!(cfg.idle_timeout_ticks, Some(250));
    }
}
