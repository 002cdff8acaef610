use crate::controller::SessionOptions;
use facecap_core::GuidanceSequence;
use facecap_hw::{FormatRequest, MOTION_JPEG, RAW_YUYV};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Capture configuration: defaults, then an optional TOML file, then
/// `FACECAP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Base URL of the registration backend.
    pub server_url: String,
    /// Path template; `{subject}` is replaced by the encoded subject id.
    pub register_path: String,
    /// Spacing of the guidance steps.
    pub step_interval_ms: u64,
    /// Ordered media types to try when arming the recorder.
    pub encoding_preferences: Vec<String>,
    /// Used when no preference is supported.
    pub default_media_type: String,
    /// Overall HTTP timeout. Unset leaves the transport default.
    pub upload_timeout_secs: Option<u64>,
    /// Start recording as soon as the camera is ready.
    pub auto_start: bool,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            server_url: "http://localhost:8000".to_string(),
            register_path: "/faces/register_video/{subject}".to_string(),
            step_interval_ms: 3000,
            encoding_preferences: vec![
                "video/webm;codecs=vp9".to_string(),
                "video/webm;codecs=vp8".to_string(),
                MOTION_JPEG.to_string(),
                RAW_YUYV.to_string(),
            ],
            default_media_type: "video/webm".to_string(),
            upload_timeout_secs: None,
            auto_start: true,
            frame_width: 640,
            frame_height: 480,
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `env` for every variable lookup.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match config_path(&env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(&env);
        Ok(config)
    }

    /// A missing file yields the defaults; a malformed one is an error.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(?path, "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(?path, "loaded config");
        Ok(config)
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("FACECAP_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = env("FACECAP_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = env("FACECAP_REGISTER_PATH") {
            self.register_path = v;
        }
        if let Some(v) = env("FACECAP_ENCODING_PREFERENCES") {
            self.encoding_preferences = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = env("FACECAP_DEFAULT_MEDIA_TYPE") {
            self.default_media_type = v;
        }
        if let Some(v) = env("FACECAP_AUTO_START") {
            self.auto_start = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        self.step_interval_ms = env_parse(env, "FACECAP_STEP_INTERVAL_MS", self.step_interval_ms);
        self.frame_width = env_parse(env, "FACECAP_FRAME_WIDTH", self.frame_width);
        self.frame_height = env_parse(env, "FACECAP_FRAME_HEIGHT", self.frame_height);
        if let Some(secs) = env("FACECAP_UPLOAD_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.upload_timeout_secs = Some(secs);
        }
    }

    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms)
    }

    pub fn upload_timeout(&self) -> Option<Duration> {
        self.upload_timeout_secs.map(Duration::from_secs)
    }

    pub fn format_request(&self) -> FormatRequest {
        FormatRequest {
            width: self.frame_width,
            height: self.frame_height,
        }
    }

    /// The registration sequence at the configured spacing.
    pub fn sequence(&self) -> GuidanceSequence {
        GuidanceSequence::registration(self.step_interval())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            encoding_preferences: self.encoding_preferences.clone(),
            default_media_type: self.default_media_type.clone(),
            sequence: self.sequence(),
            auto_start: self.auto_start,
        }
    }
}

fn config_path(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = env("FACECAP_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let base = env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("facecap").join("config.toml"))
}

/// Parse `key`, keeping `current` when unset or unparsable.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("facecap-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_any_source() {
        let config = Config::load_with(env_of(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.step_interval(), Duration::from_millis(3000));
        assert_eq!(config.upload_timeout(), None);
        assert_eq!(config.sequence().len(), 5);
        assert_eq!(config.sequence().total(), Duration::from_millis(15000));
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let config = Config::load_with(env_of(&[(
            "FACECAP_CONFIG",
            "/nonexistent/facecap/config.toml",
        )]))
        .unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let path = temp_file(
            "partial.toml",
            "server_url = \"http://backend:9000\"\nauto_start = false\nupload_timeout_secs = 30\n",
        );
        let config =
            Config::load_with(env_of(&[("FACECAP_CONFIG", path.to_str().unwrap())])).unwrap();
        assert_eq!(config.server_url, "http://backend:9000");
        assert!(!config.auto_start);
        assert_eq!(config.upload_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.camera_device, "/dev/video0");
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let path = temp_file("broken.toml", "step_interval_ms = \"soon\"\n");
        let err = Config::load_with(env_of(&[("FACECAP_CONFIG", path.to_str().unwrap())]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_xdg_path_is_used() {
        let path = temp_file("xdg-probe.toml", "");
        let xdg = path.parent().unwrap().join("xdg");
        std::fs::create_dir_all(xdg.join("facecap")).unwrap();
        std::fs::write(xdg.join("facecap/config.toml"), "frame_width = 1280\n").unwrap();

        let config =
            Config::load_with(env_of(&[("XDG_CONFIG_HOME", xdg.to_str().unwrap())])).unwrap();
        assert_eq!(config.frame_width, 1280);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::load_with(env_of(&[
            ("FACECAP_CAMERA_DEVICE", "/dev/video2"),
            ("FACECAP_STEP_INTERVAL_MS", "1500"),
            ("FACECAP_ENCODING_PREFERENCES", "video/mp4, video/x-motion-jpeg"),
            ("FACECAP_AUTO_START", "false"),
            ("FACECAP_UPLOAD_TIMEOUT_SECS", "20"),
        ]))
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.step_interval_ms, 1500);
        assert_eq!(
            config.encoding_preferences,
            vec!["video/mp4".to_string(), "video/x-motion-jpeg".to_string()]
        );
        assert!(!config.auto_start);
        assert_eq!(config.upload_timeout_secs, Some(20));

        let options = config.session_options();
        assert_eq!(options.sequence.total(), Duration::from_millis(7500));
        assert!(!options.auto_start);
    }

    #[test]
    fn test_unparsable_env_keeps_prior_value() {
        let config = Config::load_with(env_of(&[
            ("FACECAP_STEP_INTERVAL_MS", "fast"),
            ("FACECAP_FRAME_HEIGHT", "-1"),
            ("FACECAP_UPLOAD_TIMEOUT_SECS", "never"),
        ]))
        .unwrap();
        assert_eq!(config.step_interval_ms, 3000);
        assert_eq!(config.frame_height, 480);
        assert_eq!(config.upload_timeout_secs, None);
    }
}
