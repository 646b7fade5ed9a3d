use crate::error::RequestError;
use crate::models::{
    AudioFormat, AudioQuality, AudioSpec, Container, DownloadMode, DownloadRequest, ToolPaths,
    VideoSpec,
};
use anyhow::{anyhow, Context, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// The structure of our configuration file (config.toml)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub download: DownloadDefaults,
}

/// The last-used download options.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DownloadDefaults {
    pub mode: DownloadMode,
    pub resolution: u32,
    pub container: Container,
    pub audio_quality: AudioQuality,
    pub audio_format: AudioFormat,
    pub destination: PathBuf,
}

impl Default for DownloadDefaults {
    fn default() -> Self {
        // Use the 'directories' crate to find the user's download directory.
        let destination = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("downloads"));

        DownloadDefaults {
            mode: DownloadMode::Both,
            resolution: 1080,
            container: Container::Mp4,
            audio_quality: AudioQuality::Source,
            audio_format: AudioFormat::Opus,
            destination,
        }
    }
}

/// Per-download changes on top of [`DownloadDefaults`]. Unset fields keep
/// the saved value.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOverrides {
    pub mode: Option<DownloadMode>,
    pub resolution: Option<u32>,
    pub container: Option<Container>,
    pub audio_quality: Option<AudioQuality>,
    pub audio_format: Option<AudioFormat>,
    pub destination: Option<PathBuf>,
}

impl DownloadDefaults {
    pub fn with_overrides(&self, overrides: &DownloadOverrides) -> DownloadDefaults {
        DownloadDefaults {
            mode: overrides.mode.unwrap_or(self.mode),
            resolution: overrides.resolution.unwrap_or(self.resolution),
            container: overrides.container.unwrap_or(self.container),
            audio_quality: overrides.audio_quality.unwrap_or(self.audio_quality),
            audio_format: overrides.audio_format.unwrap_or(self.audio_format),
            destination: overrides
                .destination
                .clone()
                .unwrap_or_else(|| self.destination.clone()),
        }
    }

    /// Builds a request for `url` from these settings. Outside audio-only
    /// mode the audio is never transcoded.
    pub fn request_for(&self, url: &str) -> Result<DownloadRequest, RequestError> {
        let video = self.mode.wants_video().then_some(VideoSpec {
            resolution: self.resolution,
            container: self.container,
        });
        let audio = self.mode.wants_audio().then(|| AudioSpec {
            quality: self.audio_quality,
            format: match self.mode {
                DownloadMode::AudioOnly => self.audio_format,
                _ => AudioFormat::Source,
            },
        });
        DownloadRequest::new(url, self.destination.clone(), self.mode, video, audio)
    }
}

/// Reads and writes `config.toml`. All settings writes go through here.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// The store at the platform config directory, e.g.
    /// `~/Library/Application Support/dev.Downer.Downer/config.toml`.
    pub fn default_location() -> Result<Self> {
        let project_dirs = ProjectDirs::from("dev", "Downer", "Downer")
            .ok_or_else(|| anyhow!("Could not find a valid home directory to store config"))?;
        Ok(Self::at(project_dirs.config_dir().join("config.toml")))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        SettingsStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the configuration, writing the defaults first if no file exists.
    pub async fn load(&self) -> Result<Config> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            tracing::info!(
                "No config file found. Creating a default one at: {}",
                self.path.display()
            );
            let default_config = Config::default();
            self.save(&default_config).await?;
            return Ok(default_config);
        }

        let config_content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read config file at {}", self.path.display()))?;
        let config: Config = toml::from_str(&config_content)
            .map_err(|e| anyhow!("Failed to parse config file at {}: {}", self.path.display(), e))?;

        Ok(config)
    }

    pub async fn save(&self, config: &Config) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let toml_string = toml::to_string_pretty(config)?;
        fs::write(&self.path, toml_string)
            .await
            .with_context(|| format!("Failed to write config file at {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::at(dir.path().join("nested/config.toml"));

        let config = store.load().await.unwrap();
        assert_eq!(config, Config::default());
        assert!(store.path().exists());
        assert_eq!(config.tools.yt_dlp, PathBuf::from("/opt/homebrew/bin/yt-dlp"));
        assert_eq!(config.download.resolution, 1080);
        assert_eq!(config.download.audio_format, AudioFormat::Opus);
    }

    #[tokio::test]
    async fn save_then_load_keeps_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::at(dir.path().join("config.toml"));
        let mut config = Config::default();
        config.download.mode = DownloadMode::AudioOnly;
        config.download.audio_quality = AudioQuality::Ceiling(70);
        config.tools.ffmpeg = PathBuf::from("/usr/local/bin/ffmpeg");

        store.save(&config).await.unwrap();
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("audio_quality = \"70k\""));
        assert!(text.contains("mode = \"audio_only\""));
        assert_eq!(store.load().await.unwrap(), config);
    }

    #[tokio::test]
    async fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::at(dir.path().join("config.toml"));
        std::fs::write(store.path(), "[download]\nresolution = 720\n").unwrap();

        let config = store.load().await.unwrap();
        assert_eq!(config.download.resolution, 720);
        assert_eq!(config.download.container, Container::Mp4);
        assert_eq!(config.tools, ToolPaths::default());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::at(dir.path().join("config.toml"));
        std::fs::write(store.path(), "[download]\naudio_quality = \"loud\"\n").unwrap();
        let err = store.load().await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let defaults = DownloadDefaults {
            destination: PathBuf::from("/tmp"),
            ..DownloadDefaults::default()
        };
        let merged = defaults.with_overrides(&DownloadOverrides {
            resolution: Some(480),
            audio_format: Some(AudioFormat::Mp3),
            ..Default::default()
        });
        assert_eq!(merged.resolution, 480);
        assert_eq!(merged.audio_format, AudioFormat::Mp3);
        assert_eq!(merged.mode, DownloadMode::Both);
        assert_eq!(merged.destination, PathBuf::from("/tmp"));
    }

    #[test]
    fn requests_outside_audio_mode_never_transcode() {
        let defaults = DownloadDefaults {
            audio_format: AudioFormat::Mp3,
            ..DownloadDefaults::default()
        };
        let request = defaults.request_for("https://example.com/v").unwrap();
        assert_eq!(request.audio().map(|a| a.format), Some(AudioFormat::Source));

        let audio_only = DownloadDefaults { mode: DownloadMode::AudioOnly, ..defaults.clone() };
        let request = audio_only.request_for("https://example.com/v").unwrap();
        assert_eq!(request.audio().map(|a| a.format), Some(AudioFormat::Mp3));
        assert!(request.video().is_none());

        let video_only = DownloadDefaults { mode: DownloadMode::VideoOnly, ..defaults };
        let request = video_only.request_for("https://example.com/v").unwrap();
        assert!(request.audio().is_none());
        assert_eq!(request.video().map(|v| v.resolution), Some(1080));
    }
}
