use crate::config::DownloadOverrides;
use crate::error::RequestError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

static BITRATE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<kbps>\d{1,5})\s*[kK]?$").unwrap());

static RESOLUTION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<height>\d{1,5})[pP]?$").unwrap());

/// Resolution ceilings offered to users, highest first.
pub const RESOLUTIONS: [u32; 7] = [4320, 2160, 1080, 720, 480, 360, 240];

// ===================================================================
//                          DOWNLOAD OPTIONS
// ===================================================================

/// Which streams a download should fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DownloadMode {
    AudioOnly,
    VideoOnly,
    Both,
}

impl DownloadMode {
    pub fn wants_video(self) -> bool {
        self != DownloadMode::AudioOnly
    }

    pub fn wants_audio(self) -> bool {
        self != DownloadMode::VideoOnly
    }

    pub fn label(self) -> &'static str {
        match self {
            DownloadMode::AudioOnly => "Audio Only",
            DownloadMode::VideoOnly => "Video Only",
            DownloadMode::Both => "Video + Audio",
        }
    }
}

/// Target container for video downloads. Never re-encodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mkv,
    Webm,
}

impl Container {
    pub fn as_str(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
            Container::Webm => "webm",
        }
    }
}

/// Upper bound on the audio stream bitrate, or `Source` for the best available.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AudioQuality {
    Source,
    Ceiling(u32),
}

impl AudioQuality {
    pub const PRESETS: [AudioQuality; 4] = [
        AudioQuality::Source,
        AudioQuality::Ceiling(128),
        AudioQuality::Ceiling(70),
        AudioQuality::Ceiling(50),
    ];

    pub fn label(self) -> String {
        match self {
            AudioQuality::Source => "Best available".to_string(),
            AudioQuality::Ceiling(kbps) => format!("Up to {} kbps", kbps),
        }
    }
}

impl fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioQuality::Source => f.write_str("source"),
            AudioQuality::Ceiling(kbps) => write!(f, "{}k", kbps),
        }
    }
}

impl FromStr for AudioQuality {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("source") {
            return Ok(AudioQuality::Source);
        }
        BITRATE_REGEX
            .captures(s)
            .and_then(|caps| caps["kbps"].parse::<u32>().ok())
            .filter(|kbps| *kbps > 0)
            .map(AudioQuality::Ceiling)
            .ok_or_else(|| RequestError::InvalidAudioQuality(s.to_string()))
    }
}

impl TryFrom<String> for AudioQuality {
    type Error = RequestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AudioQuality> for String {
    fn from(value: AudioQuality) -> Self {
        value.to_string()
    }
}

/// Output format for audio. `Source` keeps the downloaded stream untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Source,
    Mp3,
    M4a,
    Opus,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 4] = [
        AudioFormat::Source,
        AudioFormat::Mp3,
        AudioFormat::M4a,
        AudioFormat::Opus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AudioFormat::Source => "source",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Opus => "opus",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AudioFormat::Source => "Source (no transcode)",
            AudioFormat::Mp3 => "MP3",
            AudioFormat::M4a => "AAC (M4A)",
            AudioFormat::Opus => "Opus",
        }
    }
}

/// Parses a resolution ceiling such as `1080` or `1080p`.
pub fn parse_resolution(s: &str) -> Result<u32, RequestError> {
    RESOLUTION_REGEX
        .captures(s.trim())
        .and_then(|caps| caps["height"].parse::<u32>().ok())
        .filter(|height| *height > 0)
        .ok_or_else(|| RequestError::InvalidResolution(s.to_string()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSpec {
    /// Maximum stream height in pixels.
    pub resolution: u32,
    pub container: Container,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSpec {
    pub quality: AudioQuality,
    pub format: AudioFormat,
}

/// The streams a request fetches, with the settings each one needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StreamSelection {
    AudioOnly { audio: AudioSpec },
    VideoOnly { video: VideoSpec },
    Both { video: VideoSpec, audio: AudioSpec },
}

/// One download attempt. Built through [`DownloadRequest::new`], which
/// guarantees video settings are present iff the mode wants video and audio
/// settings iff the mode wants audio.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DownloadRequest {
    url: String,
    destination: PathBuf,
    #[serde(flatten)]
    selection: StreamSelection,
}

impl DownloadRequest {
    pub fn new(
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
        mode: DownloadMode,
        video: Option<VideoSpec>,
        audio: Option<AudioSpec>,
    ) -> Result<Self, RequestError> {
        let url = url.into().trim().to_string();
        if url.is_empty() {
            return Err(RequestError::EmptyUrl);
        }
        if matches!(video, Some(VideoSpec { resolution: 0, .. })) {
            return Err(RequestError::InvalidResolution("0".to_string()));
        }
        let selection = match (mode, video, audio) {
            (DownloadMode::AudioOnly, None, Some(audio)) => StreamSelection::AudioOnly { audio },
            (DownloadMode::VideoOnly, Some(video), None) => StreamSelection::VideoOnly { video },
            (DownloadMode::Both, Some(video), Some(audio)) => StreamSelection::Both { video, audio },
            (mode, video, _) if mode.wants_video() != video.is_some() => {
                return Err(RequestError::VideoSpecMismatch(mode));
            }
            (mode, _, _) => return Err(RequestError::AudioSpecMismatch(mode)),
        };
        Ok(DownloadRequest {
            url,
            destination: destination.into(),
            selection,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn selection(&self) -> &StreamSelection {
        &self.selection
    }

    pub fn mode(&self) -> DownloadMode {
        match self.selection {
            StreamSelection::AudioOnly { .. } => DownloadMode::AudioOnly,
            StreamSelection::VideoOnly { .. } => DownloadMode::VideoOnly,
            StreamSelection::Both { .. } => DownloadMode::Both,
        }
    }

    pub fn video(&self) -> Option<&VideoSpec> {
        match &self.selection {
            StreamSelection::VideoOnly { video } | StreamSelection::Both { video, .. } => Some(video),
            StreamSelection::AudioOnly { .. } => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioSpec> {
        match &self.selection {
            StreamSelection::AudioOnly { audio } | StreamSelection::Both { audio, .. } => Some(audio),
            StreamSelection::VideoOnly { .. } => None,
        }
    }
}

// ===================================================================
//                          TOOLS & COMMANDS
// ===================================================================

/// The external executables a download depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    YtDlp,
    Ffmpeg,
    Ffprobe,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Tool::YtDlp => "yt-dlp",
            Tool::Ffmpeg => "ffmpeg",
            Tool::Ffprobe => "ffprobe",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl ToolPaths {
    pub fn get(&self, tool: Tool) -> &Path {
        match tool {
            Tool::YtDlp => &self.yt_dlp,
            Tool::Ffmpeg => &self.ffmpeg,
            Tool::Ffprobe => &self.ffprobe,
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        let homebrew = Path::new("/opt/homebrew/bin");
        ToolPaths {
            yt_dlp: homebrew.join("yt-dlp"),
            ffmpeg: homebrew.join("ffmpeg"),
            ffprobe: homebrew.join("ffprobe"),
        }
    }
}

/// A fully resolved external invocation, ready to hand to the job runner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    /// Variables set on top of the inherited environment.
    pub environment: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Renders the command as one shell line, e.g. for logs and `--dry-run`.
    pub fn shell_line(&self) -> String {
        let mut line = format!(
            "cd {} && {}",
            escaped(&self.working_directory.to_string_lossy()),
            quoted(&self.executable.to_string_lossy())
        );
        for arg in &self.arguments {
            line.push(' ');
            if arg.starts_with('-') {
                line.push_str(arg);
            } else {
                line.push_str(&quoted(arg));
            }
        }
        line
    }
}

/// Escapes quotes and spaces so `s` reads as a single unquoted shell token.
pub fn escaped(s: &str) -> String {
    s.replace('"', "\\\"").replace(' ', "\\ ")
}

/// Wraps `s` in double quotes. Spaces need no escape there, but `\`, `"`,
/// `$` and backticks do.
pub fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

// ===================================================================
//                          JOB STATE & EVENTS
// ===================================================================

/// How a job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed { code: i32 },
    Cancelled,
}

impl JobOutcome {
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            JobOutcome::Succeeded
        } else {
            JobOutcome::Failed { code }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Finished(JobOutcome),
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished(_))
    }
}

/// Messages pushed by a running job. `Terminated` is always the last one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    /// A chunk of merged stdout/stderr. Not necessarily a whole line.
    Output(String),
    Terminated(JobOutcome),
}

// ===================================================================
//                          API MODELS
// ===================================================================

/// The JSON body for a `POST /download` request. Unset fields fall back to
/// the saved defaults.
#[derive(Deserialize, Debug, Default)]
pub struct DownloadPayload {
    pub url: String,
    #[serde(flatten)]
    pub overrides: DownloadOverrides,
}

/// The response sent after a download was started.
#[derive(Serialize, Debug)]
pub struct DownloadResponse {
    pub message: String,
    pub job_id: u64,
    pub command: String,
}

#[derive(Serialize, Debug)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Snapshot of the status line for `GET /status`.
#[derive(Clone, Serialize, Debug, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: String,
    pub state: Option<JobState>,
    pub job_id: Option<u64>,
}

#[derive(Serialize, Debug)]
pub struct OptionEntry {
    pub label: String,
    pub value: String,
}

/// The choices a client may offer, as served by `GET /options`.
#[derive(Serialize, Debug)]
pub struct OptionCatalog {
    pub modes: Vec<OptionEntry>,
    pub resolutions: Vec<u32>,
    pub containers: Vec<&'static str>,
    pub audio_qualities: Vec<OptionEntry>,
    pub audio_formats: Vec<OptionEntry>,
}

impl OptionCatalog {
    pub fn new() -> Self {
        let modes = [DownloadMode::Both, DownloadMode::AudioOnly, DownloadMode::VideoOnly]
            .into_iter()
            .map(|mode| OptionEntry {
                label: mode.label().to_string(),
                value: serde_json::to_value(mode)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
            })
            .collect();
        OptionCatalog {
            modes,
            resolutions: RESOLUTIONS.to_vec(),
            containers: [Container::Mp4, Container::Mkv, Container::Webm]
                .into_iter()
                .map(Container::as_str)
                .collect(),
            audio_qualities: AudioQuality::PRESETS
                .into_iter()
                .map(|q| OptionEntry { label: q.label(), value: q.to_string() })
                .collect(),
            audio_formats: AudioFormat::ALL
                .into_iter()
                .map(|f| OptionEntry {
                    label: f.label().to_string(),
                    value: f.as_str().to_string(),
                })
                .collect(),
        }
    }
}

impl Default for OptionCatalog {
    fn default() -> Self {
        Self::new()
    }
}
