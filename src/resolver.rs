//! Turns a [`DownloadRequest`] into the exact yt-dlp invocation that fetches it.

use crate::error::ResolutionError;
use crate::models::{
    AudioFormat, AudioQuality, AudioSpec, CommandSpec, DownloadRequest, StreamSelection, Tool,
    ToolPaths, VideoSpec,
};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Above this ceiling an explicit `--audio-quality` would ask the encoder to
/// upscale, so the flag is left out and ffmpeg's default quality is used.
pub const TRANSCODE_BITRATE_LIMIT_KBPS: u32 = 160;

/// Validates the destination and tools, then builds the command for `request`.
///
/// The destination is checked first; tools are checked in the order
/// yt-dlp, ffmpeg, ffprobe.
pub fn resolve(request: &DownloadRequest, tools: &ToolPaths) -> Result<CommandSpec, ResolutionError> {
    let destination = request.destination();
    if !destination.is_dir() {
        return Err(ResolutionError::DestinationMissing(destination.to_path_buf()));
    }
    for tool in [Tool::YtDlp, Tool::Ffmpeg, Tool::Ffprobe] {
        let path = tools.get(tool);
        if !is_executable_file(path) {
            return Err(ResolutionError::ToolMissing(tool, path.to_path_buf()));
        }
    }

    let mut arguments = format_arguments(request);
    arguments.push(request.url().to_string());

    Ok(CommandSpec {
        executable: tools.yt_dlp.clone(),
        arguments,
        working_directory: destination.to_path_buf(),
        environment: tool_environment(tools),
    })
}

/// The format selector and post-processing flags for `request`, without the URL.
pub fn format_arguments(request: &DownloadRequest) -> Vec<String> {
    let mut args = Vec::new();
    match request.selection() {
        StreamSelection::AudioOnly { audio } => {
            args.push("-f".to_string());
            args.push(audio_filter(audio.quality));
            args.extend(transcode_flags(audio));
        }
        StreamSelection::VideoOnly { video } => {
            args.push("-f".to_string());
            args.push(format!("{}[acodec=none]", video_filter(video)));
            args.push("--remux-video".to_string());
            args.push(video.container.as_str().to_string());
        }
        StreamSelection::Both { video, audio } => {
            args.push("-f".to_string());
            args.push(format!("{}+{}", video_filter(video), audio_filter(audio.quality)));
            args.push("--merge-output-format".to_string());
            args.push(video.container.as_str().to_string());
        }
    }
    args
}

/// Best audio-only stream, capped at the ceiling when one is set.
pub fn audio_filter(quality: AudioQuality) -> String {
    match quality {
        AudioQuality::Source => "bestaudio".to_string(),
        AudioQuality::Ceiling(kbps) => format!("bestaudio[abr<={}][vcodec=none]", kbps),
    }
}

fn video_filter(video: &VideoSpec) -> String {
    format!("bestvideo[height<={}]", video.resolution)
}

fn transcode_flags(audio: &AudioSpec) -> Vec<String> {
    if audio.format == AudioFormat::Source {
        return Vec::new();
    }
    let mut flags = vec![
        "--extract-audio".to_string(),
        "--audio-format".to_string(),
        audio.format.as_str().to_string(),
    ];
    if let AudioQuality::Ceiling(kbps) = audio.quality {
        if kbps <= TRANSCODE_BITRATE_LIMIT_KBPS {
            flags.push("--audio-quality".to_string());
            flags.push(audio.quality.to_string());
        }
    }
    flags
}

/// `PATH` with ffmpeg's directory in front, plus `FFMPEG` and `FFPROBE`.
fn tool_environment(tools: &ToolPaths) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let inherited = std::env::var_os("PATH").unwrap_or_default();
    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Some(dir) = tools.ffmpeg.parent().filter(|d| !d.as_os_str().is_empty()) {
        dirs.push(dir.to_path_buf());
    }
    dirs.extend(std::env::split_paths(&inherited));
    let path = std::env::join_paths(dirs).unwrap_or_else(|_| {
        // A directory containing the separator cannot be joined; keep PATH as is.
        OsString::from(&inherited)
    });
    env.insert("PATH".to_string(), path.to_string_lossy().into_owned());
    env.insert("FFMPEG".to_string(), tools.ffmpeg.to_string_lossy().into_owned());
    env.insert("FFPROBE".to_string(), tools.ffprobe.to_string_lossy().into_owned());
    env
}

/// True when `path` is a regular file the current user may execute.
pub fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Container, DownloadMode};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        tools: ToolPaths,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).unwrap();
        let tools = ToolPaths {
            yt_dlp: bin.join("yt-dlp"),
            ffmpeg: bin.join("ffmpeg"),
            ffprobe: bin.join("ffprobe"),
        };
        for path in [&tools.yt_dlp, &tools.ffmpeg, &tools.ffprobe] {
            make_executable(path);
        }
        Fixture { dir, tools }
    }

    fn make_executable(path: &Path) {
        fs::write(path, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn audio_request(dest: &Path, quality: AudioQuality, format: AudioFormat) -> DownloadRequest {
        DownloadRequest::new(
            "https://example.com/watch?v=X",
            dest,
            DownloadMode::AudioOnly,
            None,
            Some(AudioSpec { quality, format }),
        )
        .unwrap()
    }

    fn video_request(dest: &Path, mode: DownloadMode, quality: AudioQuality) -> DownloadRequest {
        let audio = mode
            .wants_audio()
            .then_some(AudioSpec { quality, format: AudioFormat::Source });
        DownloadRequest::new(
            "https://example.com/watch?v=X",
            dest,
            mode,
            Some(VideoSpec { resolution: 1080, container: Container::Mp4 }),
            audio,
        )
        .unwrap()
    }

    #[test]
    fn both_mode_merges_capped_video_with_best_audio() {
        let fx = fixture();
        let out = fx.dir.path().join("out");
        fs::create_dir(&out).unwrap();

        let spec = resolve(&video_request(&out, DownloadMode::Both, AudioQuality::Source), &fx.tools).unwrap();

        assert_eq!(spec.executable, fx.tools.yt_dlp);
        assert_eq!(spec.working_directory, out);
        assert_eq!(
            spec.arguments,
            [
                "-f",
                "bestvideo[height<=1080]+bestaudio",
                "--merge-output-format",
                "mp4",
                "https://example.com/watch?v=X",
            ]
        );
    }

    #[test]
    fn both_mode_carries_the_audio_ceiling() {
        let fx = fixture();
        let spec = resolve(
            &video_request(fx.dir.path(), DownloadMode::Both, AudioQuality::Ceiling(70)),
            &fx.tools,
        )
        .unwrap();
        assert_eq!(spec.arguments[1], "bestvideo[height<=1080]+bestaudio[abr<=70][vcodec=none]");
        assert!(!spec.arguments.iter().any(|a| a == "--extract-audio"));
    }

    #[test]
    fn audio_only_transcode_with_low_ceiling() {
        let fx = fixture();
        let request = audio_request(fx.dir.path(), AudioQuality::Ceiling(128), AudioFormat::Mp3);
        let spec = resolve(&request, &fx.tools).unwrap();
        assert_eq!(
            spec.arguments,
            [
                "-f",
                "bestaudio[abr<=128][vcodec=none]",
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "128k",
                "https://example.com/watch?v=X",
            ]
        );
    }

    #[test]
    fn audio_only_source_format_never_extracts() {
        let fx = fixture();
        for quality in [AudioQuality::Source, AudioQuality::Ceiling(50), AudioQuality::Ceiling(320)] {
            let request = audio_request(fx.dir.path(), quality, AudioFormat::Source);
            let spec = resolve(&request, &fx.tools).unwrap();
            assert!(!spec.arguments.iter().any(|a| a == "--extract-audio"));
            assert!(!spec.arguments.iter().any(|a| a == "--audio-format"));
            assert!(!spec.arguments.iter().any(|a| a == "--audio-quality"));
        }
    }

    #[test]
    fn ceiling_above_limit_omits_audio_quality() {
        let fx = fixture();
        for kbps in [161, 192, 320] {
            let request = audio_request(fx.dir.path(), AudioQuality::Ceiling(kbps), AudioFormat::Opus);
            let spec = resolve(&request, &fx.tools).unwrap();
            assert!(spec.arguments.iter().any(|a| a == "--extract-audio"));
            assert!(!spec.arguments.iter().any(|a| a == "--audio-quality"));
        }
        let at_limit = audio_request(fx.dir.path(), AudioQuality::Ceiling(160), AudioFormat::Opus);
        let spec = resolve(&at_limit, &fx.tools).unwrap();
        assert!(spec.arguments.windows(2).any(|w| w == ["--audio-quality", "160k"]));
    }

    #[test]
    fn source_quality_transcode_has_no_bitrate_flag() {
        let fx = fixture();
        let request = audio_request(fx.dir.path(), AudioQuality::Source, AudioFormat::M4a);
        let spec = resolve(&request, &fx.tools).unwrap();
        assert_eq!(spec.arguments[1], "bestaudio");
        assert!(spec.arguments.windows(2).any(|w| w == ["--audio-format", "m4a"]));
        assert!(!spec.arguments.iter().any(|a| a == "--audio-quality"));
    }

    #[test]
    fn video_only_has_no_audio_term() {
        let fx = fixture();
        let spec = resolve(
            &video_request(fx.dir.path(), DownloadMode::VideoOnly, AudioQuality::Source),
            &fx.tools,
        )
        .unwrap();
        assert_eq!(spec.arguments[1], "bestvideo[height<=1080][acodec=none]");
        assert!(spec.arguments.windows(2).any(|w| w == ["--remux-video", "mp4"]));
        assert!(!spec.arguments.iter().any(|a| a.contains("bestaudio")));
        assert!(!spec.arguments.iter().any(|a| a == "--merge-output-format"));
    }

    #[test]
    fn missing_destination_is_reported_before_tools() {
        let fx = fixture();
        let gone = fx.dir.path().join("nope");
        let broken_tools = ToolPaths {
            yt_dlp: PathBuf::from("/nonexistent/yt-dlp"),
            ..fx.tools.clone()
        };
        let request = audio_request(&gone, AudioQuality::Source, AudioFormat::Source);
        assert_eq!(
            resolve(&request, &broken_tools),
            Err(ResolutionError::DestinationMissing(gone))
        );
    }

    #[test]
    fn destination_must_be_a_directory() {
        let fx = fixture();
        let request = audio_request(&fx.tools.ffmpeg, AudioQuality::Source, AudioFormat::Source);
        assert!(matches!(
            resolve(&request, &fx.tools),
            Err(ResolutionError::DestinationMissing(_))
        ));
    }

    #[test]
    fn missing_tools_are_named() {
        let fx = fixture();
        let request = audio_request(fx.dir.path(), AudioQuality::Source, AudioFormat::Source);

        let mut tools = fx.tools.clone();
        tools.ffprobe = fx.dir.path().join("bin/missing-ffprobe");
        assert_eq!(
            resolve(&request, &tools),
            Err(ResolutionError::ToolMissing(Tool::Ffprobe, tools.ffprobe.clone()))
        );

        tools.yt_dlp = fx.dir.path().join("bin");
        assert!(matches!(
            resolve(&request, &tools),
            Err(ResolutionError::ToolMissing(Tool::YtDlp, _))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_tool_is_missing() {
        use std::os::unix::fs::PermissionsExt;
        let fx = fixture();
        fs::set_permissions(&fx.tools.ffmpeg, fs::Permissions::from_mode(0o644)).unwrap();
        let request = audio_request(fx.dir.path(), AudioQuality::Source, AudioFormat::Source);
        assert!(matches!(
            resolve(&request, &fx.tools),
            Err(ResolutionError::ToolMissing(Tool::Ffmpeg, _))
        ));
    }

    #[test]
    fn environment_points_at_the_transcoder() {
        let fx = fixture();
        let request = audio_request(fx.dir.path(), AudioQuality::Source, AudioFormat::Source);
        let spec = resolve(&request, &fx.tools).unwrap();

        let path = spec.environment.get("PATH").unwrap();
        let first = std::env::split_paths(path).next().unwrap();
        assert_eq!(first, fx.dir.path().join("bin"));
        assert_eq!(spec.environment["FFMPEG"], fx.tools.ffmpeg.to_string_lossy());
        assert_eq!(spec.environment["FFPROBE"], fx.tools.ffprobe.to_string_lossy());
    }
}
