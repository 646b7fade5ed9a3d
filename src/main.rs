use clap::{Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use downer::config::{DownloadOverrides, SettingsStore};
use downer::daemon::{self, DaemonPaths};
use downer::models::{
    parse_resolution, AudioFormat, AudioQuality, Container, DownloadMode, JobEvent, JobOutcome, Tool,
};
use downer::resolver;
use downer::runner::JobRunner;
use downer::status::StatusLine;
use downer::{router, AppState};

// --- Command-Line Argument Parsing ---
#[derive(Parser, Debug)]
#[command(author, version, about = "Downloads media with yt-dlp using saved preferences.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Downloads one URL in the foreground. Ctrl-C cancels.
    Download(DownloadArgs),
    /// Shows or edits the saved settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manages the HTTP control server.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
}

#[derive(clap::Args, Debug)]
struct DownloadArgs {
    /// The page or media URL to download.
    url: String,
    #[arg(long, value_enum)]
    mode: Option<DownloadMode>,
    /// Maximum video height, e.g. 1080 or 720p.
    #[arg(long, value_parser = parse_resolution)]
    resolution: Option<u32>,
    #[arg(long, value_enum)]
    container: Option<Container>,
    /// `source` or a bitrate ceiling such as 128k.
    #[arg(long)]
    audio_quality: Option<AudioQuality>,
    #[arg(long, value_enum)]
    audio_format: Option<AudioFormat>,
    /// Destination folder.
    #[arg(long)]
    dest: Option<PathBuf>,
    /// Remember these options as the new defaults.
    #[arg(long)]
    save: bool,
    /// Print the resolved command instead of running it.
    #[arg(long)]
    dry_run: bool,
}

impl DownloadArgs {
    fn overrides(&self) -> DownloadOverrides {
        DownloadOverrides {
            mode: self.mode,
            resolution: self.resolution,
            container: self.container,
            audio_quality: self.audio_quality,
            audio_format: self.audio_format,
            destination: self.dest.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Prints the current settings as TOML.
    Show,
    /// Prints the location of the settings file.
    Path,
    /// Sets the paths of the external tools.
    Tools {
        #[arg(long)]
        yt_dlp: Option<PathBuf>,
        #[arg(long)]
        ffmpeg: Option<PathBuf>,
        #[arg(long)]
        ffprobe: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ServerAction {
    /// Start the server as a background process.
    Start,
    /// Stop the background server process.
    Stop,
    /// Restart the background server process.
    Restart,
    /// Run the server in the foreground.
    Run,
    /// Check the status of the background server process.
    Status,
}

// --- Main Application Logic ---
// No #[tokio::main]: `server start` forks, and the runtime must be built after that.
fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Download(args) => {
            tracing_subscriber::fmt().with_writer(std::io::stderr).init();
            runtime()?.block_on(download(args))
        }
        Commands::Config { action } => {
            runtime()?.block_on(config_command(action))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Server { action } => {
            match action {
                ServerAction::Start => start_server()?,
                ServerAction::Stop => stop_server()?,
                ServerAction::Restart => {
                    stop_server()?;
                    std::thread::sleep(std::time::Duration::from_secs(1));
                    start_server()?;
                }
                ServerAction::Run => {
                    tracing_subscriber::fmt::init();
                    runtime()?.block_on(run_server())?;
                }
                ServerAction::Status => check_status()?,
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread().enable_all().build()?)
}

// --- Download ---

/// Resolves and runs one download, printing every status change.
async fn download(args: DownloadArgs) -> anyhow::Result<ExitCode> {
    let store = SettingsStore::default_location()?;
    let mut config = store.load().await?;
    let settings = config.download.with_overrides(&args.overrides());

    let request = match settings.request_for(&args.url) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{}", e);
            return Ok(ExitCode::FAILURE);
        }
    };
    if args.save {
        config.download = settings;
        store.save(&config).await?;
        tracing::info!("Saved download defaults to {}", store.path().display());
    }

    let command = match resolver::resolve(&request, &config.tools) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!("Resolution failed: {}", e);
            println!("{}", e.status_text());
            return Ok(ExitCode::FAILURE);
        }
    };
    if args.dry_run {
        println!("{}", command.shell_line());
        return Ok(ExitCode::SUCCESS);
    }

    let runner = JobRunner::with_system_processes();
    let status = StatusLine::new();
    let (job, mut events) = match runner.start(command) {
        Ok(started) => started,
        Err(e) => {
            println!("Error: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };
    status.begin(job.id());
    println!("{}", status.text());

    let mut outcome = None;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let JobEvent::Terminated(done) = event {
                    outcome = Some(done);
                }
                if let Some(text) = status.apply(job.id(), &event) {
                    println!("{}", text);
                }
            }
            _ = tokio::signal::ctrl_c(), if outcome.is_none() => {
                job.cancel();
            }
        }
    }

    Ok(match outcome {
        Some(JobOutcome::Succeeded) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

// --- Settings ---

async fn config_command(action: ConfigAction) -> anyhow::Result<()> {
    let store = SettingsStore::default_location()?;
    match action {
        ConfigAction::Show => {
            let config = store.load().await?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => println!("{}", store.path().display()),
        ConfigAction::Tools { yt_dlp, ffmpeg, ffprobe } => {
            let mut config = store.load().await?;
            if let Some(path) = yt_dlp {
                config.tools.yt_dlp = path;
            }
            if let Some(path) = ffmpeg {
                config.tools.ffmpeg = path;
            }
            if let Some(path) = ffprobe {
                config.tools.ffprobe = path;
            }
            store.save(&config).await?;
            for tool in [Tool::YtDlp, Tool::Ffmpeg, Tool::Ffprobe] {
                let path = config.tools.get(tool);
                let note = if resolver::is_executable_file(path) { "" } else { "  (not executable)" };
                println!("{:<8} {}{}", tool, path.display(), note);
            }
        }
    }
    Ok(())
}

// --- Server Action Functions ---

/// Runs the HTTP control server until the process is stopped.
async fn run_server() -> anyhow::Result<()> {
    let store = SettingsStore::default_location()?;
    let config = store.load().await?;
    let state = AppState::new(config, store, Arc::new(JobRunner::with_system_processes()));

    let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port_str = env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("{}:{}", host, port_str);

    tracing::info!("Starting server in foreground, listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Starts the server as a background process using platform-specific logic.
fn start_server() -> anyhow::Result<()> {
    let paths = DaemonPaths::locate()?;
    if let Some(pid) = paths.running_pid()? {
        println!("Server is already running with PID: {}", pid);
        return Ok(());
    }
    println!("Starting server in the background. PID file at: {}", paths.pid_file.display());

    #[cfg(unix)]
    {
        daemon::detach(&paths)?;
        // From here on we are the daemon.
        tracing_subscriber::fmt::init();
        runtime()?.block_on(run_server())?;
    }

    #[cfg(windows)]
    {
        let pid = daemon::spawn_detached(&paths)?;
        println!("Server started with PID: {}", pid);
    }

    Ok(())
}

/// Stops the background server process.
fn stop_server() -> anyhow::Result<()> {
    let paths = DaemonPaths::locate()?;
    match daemon::stop(&paths)? {
        Some(pid) => println!("Stopped server process with PID: {}", pid),
        None => println!("Server is not running."),
    }
    Ok(())
}

/// Checks if the server process is running.
fn check_status() -> anyhow::Result<()> {
    let paths = DaemonPaths::locate()?;
    match paths.running_pid()? {
        Some(pid) => println!("Server is running with PID: {}", pid),
        None => println!("Server is not running."),
    }
    Ok(())
}
