//! Background server lifecycle: a PID file in the data directory plus a
//! process lookup decide whether the server is up.

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};

/// Where the server's PID file and log live.
pub struct DaemonPaths {
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl DaemonPaths {
    pub fn locate() -> Result<Self> {
        let project_dirs = ProjectDirs::from("dev", "Downer", "Downer")
            .ok_or_else(|| anyhow!("Could not find a valid project directory"))?;
        Self::in_dir(project_dirs.data_local_dir())
    }

    pub fn in_dir(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(DaemonPaths {
            pid_file: dir.join("server.pid"),
            log_file: dir.join("server.log"),
        })
    }

    /// The recorded PID, if the file exists and parses.
    pub fn recorded_pid(&self) -> Result<Option<u32>> {
        if !self.pid_file.exists() {
            return Ok(None);
        }
        let pid_str = fs::read_to_string(&self.pid_file)?;
        let pid = pid_str
            .trim()
            .parse()
            .with_context(|| format!("Malformed PID file at {}", self.pid_file.display()))?;
        Ok(Some(pid))
    }

    /// The PID of the running server, or `None` if it is not running.
    pub fn running_pid(&self) -> Result<Option<u32>> {
        let Some(pid) = self.recorded_pid()? else {
            return Ok(None);
        };
        let system = System::new_all();
        Ok(system.process(Pid::from_u32(pid)).map(|_| pid))
    }
}

/// Detaches from the terminal. On unix this forks; the caller continues in
/// the daemon and must build its async runtime only afterwards.
#[cfg(unix)]
pub fn detach(paths: &DaemonPaths) -> Result<()> {
    use daemonize::Daemonize;

    let stdout = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;
    let stderr = stdout.try_clone()?;
    Daemonize::new()
        .pid_file(&paths.pid_file)
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .map_err(|e| anyhow!("Failed to daemonize: {}", e))
}

/// Windows has no fork: start a hidden copy running `server run` and record its PID.
#[cfg(windows)]
pub fn spawn_detached(paths: &DaemonPaths) -> Result<u32> {
    use std::os::windows::process::CommandExt;
    use std::process::Command;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let myself = std::env::current_exe()?;
    let child = Command::new(&myself)
        .arg("server")
        .arg("run")
        .creation_flags(CREATE_NO_WINDOW)
        .spawn()?;
    fs::write(&paths.pid_file, child.id().to_string())?;
    Ok(child.id())
}

/// Kills the recorded server process and removes the PID file.
/// Returns the PID that was stopped, if any.
pub fn stop(paths: &DaemonPaths) -> Result<Option<u32>> {
    let Some(pid) = paths.recorded_pid()? else {
        return Ok(None);
    };
    let system = System::new_all();
    let stopped = match system.process(Pid::from_u32(pid)) {
        Some(process) => {
            process.kill();
            Some(pid)
        }
        None => None,
    };
    fs::remove_file(&paths.pid_file)?;
    Ok(stopped)
}
