//! Runs one resolved download command at a time and reports what it prints.

use crate::error::{SpawnError, StartError};
use crate::models::{CommandSpec, JobEvent, JobOutcome, JobState};
use crate::resolver::is_executable_file;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::{Stream, StreamExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

/// Merged stdout/stderr of a child, chunk by chunk.
pub type OutputStream = Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>;

/// Receiving end of a job's events.
pub type JobEvents = UnboundedReceiver<JobEvent>;

/// How long a cancelled process gets to exit after SIGTERM before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// How long output still buffered at exit keeps being read. Descendants that
/// inherited the output can hold it open well past the exit.
const OUTPUT_DRAIN: Duration = Duration::from_millis(250);

/// A started process, as seen by the runner.
#[async_trait]
pub trait ChildProcess: Send {
    /// Takes the output stream. Called once, right after spawning.
    fn take_output(&mut self) -> OutputStream;

    /// Waits for the process to exit and returns its exit code.
    async fn wait(&mut self) -> io::Result<i32>;

    /// Asks the process to stop (SIGTERM on unix). Does not wait.
    fn terminate(&mut self) -> io::Result<()>;

    /// Kills the process outright. Does not wait.
    fn kill(&mut self) -> io::Result<()>;
}

/// Creates child processes from a [`CommandSpec`].
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ChildProcess>, SpawnError>;
}

// ===================================================================
//                          SYSTEM PROCESSES
// ===================================================================

/// Spawns real OS processes through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpawner;

impl ProcessSpawner for SystemSpawner {
    fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ChildProcess>, SpawnError> {
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.arguments)
            .current_dir(&spec.working_directory)
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = attach_output(&mut cmd)?;
        let mut child = cmd.spawn()?;
        // The builder holds our copies of the write ends; drop them so the
        // reader sees EOF once the child exits.
        drop(cmd);

        let output = match output {
            Some(stream) => stream,
            None => piped_output(&mut child),
        };
        Ok(Box::new(SystemChild { child, output: Some(output) }))
    }
}

/// On unix both stdout and stderr go into one socket so chunks keep the
/// order the child wrote them in.
#[cfg(unix)]
fn attach_output(cmd: &mut Command) -> Result<Option<OutputStream>, SpawnError> {
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    let (reader, writer) = UnixStream::pair()?;
    let writer_err = writer.try_clone()?;
    cmd.stdout(Stdio::from(OwnedFd::from(writer)))
        .stderr(Stdio::from(OwnedFd::from(writer_err)));

    reader.set_nonblocking(true)?;
    let reader = tokio::net::UnixStream::from_std(reader)?;
    Ok(Some(chunk_stream(reader)))
}

#[cfg(not(unix))]
fn attach_output(cmd: &mut Command) -> Result<Option<OutputStream>, SpawnError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    Ok(None)
}

/// Fallback for platforms without socket pairs: interleave the two pipes.
fn piped_output(child: &mut tokio::process::Child) -> OutputStream {
    let stdout = child.stdout.take().map(chunk_stream);
    let stderr = child.stderr.take().map(chunk_stream);
    match (stdout, stderr) {
        (Some(out), Some(err)) => Box::pin(out.merge(err)),
        (Some(one), None) | (None, Some(one)) => one,
        (None, None) => Box::pin(tokio_stream::empty()),
    }
}

fn chunk_stream<R>(reader: R) -> OutputStream
where
    R: tokio::io::AsyncRead + Send + 'static,
{
    Box::pin(
        ReaderStream::new(reader)
            .map(|chunk| chunk.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())),
    )
}

struct SystemChild {
    child: tokio::process::Child,
    output: Option<OutputStream>,
}

#[async_trait]
impl ChildProcess for SystemChild {
    fn take_output(&mut self) -> OutputStream {
        self.output
            .take()
            .unwrap_or_else(|| Box::pin(tokio_stream::empty()))
    }

    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use sysinfo::{Pid, Signal, System};

        // No id once the child has been reaped.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return Ok(());
        }
        match system.process(pid).and_then(|process| process.kill_with(Signal::Term)) {
            Some(true) => Ok(()),
            Some(false) => Err(io::Error::new(io::ErrorKind::Other, "SIGTERM was not delivered")),
            None => self.child.start_kill(),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// The exit code, or `128 + signal` for a process killed by a signal.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

// ===================================================================
//                          JOBS
// ===================================================================

struct JobShared {
    state: JobState,
    /// Dropped with the terminal event so receivers see the channel close.
    events: Option<UnboundedSender<JobEvent>>,
}

impl JobShared {
    /// Delivers a chunk unless the job already ended.
    fn output(&mut self, chunk: String) {
        if self.state != JobState::Running {
            return;
        }
        if let Some(events) = &self.events {
            let _ = events.send(JobEvent::Output(chunk));
        }
    }

    /// Records the terminal outcome. Only the first call has any effect.
    fn finish(&mut self, outcome: JobOutcome) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = JobState::Finished(outcome);
        if let Some(events) = self.events.take() {
            let _ = events.send(JobEvent::Terminated(outcome));
        }
        true
    }
}

/// A started download. Cheap to clone; all clones refer to the same job.
#[derive(Clone)]
pub struct JobHandle {
    id: u64,
    command: Arc<CommandSpec>,
    shared: Arc<Mutex<JobShared>>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn state(&self) -> JobState {
        self.shared.lock().unwrap().state
    }

    /// Stops the job. Once this returns, no more output is delivered and the
    /// job's outcome is `Cancelled`. Returns false if the job had already ended.
    pub fn cancel(&self) -> bool {
        let cancelled = self.shared.lock().unwrap().finish(JobOutcome::Cancelled);
        if cancelled {
            tracing::info!("Download job {} cancelled", self.id);
            self.cancel.cancel();
        }
        cancelled
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Starts download processes, one at a time.
pub struct JobRunner {
    spawner: Arc<dyn ProcessSpawner>,
    current: Mutex<Option<JobHandle>>,
    next_id: AtomicU64,
    stop_grace: Duration,
}

impl JobRunner {
    pub fn new(spawner: Arc<dyn ProcessSpawner>) -> Self {
        JobRunner {
            spawner,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
            stop_grace: STOP_GRACE,
        }
    }

    /// Changes how long a cancelled process may take to exit before it is killed.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_system_processes() -> Self {
        Self::new(Arc::new(SystemSpawner))
    }

    /// Spawns `spec` and returns its handle with the event stream.
    ///
    /// Fails without spawning if another job is still running, or if the
    /// executable or working directory is unusable.
    pub fn start(&self, spec: CommandSpec) -> Result<(JobHandle, JobEvents), StartError> {
        let mut current = self.current.lock().unwrap();
        if let Some(job) = current.as_ref() {
            if !job.state().is_terminal() {
                return Err(StartError::AlreadyRunning);
            }
        }

        preflight(&spec)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(JobShared { state: JobState::Pending, events: Some(tx) }));

        let mut child = self.spawner.spawn(&spec).map_err(|e| {
            tracing::error!("Failed to start download job {}: {}", id, e);
            e
        })?;
        shared.lock().unwrap().state = JobState::Running;
        tracing::info!("Started download job {}: {}", id, spec.shell_line());

        let handle = JobHandle {
            id,
            command: Arc::new(spec),
            shared: shared.clone(),
            cancel: CancellationToken::new(),
        };
        let output = child.take_output();
        tokio::spawn(drive_job(
            id,
            child,
            output,
            shared,
            handle.cancel.clone(),
            self.stop_grace,
        ));

        *current = Some(handle.clone());
        Ok((handle, rx))
    }

    /// Cancels the current job, if it is still running.
    pub fn cancel(&self) -> bool {
        let current = self.current.lock().unwrap().clone();
        current.map_or(false, |job| job.cancel())
    }

    /// The most recently started job, finished or not.
    pub fn current(&self) -> Option<JobHandle> {
        self.current.lock().unwrap().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.current().map_or(false, |job| !job.state().is_terminal())
    }
}

fn preflight(spec: &CommandSpec) -> Result<(), SpawnError> {
    if !spec.executable.exists() {
        return Err(SpawnError::ExecutableMissing(spec.executable.clone()));
    }
    if !is_executable_file(&spec.executable) {
        return Err(SpawnError::NotExecutable(spec.executable.clone()));
    }
    if !spec.working_directory.is_dir() {
        return Err(SpawnError::WorkingDirectoryMissing(spec.working_directory.clone()));
    }
    Ok(())
}

/// Pumps output into the job's channel until the process exits or the job
/// is cancelled. The exit is reported as soon as it happens, even if a
/// descendant still holds the output open.
async fn drive_job(
    id: u64,
    mut child: Box<dyn ChildProcess>,
    mut output: OutputStream,
    shared: Arc<Mutex<JobShared>>,
    cancel: CancellationToken,
    stop_grace: Duration,
) {
    let mut output_open = true;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stop_child(id, child.as_mut(), stop_grace).await;
                return;
            }
            chunk = output.next(), if output_open => match chunk {
                Some(Ok(text)) => shared.lock().unwrap().output(text),
                Some(Err(e)) => {
                    tracing::warn!("Reading output of job {} failed: {}", id, e);
                    output_open = false;
                }
                None => output_open = false,
            },
            code = child.wait() => {
                if output_open {
                    drain_output(id, &mut output, &shared).await;
                }
                let outcome = match code {
                    Ok(code) => JobOutcome::from_exit_code(code),
                    Err(e) => {
                        tracing::error!("Waiting on download job {} failed: {}", id, e);
                        JobOutcome::Failed { code: -1 }
                    }
                };
                if shared.lock().unwrap().finish(outcome) {
                    match outcome {
                        JobOutcome::Succeeded => tracing::info!("Download job {} completed", id),
                        _ => tracing::error!("Download job {} ended: {:?}", id, outcome),
                    }
                }
                return;
            }
        }
    }
}

/// Delivers what the process wrote before exiting, giving up after
/// [`OUTPUT_DRAIN`] or at end of stream.
async fn drain_output(id: u64, output: &mut OutputStream, shared: &Mutex<JobShared>) {
    let drain = async {
        while let Some(Ok(text)) = output.next().await {
            shared.lock().unwrap().output(text);
        }
    };
    if tokio::time::timeout(OUTPUT_DRAIN, drain).await.is_err() {
        tracing::debug!("Output of job {} still open after exit; no longer reading it", id);
    }
}

/// SIGTERM first so yt-dlp can stop ffmpeg and tidy its partial files; SIGKILL
/// if it is still there after `grace`.
async fn stop_child(id: u64, child: &mut dyn ChildProcess, grace: Duration) {
    if let Err(e) = child.terminate() {
        tracing::warn!("Failed to terminate download job {}: {}", id, e);
    }
    let code = match tokio::time::timeout(grace, child.wait()).await {
        Ok(code) => code,
        Err(_) => {
            tracing::warn!("Download job {} still running {:?} after SIGTERM, killing it", id, grace);
            if let Err(e) = child.kill() {
                tracing::warn!("Failed to kill download job {}: {}", id, e);
            }
            child.wait().await
        }
    };
    match code {
        Ok(code) => tracing::debug!("Cancelled job {} exited with code {}", id, code),
        Err(e) => tracing::warn!("Failed to reap cancelled job {}: {}", id, e),
    }
}
