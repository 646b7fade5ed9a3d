use crate::models::{JobEvent, JobOutcome, JobState, StatusResponse};
use crate::runner::JobEvents;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const IDLE: &str = "Idle";
pub const STARTING: &str = "Starting download…";

/// How long a finished job's message stays up before the line reads `Idle`.
pub const IDLE_AFTER: Duration = Duration::from_secs(10);

/// Text shown once a job has ended.
pub fn outcome_text(outcome: JobOutcome) -> String {
    match outcome {
        JobOutcome::Succeeded => "Download completed.".to_string(),
        JobOutcome::Failed { code } => format!("Download failed (code {}).", code),
        JobOutcome::Cancelled => "Download cancelled.".to_string(),
    }
}

struct StatusInner {
    text: String,
    job: Option<(u64, JobState)>,
    /// Bumped on every change, so a delayed reset can tell it is stale.
    generation: u64,
}

/// The single human-readable status line. Every update replaces the text.
#[derive(Clone)]
pub struct StatusLine {
    inner: Arc<Mutex<StatusInner>>,
}

impl StatusLine {
    pub fn new() -> Self {
        StatusLine {
            inner: Arc::new(Mutex::new(StatusInner {
                text: IDLE.to_string(),
                job: None,
                generation: 0,
            })),
        }
    }

    pub fn text(&self) -> String {
        self.inner.lock().unwrap().text.clone()
    }

    pub fn snapshot(&self) -> StatusResponse {
        let inner = self.inner.lock().unwrap();
        StatusResponse {
            status: inner.text.clone(),
            state: inner.job.map(|(_, state)| state),
            job_id: inner.job.map(|(id, _)| id),
        }
    }

    /// Shows a message that is not tied to a job, e.g. a resolution error.
    pub fn set(&self, text: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.text = text.into();
        inner.generation += 1;
    }

    /// Marks `job_id` as the job the line is reporting on.
    pub fn begin(&self, job_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.text = STARTING.to_string();
        inner.job = Some((job_id, JobState::Running));
        inner.generation += 1;
    }

    /// Applies one event and returns the new text, or `None` if nothing
    /// changed. Whitespace-only chunks and events from other jobs are ignored.
    pub fn apply(&self, job_id: u64, event: &JobEvent) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.job.map(|(id, _)| id) != Some(job_id) {
            return None;
        }
        match event {
            JobEvent::Output(chunk) => {
                let trimmed = chunk.trim();
                if trimmed.is_empty() {
                    return None;
                }
                inner.text = trimmed.to_string();
            }
            JobEvent::Terminated(outcome) => {
                inner.text = outcome_text(*outcome);
                inner.job = Some((job_id, JobState::Finished(*outcome)));
            }
        }
        inner.generation += 1;
        Some(inner.text.clone())
    }

    fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    /// Puts the line back to `Idle` unless it changed since `generation`.
    fn reset_if_unchanged(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.generation != generation {
            return false;
        }
        inner.text = IDLE.to_string();
        inner.generation += 1;
        true
    }
}

impl Default for StatusLine {
    fn default() -> Self {
        Self::new()
    }
}

/// Feeds a job's events into `status` until the job ends, then reverts the
/// line to `Idle` after `idle_after` if nothing else happened meanwhile.
pub async fn follow(status: StatusLine, job_id: u64, mut events: JobEvents, idle_after: Duration) {
    while let Some(event) = events.recv().await {
        status.apply(job_id, &event);
    }
    let generation = status.generation();
    tokio::time::sleep(idle_after).await;
    if status.reset_if_unchanged(generation) {
        tracing::debug!("Status for job {} reset to idle", job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn output_replaces_text_and_skips_blank_chunks() {
        let status = StatusLine::new();
        assert_eq!(status.text(), IDLE);
        status.begin(7);
        assert_eq!(status.text(), STARTING);

        assert_eq!(
            status.apply(7, &JobEvent::Output("  [download]  12.5%\n".to_string())),
            Some("[download]  12.5%".to_string())
        );
        assert_eq!(status.apply(7, &JobEvent::Output(" \n\r".to_string())), None);
        assert_eq!(status.text(), "[download]  12.5%");

        status.apply(7, &JobEvent::Terminated(JobOutcome::Failed { code: 1 }));
        let snapshot = status.snapshot();
        assert_eq!(snapshot.status, "Download failed (code 1).");
        assert_eq!(snapshot.job_id, Some(7));
        assert_eq!(snapshot.state, Some(JobState::Finished(JobOutcome::Failed { code: 1 })));
    }

    #[test]
    fn events_from_an_old_job_are_ignored() {
        let status = StatusLine::new();
        status.begin(1);
        status.begin(2);
        assert_eq!(status.apply(1, &JobEvent::Output("stale".to_string())), None);
        assert_eq!(status.text(), STARTING);
    }

    #[test]
    fn outcome_texts() {
        assert_eq!(outcome_text(JobOutcome::Succeeded), "Download completed.");
        assert_eq!(outcome_text(JobOutcome::Cancelled), "Download cancelled.");
        assert_eq!(outcome_text(JobOutcome::Failed { code: 137 }), "Download failed (code 137).");
    }

    #[tokio::test(start_paused = true)]
    async fn follow_resets_to_idle_after_the_delay() {
        let status = StatusLine::new();
        status.begin(3);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(JobEvent::Output("working".to_string())).unwrap();
        tx.send(JobEvent::Terminated(JobOutcome::Succeeded)).unwrap();
        drop(tx);

        let task = tokio::spawn(follow(status.clone(), 3, rx, IDLE_AFTER));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(status.text(), "Download completed.");

        task.await.unwrap();
        assert_eq!(status.text(), IDLE);
    }

    #[tokio::test(start_paused = true)]
    async fn follow_keeps_newer_messages() {
        let status = StatusLine::new();
        status.begin(4);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(JobEvent::Terminated(JobOutcome::Cancelled)).unwrap();
        drop(tx);

        let task = tokio::spawn(follow(status.clone(), 4, rx, IDLE_AFTER));
        tokio::time::sleep(Duration::from_secs(1)).await;
        status.begin(5);
        task.await.unwrap();
        assert_eq!(status.text(), STARTING);
    }
}
