//! Periodic background tasks that run independent of the request path
//! (spec §4.7: fine-tuning job status sync).
//!
//! Fine-tuning job persistence itself is an external collaborator (spec §1 Non-goals
//! list it among the repository ports assumed given); this module only owns the poll
//! loop and the port trait it calls through.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

/// Status of a single fine-tuning job as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FineTuneStatus {
    Queued,
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct FineTuneJob {
    pub job_id: String,
    pub provider: String,
    pub status: FineTuneStatus,
}

/// External collaborator: looks up in-progress jobs and persists status updates.
/// A real deployment backs this with a database; the core never talks to it directly
/// except through this port.
pub trait FineTuneRepository: Send + Sync {
    fn in_progress(&self) -> Vec<FineTuneJob>;
    fn update_status(&self, job_id: &str, status: FineTuneStatus);
}

/// External collaborator: asks a provider for a job's current status.
pub trait FineTunePort: Send + Sync {
    fn poll(&self, provider: &str, job_id: &str) -> anyhow::Result<FineTuneStatus>;
}

/// Default repository when no fine-tune store is wired up: reports nothing in progress,
/// so the sync loop runs but never does any work. Deployments that actually submit
/// fine-tuning jobs supply their own `FineTuneRepository`/`FineTunePort`.
#[derive(Default)]
pub struct NoopFineTuneRepository;

impl FineTuneRepository for NoopFineTuneRepository {
    fn in_progress(&self) -> Vec<FineTuneJob> {
        Vec::new()
    }

    fn update_status(&self, _job_id: &str, _status: FineTuneStatus) {}
}

/// Pairs with [`NoopFineTuneRepository`] — never called since there are never any jobs
/// in progress, but still needs a body to satisfy the trait.
#[derive(Default)]
pub struct NoopFineTunePort;

impl FineTunePort for NoopFineTunePort {
    fn poll(&self, _provider: &str, _job_id: &str) -> anyhow::Result<FineTuneStatus> {
        Ok(FineTuneStatus::Queued)
    }
}

/// Poll all in-progress fine-tuning jobs every `interval` and persist status changes.
/// Cancellable via `shutdown`; survives individual poll failures (spec §4.7: "Exceptions
/// are logged; the loop survives individual failures").
pub async fn fine_tune_sync_loop(
    repository: Arc<dyn FineTuneRepository>,
    port: Arc<dyn FineTunePort>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_once(&*repository, &*port).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("fine-tune sync loop shutting down");
                    return;
                }
            }
        }
    }
}

async fn run_once(repository: &dyn FineTuneRepository, port: &dyn FineTunePort) {
    for job in repository.in_progress() {
        match port.poll(&job.provider, &job.job_id) {
            Ok(status) if status != job.status => {
                info!(job_id = %job.job_id, provider = %job.provider, ?status, "fine-tune job status changed");
                repository.update_status(&job.job_id, status);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(job_id = %job.job_id, provider = %job.provider, error = %e, "fine-tune poll failed, will retry next tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeRepository {
        jobs: Mutex<Vec<FineTuneJob>>,
        updates: Mutex<Vec<(String, FineTuneStatus)>>,
    }

    impl FineTuneRepository for FakeRepository {
        fn in_progress(&self) -> Vec<FineTuneJob> {
            self.jobs.lock().unwrap().clone()
        }

        fn update_status(&self, job_id: &str, status: FineTuneStatus) {
            self.updates.lock().unwrap().push((job_id.to_string(), status.clone()));
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(job) = jobs.iter_mut().find(|j| j.job_id == job_id) {
                job.status = status;
            }
        }
    }

    struct FakePort {
        next_status: FineTuneStatus,
    }

    impl FineTunePort for FakePort {
        fn poll(&self, _provider: &str, _job_id: &str) -> anyhow::Result<FineTuneStatus> {
            Ok(self.next_status.clone())
        }
    }

    struct FailingPort;

    impl FineTunePort for FailingPort {
        fn poll(&self, _provider: &str, _job_id: &str) -> anyhow::Result<FineTuneStatus> {
            anyhow::bail!("provider unreachable")
        }
    }

    #[tokio::test]
    async fn updates_status_when_it_changes() {
        let repo = Arc::new(FakeRepository {
            jobs: Mutex::new(vec![FineTuneJob {
                job_id: "ft-1".into(),
                provider: "openai".into(),
                status: FineTuneStatus::Running,
            }]),
            updates: Mutex::new(Vec::new()),
        });
        let port = Arc::new(FakePort { next_status: FineTuneStatus::Succeeded });

        run_once(&*repo, &*port).await;

        let updates = repo.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "ft-1");
        assert_eq!(updates[0].1, FineTuneStatus::Succeeded);
    }

    #[tokio::test]
    async fn no_update_when_status_unchanged() {
        let repo = Arc::new(FakeRepository {
            jobs: Mutex::new(vec![FineTuneJob {
                job_id: "ft-1".into(),
                provider: "openai".into(),
                status: FineTuneStatus::Running,
            }]),
            updates: Mutex::new(Vec::new()),
        });
        let port = Arc::new(FakePort { next_status: FineTuneStatus::Running });

        run_once(&*repo, &*port).await;

        assert!(repo.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn poll_failure_is_logged_and_does_not_panic() {
        let repo = Arc::new(FakeRepository {
            jobs: Mutex::new(vec![FineTuneJob {
                job_id: "ft-1".into(),
                provider: "openai".into(),
                status: FineTuneStatus::Running,
            }]),
            updates: Mutex::new(Vec::new()),
        });
        let port = Arc::new(FailingPort);

        run_once(&*repo, &*port).await;

        assert!(repo.updates.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_shutdown_signal() {
        let repo = Arc::new(FakeRepository { jobs: Mutex::new(Vec::new()), updates: Mutex::new(Vec::new()) });
        let port = Arc::new(FakePort { next_status: FineTuneStatus::Running });
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(fine_tune_sync_loop(repo, port, Duration::from_secs(300), rx));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit promptly on shutdown")
            .unwrap();
    }
}
