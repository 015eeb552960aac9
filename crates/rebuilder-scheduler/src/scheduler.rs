//! The scheduler proper: one task per candidate package, gated by a
//! token pool sized to the backend's advertised capacity, retrying
//! transient admission failures on a delay shared across all tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rebuilder_common::protocol::{Request, Response, Result};
use rebuilder_common::transport::BuildStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::birdseye::{Birdseye, SlotState};
use crate::job::{self, BuildJob};
use crate::report::{classify, Outcome, PackageResult, Report};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Admission endpoint: a worker, or the balancer in front of many.
    pub endpoint: String,
    /// Per-package output directories are created under here.
    pub log_dir: PathBuf,
    /// Target distribution, passed through to the build tool. The
    /// worker applies its default when empty.
    pub distribution: String,
    /// Local artifact files injected into every build.
    pub extra_artifacts: Vec<PathBuf>,
    /// Delay between admission retries, shared across all packages so
    /// refused tasks do not stampede the pool in lockstep.
    pub retry_delay: Duration,
    /// Re-run failed builds without injected artifacts to tell
    /// pre-existing breakage apart from regressions.
    pub recheck: bool,
    /// Point log references at the build tool's own log file instead of
    /// the captured console output.
    pub keep_native_log: bool,
    /// Render the live status line.
    pub progress: bool,
}

impl SchedulerConfig {
    pub fn new(endpoint: impl Into<String>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            log_dir: log_dir.into(),
            distribution: String::new(),
            extra_artifacts: Vec::new(),
            retry_delay: Duration::from_secs(10),
            recheck: false,
            keep_native_log: false,
            progress: false,
        }
    }
}

/// The shared retry rate limiter: one waiter is admitted per tick,
/// whoever it is. Deliberately global rather than per-task backoff.
#[derive(Clone)]
struct RetryGate(Arc<tokio::sync::Mutex<tokio::time::Interval>>);

impl RetryGate {
    fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the interval's immediate first tick so the first retry
        // actually waits.
        interval.reset();
        Self(Arc::new(tokio::sync::Mutex::new(interval)))
    }

    async fn wait(&self) {
        self.0.lock().await.tick().await;
    }
}

/// What one build attempt came to.
enum BuildOutcome {
    /// The build ran; this is its exit status.
    Exited(i32),
    /// Transport or worker failure mid-attempt. Fatal to this package
    /// only, never to the run.
    Errored(String),
}

pub struct Scheduler {
    config: Arc<SchedulerConfig>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Drives every job to a classification. Returns an error only for
    /// setup failures (capacity query, non-transient admission failure),
    /// which abort the whole run.
    pub async fn run(&self, jobs: Vec<BuildJob>) -> Result<Report> {
        let capacity = query_capacity(&self.config.endpoint).await?;
        tracing::info!(
            capacity,
            packages = jobs.len(),
            endpoint = %self.config.endpoint,
            "scheduling rebuilds"
        );

        tokio::fs::create_dir_all(&self.config.log_dir).await?;

        let total = jobs.len();
        let tokens = Arc::new(Semaphore::new(capacity as usize));
        let retry = RetryGate::new(self.config.retry_delay);
        let eye = Birdseye::new(capacity as usize, total);
        let render = self
            .config
            .progress
            .then(|| eye.clone().spawn(Duration::from_secs(1)));

        let mut tasks = JoinSet::new();
        for build_job in jobs {
            let config = self.config.clone();
            let tokens = tokens.clone();
            let retry = retry.clone();
            let eye = eye.clone();
            tasks.spawn(async move { run_one(config, tokens, retry, eye, build_job).await });
        }

        let mut results = Vec::with_capacity(total);
        let run = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(result)) => results.push(result),
                    Ok(Err(e)) => {
                        tasks.abort_all();
                        return Err(e);
                    }
                    Err(e) if e.is_cancelled() => continue,
                    Err(e) => {
                        tasks.abort_all();
                        return Err(std::io::Error::other(format!("build task failed: {}", e))
                            .into());
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some(handle) = render {
            handle.abort();
            eprintln!();
        }
        run?;

        Ok(Report::new(results))
    }
}

async fn query_capacity(endpoint: &str) -> Result<u32> {
    match BuildStream::roundtrip(endpoint, &Request::GetCapacity).await? {
        Response::Capacity { concurrent_builds } => Ok(concurrent_builds),
        other => Err(std::io::Error::other(format!(
            "expected a capacity report, got {:?}",
            other
        ))
        .into()),
    }
}

/// One package's whole life: build, optional recheck, classification.
async fn run_one(
    config: Arc<SchedulerConfig>,
    tokens: Arc<Semaphore>,
    retry: RetryGate,
    eye: Arc<Birdseye>,
    build_job: BuildJob,
) -> Result<PackageResult> {
    let spec = build_job.spec();

    let dest = config.log_dir.join(&spec);
    let outcome = attempt(&config, &tokens, &retry, &eye, &spec, &dest, true).await?;
    let status = match outcome {
        BuildOutcome::Exited(status) => status,
        BuildOutcome::Errored(message) => {
            eye.package_done();
            return Ok(PackageResult::errored(spec, message));
        }
    };
    if classify(status != 0, None) == Outcome::Passing {
        eye.package_done();
        return Ok(PackageResult::passing(spec));
    }

    let log = log_reference(&config, &dest, &spec);
    if !config.recheck {
        eye.package_done();
        return Ok(PackageResult::failing(spec, log));
    }

    // Second pass with no injected artifacts: does the package fail on
    // its own? Recheck outputs live beside the log directory, under a
    // root of their own.
    let root = recheck_root(&config.log_dir);
    tokio::fs::create_dir_all(&root).await?;
    let recheck_dest = root.join(&spec);
    let outcome = attempt(&config, &tokens, &retry, &eye, &spec, &recheck_dest, false).await?;
    eye.package_done();
    let result = match outcome {
        BuildOutcome::Exited(recheck_status) => {
            match classify(true, Some(recheck_status != 0)) {
                Outcome::AlreadyBroken => {
                    let recheck_log = log_reference(&config, &recheck_dest, &spec);
                    PackageResult::already_broken(spec, log, recheck_log)
                }
                _ => PackageResult::failing(spec, log),
            }
        }
        BuildOutcome::Errored(message) => {
            tracing::error!(package = %spec, "recheck attempt failed: {}", message);
            PackageResult::failing(spec, log)
        }
    };
    Ok(result)
}

/// One acquire-build-release cycle, looping on transient admission
/// refusal. A non-transient admission failure is returned as an error
/// and aborts the run; failures after the grant are this package's
/// problem only and come back as [`BuildOutcome::Errored`].
async fn attempt(
    config: &SchedulerConfig,
    tokens: &Arc<Semaphore>,
    retry: &RetryGate,
    eye: &Arc<Birdseye>,
    spec: &str,
    dest: &Path,
    with_artifacts: bool,
) -> Result<BuildOutcome> {
    loop {
        let permit = tokens
            .clone()
            .acquire_owned()
            .await
            .map_err(std::io::Error::other)?;
        let slot = eye.claim();
        eye.set(slot, SlotState::Acquiring);

        let lease = match job::acquire(&config.endpoint).await {
            Ok(lease) => lease,
            Err(e) if e.is_transient() => {
                tracing::debug!(package = %spec, "admission refused, will retry: {}", e);
                eye.release(slot);
                drop(permit);
                retry.wait().await;
                continue;
            }
            Err(e) => {
                eye.set(slot, SlotState::Erroring);
                eye.release(slot);
                return Err(e);
            }
        };

        eye.set(slot, SlotState::Running);
        tracing::info!(
            package = %spec,
            worker = %lease.worker_addr,
            lease = %lease.lease_id,
            "building"
        );

        let artifacts: &[PathBuf] = if with_artifacts {
            &config.extra_artifacts
        } else {
            &[]
        };
        let built = job::run_build(&lease, spec, &config.distribution, artifacts, dest).await;

        if let Err(e) = job::release(&lease).await {
            // The build result is already in hand; a failed release only
            // leaks a slot on the worker.
            tracing::warn!(package = %spec, lease = %lease.lease_id, "release failed: {}", e);
        }
        drop(lease);

        let outcome = match built {
            Ok(status) => {
                eye.set(slot, SlotState::Done);
                BuildOutcome::Exited(status)
            }
            Err(e) => {
                tracing::error!(package = %spec, "build attempt failed: {}", e);
                eye.set(slot, SlotState::Erroring);
                BuildOutcome::Errored(e.to_string())
            }
        };
        eye.release(slot);
        drop(permit);
        return Ok(outcome);
    }
}

/// The recheck output root: the log directory with `_recheck` appended
/// to its name, as a sibling rather than a subdirectory.
fn recheck_root(log_dir: &Path) -> PathBuf {
    let mut root = log_dir.as_os_str().to_os_string();
    root.push("_recheck");
    PathBuf::from(root)
}

fn log_reference(config: &SchedulerConfig, dest: &Path, spec: &str) -> PathBuf {
    if config.keep_native_log {
        dest.join(format!("{}_amd64.build", spec))
    } else {
        dest.join("STDOUT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recheck_outputs_live_beside_the_log_directory() {
        assert_eq!(
            recheck_root(Path::new("buildlogs")),
            Path::new("buildlogs_recheck")
        );
        assert_eq!(
            recheck_root(Path::new("/var/log/rebuild")),
            Path::new("/var/log/rebuild_recheck")
        );
    }
}
