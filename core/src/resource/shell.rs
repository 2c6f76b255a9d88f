//! ShellAdapter (spec §4.5): runs a task as a direct child process, either
//! locally or over SSH, self-limiting on a local core counter rather than
//! relying on an external batch scheduler.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::BackendError;
use crate::resource::transport::Transport;
use crate::resource::{PollOutcome, ResourceAdapter};
use crate::task::{ReturnCode, ResourceUsage, State, Task};
use gc3_common::{MemoryUnit, Quantity, TimeUnit};

/// Per-job bookkeeping kept so a restarted engine can reattach (§4.5:
/// "track the child pid in a sidecar file").
#[derive(Debug, Clone)]
struct JobRecord {
    pid: Option<u32>,
    cores: u32,
    finished: Option<RunOutcome>,
}

#[derive(Debug, Clone)]
struct RunOutcome {
    exit_status: i32,
    usage: Option<ResourceUsage>,
}

/// Parse GNU `/usr/bin/time -v` output into the Task's resource-usage
/// telemetry (§3, §4.5, §6: "wrapper whose output is parsed to populate
/// resource usage"). Tolerant of a missing or malformed sidecar file: any
/// field not found is simply left unset rather than failing the poll.
fn parse_time_verbose(text: &str) -> Option<ResourceUsage> {
    if text.trim().is_empty() {
        return None;
    }
    let mut user_secs: Option<f64> = None;
    let mut sys_secs: Option<f64> = None;
    let mut max_rss_kb: Option<u64> = None;
    let mut wall: Option<Quantity> = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("User time (seconds):") {
            user_secs = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("System time (seconds):") {
            sys_secs = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("Maximum resident set size (kbytes):") {
            max_rss_kb = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("Elapsed (wall clock) time (h:mm:ss or m:ss):") {
            wall = parse_elapsed(v.trim());
        }
    }

    let cpu_time = match (user_secs, sys_secs) {
        (None, None) => None,
        (u, s) => Some(Quantity::time((u.unwrap_or(0.0) + s.unwrap_or(0.0)).round() as i64, TimeUnit::Seconds)),
    };

    Some(ResourceUsage {
        cpu_time,
        memory_high_water: max_rss_kb.map(|kb| Quantity::memory(kb as i64, MemoryUnit::KiB)),
        wall_clock: wall,
    })
}

/// `h:mm:ss` or `m:ss.cc` as GNU time formats it. Sub-second precision is
/// not representable in `Quantity`'s integer-seconds canonical form and is
/// rounded away.
fn parse_elapsed(raw: &str) -> Option<Quantity> {
    let parts: Vec<&str> = raw.split(':').collect();
    let secs: f64 = match parts.as_slice() {
        [h, m, s] => h.parse::<f64>().ok()? * 3600.0 + m.parse::<f64>().ok()? * 60.0 + s.parse::<f64>().ok()?,
        [m, s] => m.parse::<f64>().ok()? * 60.0 + s.parse::<f64>().ok()?,
        _ => return None,
    };
    Some(Quantity::time(secs.round() as i64, TimeUnit::Seconds))
}

/// Runs tasks on one host, local or SSH, as plain subprocesses.
#[derive(Debug)]
pub struct ShellAdapter {
    transport: Arc<dyn Transport>,
    working_root: PathBuf,
    /// Cores available right now; starts at `total_cores` and is decremented
    /// on submit, incremented back on terminal observation (§4.5).
    available_cores: AtomicI64,
    total_cores: AtomicU32,
    jobs: DashMap<String, JobRecord>,
}

impl ShellAdapter {
    pub fn new(transport: Arc<dyn Transport>, working_root: PathBuf, detected_cores: u32, override_cores: Option<u32>) -> Self {
        let cores = override_cores.unwrap_or(detected_cores);
        ShellAdapter {
            transport,
            working_root,
            available_cores: AtomicI64::new(cores as i64),
            total_cores: AtomicU32::new(cores),
            jobs: DashMap::new(),
        }
    }

    pub fn available_cores(&self) -> i64 {
        self.available_cores.load(Ordering::SeqCst)
    }

    fn task_dir(&self, task: &Task) -> PathBuf {
        self.working_root.join(task.id.0.as_str())
    }
}

#[async_trait]
impl ResourceAdapter for ShellAdapter {
    async fn submit(&self, task: &Task) -> Result<String, BackendError> {
        let cores = task.spec.requirements.cores as i64;

        // Self-limit enforcement (§4.5): refuse if it would drive the
        // counter negative; the Engine retries this task on a later tick.
        let prior = self.available_cores.fetch_sub(cores, Ordering::SeqCst);
        if prior - cores < 0 {
            self.available_cores.fetch_add(cores, Ordering::SeqCst);
            return Err(BackendError::Transient(format!(
                "only {prior} of {requested} requested cores free",
                requested = cores
            )));
        }

        let dir = self.task_dir(task);
        let dir_str = dir.to_string_lossy().to_string();
        self.transport
            .run(&format!("mkdir -p {dir_str}"), None)
            .await
            .map_err(|e| {
                self.available_cores.fetch_add(cores, Ordering::SeqCst);
                BackendError::from(e)
            })?;

        // The payload itself must run inside the backgrounded subshell, not
        // in the foreground with only the trailing `echo $?` backgrounded —
        // otherwise `submit()` blocks on the job and `echo $!` captures the
        // pid of the echo, not the job (§4.5, §5: submit must not block a
        // tick on the job's own runtime).
        let mut inner = String::new();
        for (k, v) in &task.spec.environment {
            inner.push_str(&format!("{k}={v} "));
        }
        // Wrap with `/usr/bin/time -v` so resource-usage telemetry can be
        // parsed back out of a sidecar file on poll (§4.5, §6).
        inner.push_str(&format!(
            "/usr/bin/time -v -o {dir_str}/.gc3.usage -- {} {}",
            task.spec.command,
            task.spec.arguments.join(" ")
        ));
        if let Some(out) = &task.spec.stdout {
            inner.push_str(&format!(" > {out}"));
        }
        if task.spec.join_stdout_stderr {
            inner.push_str(" 2>&1");
        } else if let Some(err) = &task.spec.stderr {
            inner.push_str(&format!(" 2> {err}"));
        }
        let cmd = format!(
            "( cd {dir_str} && {inner} ; echo $? > {dir_str}/.gc3.exit ) &\necho $!"
        );

        let out = self.transport.run(&cmd, None).await?;
        let pid: Option<u32> = String::from_utf8_lossy(&out.stdout).trim().parse().ok();

        let job_id = task.id.0.clone();
        self.jobs.insert(
            job_id.clone(),
            JobRecord {
                pid,
                cores: task.spec.requirements.cores,
                finished: None,
            },
        );
        info!(job_id, pid, "shell job started");
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<PollOutcome, BackendError> {
        let Some(mut record) = self.jobs.get_mut(job_id) else {
            return Err(BackendError::NotFound(job_id.to_string()));
        };

        if let Some(outcome) = &record.finished {
            return Ok(PollOutcome {
                state: State::Terminating,
                resource_usage: outcome.usage.clone(),
                exit_info: Some(ReturnCode::from_exit(outcome.exit_status.clamp(0, 255) as u8)),
            });
        }

        let dir = self.working_root.join(job_id);
        let exit_file = dir.join(".gc3.exit");
        let out = self
            .transport
            .run(&format!("cat {} 2>/dev/null", exit_file.to_string_lossy()), None)
            .await?;
        let text = String::from_utf8_lossy(&out.stdout);
        let trimmed = text.trim();

        if trimmed.is_empty() {
            return Ok(PollOutcome {
                state: State::Running,
                resource_usage: None,
                exit_info: None,
            });
        }

        let code: i32 = trimmed.parse().unwrap_or(-1);
        self.available_cores.fetch_add(record.cores as i64, Ordering::SeqCst);

        let usage_out = self
            .transport
            .run(&format!("cat {}/.gc3.usage 2>/dev/null", dir.to_string_lossy()), None)
            .await?;
        let usage = parse_time_verbose(&String::from_utf8_lossy(&usage_out.stdout));

        record.finished = Some(RunOutcome {
            exit_status: code,
            usage: usage.clone(),
        });

        Ok(PollOutcome {
            state: State::Terminating,
            resource_usage: usage,
            exit_info: Some(ReturnCode::from_exit(code.clamp(0, 255) as u8)),
        })
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BackendError> {
        if let Some(record) = self.jobs.get(job_id) {
            if let Some(pid) = record.pid {
                self.transport.run(&format!("kill {pid}"), None).await?;
            }
        } else {
            warn!(job_id, "cancel of unknown job id");
        }
        Ok(())
    }

    async fn fetch_outputs(&self, task: &Task) -> Result<PathBuf, BackendError> {
        let dir = self.task_dir(task);
        let local_dir = dir.clone();
        for (src, _dest_url) in &task.spec.outputs {
            let remote = dir.join(src).to_string_lossy().to_string();
            let local = local_dir.join(src);
            if let Err(e) = self.transport.get(&remote, &local).await {
                warn!(%src, error = %e, "output missing, recording and continuing");
            }
        }
        Ok(local_dir)
    }

    fn load(&self) -> usize {
        let total = self.total_cores.load(Ordering::SeqCst) as i64;
        let avail = self.available_cores.load(Ordering::SeqCst);
        (total - avail).max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::transport::LocalTransport;
    use crate::task::{Requirements, Spec};
    use gc3_common::{MemoryUnit, Quantity, TimeUnit};
    use std::collections::BTreeMap;

    fn sample_task(cores: u32) -> Task {
        Task::new(
            "echo-job",
            Spec {
                command: "/bin/echo".into(),
                arguments: vec!["hi".into()],
                inputs: BTreeMap::new(),
                outputs: vec![],
                stdin: None,
                stdout: None,
                stderr: None,
                join_stdout_stderr: false,
                environment: BTreeMap::new(),
                requirements: Requirements {
                    cores,
                    memory_per_core: Quantity::memory(256, MemoryUnit::MiB),
                    walltime: Quantity::time(1, TimeUnit::Hours),
                    architecture: vec![],
                    tags: vec![],
                },
            },
        )
    }

    fn adapter(dir: &std::path::Path, cores: u32) -> ShellAdapter {
        ShellAdapter::new(Arc::new(LocalTransport), dir.to_path_buf(), cores, None)
    }

    #[test]
    fn override_cores_wins_over_detected() {
        let a = ShellAdapter::new(Arc::new(LocalTransport), PathBuf::from("/tmp"), 8, Some(2));
        assert_eq!(a.available_cores(), 2);
    }

    #[test]
    fn parse_time_verbose_reads_the_fields_gc3pie_cares_about() {
        let sample = "\tCommand being timed: \"/bin/echo hi\"\n\
                       \tUser time (seconds): 0.01\n\
                       \tSystem time (seconds): 0.02\n\
                       \tElapsed (wall clock) time (h:mm:ss or m:ss): 0:01.50\n\
                       \tMaximum resident set size (kbytes): 2048\n";
        let usage = parse_time_verbose(sample).unwrap();
        assert_eq!(usage.cpu_time.unwrap().as_time(TimeUnit::Seconds).unwrap(), 0);
        assert_eq!(usage.memory_high_water.unwrap().as_memory(MemoryUnit::KiB).unwrap(), 2048);
        assert_eq!(usage.wall_clock.unwrap().as_time(TimeUnit::Seconds).unwrap(), 2);
    }

    #[test]
    fn parse_time_verbose_tolerates_an_empty_or_missing_file() {
        assert!(parse_time_verbose("").is_none());
    }

    #[tokio::test]
    async fn submit_refuses_when_cores_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path(), 1);
        let task = sample_task(2);
        let err = a.submit(&task).await.unwrap_err();
        assert!(matches!(err, BackendError::Transient(_)));
        // A refused submission must not leave the counter decremented.
        assert_eq!(a.available_cores(), 1);
    }

    #[tokio::test]
    async fn submit_then_poll_until_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path(), 2);
        let task = sample_task(1);

        let job_id = a.submit(&task).await.unwrap();
        assert_eq!(a.available_cores(), 1);

        let mut outcome = a.poll(&job_id).await.unwrap();
        for _ in 0..200 {
            if outcome.exit_info.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            outcome = a.poll(&job_id).await.unwrap();
        }
        assert_eq!(outcome.state, State::Terminating);
        assert!(outcome.exit_info.unwrap().is_success());
        // Cores are returned once the job is observed finished.
        assert_eq!(a.available_cores(), 2);
    }

    #[tokio::test]
    async fn poll_of_unknown_job_errors() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path(), 1);
        let err = a.poll("nonexistent").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancel_of_unknown_job_is_a_warning_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path(), 1);
        assert!(a.cancel("nonexistent").await.is_ok());
    }
}
