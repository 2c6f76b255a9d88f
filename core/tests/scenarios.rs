//! End-to-end scenarios driving the public Engine/Session surface, one per
//! spec §8 walk-through. Fine-grained ordering guarantees (e.g. Sequential
//! never exposing child N+1 before child N terminates) are covered at the
//! unit level in `task::group`; these tests assert the outcome an operator
//! would actually observe.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gc3_common::{MemoryUnit, Quantity, TimeUnit};
use gc3_core::engine::{Engine, EngineConfig};
use gc3_core::error::{BackendError, TransportError};
use gc3_core::resource::batch::flavour::{ScriptHooks, Slurm};
use gc3_core::resource::batch::BatchAdapter;
use gc3_core::resource::cloud::{CloudApi, CloudPool, CloudPoolConfig, FirewallRule, InstanceStatus};
use gc3_core::resource::shell::ShellAdapter;
use gc3_core::resource::transport::{LocalTransport, RunOutput, SshCredentials, Transport};
use gc3_core::resource::{Capabilities, Resource, ResourceAdapter};
use gc3_core::session::Session;
use gc3_core::store;
use gc3_core::task::group::DependencyEdges;
use gc3_core::task::{Node, Requirements, Spec, State, Task, TaskGroup};

fn caps() -> Capabilities {
    Capabilities {
        max_cores_total: 8,
        max_cores_per_task: 4,
        max_memory_per_core: Quantity::memory(4, MemoryUnit::GiB),
        max_walltime: Quantity::time(2, TimeUnit::Hours),
        architecture: vec![],
    }
}

fn spec(command: &str, args: Vec<&str>, stdout: Option<&str>) -> Spec {
    Spec {
        command: command.into(),
        arguments: args.into_iter().map(String::from).collect(),
        inputs: BTreeMap::new(),
        outputs: vec![],
        stdin: None,
        stdout: stdout.map(String::from),
        stderr: None,
        join_stdout_stderr: false,
        environment: BTreeMap::new(),
        requirements: Requirements {
            cores: 1,
            memory_per_core: Quantity::memory(256, MemoryUnit::MiB),
            walltime: Quantity::time(1, TimeUnit::Hours),
            architecture: vec![],
            tags: vec![],
        },
    }
}

async fn wait_until<F>(engine: &Engine, mut done: F)
where
    F: FnMut(&[(gc3_core::task::TaskId, String, State, Option<gc3_core::task::ReturnCode>)]) -> bool,
{
    for _ in 0..200 {
        let snap = engine.snapshot().await.unwrap();
        if done(&snap) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("scenario did not converge in time");
}

// S1: trivial local run (spec §8 S1).
#[tokio::test]
async fn s1_trivial_local_run_terminates_successfully_and_captures_stdout() {
    let work = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let store_url = format!("file://{}", store_dir.path().display());

    let adapter = ShellAdapter::new(Arc::new(LocalTransport), work.path().to_path_buf(), 2, None);
    let resource = Resource::new("localhost", true, caps(), vec![], Box::new(adapter));

    let store: Arc<dyn store::Store> = Arc::from(store::open(&store_url).unwrap());
    let engine = Engine::start(
        EngineConfig { max_in_flight: 1, ..Default::default() },
        vec![resource],
        store,
        "s1",
    )
    .await
    .unwrap();

    let task = Task::new("hello", spec("/bin/echo", vec!["hello"], Some("stdout.txt")));
    let id = task.id.clone();
    engine.add(Node::Leaf(task)).await.unwrap();

    wait_until(&engine, |snap| {
        snap.iter().any(|(i, _, s, _)| i == &id && *s == State::Terminated)
    })
    .await;

    let snap = engine.snapshot().await.unwrap();
    let (_, _, state, rc) = snap.into_iter().find(|(i, ..)| i == &id).unwrap();
    assert_eq!(state, State::Terminated);
    assert!(rc.unwrap().is_success());

    let stdout_path = work.path().join(id.0).join("stdout.txt");
    let captured = tokio::fs::read_to_string(&stdout_path).await.unwrap();
    assert_eq!(captured.trim(), "hello");
}

// S2: sequential group, second child fails (spec §8 S2).
#[tokio::test]
async fn s2_sequential_group_runs_in_order_and_reports_the_failing_child() {
    let work = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let store_url = format!("file://{}", store_dir.path().display());

    let adapter = ShellAdapter::new(Arc::new(LocalTransport), work.path().to_path_buf(), 2, None);
    let resource = Resource::new("localhost", true, caps(), vec![], Box::new(adapter));
    let store: Arc<dyn store::Store> = Arc::from(store::open(&store_url).unwrap());
    let engine = Engine::start(EngineConfig::default(), vec![resource], store, "s2").await.unwrap();

    let a = Task::new("ok", spec("/bin/true", vec![], None));
    let b = Task::new("fails", spec("/bin/false", vec![], None));
    let group = TaskGroup::sequential("seq", vec![a, b]);
    let group_id = group.id.clone();
    engine.add(Node::Group(group)).await.unwrap();

    wait_until(&engine, |snap| {
        snap.iter().any(|(i, _, s, _)| i == &group_id && *s == State::Terminated)
    })
    .await;

    let snap = engine.snapshot().await.unwrap();
    let (_, _, state, rc) = snap.into_iter().find(|(i, ..)| i == &group_id).unwrap();
    assert_eq!(state, State::Terminated);
    assert!(!rc.unwrap().is_success(), "derived return code must reflect the failing second child");
}

// S3: SLURM submission/accounting race within the grace window (spec §8 S3,
// spec §4.2/§9's live-queue-vs-accounting tie-break).
#[derive(Debug, Default)]
struct SlurmRaceTransport {
    sacct_calls: AtomicUsize,
}

#[async_trait]
impl Transport for SlurmRaceTransport {
    async fn run(&self, command: &str, _stdin: Option<&[u8]>) -> Result<RunOutput, TransportError> {
        if command.contains("sbatch") {
            return Ok(RunOutput { stdout: b"Submitted batch job 98765\n".to_vec(), stderr: vec![], exit_status: 0 });
        }
        if command.contains("squeue") {
            // The job has already left the live queue by the time the
            // engine first polls: the scheduler must fall through to
            // accounting rather than treating this as Submitted/Running.
            return Ok(RunOutput { stdout: b"COMPLETED\n".to_vec(), stderr: vec![], exit_status: 0 });
        }
        if command.contains("sacct") {
            let n = self.sacct_calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                // Accounting hasn't caught up yet (spec §9's grace window).
                return Ok(RunOutput { stdout: vec![], stderr: vec![], exit_status: 0 });
            }
            return Ok(RunOutput { stdout: b"COMPLETED 0:0\n".to_vec(), stderr: vec![], exit_status: 0 });
        }
        Ok(RunOutput { stdout: vec![], stderr: vec![], exit_status: 0 })
    }

    async fn get(&self, _remote_path: &str, _local_path: &std::path::Path) -> Result<(), TransportError> {
        Ok(())
    }
    async fn put(&self, _local_path: &std::path::Path, _remote_path: &str) -> Result<(), TransportError> {
        Ok(())
    }
    async fn listdir(&self, _remote_path: &str) -> Result<Vec<String>, TransportError> {
        Ok(vec![])
    }
    async fn remove(&self, _remote_path: &str) -> Result<(), TransportError> {
        Ok(())
    }
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test]
async fn s3_slurm_accounting_lag_is_absorbed_by_the_grace_window() {
    let transport: Arc<dyn Transport> = Arc::new(SlurmRaceTransport::default());
    let adapter = BatchAdapter::new(Slurm, transport, "/remote/work", ScriptHooks::default(), Duration::from_secs(30));

    let task = Task::new("slurm-job", spec("/bin/true", vec![], None));
    let job_id = adapter.submit(&task).await.unwrap();
    assert_eq!(job_id, "98765");

    // First two polls: live queue says COMPLETED, accounting has no rows
    // yet. The task must remain Terminating (§8 S3), not bounce to Unknown.
    for _ in 0..2 {
        let outcome = adapter.poll(&job_id).await.unwrap();
        assert_eq!(outcome.state, State::Terminating);
        assert!(outcome.exit_info.is_none());
    }

    // Third poll: accounting has caught up, within the grace window.
    let outcome = adapter.poll(&job_id).await.unwrap();
    assert_eq!(outcome.state, State::Terminating);
    assert!(outcome.exit_info.unwrap().is_success());
}

// S4: cloud VM provisioning caps the pool at `pool_max_size` and releases
// every VM on shutdown (spec §8 S4, §4.6).
#[derive(Debug, Default)]
struct NeverReadyCloudApi {
    launched: std::sync::Mutex<usize>,
    terminated: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl CloudApi for NeverReadyCloudApi {
    async fn launch_instance(&self, _image_id: &str, _flavour: &str, _keypair: &str, _user_data: &str) -> Result<String, BackendError> {
        let mut n = self.launched.lock().unwrap();
        *n += 1;
        Ok(format!("vm-{n}"))
    }
    async fn instance_status(&self, _instance_id: &str) -> Result<InstanceStatus, BackendError> {
        Ok(InstanceStatus { provisioning: true, running: false, public_address: None })
    }
    async fn terminate_instance(&self, instance_id: &str) -> Result<(), BackendError> {
        self.terminated.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }
    async fn keypair_fingerprint(&self, _keypair: &str) -> Result<Option<String>, BackendError> {
        Ok(None)
    }
    async fn security_group_rules(&self, _group: &str) -> Result<Option<Vec<FirewallRule>>, BackendError> {
        Ok(Some(vec![]))
    }
    async fn add_security_group_rule(&self, _group: &str, _rule: &FirewallRule) -> Result<(), BackendError> {
        Ok(())
    }
}

#[tokio::test]
async fn s4_cloud_pool_never_exceeds_its_configured_size_and_shutdown_releases_every_vm() {
    let api = Arc::new(NeverReadyCloudApi::default());
    let config = CloudPoolConfig {
        endpoint: "https://cloud.example.invalid".into(),
        region: "eu-west".into(),
        image_id: "ami-base".into(),
        image_id_per_tag: std::collections::HashMap::new(),
        flavour: "m1.small".into(),
        flavour_per_tag: std::collections::HashMap::new(),
        keypair: "gc3-key".into(),
        expected_keypair_fingerprint: None,
        security_group: "gc3-sg".into(),
        required_rules: vec![FirewallRule { protocol: "tcp".into(), port_range: "22".into() }],
        user_data: String::new(),
        user_data_per_tag: std::collections::HashMap::new(),
        pool_max_size: 2,
        idle_window: Duration::from_secs(300),
        ssh_credentials: SshCredentials {
            username: "gc3".into(),
            port: 22,
            keyfile: None,
            ssh_config: None,
            connect_timeout: Duration::from_secs(5),
        },
    };
    let pool = CloudPool::new(config, api.clone());

    for _ in 0..3 {
        let task = Task::new("cloud-job", spec("/bin/true", vec![], None));
        // None of these ever promote to Ready (the mock never reports
        // `running`), so every submit stays pending-on-provisioning.
        let _ = pool.submit(&task).await;
    }

    assert_eq!(pool.vm_count().await, 2, "pool must not exceed pool_max_size even under repeated demand");

    pool.shutdown().await.unwrap();
    assert_eq!(pool.vm_count().await, 0);
    assert_eq!(api.terminated.lock().unwrap().len(), 2);
}

// S5: resume after a crash (spec §8 S5): reopening a Session against the
// same Store picks the task back up without losing persisted history.
#[tokio::test]
async fn s5_resuming_a_session_from_disk_continues_a_task_to_completion() {
    let base = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let store_url = format!("file://{}", base.path().join("store").display());

    let task_id;
    {
        let session = Session::create(base.path(), "campaign", &store_url).await.unwrap();
        let adapter = ShellAdapter::new(Arc::new(LocalTransport), work.path().to_path_buf(), 2, None);
        let resource = Resource::new("localhost", true, caps(), vec![], Box::new(adapter));
        let engine = Engine::start(EngineConfig::default(), vec![resource], session.store(), "campaign").await.unwrap();

        let task = Task::new("long-job", spec("/bin/true", vec![], None));
        task_id = task.id.clone();
        let id = engine.add(Node::Leaf(task)).await.unwrap();
        session.add(&id).await.unwrap();
        // Simulate a crash: no ticks are run and neither `close` nor `abort`
        // is called before the engine/session are dropped, so the task is
        // still persisted as `New` and the session has no end timestamp.
    }

    // "Crash" recovery: reopen the session, reload the task from the store,
    // re-register it with a fresh engine, and let it run to completion.
    let session = Session::open(base.path(), "campaign").await.unwrap();
    assert!(session.ended_at().await.is_none());
    let ids = session.list().await.unwrap();
    assert_eq!(ids, vec![task_id.clone()]);

    let reloaded = session.store().load_task(&task_id).await.unwrap();
    assert_eq!(reloaded.state(), State::New);

    let adapter = ShellAdapter::new(Arc::new(LocalTransport), work.path().to_path_buf(), 2, None);
    let resource = Resource::new("localhost", true, caps(), vec![], Box::new(adapter));
    let engine = Engine::start(EngineConfig::default(), vec![resource], session.store(), "campaign").await.unwrap();
    engine.add(Node::Leaf(reloaded)).await.unwrap();

    wait_until(&engine, |snap| {
        snap.iter().any(|(i, _, s, _)| i == &task_id && *s == State::Terminated)
    })
    .await;
}

// S6: redo preserves history while resetting the run record (spec §8 S6).
#[tokio::test]
async fn s6_redo_resets_state_but_keeps_history_then_runs_to_completion_again() {
    let work = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let store_url = format!("file://{}", store_dir.path().display());

    let adapter = ShellAdapter::new(Arc::new(LocalTransport), work.path().to_path_buf(), 2, None);
    let resource = Resource::new("localhost", true, caps(), vec![], Box::new(adapter));
    let store: Arc<dyn store::Store> = Arc::from(store::open(&store_url).unwrap());
    let engine = Engine::start(EngineConfig::default(), vec![resource], store, "s6").await.unwrap();

    let task = Task::new("redo-me", spec("/bin/true", vec![], None));
    let id = engine.add(Node::Leaf(task)).await.unwrap();

    wait_until(&engine, |snap| snap.iter().any(|(i, _, s, _)| i == &id && *s == State::Terminated)).await;

    engine.redo(id.clone()).await.unwrap();
    let snap = engine.snapshot().await.unwrap();
    let (_, _, state, rc) = snap.into_iter().find(|(i, ..)| i == &id).unwrap();
    assert_eq!(state, State::New, "redo must reset the run record to New");
    assert!(rc.is_none());

    wait_until(&engine, |snap| snap.iter().any(|(i, _, s, _)| i == &id && *s == State::Terminated)).await;
}

// Dependency group ordering guarantee exercised end to end against the
// derived group state the operator would observe (spec §8 property 4; the
// child-eligibility detail itself is covered in `task::group`'s unit tests).
#[tokio::test]
async fn dependency_group_skips_the_successor_when_its_predecessor_fails() {
    let work = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let store_url = format!("file://{}", store_dir.path().display());

    let adapter = ShellAdapter::new(Arc::new(LocalTransport), work.path().to_path_buf(), 2, None);
    let resource = Resource::new("localhost", true, caps(), vec![], Box::new(adapter));
    let store: Arc<dyn store::Store> = Arc::from(store::open(&store_url).unwrap());
    let engine = Engine::start(EngineConfig::default(), vec![resource], store, "dep").await.unwrap();

    let a = Task::new("will-fail", spec("/bin/false", vec![], None));
    let b = Task::new("never-runs", spec("/bin/true", vec![], None));
    let a_id = a.id.clone();
    let b_id = b.id.clone();
    let mut edges = DependencyEdges::new();
    edges.insert(b_id.clone(), vec![a_id.clone()]);
    let group = TaskGroup::dependency("dep", vec![a, b], edges);
    let group_id = group.id.clone();
    engine.add(Node::Group(group)).await.unwrap();

    wait_until(&engine, |snap| {
        snap.iter().any(|(i, _, s, _)| i == &group_id && *s == State::Terminated)
    })
    .await;

    let snap = engine.snapshot().await.unwrap();
    let (_, _, state, rc) = snap.into_iter().find(|(i, ..)| i == &group_id).unwrap();
    assert_eq!(state, State::Terminated);
    assert!(!rc.unwrap().is_success());
}

// Session::abort (spec §4.7): kills every non-terminal top-level task it
// owns and does not return until they are all terminal.
#[tokio::test]
async fn abort_kills_non_terminal_top_level_tasks_and_waits_for_termination() {
    let base = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let store_url = format!("file://{}", base.path().join("store").display());

    let session = Session::create(base.path(), "aborted-campaign", &store_url).await.unwrap();
    let adapter = ShellAdapter::new(Arc::new(LocalTransport), work.path().to_path_buf(), 2, None);
    let resource = Resource::new("localhost", true, caps(), vec![], Box::new(adapter));
    let engine =
        Engine::start(EngineConfig::default(), vec![resource], session.store(), "aborted-campaign").await.unwrap();

    let task = Task::new("sleeper", spec("/bin/sleep", vec!["30"], None));
    let id = engine.add(Node::Leaf(task)).await.unwrap();
    session.add(&id).await.unwrap();

    // Let the submission pass actually launch the job before aborting, so
    // abort is exercised against a task that is genuinely running, not one
    // still sitting in New.
    wait_until(&engine, |snap| snap.iter().any(|(i, _, s, _)| i == &id && *s != State::New)).await;

    session.abort(&engine).await.unwrap();

    let snap = engine.snapshot().await.unwrap();
    let (_, _, state, _) = snap.into_iter().find(|(i, ..)| i == &id).unwrap();
    assert_eq!(state, State::Terminated, "abort must wait until the task is terminal");
    assert!(session.ended_at().await.is_some());
}
