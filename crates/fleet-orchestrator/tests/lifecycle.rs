//! End-to-end lifecycle tests with real child processes.
//!
//! The spawned "server" is `/bin/sh`; reachability for the health probe is
//! provided by a TCP listener owned by the test, so the suite does not
//! depend on a real server binary. Unix-only because it spawns `sh` and
//! relies on SIGTERM for graceful stops.
#![cfg(unix)]

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use fleet_orchestrator::logs::FLEET_PREFIX;
use fleet_orchestrator::{
    DeviceSelector, FleetConfig, InstanceConfig, InstanceRegistry, InstanceState, LogHub,
    RegistryError, ServerCommand,
};
use tokio::time::Instant;

/// Fleet config spawning `sh -c <script>`; launch flags land in the
/// script's positional parameters and are ignored.
fn sh_fleet(script: &str) -> FleetConfig {
    FleetConfig::new(ServerCommand::new("/bin/sh").with_args(["-c", script, "server"]))
        .with_port_range(18300, 18399)
        .with_probe_timeout(Duration::from_secs(5))
        .with_probe_interval(Duration::from_millis(50))
        .with_grace_period(Duration::from_secs(2))
        .with_kill_timeout(Duration::from_secs(2))
}

fn registry_with(script: &str) -> (InstanceRegistry, Arc<LogHub>) {
    let logs = Arc::new(LogHub::new());
    let registry = InstanceRegistry::new(sh_fleet(script), Arc::clone(&logs));
    (registry, logs)
}

fn gpu(index: u32, port: u16) -> InstanceConfig {
    InstanceConfig::new(DeviceSelector::Gpu(index), format!("GPU {}", index), port)
}

fn cpu(port: u16) -> InstanceConfig {
    InstanceConfig::new(DeviceSelector::Cpu, "CPU (no GPU)", port)
}

async fn wait_for_state(
    registry: &InstanceRegistry,
    id: &str,
    expected: InstanceState,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;
    loop {
        let state = registry.get(id).map(|s| s.state);
        if state == Some(expected) {
            return;
        }
        if Instant::now() >= deadline {
            panic!("instance {} never reached {} (last seen: {:?})", id, expected, state);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn start_reaches_running_and_stop_reaches_stopped() {
    let (registry, _logs) = registry_with("sleep 30");
    let _listener = TcpListener::bind("127.0.0.1:18301").unwrap();

    registry.add_instance(gpu(0, 18301)).unwrap();
    registry.start_instance("gpu0_18301").unwrap();
    assert_eq!(
        registry.get("gpu0_18301").unwrap().state,
        InstanceState::Starting
    );

    wait_for_state(&registry, "gpu0_18301", InstanceState::Running, Duration::from_secs(5)).await;
    let snap = registry.get("gpu0_18301").unwrap();
    assert_eq!(snap.url.as_deref(), Some("http://127.0.0.1:18301"));
    assert!(snap.pid.is_some());
    assert_eq!(registry.running_count(), 1);

    registry.stop_instance("gpu0_18301").unwrap();
    wait_for_state(&registry, "gpu0_18301", InstanceState::Stopped, Duration::from_secs(6)).await;
    let snap = registry.get("gpu0_18301").unwrap();
    assert!(snap.url.is_none());
    assert!(snap.last_error.is_none());
}

#[tokio::test]
async fn start_while_running_is_invalid_state() {
    let (registry, _logs) = registry_with("sleep 30");
    let _listener = TcpListener::bind("127.0.0.1:18303").unwrap();

    registry.add_instance(gpu(0, 18303)).unwrap();
    registry.start_instance("gpu0_18303").unwrap();
    wait_for_state(&registry, "gpu0_18303", InstanceState::Running, Duration::from_secs(5)).await;

    assert!(matches!(
        registry.start_instance("gpu0_18303"),
        Err(RegistryError::InvalidState { .. })
    ));
    // The rejected call left the instance untouched.
    assert_eq!(registry.get("gpu0_18303").unwrap().state, InstanceState::Running);

    registry.stop_instance("gpu0_18303").unwrap();
    wait_for_state(&registry, "gpu0_18303", InstanceState::Stopped, Duration::from_secs(6)).await;
}

#[tokio::test]
async fn stop_is_idempotent_under_repeated_calls() {
    let (registry, _logs) = registry_with("sleep 30");
    let _listener = TcpListener::bind("127.0.0.1:18305").unwrap();

    registry.add_instance(cpu(18305)).unwrap();
    registry.start_instance("cpu_18305").unwrap();
    wait_for_state(&registry, "cpu_18305", InstanceState::Running, Duration::from_secs(5)).await;

    registry.stop_instance("cpu_18305").unwrap();
    registry.stop_instance("cpu_18305").unwrap();
    wait_for_state(&registry, "cpu_18305", InstanceState::Stopped, Duration::from_secs(6)).await;
    registry.stop_instance("cpu_18305").unwrap();
    assert_eq!(registry.get("cpu_18305").unwrap().state, InstanceState::Stopped);
}

#[tokio::test]
async fn two_instances_run_concurrently_with_distinct_urls_and_prefixes() {
    let (registry, logs) = registry_with("echo booting; sleep 30");
    let _l1 = TcpListener::bind("127.0.0.1:18310").unwrap();
    let _l2 = TcpListener::bind("127.0.0.1:18311").unwrap();

    registry.add_instance(gpu(0, 18310)).unwrap();
    registry.add_instance(gpu(1, 18311)).unwrap();

    let outcomes = registry.start_all();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, r)| r.is_ok()));

    wait_for_state(&registry, "gpu0_18310", InstanceState::Running, Duration::from_secs(5)).await;
    wait_for_state(&registry, "gpu1_18311", InstanceState::Running, Duration::from_secs(5)).await;

    let urls: Vec<Option<String>> = registry.list().into_iter().map(|s| s.url).collect();
    assert!(urls.contains(&Some("http://127.0.0.1:18310".to_string())));
    assert!(urls.contains(&Some("http://127.0.0.1:18311".to_string())));

    // Each instance's output carries its own prefix, no cross-contamination.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let a = logs.recent(100, Some("[GPU0:18310]"));
        let b = logs.recent(100, Some("[GPU1:18311]"));
        if a.iter().any(|l| l.line == "booting") && b.iter().any(|l| l.line == "booting") {
            break;
        }
        if Instant::now() >= deadline {
            panic!("prefixed output lines never arrived");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(logs
        .recent(100, Some("[GPU0:18310]"))
        .iter()
        .all(|l| l.prefix == "[GPU0:18310]"));

    registry.stop_all();
    wait_for_state(&registry, "gpu0_18310", InstanceState::Stopped, Duration::from_secs(6)).await;
    wait_for_state(&registry, "gpu1_18311", InstanceState::Stopped, Duration::from_secs(6)).await;
}

#[tokio::test]
async fn unexpected_exit_after_running_crashes_exactly_once() {
    let (registry, logs) = registry_with("sleep 1; exit 7");
    let _listener = TcpListener::bind("127.0.0.1:18320").unwrap();

    registry.add_instance(gpu(0, 18320)).unwrap();
    registry.start_instance("gpu0_18320").unwrap();
    wait_for_state(&registry, "gpu0_18320", InstanceState::Running, Duration::from_secs(5)).await;
    wait_for_state(&registry, "gpu0_18320", InstanceState::Crashed, Duration::from_secs(5)).await;

    let snap = registry.get("gpu0_18320").unwrap();
    assert!(snap.last_error.as_deref().unwrap_or("").contains("7"));
    assert!(snap.url.is_none());

    // Give any stray duplicate a chance to surface, then count crash reports.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let crash_lines = logs
        .recent(1000, Some(FLEET_PREFIX))
        .into_iter()
        .filter(|l| l.line.contains("crashed: exited"))
        .count();
    assert_eq!(crash_lines, 1);
}

#[tokio::test]
async fn crashed_instance_can_be_started_again() {
    let (registry, _logs) = registry_with("exit 1");
    registry.add_instance(cpu(18325)).unwrap();

    registry.start_instance("cpu_18325").unwrap();
    wait_for_state(&registry, "cpu_18325", InstanceState::Crashed, Duration::from_secs(5)).await;

    // No auto-retry happened, but an explicit start is accepted.
    registry.start_instance("cpu_18325").unwrap();
    wait_for_state(&registry, "cpu_18325", InstanceState::Crashed, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn probe_timeout_resolves_to_crashed() {
    // Nothing listens on the port, so the probe can never succeed.
    let logs = Arc::new(LogHub::new());
    let config = sh_fleet("sleep 30").with_probe_timeout(Duration::from_millis(400));
    let registry = InstanceRegistry::new(config, Arc::clone(&logs));

    registry.add_instance(cpu(18330)).unwrap();
    registry.start_instance("cpu_18330").unwrap();
    wait_for_state(&registry, "cpu_18330", InstanceState::Crashed, Duration::from_secs(5)).await;

    let snap = registry.get("cpu_18330").unwrap();
    assert_eq!(snap.last_error.as_deref(), Some("health probe timed out"));
}

#[tokio::test]
async fn start_all_reports_port_conflict_independently() {
    let (registry, _logs) = registry_with("sleep 30");
    let _l1 = TcpListener::bind("127.0.0.1:18340").unwrap();
    let _l2 = TcpListener::bind("127.0.0.1:18341").unwrap();

    registry.add_instance(gpu(0, 18340)).unwrap();
    registry.add_instance(gpu(1, 18341)).unwrap();
    // Allowed while the holder is stopped, but only one may go live.
    registry.add_instance(cpu(18340)).unwrap();

    let outcomes = registry.start_all();
    assert_eq!(outcomes.len(), 3);
    let failures: Vec<_> = outcomes
        .iter()
        .filter_map(|(id, r)| r.as_ref().err().map(|e| (id.clone(), e)))
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0].1,
        RegistryError::DuplicatePort { port: 18340, .. }
    ));

    // The two non-conflicting instances still come up.
    let survivors: Vec<String> = outcomes
        .iter()
        .filter(|(_, r)| r.is_ok())
        .map(|(id, _)| id.clone())
        .collect();
    for id in &survivors {
        wait_for_state(&registry, id, InstanceState::Running, Duration::from_secs(5)).await;
    }

    registry.stop_all();
    for id in &survivors {
        wait_for_state(&registry, id, InstanceState::Stopped, Duration::from_secs(6)).await;
    }
}

#[tokio::test]
async fn port_is_reusable_once_holder_fully_stopped() {
    let (registry, _logs) = registry_with("sleep 30");
    let _listener = TcpListener::bind("127.0.0.1:18350").unwrap();

    registry.add_instance(gpu(0, 18350)).unwrap();
    registry.start_instance("gpu0_18350").unwrap();
    wait_for_state(&registry, "gpu0_18350", InstanceState::Running, Duration::from_secs(5)).await;

    // While the holder is live the port is rejected outright.
    assert!(matches!(
        registry.add_instance(cpu(18350)),
        Err(RegistryError::DuplicatePort { port: 18350, .. })
    ));

    registry.stop_instance("gpu0_18350").unwrap();
    wait_for_state(&registry, "gpu0_18350", InstanceState::Stopped, Duration::from_secs(6)).await;

    let snap = registry.add_instance(cpu(18350)).unwrap();
    assert_eq!(snap.id, "cpu_18350");
}

#[tokio::test]
async fn remove_running_instance_is_rejected() {
    let (registry, _logs) = registry_with("sleep 30");
    let _listener = TcpListener::bind("127.0.0.1:18360").unwrap();

    registry.add_instance(gpu(0, 18360)).unwrap();
    registry.start_instance("gpu0_18360").unwrap();
    wait_for_state(&registry, "gpu0_18360", InstanceState::Running, Duration::from_secs(5)).await;

    assert!(matches!(
        registry.remove_instance("gpu0_18360"),
        Err(RegistryError::InvalidState { .. })
    ));

    registry.stop_instance("gpu0_18360").unwrap();
    wait_for_state(&registry, "gpu0_18360", InstanceState::Stopped, Duration::from_secs(6)).await;
    registry.remove_instance("gpu0_18360").unwrap();
    assert!(registry.get("gpu0_18360").is_none());
}
