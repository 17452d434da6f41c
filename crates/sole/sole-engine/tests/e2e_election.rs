//! End-to-end multi-process election test.
//!
//! # Overview
//!
//! Several OS processes start the same application at the same instant and
//! race for the primary role. The winner collects one message from every
//! loser; afterwards a late process must find the block vacant and take over.
//!
//! # Test Architecture
//!
//! The test executable re-invokes itself with a role environment variable.
//! Each child writes a one-line result file into the shared runtime
//! directory, which the orchestrator reads once every child has exited.
//!
//! ```text
//! [orchestrator] --spawn x CONTENDERS--> [contender]...  (start together)
//!                                          |  one primary, collects messages
//!                                          |  the rest send "hello from <pid>"
//!                --wait, read results--
//!                --spawn--> [latecomer]  must be primary again
//! ```
//!
//! # Running the Test
//!
//! ```bash
//! cargo test -p sole-engine --test e2e_election -- --nocapture
//! ```

use sole_config::SoleConfig;
use sole_engine::{InstanceEvent, SingleInstance};
use std::collections::BTreeSet;
use std::env;
use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Writes to stderr with an immediate flush so output survives capture.
macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const TEST_NAME: &str = "e2e_processes_elect_one_primary";

const ENV_ROLE: &str = "SOLE_E2E_ROLE";
const ENV_DIR: &str = "SOLE_E2E_DIR";
const ENV_START_AT_MS: &str = "SOLE_E2E_START_AT_MS";
const ENV_EXPECT: &str = "SOLE_E2E_EXPECT";

const ROLE_CONTENDER: &str = "contender";
const ROLE_LATECOMER: &str = "latecomer";

const CONTENDERS: usize = 5;

/// How long a primary waits for the expected messages.
const COLLECT_WINDOW: Duration = Duration::from_secs(15);

fn config(dir: &Path) -> SoleConfig {
    let mut config = SoleConfig::for_app("sole-e2e");
    config.runtime_dir = Some(dir.to_path_buf());
    config.timeout_ms = 3000;
    config
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis()
}

/// Child entry point. Elects, plays the role it got, records the result.
fn run_child(dir: &Path, expect_messages: usize) {
    if let Ok(at) = env::var(ENV_START_AT_MS) {
        let at: u128 = at.parse().expect("bad start time");
        let now = now_ms();
        if at > now {
            std::thread::sleep(Duration::from_millis((at - now) as u64));
        }
    }

    let pid = std::process::id();
    let mut instance = SingleInstance::start(&config(dir)).expect("start failed");

    let result = if instance.is_primary() {
        log!("[{pid}] primary, expecting {expect_messages} messages");
        let mut senders = BTreeSet::new();
        let deadline = Instant::now() + COLLECT_WINDOW;
        while senders.len() < expect_messages {
            let left = deadline.saturating_duration_since(Instant::now());
            match instance.events().recv_timeout(left) {
                Ok(InstanceEvent::Message { instance_id, payload }) => {
                    log!("[{pid}] message from #{instance_id}: {}", String::from_utf8_lossy(&payload));
                    assert!(payload.starts_with(b"hello from "));
                    senders.insert(instance_id);
                }
                Ok(InstanceEvent::Started) => {}
                Err(_) => panic!("[{pid}] only heard from {senders:?}"),
            }
        }
        let ids: Vec<String> = senders.iter().map(u32::to_string).collect();
        format!("primary {}", ids.join(","))
    } else {
        let id = instance.instance_id();
        log!("[{pid}] secondary #{id}, primary pid {}", instance.primary_pid());
        assert!(instance.primary_pid() > 0);

        let payload = format!("hello from {pid}");
        let deadline = Instant::now() + COLLECT_WINDOW;
        while !instance.send_message(payload.as_bytes(), Duration::from_secs(2)) {
            assert!(Instant::now() < deadline, "[{pid}] primary unreachable");
        }
        format!("secondary {id}")
    };

    std::fs::write(dir.join(format!("result-{pid}")), &result).expect("write result");
    log!("[{pid}] done: {result}");
}

fn spawn(exe: &Path, dir: &Path, role: &str, start_at: u128, expect: usize) -> Child {
    Command::new(exe)
        .arg("--exact")
        .arg(TEST_NAME)
        .arg("--nocapture")
        .env(ENV_ROLE, role)
        .env(ENV_DIR, dir)
        .env(ENV_START_AT_MS, start_at.to_string())
        .env(ENV_EXPECT, expect.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("failed to spawn child")
}

fn take_results(dir: &Path) -> Vec<String> {
    let mut results = Vec::new();
    for entry in std::fs::read_dir(dir).expect("read runtime dir") {
        let path = entry.expect("dir entry").path();
        let is_result = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("result-"));
        if is_result {
            results.push(std::fs::read_to_string(&path).expect("read result"));
            std::fs::remove_file(&path).expect("remove result");
        }
    }
    results.sort();
    results
}

#[test]
fn e2e_processes_elect_one_primary() {
    if let Ok(role) = env::var(ENV_ROLE) {
        let dir = env::var(ENV_DIR).expect("SOLE_E2E_DIR not set");
        let expect: usize = env::var(ENV_EXPECT).expect("SOLE_E2E_EXPECT not set").parse().unwrap();
        match role.as_str() {
            ROLE_CONTENDER | ROLE_LATECOMER => run_child(Path::new(&dir), expect),
            other => panic!("Unknown role: {other}"),
        }
        return;
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let exe = env::current_exe().expect("Failed to get current executable path");

    log!("[ORCHESTRATOR] Spawning {CONTENDERS} contenders in {}", dir.path().display());
    let start_at = now_ms() + 300;
    let children: Vec<Child> = (0..CONTENDERS)
        .map(|_| spawn(&exe, dir.path(), ROLE_CONTENDER, start_at, CONTENDERS - 1))
        .collect();

    for mut child in children {
        let status = child.wait().expect("wait for contender");
        assert!(status.success(), "contender failed: {status}");
    }

    let results = take_results(dir.path());
    log!("[ORCHESTRATOR] Results: {results:?}");
    assert_eq!(results.len(), CONTENDERS);

    let primaries: Vec<&String> = results.iter().filter(|r| r.starts_with("primary")).collect();
    assert_eq!(primaries.len(), 1, "exactly one primary expected");

    let secondary_ids: BTreeSet<u32> = results
        .iter()
        .filter_map(|r| r.strip_prefix("secondary "))
        .map(|id| id.parse().expect("instance id"))
        .collect();
    let expected: BTreeSet<u32> = (1..CONTENDERS as u32).collect();
    assert_eq!(secondary_ids, expected, "instance ids must be 1..N-1 without gaps");

    let heard: BTreeSet<u32> = primaries[0]
        .trim_start_matches("primary ")
        .split(',')
        .map(|id| id.parse().expect("instance id"))
        .collect();
    assert_eq!(heard, expected, "primary must hear every secondary under its declared id");

    log!("[ORCHESTRATOR] Spawning latecomer after the primary exited");
    let status = spawn(&exe, dir.path(), ROLE_LATECOMER, 0, 0)
        .wait()
        .expect("wait for latecomer");
    assert!(status.success(), "latecomer failed: {status}");
    assert_eq!(take_results(dir.path()), ["primary "]);

    log!("[ORCHESTRATOR] Election test passed");
}
