//! Fakes shared by the integration tests

#![allow(dead_code)]

use hwbroker::platform::{BatchRequest, PlatformError, PlatformIo, PlatformResult, SignalBehavior};
use hwbroker::process::ProcessTable;
use hwbroker::secure::SecureFs;
use hwbroker::{BrokerContext, BrokerPaths};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

pub const SIGNALS: [&str; 3] = ["ENERGY", "POWER", "TEMPERATURE"];
pub const CONTROLS: [&str; 3] = ["FREQUENCY", "POWER_LIMIT", "UNCORE_FREQUENCY"];

/// Hardware layer that records every call it receives
#[derive(Default)]
pub struct FakeIo {
    calls: Mutex<Vec<String>>,
    next_server_pid: Mutex<i32>,
    fail_reads: Mutex<bool>,
    fail_saves: Mutex<bool>,
}

impl FakeIo {
    pub fn new() -> Self {
        Self {
            next_server_pid: Mutex::new(5000),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail_reads(&self) {
        *self.fail_reads.lock().unwrap() = true;
    }

    pub fn fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap() = fail;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn known(names: &[&str], name: &str) -> PlatformResult<()> {
    if names.contains(&name) {
        Ok(())
    } else {
        Err(PlatformError::new(format!("unknown name: {}", name)))
    }
}

impl PlatformIo for FakeIo {
    fn signal_names(&self) -> Vec<String> {
        SIGNALS.iter().map(|s| s.to_string()).collect()
    }

    fn control_names(&self) -> Vec<String> {
        CONTROLS.iter().map(|s| s.to_string()).collect()
    }

    fn read_signal(&self, name: &str, domain: i32, domain_idx: i32) -> PlatformResult<f64> {
        self.record(format!("read_signal {} {} {}", name, domain, domain_idx));
        if *self.fail_reads.lock().unwrap() {
            return Err(PlatformError::new("msr read failed"));
        }
        known(&SIGNALS, name)?;
        Ok(42.5)
    }

    fn write_control(&self, name: &str, domain: i32, domain_idx: i32, value: f64) -> PlatformResult<()> {
        self.record(format!("write_control {} {} {} {}", name, domain, domain_idx, value));
        known(&CONTROLS, name)
    }

    fn save_control_dir(&self, dir: &Path) -> PlatformResult<()> {
        self.record(format!("save_control_dir {}", dir.display()));
        if *self.fail_saves.lock().unwrap() {
            return Err(PlatformError::new("save failed"));
        }
        Ok(())
    }

    fn restore_control_dir(&self, dir: &Path) -> PlatformResult<()> {
        self.record(format!("restore_control_dir {}", dir.display()));
        Ok(())
    }

    fn signal_description(&self, name: &str) -> PlatformResult<String> {
        known(&SIGNALS, name)?;
        Ok(format!("{} description", name))
    }

    fn control_description(&self, name: &str) -> PlatformResult<String> {
        known(&CONTROLS, name)?;
        Ok(format!("{} description", name))
    }

    fn signal_domain_type(&self, name: &str) -> PlatformResult<i32> {
        known(&SIGNALS, name)?;
        Ok(2)
    }

    fn control_domain_type(&self, name: &str) -> PlatformResult<i32> {
        known(&CONTROLS, name)?;
        Ok(3)
    }

    fn signal_info(&self, name: &str) -> PlatformResult<SignalBehavior> {
        known(&SIGNALS, name)?;
        Ok(SignalBehavior {
            aggregation: 1,
            format: 0,
            behavior: 2,
        })
    }

    fn start_batch_server(
        &self,
        client_pid: i32,
        signals: &[BatchRequest],
        controls: &[BatchRequest],
    ) -> PlatformResult<(i32, String)> {
        self.record(format!(
            "start_batch_server {} {} {}",
            client_pid,
            signals.len(),
            controls.len()
        ));
        let mut next = self.next_server_pid.lock().unwrap();
        *next += 1;
        Ok((*next, format!("batch-key-{}", *next)))
    }

    fn stop_batch_server(&self, server_pid: i32) -> PlatformResult<()> {
        self.record(format!("stop_batch_server {}", server_pid));
        Ok(())
    }

    fn create_topo_cache(&self, path: &Path) -> PlatformResult<()> {
        self.record("create_topo_cache".to_string());
        fs::write(path, "board 1\npackage 2\ncore 8\n").map_err(|e| PlatformError::new(e.to_string()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
            .map_err(|e| PlatformError::new(e.to_string()))
    }
}

/// Process table with scripted processes
#[derive(Default)]
pub struct FakeProcesses {
    created: Mutex<HashMap<i32, SystemTime>>,
    sessions: Mutex<HashMap<i32, i32>>,
}

impl FakeProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    /// A process started an hour ago
    pub fn spawn(&self, pid: i32) {
        self.created
            .lock()
            .unwrap()
            .insert(pid, SystemTime::now() - Duration::from_secs(3600));
    }

    /// A process started an hour ago in session `sid`
    pub fn spawn_in_session(&self, pid: i32, sid: i32) {
        self.spawn(pid);
        self.sessions.lock().unwrap().insert(pid, sid);
    }

    /// The pid now belongs to a process newer than any session file
    pub fn reuse(&self, pid: i32) {
        self.created
            .lock()
            .unwrap()
            .insert(pid, SystemTime::now() + Duration::from_secs(3600));
    }

    pub fn kill(&self, pid: i32) {
        self.created.lock().unwrap().remove(&pid);
        self.sessions.lock().unwrap().remove(&pid);
    }
}

impl ProcessTable for FakeProcesses {
    fn create_time(&self, pid: i32) -> Option<SystemTime> {
        self.created.lock().unwrap().get(&pid).copied()
    }

    fn session_id(&self, pid: i32) -> Option<i32> {
        self.sessions.lock().unwrap().get(&pid).copied()
    }
}

/// Scratch broker layout: state and access directories under a tempdir
pub struct Harness {
    pub temp: TempDir,
    pub io: Arc<FakeIo>,
    pub processes: Arc<FakeProcesses>,
    pub store: Arc<SecureFs>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().unwrap(),
            io: Arc::new(FakeIo::new()),
            processes: Arc::new(FakeProcesses::new()),
            store: Arc::new(SecureFs::new()),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.temp.path().join("state")
    }

    pub fn access_dir(&self) -> PathBuf {
        self.temp.path().join("access")
    }

    pub fn context(&self) -> BrokerContext {
        BrokerContext::new(
            self.io.clone(),
            self.store.clone(),
            self.processes.clone(),
            BrokerPaths::new(self.state_dir(), self.access_dir()),
        )
    }

    /// Write an access list file the way an administrator would
    pub fn write_access(&self, relative_dir: &str, signals: &[&str], controls: &[&str]) {
        let root = self.access_dir();
        let dir = root.join(relative_dir);
        fs::create_dir_all(&dir).unwrap();
        // Broker-created directories are 0700; match so later updates keep them
        let mut current = dir.as_path();
        while current.starts_with(&root) {
            fs::set_permissions(current, fs::Permissions::from_mode(0o700)).unwrap();
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        for (file, names) in [("allowed_signals", signals), ("allowed_controls", controls)] {
            let path = dir.join(file);
            let mut contents = String::from("# managed by tests\n");
            for name in names {
                contents.push_str(name);
                contents.push('\n');
            }
            fs::write(&path, contents).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        }
    }
}

pub fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}
