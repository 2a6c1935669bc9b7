//! In-memory platform backend driven by configuration
//!
//! Stands in for hardware access: signals report configured values, controls
//! keep the last value written, and batch servers are real child processes.

use super::batch::BatchProcess;
use super::io::{BatchRequest, PlatformError, PlatformIo, PlatformResult, SignalBehavior};
use crate::config::{ControlConfig, PlatformConfig, SignalConfig};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SAVE_FILE: &str = "controls.json";

/// Configuration-backed [`PlatformIo`]
pub struct MemoryIo {
    signals: BTreeMap<String, SignalConfig>,
    controls: BTreeMap<String, ControlConfig>,
    values: Mutex<BTreeMap<String, f64>>,
    batch_command: Vec<String>,
    topology: String,
    batch_servers: Mutex<HashMap<i32, BatchProcess>>,
}

impl MemoryIo {
    pub fn new(config: &PlatformConfig) -> Self {
        let signals = config
            .signals
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        let controls: BTreeMap<String, ControlConfig> = config
            .controls
            .iter()
            .map(|c| (c.name.clone(), c.clone()))
            .collect();
        let values = controls
            .values()
            .map(|c| (c.name.clone(), c.value))
            .collect();

        Self {
            signals,
            controls,
            values: Mutex::new(values),
            batch_command: config.batch_command.clone(),
            topology: config.topology.clone(),
            batch_servers: Mutex::new(HashMap::new()),
        }
    }

    fn values(&self) -> MutexGuard<'_, BTreeMap<String, f64>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn batch_servers(&self) -> MutexGuard<'_, HashMap<i32, BatchProcess>> {
        self.batch_servers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn signal(&self, name: &str) -> PlatformResult<&SignalConfig> {
        self.signals
            .get(name)
            .ok_or_else(|| PlatformError::new(format!("unknown signal: {}", name)))
    }

    fn control(&self, name: &str) -> PlatformResult<&ControlConfig> {
        self.controls
            .get(name)
            .ok_or_else(|| PlatformError::new(format!("unknown control: {}", name)))
    }

    /// Number of batch servers currently supervised
    pub fn batch_server_count(&self) -> usize {
        self.batch_servers().len()
    }
}

fn check_domain(name: &str, expected: i32, domain: i32, domain_idx: i32) -> PlatformResult<()> {
    if domain != expected {
        return Err(PlatformError::new(format!(
            "{} is not defined for domain {} (native domain is {})",
            name, domain, expected
        )));
    }
    if domain_idx < 0 {
        return Err(PlatformError::new(format!(
            "invalid domain index {} for {}",
            domain_idx, name
        )));
    }
    Ok(())
}

impl PlatformIo for MemoryIo {
    fn signal_names(&self) -> Vec<String> {
        self.signals.keys().cloned().collect()
    }

    fn control_names(&self) -> Vec<String> {
        self.controls.keys().cloned().collect()
    }

    fn read_signal(&self, name: &str, domain: i32, domain_idx: i32) -> PlatformResult<f64> {
        let signal = self.signal(name)?;
        check_domain(name, signal.domain, domain, domain_idx)?;
        // A signal named after a control reports the control's current value
        Ok(self.values().get(name).copied().unwrap_or(signal.value))
    }

    fn write_control(&self, name: &str, domain: i32, domain_idx: i32, value: f64) -> PlatformResult<()> {
        let control = self.control(name)?;
        check_domain(name, control.domain, domain, domain_idx)?;
        self.values().insert(name.to_string(), value);
        tracing::debug!("Control {} set to {}", name, value);
        Ok(())
    }

    fn save_control_dir(&self, dir: &Path) -> PlatformResult<()> {
        let contents = serde_json::to_string_pretty(&*self.values())
            .map_err(|e| PlatformError::new(format!("unable to encode controls: {}", e)))?;
        let path = dir.join(SAVE_FILE);
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()
        };
        write().map_err(|e| PlatformError::new(format!("unable to write {}: {}", path.display(), e)))?;
        tracing::debug!("Saved controls to {}", path.display());
        Ok(())
    }

    fn restore_control_dir(&self, dir: &Path) -> PlatformResult<()> {
        let path = dir.join(SAVE_FILE);
        let contents = fs::read_to_string(&path)
            .map_err(|e| PlatformError::new(format!("unable to read {}: {}", path.display(), e)))?;
        let saved: BTreeMap<String, f64> = serde_json::from_str(&contents)
            .map_err(|e| PlatformError::new(format!("unable to parse {}: {}", path.display(), e)))?;

        let mut values = self.values();
        for (name, value) in saved {
            if self.controls.contains_key(&name) {
                values.insert(name, value);
            }
        }
        tracing::debug!("Restored controls from {}", path.display());
        Ok(())
    }

    fn signal_description(&self, name: &str) -> PlatformResult<String> {
        Ok(self.signal(name)?.description.clone())
    }

    fn control_description(&self, name: &str) -> PlatformResult<String> {
        Ok(self.control(name)?.description.clone())
    }

    fn signal_domain_type(&self, name: &str) -> PlatformResult<i32> {
        Ok(self.signal(name)?.domain)
    }

    fn control_domain_type(&self, name: &str) -> PlatformResult<i32> {
        Ok(self.control(name)?.domain)
    }

    fn signal_info(&self, name: &str) -> PlatformResult<SignalBehavior> {
        let signal = self.signal(name)?;
        Ok(SignalBehavior {
            aggregation: signal.aggregation,
            format: signal.format,
            behavior: signal.behavior,
        })
    }

    fn start_batch_server(
        &self,
        client_pid: i32,
        signals: &[BatchRequest],
        controls: &[BatchRequest],
    ) -> PlatformResult<(i32, String)> {
        for request in signals {
            check_domain(&request.name, self.signal(&request.name)?.domain, request.domain, request.domain_idx)?;
        }
        for request in controls {
            check_domain(&request.name, self.control(&request.name)?.domain, request.domain, request.domain_idx)?;
        }

        let process = BatchProcess::spawn(&self.batch_command, client_pid, signals, controls)?;
        let server_pid = process.pid();
        let key = process.key().to_string();
        self.batch_servers().insert(server_pid, process);
        Ok((server_pid, key))
    }

    fn stop_batch_server(&self, server_pid: i32) -> PlatformResult<()> {
        let tracked = self.batch_servers().remove(&server_pid);
        match tracked {
            Some(mut process) => process.stop(),
            None => {
                // Started by a previous broker instance
                match kill(Pid::from_raw(server_pid), Signal::SIGTERM) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                    Err(e) => Err(PlatformError::new(format!(
                        "unable to signal batch server {}: {}",
                        server_pid, e
                    ))),
                }
            }
        }
    }

    fn create_topo_cache(&self, path: &Path) -> PlatformResult<()> {
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o644)
                .open(path)?;
            file.set_permissions(Permissions::from_mode(0o644))?;
            file.write_all(self.topology.as_bytes())?;
            file.sync_all()
        };
        write().map_err(|e| PlatformError::new(format!("unable to write {}: {}", path.display(), e)))?;
        tracing::info!("Created topology cache {}", path.display());
        Ok(())
    }
}
