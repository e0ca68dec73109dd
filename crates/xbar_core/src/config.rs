//! Configuration File
//!
//! Key/value text configuration parsed once at process start. The file is
//! `xbar_config.txt`, located via the `XBAR_CFG_DIR` environment variable,
//! falling back to the default path and then to the current directory.
//!
//! Recognized keys: logging levels per context, real-time scheduling
//! parameters, the shm group name, routing zone runner-thread switches and
//! per-device diagnostic parameters. Unknown keys are retained and can be
//! queried verbatim.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::error::{CoreError, CoreResult};

/// Environment variable pointing at the config directory
pub const CONFIG_ENV_VAR: &str = "XBAR_CFG_DIR";

/// File name of the configuration file
pub const CONFIG_FILE_NAME: &str = "xbar_config.txt";

const CONFIG_DEFAULT_PATH: &str = "/etc";
const RUNNER_THREAD_PREFIX: &str = "routingzone.runner_threads";
const DIAGNOSTIC_PREFIX: &str = "alsahandler.diagnostic";

/// Scheduling policy for real-time worker threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Completely fair scheduler (non-real-time)
    Cfs,
    Fifo,
    RoundRobin,
}

/// Whether a worker runs at the configured priority or one step below
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPriorityAdjust {
    Same,
    OneLess,
}

/// Per-device diagnostic parameters from the config file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagnosticConfig {
    pub port_name: String,
    pub copy_to: String,
    pub error_threshold: u32,
}

/// Parsed configuration
#[derive(Debug)]
pub struct ConfigFile {
    sched_policy: SchedPolicy,
    sched_priority: u32,
    cpu_affinities: Vec<u32>,
    shm_group: String,
    /// `routingzone.runner_threads[.<zone>]` -> enabled
    runner_threads: HashMap<String, bool>,
    /// `alsahandler.diagnostic.<device>` -> params
    diagnostic: HashMap<String, DiagnosticConfig>,
    log_period_time_ms: u32,
    num_entries_per_msg: u32,
    /// Log level -> context ids raised to that level
    log_levels: Vec<(String, Vec<String>)>,
    /// Every key that is not one of the registered options
    unregistered: HashMap<String, String>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let mut runner_threads = HashMap::new();
        runner_threads.insert(RUNNER_THREAD_PREFIX.to_string(), false);
        Self {
            sched_policy: SchedPolicy::Fifo,
            sched_priority: 20,
            cpu_affinities: Vec::new(),
            shm_group: "ias_audio".to_string(),
            runner_threads,
            diagnostic: HashMap::new(),
            log_period_time_ms: 500,
            num_entries_per_msg: 18,
            log_levels: Vec::new(),
            unregistered: HashMap::new(),
        }
    }
}

impl ConfigFile {
    /// Load the configuration, tolerating a missing file (defaults apply)
    pub fn load() -> Self {
        let mut config = Self::default();
        let path = Self::locate();
        match path {
            Some(path) => {
                if let Err(err) = config.parse_file(&path) {
                    error!(path = %path.display(), %err, "failed to parse config file");
                } else {
                    info!(path = %path.display(), "config file successfully loaded");
                }
            }
            None => info!("config file not found, using defaults"),
        }
        config
    }

    fn locate() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_ENV_VAR) {
            if !dir.is_empty() {
                let candidate = Path::new(&dir).join(CONFIG_FILE_NAME);
                if candidate.exists() {
                    return Some(candidate);
                }
                info!(path = %candidate.display(), "config file not found");
                return None;
            }
        }
        let candidate = Path::new(CONFIG_DEFAULT_PATH).join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
        let candidate = Path::new(".").join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
        None
    }

    fn parse_file(&mut self, path: &Path) -> CoreResult<()> {
        let content = std::fs::read_to_string(path)?;
        self.parse(&content);
        Ok(())
    }

    /// Parse `key = value` lines; `#` starts a comment
    pub fn parse(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line, "ignoring config line without '='");
                continue;
            };
            self.apply(key.trim(), value.trim());
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "scheduling.rt.policy" => self.set_sched_policy(value),
            "scheduling.rt.priority" => self.set_sched_priority(value),
            "scheduling.rt.cpu_affinity" => self.set_cpu_affinity(value),
            "shm.group" => {
                self.shm_group = value.to_string();
                info!(group = %self.shm_group, "shm group name set");
            }
            _ if key.starts_with("logging.") => {
                let level = key.trim_start_matches("logging.").to_string();
                let contexts: Vec<String> =
                    value.split_whitespace().map(|s| s.to_string()).collect();
                self.log_levels.push((level, contexts));
            }
            _ if key.starts_with(RUNNER_THREAD_PREFIX) => {
                let enabled = value == "enabled";
                self.runner_threads.insert(key.to_string(), enabled);
                info!(key, value, "stored runner thread option");
            }
            _ if key.starts_with(DIAGNOSTIC_PREFIX) => {
                self.apply_diagnostic(key, value);
                self.unregistered.insert(key.to_string(), value.to_string());
            }
            _ => {
                info!(key, value, "unregistered config option");
                self.unregistered.insert(key.to_string(), value.to_string());
            }
        }
    }

    fn set_sched_policy(&mut self, value: &str) {
        self.sched_policy = match value {
            "fifo" => SchedPolicy::Fifo,
            "rr" => SchedPolicy::RoundRobin,
            "cfs" => SchedPolicy::Cfs,
            other => {
                error!(policy = other, "invalid scheduling policy, using fifo");
                SchedPolicy::Fifo
            }
        };
        info!(policy = ?self.sched_policy, "scheduling policy set");
    }

    fn set_sched_priority(&mut self, value: &str) {
        let Ok(priority) = value.parse::<u32>() else {
            error!(value, "invalid scheduling priority, keeping default");
            return;
        };
        if self.sched_policy == SchedPolicy::Cfs && priority != 0 {
            error!(priority, "priority is ignored for scheduling policy cfs");
            self.sched_priority = priority;
        } else if priority > 99 {
            error!(priority, "priority must be in 0..=99, set to 0");
            self.sched_priority = 0;
        } else {
            self.sched_priority = priority;
            info!(priority, "scheduling priority set");
        }
    }

    fn set_cpu_affinity(&mut self, value: &str) {
        for token in value.split_whitespace() {
            if let Ok(cpu) = token.parse::<u32>() {
                self.cpu_affinities.push(cpu);
            }
        }
    }

    fn apply_diagnostic(&mut self, key: &str, value: &str) {
        if key == "alsahandler.diagnostic.log_period_time" {
            match value.parse::<u32>() {
                Ok(ms) => self.log_period_time_ms = ms,
                Err(_) => error!(key, value, "invalid value, keeping default"),
            }
            return;
        }
        if key == "alsahandler.diagnostic.num_entries_per_msg" {
            match value.parse::<u32>() {
                Ok(n) => self.num_entries_per_msg = n,
                Err(_) => error!(key, value, "invalid value, keeping default"),
            }
            return;
        }
        // Per-device keys: alsahandler.diagnostic.<device>.<param>
        let Some(map_key) = key.rfind('.').map(|idx| key[..idx].to_string()) else {
            return;
        };
        let entry = self.diagnostic.entry(map_key).or_default();
        if key.ends_with(".port_name") {
            entry.port_name = value.to_string();
        } else if key.ends_with(".copy_to") {
            entry.copy_to = value.to_string();
        } else if key.ends_with(".error_threshold") {
            match value.parse::<u32>() {
                Ok(threshold) => entry.error_threshold = threshold,
                Err(_) => error!(key, value, "invalid value, keeping default"),
            }
        } else {
            info!(key, "unknown diagnostic key");
        }
    }

    pub fn sched_policy(&self) -> SchedPolicy {
        self.sched_policy
    }

    pub fn sched_priority(&self) -> u32 {
        self.sched_priority
    }

    pub fn cpu_affinities(&self) -> &[u32] {
        &self.cpu_affinities
    }

    pub fn shm_group(&self) -> &str {
        &self.shm_group
    }

    pub fn log_period_time_ms(&self) -> u32 {
        self.log_period_time_ms
    }

    pub fn num_entries_per_msg(&self) -> u32 {
        self.num_entries_per_msg
    }

    /// Runner-thread state for a zone: per-zone override, else the global
    /// default
    pub fn runner_threads_enabled(&self, zone_name: &str) -> bool {
        let key = format!("{RUNNER_THREAD_PREFIX}.{zone_name}");
        if let Some(&enabled) = self.runner_threads.get(&key) {
            return enabled;
        }
        self.runner_threads
            .get(RUNNER_THREAD_PREFIX)
            .copied()
            .unwrap_or(false)
    }

    /// Diagnostic parameters for a device name, if configured
    pub fn diagnostic_config(&self, device_name: &str) -> Option<&DiagnosticConfig> {
        let key = format!("{DIAGNOSTIC_PREFIX}.{device_name}");
        self.diagnostic.get(&key)
    }

    /// Raw lookup of an unregistered key
    pub fn get_key(&self, key: &str) -> Option<&str> {
        self.unregistered.get(key).map(String::as_str)
    }

    /// Translate the `logging.<level>` entries into an env-filter string
    /// usable with `tracing-subscriber`.
    pub fn log_filter(&self) -> String {
        let mut directives: Vec<String> = Vec::new();
        for (level, contexts) in &self.log_levels {
            let target_level = match level.as_str() {
                "off" => "off",
                "fatal" | "error" => "error",
                "warning" => "warn",
                "info" => "info",
                "debug" => "debug",
                "verbose" => "trace",
                _ => continue,
            };
            for context in contexts {
                directives.push(format!("{context}={target_level}"));
            }
        }
        directives.join(",")
    }

    /// Apply the configured scheduling policy, priority and CPU affinity to
    /// the calling thread. Affinity ids above 16 are ignored.
    #[cfg(target_os = "linux")]
    pub fn configure_thread_scheduling(&self, adjust: SchedPriorityAdjust) -> CoreResult<()> {
        let policy = match self.sched_policy {
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
            SchedPolicy::Cfs => libc::SCHED_OTHER,
        };
        let mut priority = self.sched_priority as i32;
        if adjust == SchedPriorityAdjust::OneLess && priority > 0 {
            priority -= 1;
        }
        if policy == libc::SCHED_OTHER {
            priority = 0;
        }
        let param = libc::sched_param {
            sched_priority: priority,
        };
        // SAFETY: operates on the calling thread with a valid sched_param.
        let result = unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy, &param) };
        if result != 0 {
            error!(
                policy = ?self.sched_policy,
                priority, "scheduling parameters couldn't be set (permissions?)"
            );
            return Err(CoreError::NotAllowed(
                "failed to set thread scheduling parameters".to_string(),
            ));
        }
        info!(policy = ?self.sched_policy, priority, "scheduling parameters set");

        if !self.cpu_affinities.is_empty() {
            // SAFETY: cpu_set is fully initialized by CPU_ZERO before use.
            unsafe {
                let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_ZERO(&mut cpu_set);
                for &cpu in &self.cpu_affinities {
                    if cpu <= 16 {
                        libc::CPU_SET(cpu as usize, &mut cpu_set);
                        info!(cpu, "adding CPU to affinity mask");
                    }
                }
                let result = libc::pthread_setaffinity_np(
                    libc::pthread_self(),
                    std::mem::size_of::<libc::cpu_set_t>(),
                    &cpu_set,
                );
                if result != 0 {
                    error!("CPU affinity couldn't be set");
                    return Err(CoreError::NotAllowed(
                        "failed to set CPU affinity".to_string(),
                    ));
                }
            }
            info!("CPU affinity successfully set");
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn configure_thread_scheduling(&self, _adjust: SchedPriorityAdjust) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigFile::default();
        assert_eq!(config.sched_policy(), SchedPolicy::Fifo);
        assert_eq!(config.sched_priority(), 20);
        assert_eq!(config.shm_group(), "ias_audio");
        assert_eq!(config.log_period_time_ms(), 500);
        assert_eq!(config.num_entries_per_msg(), 18);
        assert!(!config.runner_threads_enabled("anything"));
    }

    #[test]
    fn test_parse_scheduling() {
        let mut config = ConfigFile::default();
        config.parse(
            "scheduling.rt.policy = rr\n\
             scheduling.rt.priority = 30\n\
             scheduling.rt.cpu_affinity = 1 2 3\n",
        );
        assert_eq!(config.sched_policy(), SchedPolicy::RoundRobin);
        assert_eq!(config.sched_priority(), 30);
        assert_eq!(config.cpu_affinities(), &[1, 2, 3]);
    }

    #[test]
    fn test_priority_out_of_range() {
        let mut config = ConfigFile::default();
        config.parse("scheduling.rt.priority = 150\n");
        assert_eq!(config.sched_priority(), 0);
    }

    #[test]
    fn test_invalid_policy_falls_back_to_fifo() {
        let mut config = ConfigFile::default();
        config.parse("scheduling.rt.policy = banana\n");
        assert_eq!(config.sched_policy(), SchedPolicy::Fifo);
    }

    #[test]
    fn test_runner_threads_override() {
        let mut config = ConfigFile::default();
        config.parse(
            "routingzone.runner_threads = disabled\n\
             routingzone.runner_threads.zone_a = enabled\n",
        );
        assert!(config.runner_threads_enabled("zone_a"));
        assert!(!config.runner_threads_enabled("zone_b"));
    }

    #[test]
    fn test_diagnostic_params() {
        let mut config = ConfigFile::default();
        config.parse(
            "alsahandler.diagnostic.mydev.port_name = port0\n\
             alsahandler.diagnostic.mydev.copy_to = /tmp/dst\n\
             alsahandler.diagnostic.mydev.error_threshold = 2\n\
             alsahandler.diagnostic.log_period_time = 250\n\
             alsahandler.diagnostic.num_entries_per_msg = 10\n",
        );
        let diag = config.diagnostic_config("mydev").unwrap();
        assert_eq!(diag.port_name, "port0");
        assert_eq!(diag.copy_to, "/tmp/dst");
        assert_eq!(diag.error_threshold, 2);
        assert_eq!(config.log_period_time_ms(), 250);
        assert_eq!(config.num_entries_per_msg(), 10);
        assert!(config.diagnostic_config("otherdev").is_none());
    }

    #[test]
    fn test_log_filter() {
        let mut config = ConfigFile::default();
        config.parse(
            "logging.debug = SMX RZN\n\
             logging.error = AHD\n",
        );
        let filter = config.log_filter();
        assert!(filter.contains("SMX=debug"));
        assert!(filter.contains("RZN=debug"));
        assert!(filter.contains("AHD=error"));
    }

    #[test]
    fn test_comments_and_unknown_keys() {
        let mut config = ConfigFile::default();
        config.parse(
            "# a comment\n\
             \n\
             some.custom.key = custom value\n",
        );
        assert_eq!(config.get_key("some.custom.key"), Some("custom value"));
        assert_eq!(config.get_key("missing"), None);
    }

    #[test]
    fn test_shm_group() {
        let mut config = ConfigFile::default();
        config.parse("shm.group = audio_users\n");
        assert_eq!(config.shm_group(), "audio_users");
    }
}
