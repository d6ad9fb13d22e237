use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use log::{debug, error};
use nix::unistd::Pid;

use crate::context::JudgeRequest;
use crate::error::SandCatError;

/// Ephemeral cgroup v2 leaf `<cgroup_root>/judge.<sandbox_id>`.
///
/// The leaf lives under a delegated subtree with `+cpu +memory +pids`, so
/// limits and counters are plain file writes and reads. The directory is
/// removed on drop.
pub struct SandCatCgroup {
  path: PathBuf,
}

#[derive(Debug)]
pub struct SandCatUsage {
  pub time_ms: i32,
  pub memory_mb: i64,
  pub oom_killed: bool,
}

impl SandCatCgroup {
  pub fn create(cgroup_root: &Path, sandbox_id: &str) -> Result<Self, SandCatError> {
    let path = cgroup_root.join(format!("judge.{}", sandbox_id));
    fs::create_dir(&path)
      .map_err(|err| SandCatError::cgroup(format!("Create {} fails: {}", path.display(), err)))?;
    debug!("Create cgroup {}", path.display());
    Ok(SandCatCgroup { path })
  }

  /// One full CPU per 100 ms window, no swap: the memory cap is the only
  /// memory ceiling and overruns surface as OOM kills.
  pub fn apply_limits(&self, request: &JudgeRequest) -> Result<(), SandCatError> {
    self.write_control("cpu.max", "100000 100000")?;
    self.write_control("pids.max", &request.pids_limit.to_string())?;
    let memory_max = request.memory_limit_mb * 1024 * 1024;
    self.write_control("memory.max", &memory_max.to_string())?;
    self.write_control("memory.swap.max", "0")?;
    Ok(())
  }

  pub fn attach(&self, pid: Pid) -> Result<(), SandCatError> {
    self.write_control("cgroup.procs", &pid.as_raw().to_string())
  }

  /// Harvest the final accounting. Read only after the executor has been
  /// reaped. Missing files degrade to zero counters, except `memory.peak`
  /// which falls back to a `memory.current` snapshot on older kernels.
  pub fn usage(&self) -> SandCatUsage {
    let cpu_stat = fs::read_to_string(self.path.join("cpu.stat")).unwrap_or_default();
    let time_ms = stat_value(&cpu_stat, "user_usec") / 1000;

    let memory_peak = fs::read_to_string(self.path.join("memory.peak"))
      .or_else(|_| fs::read_to_string(self.path.join("memory.current")))
      .unwrap_or_default();
    let memory_mb = memory_peak.trim().parse::<i64>().unwrap_or(0) / 1024 / 1024;

    let memory_events = fs::read_to_string(self.path.join("memory.events")).unwrap_or_default();
    let oom_killed = stat_value(&memory_events, "oom_kill") > 0;

    debug!(
      "Cgroup usage: time {} ms, memory {} MB, oom {}",
      time_ms, memory_mb, oom_killed
    );

    SandCatUsage {
      time_ms: time_ms as i32,
      memory_mb,
      oom_killed,
    }
  }

  fn write_control(&self, file: &str, value: &str) -> Result<(), SandCatError> {
    fs::write(self.path.join(file), value)
      .map_err(|err| SandCatError::cgroup(format!("Write {} = {} fails: {}", file, value, err)))
  }
}

impl Drop for SandCatCgroup {
  fn drop(&mut self) {
    // Members of the dying pid namespace leave cgroup.procs asynchronously,
    // so the rmdir can report EBUSY for a short while.
    for _ in 0..50 {
      match fs::remove_dir(&self.path) {
        Ok(_) => {
          debug!("Delete cgroup {}", self.path.display());
          return;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(_) => sleep(Duration::from_millis(10)),
      }
    }
    error!("Fails deleting cgroup {}", self.path.display());
  }
}

/// Extract one value from a flat-keyed cgroup file such as `cpu.stat` or
/// `memory.events`. Missing keys read as zero.
fn stat_value(content: &str, key: &str) -> i64 {
  for line in content.lines() {
    let mut parts = line.split_whitespace();
    if let (Some(k), Some(v)) = (parts.next(), parts.next()) {
      if k == key {
        return v.parse().unwrap_or(0);
      }
    }
  }
  0
}

#[cfg(test)]
mod tests {
  use std::fs;

  use super::{stat_value, SandCatCgroup};

  #[test]
  fn it_should_parse_flat_keyed_files() {
    let cpu_stat = "usage_usec 2500000\nuser_usec 1500000\nsystem_usec 1000000\n";
    assert_eq!(stat_value(cpu_stat, "user_usec"), 1500000);
    assert_eq!(stat_value(cpu_stat, "system_usec"), 1000000);
    assert_eq!(stat_value(cpu_stat, "nr_periods"), 0);
    assert_eq!(stat_value("", "user_usec"), 0);
    assert_eq!(stat_value("user_usec abc\n", "user_usec"), 0);
  }

  #[test]
  fn it_should_harvest_counters_and_fall_back_to_current() {
    let root = tempfile::tempdir().unwrap();
    let cgroup = SandCatCgroup::create(root.path(), "test").unwrap();
    let leaf = root.path().join("judge.test");

    fs::write(leaf.join("cpu.stat"), "usage_usec 400000\nuser_usec 321000\n").unwrap();
    fs::write(leaf.join("memory.current"), format!("{}\n", 33 * 1024 * 1024)).unwrap();
    fs::write(leaf.join("memory.events"), "low 0\noom 1\noom_kill 1\n").unwrap();

    let usage = cgroup.usage();
    assert_eq!(usage.time_ms, 321);
    assert_eq!(usage.memory_mb, 33);
    assert!(usage.oom_killed);

    fs::write(leaf.join("memory.peak"), format!("{}\n", 48 * 1024 * 1024)).unwrap();
    let usage = cgroup.usage();
    assert_eq!(usage.memory_mb, 48);

    // Drop can only rmdir an empty leaf.
    for file in ["cpu.stat", "memory.current", "memory.peak", "memory.events"] {
      fs::remove_file(leaf.join(file)).unwrap();
    }
    drop(cgroup);
    assert!(!leaf.exists());
  }
}
