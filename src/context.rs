use std::os::unix::prelude::RawFd;
use std::path::PathBuf;

use path_absolutize::Absolutize;

use crate::error::SandCatError;
use crate::mount::is_safe_filename;
use crate::proto;

/// One judged run: the program image, its inputs and its limits.
/// All configuration travels in the request frame; the binary takes none.
#[derive(Debug, Clone)]
pub struct JudgeRequest {
  /// CPU time budget (unit: ms)
  pub time_limit_ms: i32,
  /// Hard memory cap, anon + cache + kmem (unit: MB)
  pub memory_limit_mb: i64,
  /// Max concurrent processes inside the sandbox
  pub pids_limit: i32,
  /// Host path of the prepared root filesystem, bind-mounted read-only
  pub rootfs_path: PathBuf,
  /// Size cap of the writable tmpfs, e.g. "64M"
  pub tmpfs_size: String,
  /// Host path of a delegated cgroup v2 subtree
  pub cgroup_root: PathBuf,
  /// Unique per concurrent run; names the mountpoint and the cgroup leaf
  pub sandbox_id: String,
  /// Content piped to the target as standard input
  pub stdin_bytes: Vec<u8>,
  /// argv of the target; `cmdline[0]` is the absolute in-sandbox path
  pub cmdline: Vec<String>,
  /// Files materialized under the sandbox `/tmp` before execution
  pub input_files: Vec<InputFile>,
  /// Files collected from the sandbox `/tmp` after execution
  pub output_filenames: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InputFile {
  pub filename: String,
  pub content: Vec<u8>,
  pub mode: u32,
}

#[derive(Debug, Clone)]
pub struct OutputFile {
  pub filename: String,
  pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct JudgeResult {
  pub verdict: Verdict,
  pub time_ms: i32,
  pub memory_mb: i64,
  pub stdout_bytes: Vec<u8>,
  pub stderr_bytes: Vec<u8>,
  pub output_files: Vec<OutputFile>,
}

/// Terminal classification of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
  Ok,
  Tle,
  Mle,
  Re,
  Uke,
}

impl JudgeRequest {
  pub fn new<PS: Into<String>>(cmdline: Vec<PS>) -> Self {
    JudgeRequest {
      time_limit_ms: 1000,
      memory_limit_mb: 256,
      pids_limit: 16,
      rootfs_path: PathBuf::from("/"),
      tmpfs_size: String::from("64M"),
      cgroup_root: PathBuf::from("/sys/fs/cgroup"),
      sandbox_id: String::from("0"),
      stdin_bytes: vec![],
      cmdline: cmdline.into_iter().map(|a| a.into()).collect(),
      input_files: vec![],
      output_filenames: vec![],
    }
  }

  pub fn time_limit(self: &mut Self, value: i32) -> &mut Self {
    self.time_limit_ms = value;
    self
  }

  pub fn memory_limit(self: &mut Self, value: i64) -> &mut Self {
    self.memory_limit_mb = value;
    self
  }

  pub fn pids_limit(self: &mut Self, value: i32) -> &mut Self {
    self.pids_limit = value;
    self
  }

  pub fn rootfs<PS: Into<PathBuf>>(self: &mut Self, path: PS) -> &mut Self {
    self.rootfs_path = path.into();
    self
  }

  pub fn tmpfs_size<PS: Into<String>>(self: &mut Self, size: PS) -> &mut Self {
    self.tmpfs_size = size.into();
    self
  }

  pub fn cgroup_root<PS: Into<PathBuf>>(self: &mut Self, path: PS) -> &mut Self {
    self.cgroup_root = path.into();
    self
  }

  pub fn sandbox_id<PS: Into<String>>(self: &mut Self, id: PS) -> &mut Self {
    self.sandbox_id = id.into();
    self
  }

  pub fn stdin<BS: Into<Vec<u8>>>(self: &mut Self, bytes: BS) -> &mut Self {
    self.stdin_bytes = bytes.into();
    self
  }

  pub fn input_file<PS: Into<String>, BS: Into<Vec<u8>>>(
    self: &mut Self,
    filename: PS,
    content: BS,
    mode: u32,
  ) -> &mut Self {
    self.input_files.push(InputFile {
      filename: filename.into(),
      content: content.into(),
      mode,
    });
    self
  }

  pub fn output_file<PS: Into<String>>(self: &mut Self, filename: PS) -> &mut Self {
    self.output_filenames.push(filename.into());
    self
  }

  /// Check the request against the sandbox contract and normalize the
  /// host paths. A failure here is reported as UKE before any namespace
  /// or mount is created.
  pub fn validate(&mut self) -> Result<(), SandCatError> {
    if self.time_limit_ms <= 0 {
      return Err(SandCatError::request("Time limit must be positive"));
    }
    if self.memory_limit_mb <= 0 {
      return Err(SandCatError::request("Memory limit must be positive"));
    }
    if self.pids_limit <= 0 {
      return Err(SandCatError::request("Pids limit must be positive"));
    }
    if self.tmpfs_size.is_empty() {
      return Err(SandCatError::request("Tmpfs size is empty"));
    }
    if self.cmdline.is_empty() {
      return Err(SandCatError::request("Command line is empty"));
    }
    if !self.cmdline[0].starts_with('/') {
      return Err(SandCatError::request(format!(
        "Program path {} should be absolute",
        self.cmdline[0]
      )));
    }
    if !is_safe_filename(&self.sandbox_id) {
      return Err(SandCatError::request(format!(
        "Unsafe sandbox id {}",
        self.sandbox_id
      )));
    }
    for file in &self.input_files {
      if !is_safe_filename(&file.filename) {
        return Err(SandCatError::request(format!(
          "Unsafe input filename {}",
          file.filename
        )));
      }
    }

    self.rootfs_path = self.rootfs_path.absolutize()?.into_owned();
    self.cgroup_root = self.cgroup_root.absolutize()?.into_owned();
    Ok(())
  }

  pub fn read_from(fd: RawFd) -> Result<Self, SandCatError> {
    let time_limit_ms = proto::read_i32(fd)?;
    let memory_limit_mb = proto::read_i64(fd)?;
    let pids_limit = proto::read_i32(fd)?;
    let rootfs_path = PathBuf::from(proto::read_str(fd)?);
    let tmpfs_size = proto::read_str(fd)?;
    let cgroup_root = PathBuf::from(proto::read_str(fd)?);
    let sandbox_id = proto::read_str(fd)?;
    let stdin_bytes = proto::read_bytes(fd)?;

    let mut cmdline = vec![];
    for _ in 0..proto::read_count(fd)? {
      cmdline.push(proto::read_str(fd)?);
    }

    let mut input_files = vec![];
    for _ in 0..proto::read_count(fd)? {
      let filename = proto::read_str(fd)?;
      let content = proto::read_bytes(fd)?;
      let mode = proto::read_i32(fd)? as u32;
      input_files.push(InputFile {
        filename,
        content,
        mode,
      });
    }

    let mut output_filenames = vec![];
    for _ in 0..proto::read_count(fd)? {
      output_filenames.push(proto::read_str(fd)?);
    }

    Ok(JudgeRequest {
      time_limit_ms,
      memory_limit_mb,
      pids_limit,
      rootfs_path,
      tmpfs_size,
      cgroup_root,
      sandbox_id,
      stdin_bytes,
      cmdline,
      input_files,
      output_filenames,
    })
  }

  pub fn write_to(&self, fd: RawFd) -> Result<(), SandCatError> {
    proto::write_i32(fd, self.time_limit_ms)?;
    proto::write_i64(fd, self.memory_limit_mb)?;
    proto::write_i32(fd, self.pids_limit)?;
    proto::write_str(fd, &self.rootfs_path.to_string_lossy())?;
    proto::write_str(fd, &self.tmpfs_size)?;
    proto::write_str(fd, &self.cgroup_root.to_string_lossy())?;
    proto::write_str(fd, &self.sandbox_id)?;
    proto::write_bytes(fd, &self.stdin_bytes)?;

    proto::write_i32(fd, self.cmdline.len() as i32)?;
    for argument in &self.cmdline {
      proto::write_str(fd, argument)?;
    }

    proto::write_i32(fd, self.input_files.len() as i32)?;
    for file in &self.input_files {
      proto::write_str(fd, &file.filename)?;
      proto::write_bytes(fd, &file.content)?;
      proto::write_i32(fd, file.mode as i32)?;
    }

    proto::write_i32(fd, self.output_filenames.len() as i32)?;
    for filename in &self.output_filenames {
      proto::write_str(fd, filename)?;
    }

    Ok(())
  }
}

impl JudgeResult {
  /// The response emitted when the sandbox itself failed.
  pub fn internal_error(err: &SandCatError) -> Self {
    JudgeResult {
      verdict: Verdict::Uke,
      time_ms: 0,
      memory_mb: 0,
      stdout_bytes: vec![],
      stderr_bytes: format!("Internal Error: {}", err).into_bytes(),
      output_files: vec![],
    }
  }

  pub fn read_from(fd: RawFd) -> Result<Self, SandCatError> {
    let verdict = Verdict::from_code(proto::read_i32(fd)?)?;
    let time_ms = proto::read_i32(fd)?;
    let memory_mb = proto::read_i64(fd)?;
    let stdout_bytes = proto::read_bytes(fd)?;
    let stderr_bytes = proto::read_bytes(fd)?;

    let mut output_files = vec![];
    for _ in 0..proto::read_count(fd)? {
      let filename = proto::read_str(fd)?;
      let content = proto::read_bytes(fd)?;
      output_files.push(OutputFile { filename, content });
    }

    Ok(JudgeResult {
      verdict,
      time_ms,
      memory_mb,
      stdout_bytes,
      stderr_bytes,
      output_files,
    })
  }

  pub fn write_to(&self, fd: RawFd) -> Result<(), SandCatError> {
    proto::write_i32(fd, self.verdict.code())?;
    proto::write_i32(fd, self.time_ms)?;
    proto::write_i64(fd, self.memory_mb)?;
    proto::write_bytes(fd, &self.stdout_bytes)?;
    proto::write_bytes(fd, &self.stderr_bytes)?;

    proto::write_i32(fd, self.output_files.len() as i32)?;
    for file in &self.output_files {
      proto::write_str(fd, &file.filename)?;
      proto::write_bytes(fd, &file.content)?;
    }

    Ok(())
  }
}

impl Verdict {
  pub fn code(&self) -> i32 {
    match self {
      Verdict::Ok => 0,
      Verdict::Tle => 1,
      Verdict::Mle => 2,
      Verdict::Re => 3,
      Verdict::Uke => 4,
    }
  }

  pub fn from_code(code: i32) -> Result<Verdict, SandCatError> {
    match code {
      0 => Ok(Verdict::Ok),
      1 => Ok(Verdict::Tle),
      2 => Ok(Verdict::Mle),
      3 => Ok(Verdict::Re),
      4 => Ok(Verdict::Uke),
      _ => Err(SandCatError::proto(format!("Unknown verdict {}", code))),
    }
  }

  /// Map the executor exit byte and the harvested cgroup counters to the
  /// final verdict. An OOM kill beats every verdict the target earned on
  /// its own, a measured CPU overrun beats RE, and UKE stays UKE: a
  /// sandbox failure is never masked by resource accounting.
  pub fn classify(exit_code: i32, oom_killed: bool, time_ms: i32, time_limit_ms: i32) -> Verdict {
    let verdict = match exit_code {
      0 => Verdict::Ok,
      1 => Verdict::Re,
      2 => Verdict::Tle,
      _ => Verdict::Uke,
    };
    if verdict == Verdict::Uke {
      return verdict;
    }
    if oom_killed {
      Verdict::Mle
    } else if time_ms > time_limit_ms {
      Verdict::Tle
    } else {
      verdict
    }
  }
}
