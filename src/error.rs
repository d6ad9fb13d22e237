use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDERR_FILENO, unistd::isatty};

pub enum SandCatError {
  Proto(String),
  Request(String),
  Fork(String),
  Mount(String),
  Cgroup(String),
  Exec(String),
  Nix(Errno),
  Fs(String),
  Logger(FlexiLoggerError),
}

pub enum SandCatExit {
  Ok,
  Uke,
  Err(SandCatError),
}

impl SandCatError {
  pub fn proto<MS: Into<String>>(msg: MS) -> SandCatError {
    SandCatError::Proto(msg.into())
  }

  pub fn request<MS: Into<String>>(msg: MS) -> SandCatError {
    SandCatError::Request(msg.into())
  }

  pub fn fork<MS: Into<String>>(msg: MS) -> SandCatError {
    SandCatError::Fork(msg.into())
  }

  pub fn mount<MS: Into<String>>(msg: MS) -> SandCatError {
    SandCatError::Mount(msg.into())
  }

  pub fn cgroup<MS: Into<String>>(msg: MS) -> SandCatError {
    SandCatError::Cgroup(msg.into())
  }

  pub fn exec<MS: Into<String>>(msg: MS) -> SandCatError {
    SandCatError::Exec(msg.into())
  }
}

impl Debug for SandCatError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for SandCatError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      SandCatError::Proto(msg) => f.write_fmt(format_args!("SandCat Proto Error: {}", msg)),
      SandCatError::Request(msg) => f.write_fmt(format_args!("SandCat Request Error: {}", msg)),
      SandCatError::Fork(msg) => f.write_fmt(format_args!("SandCat Fork Error: {}", msg)),
      SandCatError::Mount(msg) => f.write_fmt(format_args!("SandCat Mount Error: {}", msg)),
      SandCatError::Cgroup(msg) => f.write_fmt(format_args!("SandCat Cgroup Error: {}", msg)),
      SandCatError::Exec(msg) => f.write_fmt(format_args!("SandCat Exec Error: {}", msg)),
      SandCatError::Nix(errno) => f.write_fmt(format_args!("SandCat Nix Error: {}", errno)),
      SandCatError::Fs(msg) => f.write_fmt(format_args!("SandCat File System Error: {}", msg)),
      SandCatError::Logger(err) => f.write_fmt(format_args!("SandCat Logger Error: {}", err)),
    }
  }
}

impl From<Errno> for SandCatError {
  fn from(errno: Errno) -> Self {
    SandCatError::Nix(errno)
  }
}

impl From<std::io::Error> for SandCatError {
  fn from(err: std::io::Error) -> Self {
    SandCatError::Fs(err.to_string())
  }
}

impl From<FlexiLoggerError> for SandCatError {
  fn from(err: FlexiLoggerError) -> Self {
    SandCatError::Logger(err)
  }
}

impl Error for SandCatError {}

impl Termination for SandCatExit {
  fn report(self) -> ExitCode {
    match self {
      SandCatExit::Ok => ExitCode::SUCCESS.report(),
      // The UKE response frame has already been emitted on stdout.
      SandCatExit::Uke => ExitCode::FAILURE.report(),
      SandCatExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDERR_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              format!(
                "{{\n  \"ok\": false,\n  \"type\": \"{}\",\n  \"message\": \"{}\"\n}}",
                prefix, message
              )
            }
          }
          None => {
            format!("{}", err)
          }
        };
        eprintln!("{}", text);
        ExitCode::FAILURE.report()
      }
    }
  }
}
