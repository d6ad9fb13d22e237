use std::ffi::CString;
use std::fs;
use std::mem;
use std::path::Path;
use std::ptr;

use lazy_static::lazy_static;
use libc_stdhandle::{stderr, stdin, stdout};
use log::{error, info};

use nix::errno::Errno;
use nix::libc::{self, freopen, RLIM_INFINITY};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, execve, fork, ForkResult, Pid};

use crate::context::JudgeRequest;
use crate::error::SandCatError;
use crate::pipe::SandCatPipe;
use crate::utils::into_c_string;

pub const EXIT_OK: isize = 0;
pub const EXIT_RE: isize = 1;
pub const EXIT_TLE: isize = 2;
pub const EXIT_SYS: isize = 3;

/// Extra wall-clock wait on top of the CPU budget, absorbing scheduling
/// jitter before the kill.
const GRACE_TIME_MS: i64 = 1000;

lazy_static! {
  static ref TARGET_ENV: Vec<CString> = vec![CString::new(
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
  )
  .expect("Fixed PATH should convert to CString")];
}

/// Entry of the innermost process, pid 1 of its own pid namespace.
/// The return value becomes the exit byte the namespace-init decodes:
/// 0 ok, 1 runtime error, 2 time limit, 3 and above sandbox failure.
pub fn executor_main(request: &JudgeRequest, root: &Path, barrier: &SandCatPipe) -> isize {
  match run_target(request, root, barrier) {
    Ok(code) => code,
    Err(err) => {
      error!("Executor setup fails: {}", err);
      EXIT_SYS
    }
  }
}

fn run_target(
  request: &JudgeRequest,
  root: &Path,
  barrier: &SandCatPipe,
) -> Result<isize, SandCatError> {
  // The barrier gates two things at once: this process is enrolled in the
  // cgroup, and its uid/gid map is installed. No file may be created and
  // the target may not start before either has happened.
  barrier.wait()?;

  chroot(root)?;
  chdir("/tmp")?;

  fs::write("stdin", &request.stdin_bytes)?;
  redirect_io()?;

  let mask = block_sigchld()?;

  match unsafe { fork() } {
    Ok(ForkResult::Parent { child, .. }) => Ok(wait_target(child, &mask, request.time_limit_ms)),
    Ok(ForkResult::Child) => {
      exec_target(request, &mask);
      // Only reached when execve failed; the parent reports RE.
      unsafe { libc::_exit(1) };
    }
    Err(errno) => Err(SandCatError::fork(format!("Fork target fails: {}", errno))),
  }
}

/// Redirect stdio to files inside the writable tmpfs.
fn redirect_io() -> Result<(), SandCatError> {
  let read_mode = CString::new("r").unwrap();
  let write_mode = CString::new("w").unwrap();
  let stdin_path = CString::new("stdin").unwrap();
  let stdout_path = CString::new("stdout").unwrap();
  let stderr_path = CString::new("stderr").unwrap();

  unsafe {
    if freopen(stdin_path.as_ptr(), read_mode.as_ptr(), stdin()).is_null()
      || freopen(stdout_path.as_ptr(), write_mode.as_ptr(), stdout()).is_null()
      || freopen(stderr_path.as_ptr(), write_mode.as_ptr(), stderr()).is_null()
    {
      return Err(SandCatError::exec("Redirect stdio fails"));
    }
  }

  Ok(())
}

/// Block SIGCHLD so the child termination can be awaited with a timed
/// signal wait. Returns the mask `sigtimedwait` expects.
fn block_sigchld() -> Result<libc::sigset_t, SandCatError> {
  let mut mask: libc::sigset_t = unsafe { mem::zeroed() };
  unsafe {
    libc::sigemptyset(&mut mask);
    libc::sigaddset(&mut mask, libc::SIGCHLD);
    if libc::sigprocmask(libc::SIG_BLOCK, &mask, ptr::null_mut()) == -1 {
      return Err(SandCatError::from(Errno::last()));
    }
  }
  Ok(mask)
}

/// The fork child: restore the signal mask, lift the stack limit (the
/// cgroup memory cap is the effective ceiling), clear the environment to a
/// single PATH and execve the target.
fn exec_target(request: &JudgeRequest, mask: &libc::sigset_t) {
  unsafe {
    libc::sigprocmask(libc::SIG_UNBLOCK, mask, ptr::null_mut());
  }

  if let Err(err) = setrlimit(Resource::RLIMIT_STACK, RLIM_INFINITY, RLIM_INFINITY) {
    error!("Set stack size fails: {}", err);
  }

  let arguments = request
    .cmdline
    .iter()
    .map(|argument| into_c_string(argument))
    .collect::<Vec<CString>>();
  let program = arguments[0].clone();

  let result = execve(&program, &arguments, TARGET_ENV.as_slice());
  if let Err(err) = result {
    error!("Execve target fails: {}", err.desc());
    info!("Target path: {}", request.cmdline[0]);
    info!("Target args: {}", request.cmdline.join(" "));
  }
}

/// Await the target for at most `time_limit_ms + GRACE_TIME_MS` and encode
/// its fate as the executor exit byte.
fn wait_target(child: Pid, mask: &libc::sigset_t, time_limit_ms: i32) -> isize {
  let total_ms = time_limit_ms as i64 + GRACE_TIME_MS;
  let timeout = libc::timespec {
    tv_sec: (total_ms / 1000) as libc::time_t,
    tv_nsec: ((total_ms % 1000) * 1_000_000) as libc::c_long,
  };

  let signal = unsafe { libc::sigtimedwait(mask, ptr::null_mut(), &timeout) };
  if signal < 0 {
    let errno = Errno::last();
    let _ = kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);
    return if errno == Errno::EAGAIN {
      info!("Target ran over {} ms, killed", total_ms);
      EXIT_TLE
    } else {
      error!("Waiting SIGCHLD fails: {}", errno);
      EXIT_RE
    };
  }

  match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
    Ok(WaitStatus::Exited(pid, 0)) => {
      info!("Target #{}. exited with status 0", pid);
      EXIT_OK
    }
    Ok(WaitStatus::Exited(pid, status)) => {
      info!("Target #{}. exited with status {}", pid, status);
      EXIT_RE
    }
    Ok(WaitStatus::Signaled(pid, signal, _)) => {
      info!("Target #{}. is killed by {}", pid, signal);
      EXIT_RE
    }
    _ => {
      // SIGCHLD arrived but the child is not reportable yet.
      let _ = kill(child, Signal::SIGKILL);
      let _ = waitpid(child, None);
      EXIT_RE
    }
  }
}
