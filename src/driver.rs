use std::fs;

use log::{error, info};

use nix::libc;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{getgid, getuid, Pid};

use crate::context::{JudgeRequest, JudgeResult};
use crate::error::SandCatError;
use crate::pipe::SandCatPipe;
use crate::sandbox::{self, STACK_SIZE};

/// Run one judged request and return its result.
///
/// Spawns the namespace-init into fresh user, mount, IPC, network and UTS
/// namespaces, installs the uid/gid map from outside, and reads the result
/// frame back over an internal pipe. A pid namespace is deliberately not
/// created at this level: the namespace-init must stay visible under the
/// host `/proc` to receive its map, and to write its own child's.
pub fn run(request: &JudgeRequest) -> Result<JudgeResult, SandCatError> {
  let barrier = SandCatPipe::new()?;
  let result_pipe = SandCatPipe::new()?;

  let mut stack = vec![0u8; STACK_SIZE];
  let child = clone(
    Box::new(|| sandbox::sandbox_init(request, &barrier, &result_pipe)),
    &mut stack,
    CloneFlags::CLONE_NEWUSER
      | CloneFlags::CLONE_NEWNS
      | CloneFlags::CLONE_NEWIPC
      | CloneFlags::CLONE_NEWNET
      | CloneFlags::CLONE_NEWUTS,
    Some(Signal::SIGCHLD as libc::c_int),
  )
  .map_err(|errno| SandCatError::fork(format!("Clone namespace init fails: {}", errno)))?;

  info!("Namespace init spawned (pid = {})", child);

  if let Err(err) = install_id_maps(child).and_then(|_| barrier.release()) {
    error!("Install uid/gid map fails: {}", err);
    let _ = kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);
    return Err(err);
  }

  // Read the frame before reaping: a large response would fill the pipe
  // and leave the namespace-init blocked on its write forever.
  let result_fd = result_pipe.into_reader();
  let result = JudgeResult::read_from(result_fd);
  let _ = waitpid(child, None);

  result
}

/// Map this process's real uid/gid to root inside the new user namespace,
/// granting the namespace-init CAP_SYS_ADMIN there and nowhere else.
/// `setgroups` must be denied before the gid map may be written.
fn install_id_maps(pid: Pid) -> Result<(), SandCatError> {
  let proc_dir = format!("/proc/{}", pid.as_raw());
  fs::write(format!("{}/setgroups", proc_dir), "deny")?;
  fs::write(format!("{}/uid_map", proc_dir), format!("0 {} 1", getuid().as_raw()))?;
  fs::write(format!("{}/gid_map", proc_dir), format!("0 {} 1", getgid().as_raw()))?;
  Ok(())
}
