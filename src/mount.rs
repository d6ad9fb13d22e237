use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::{debug, error};
use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::context::InputFile;
use crate::error::SandCatError;

/// The sandbox filesystem: a read-only bind mount of the rootfs under
/// `/tmp/judger_sandbox_<id>` with a fresh size-capped tmpfs over its `/tmp`.
/// Teardown happens on drop, in mount order reversed, on every exit path.
pub struct SandboxFs {
  root: PathBuf,
  bind_mounted: bool,
  tmpfs_mounted: bool,
}

impl SandboxFs {
  pub fn setup(sandbox_id: &str, rootfs: &Path, tmpfs_size: &str) -> Result<Self, SandCatError> {
    let root = PathBuf::from(format!("/tmp/judger_sandbox_{}", sandbox_id));
    let mut sandbox = SandboxFs {
      root,
      bind_mounted: false,
      tmpfs_mounted: false,
    };

    fs::create_dir_all(&sandbox.root)?;
    fs::set_permissions(&sandbox.root, Permissions::from_mode(0o777))?;

    debug!(
      "Mount rootfs {} -> {}",
      rootfs.display(),
      sandbox.root.display()
    );
    mount::<Path, Path, str, str>(Some(rootfs), &sandbox.root, None, MsFlags::MS_BIND, None)
      .map_err(|err| SandCatError::mount(format!("Bind rootfs fails: {}", err)))?;
    sandbox.bind_mounted = true;
    mount::<Path, Path, str, str>(
      None,
      &sandbox.root,
      None,
      MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_BIND,
      None,
    )
    .map_err(|err| SandCatError::mount(format!("Remount rootfs read-only fails: {}", err)))?;

    let tmp = sandbox.tmp_dir();
    let options = format!("mode=0777,size={}", tmpfs_size);
    mount::<str, Path, str, str>(
      Some("tmpfs"),
      &tmp,
      Some("tmpfs"),
      MsFlags::empty(),
      Some(options.as_str()),
    )
    .map_err(|err| SandCatError::mount(format!("Mount tmpfs fails: {}", err)))?;
    sandbox.tmpfs_mounted = true;

    Ok(sandbox)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn tmp_dir(&self) -> PathBuf {
    self.root.join("tmp")
  }

  /// Write the requested input files into the tmpfs. Filenames were
  /// validated at the driver boundary already; the check is repeated here
  /// because this process is the one holding the mount.
  pub fn materialize(&self, input_files: &[InputFile]) -> Result<(), SandCatError> {
    let tmp = self.tmp_dir();
    for file in input_files {
      if !is_safe_filename(&file.filename) {
        return Err(SandCatError::request(format!(
          "Unsafe input filename {}",
          file.filename
        )));
      }
      let mut handle = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(file.mode)
        .open(tmp.join(&file.filename))?;
      handle.write_all(&file.content)?;
    }
    Ok(())
  }

  /// Read one artifact back from the tmpfs. A missing file and an unsafe
  /// name both yield empty content.
  pub fn read_back(&self, filename: &str) -> Vec<u8> {
    if !is_safe_filename(filename) {
      return vec![];
    }
    fs::read(self.tmp_dir().join(filename)).unwrap_or_default()
  }
}

impl Drop for SandboxFs {
  fn drop(&mut self) {
    if self.tmpfs_mounted {
      let tmp = self.tmp_dir();
      if let Err(err) = umount2(&tmp, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH) {
        error!("Fails umount {}: {}", tmp.display(), err);
      }
    }
    if self.bind_mounted {
      if let Err(err) = umount2(&self.root, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH) {
        error!("Fails umount {}: {}", self.root.display(), err);
      }
    }
    if self.root.exists() {
      if let Err(err) = fs::remove_dir(&self.root) {
        error!("Fails removing {}: {}", self.root.display(), err);
      }
    }
  }
}

/// A name the sandbox may create or read under its `/tmp`: a single path
/// component, no traversal, no NUL.
pub fn is_safe_filename(filename: &str) -> bool {
  !filename.is_empty()
    && filename != "."
    && filename != ".."
    && !filename.contains('/')
    && !filename.contains('\0')
}
