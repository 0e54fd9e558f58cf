//! Virtual environment activation
//!
//! Has the same effect on a child process as sourcing `bin/activate`.

use crate::error::{DsctlError, DsctlResult};
use crate::utils::ResolvedLayout;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::warn;

const PYTHON_CANDIDATES: [&str; 2] = ["python", "python3"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualEnv {
    root: PathBuf,
    python: PathBuf,
}

impl VirtualEnv {
    /// A directory is a virtual environment when it has `bin/python{,3}`
    pub fn detect(root: &Path) -> Option<Self> {
        let bin = root.join("bin");
        PYTHON_CANDIDATES
            .iter()
            .map(|name| bin.join(name))
            .find(|candidate| candidate.is_file())
            .map(|python| Self {
                root: root.to_path_buf(),
                python,
            })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    /// Set `VIRTUAL_ENV`, put `bin/` first on `PATH` and drop `PYTHONHOME`
    pub fn activate(&self, cmd: &mut Command) {
        cmd.env("VIRTUAL_ENV", &self.root);
        cmd.env("PATH", self.activated_path(std::env::var_os("PATH")));
        cmd.env_remove("PYTHONHOME");
    }

    fn activated_path(&self, current: Option<OsString>) -> OsString {
        let mut entries = vec![self.bin_dir()];
        if let Some(current) = current {
            entries.extend(std::env::split_paths(&current));
        }
        // only fails on entries containing the separator, which split_paths never yields
        std::env::join_paths(entries).unwrap_or_else(|_| self.bin_dir().into_os_string())
    }
}

/// Interpreter the detection program runs under
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpreter {
    Venv(VirtualEnv),
    System(PathBuf),
}

impl Interpreter {
    /// Prefer the layout's virtual environment, else the configured
    /// interpreter from `PATH`
    pub fn resolve(layout: &ResolvedLayout) -> DsctlResult<Self> {
        if let Some(venv) = VirtualEnv::detect(&layout.venv_dir) {
            return Ok(Interpreter::Venv(venv));
        }

        warn!(
            "no virtual environment at {}, falling back to {}",
            layout.venv_dir.display(),
            layout.interpreter
        );
        which::which(&layout.interpreter)
            .map(Interpreter::System)
            .map_err(|err| {
                DsctlError::config_with_source(
                    format!(
                        "no virtual environment at {} and '{}' is not on PATH",
                        layout.venv_dir.display(),
                        layout.interpreter
                    ),
                    err,
                )
            })
    }

    pub fn program(&self) -> &Path {
        match self {
            Interpreter::Venv(venv) => venv.python(),
            Interpreter::System(path) => path,
        }
    }

    pub fn apply(&self, cmd: &mut Command) {
        if let Interpreter::Venv(venv) = self {
            venv.activate(cmd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn make_venv(dir: &TempDir, python_name: &str) -> PathBuf {
        let root = dir.path().join("venv");
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join(python_name);
        std::fs::write(&python, "#!/bin/sh\nexec python3 \"$@\"\n").unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        root
    }

    #[test]
    fn detects_python3_only_venv() {
        let dir = TempDir::new().unwrap();
        let root = make_venv(&dir, "python3");

        let venv = VirtualEnv::detect(&root).expect("venv");
        assert_eq!(venv.python(), root.join("bin/python3"));
    }

    #[test]
    fn plain_directory_is_not_a_venv() {
        let dir = TempDir::new().unwrap();
        assert!(VirtualEnv::detect(dir.path()).is_none());
    }

    #[test]
    fn activated_path_puts_venv_bin_first() {
        let dir = TempDir::new().unwrap();
        let venv = VirtualEnv::detect(&make_venv(&dir, "python")).unwrap();

        let path = venv.activated_path(Some(OsString::from("/usr/bin:/bin")));
        let entries: Vec<PathBuf> = std::env::split_paths(&path).collect();
        assert_eq!(
            entries,
            vec![venv.bin_dir(), PathBuf::from("/usr/bin"), PathBuf::from("/bin")]
        );
    }

    #[test]
    fn activate_sets_child_environment() {
        let dir = TempDir::new().unwrap();
        let venv = VirtualEnv::detect(&make_venv(&dir, "python")).unwrap();

        let mut cmd = Command::new("sh");
        venv.activate(&mut cmd);
        let envs: Vec<_> = cmd.get_envs().collect();

        assert!(envs
            .iter()
            .any(|(k, v)| *k == "VIRTUAL_ENV" && *v == Some(venv.root().as_os_str())));
        assert!(envs.iter().any(|(k, v)| *k == "PYTHONHOME" && v.is_none()));
    }
}
