/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Per-step temporary workspace.
//!
//! Script steps get a fresh directory under the OS temp root, named with the
//! step's prefix plus a random token, owner-accessible only. Teardown is
//! best-effort: a directory that cannot be removed is logged at warning and
//! never changes the step's outcome.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::warn;

/// A unique temporary directory for one script step.
#[derive(Debug)]
pub struct StepWorkspace {
    dir: TempDir,
}

impl StepWorkspace {
    /// Creates `<temp-root>/<prefix><random>` with owner-only permissions.
    pub fn create(prefix: &str) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(temp_root())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Recursively removes the directory, logging on failure.
    pub fn cleanup(self) {
        let path = self.dir.path().display().to_string();
        if let Err(e) = self.dir.close() {
            warn!("Couldn't remove temporary directory {}: {}", path, e);
        }
    }
}

/// The OS temp root: the first non-empty of `TMPDIR`, `TMP`, `TEMP`,
/// `TEMPDIR` on POSIX (defaulting to `/tmp`); the platform API on Windows.
fn temp_root() -> PathBuf {
    #[cfg(windows)]
    {
        std::env::temp_dir()
    }

    #[cfg(not(windows))]
    {
        for var in ["TMPDIR", "TMP", "TEMP", "TEMPDIR"] {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    return PathBuf::from(value);
                }
            }
        }
        PathBuf::from("/tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_temp_vars() {
        for var in ["TMPDIR", "TMP", "TEMP", "TEMPDIR"] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    #[cfg(not(windows))]
    fn temp_root_honors_env_chain() {
        clear_temp_vars();
        assert_eq!(temp_root(), PathBuf::from("/tmp"));

        std::env::set_var("TEMPDIR", "/from-tempdir");
        assert_eq!(temp_root(), PathBuf::from("/from-tempdir"));

        std::env::set_var("TEMP", "/from-temp");
        assert_eq!(temp_root(), PathBuf::from("/from-temp"));

        std::env::set_var("TMP", "/from-tmp");
        assert_eq!(temp_root(), PathBuf::from("/from-tmp"));

        std::env::set_var("TMPDIR", "/from-tmpdir");
        assert_eq!(temp_root(), PathBuf::from("/from-tmpdir"));

        clear_temp_vars();
    }

    #[test]
    #[serial]
    fn workspace_uses_prefix_and_is_removed_on_cleanup() {
        clear_temp_vars();
        let workspace = StepWorkspace::create("pga_1_2_").unwrap();
        let path = workspace.path().to_path_buf();

        assert!(path.is_dir());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("pga_1_2_"));

        workspace.cleanup();
        assert!(!path.exists());
    }

    #[test]
    #[serial]
    #[cfg(unix)]
    fn workspace_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        clear_temp_vars();
        let workspace = StepWorkspace::create("pga_3_4_").unwrap();
        let mode = std::fs::metadata(workspace.path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
        workspace.cleanup();
    }

    #[test]
    #[serial]
    fn distinct_workspaces_do_not_collide() {
        clear_temp_vars();
        let a = StepWorkspace::create("pga_5_6_").unwrap();
        let b = StepWorkspace::create("pga_5_6_").unwrap();
        assert_ne!(a.path(), b.path());
        a.cleanup();
        b.cleanup();
    }
}
