#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_AGENT_BIN: &str = "claude";

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn path_contains_separator(cmd: &str) -> bool {
    cmd.contains(std::path::MAIN_SEPARATOR) || cmd.contains('/')
}

pub(crate) fn find_executable_in_path(name: &str) -> Option<PathBuf> {
    if name.trim().is_empty() {
        return None;
    }
    let path_var = std::env::var_os("PATH")?;
    let dirs = std::env::split_paths(&path_var).collect::<Vec<_>>();
    find_executable_in_dirs(name, &dirs)
}

pub(crate) fn find_executable_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    if name.trim().is_empty() {
        return None;
    }
    dirs.iter()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Explicit path (or bare name) wins; otherwise the agent binary is looked up on `PATH`.
pub(crate) fn resolve_agent_bin(explicit: Option<&str>) -> Option<PathBuf> {
    match explicit.map(str::trim).filter(|s| !s.is_empty()) {
        Some(cmd) if path_contains_separator(cmd) => {
            let path = PathBuf::from(cmd);
            is_executable(&path).then_some(path)
        }
        Some(name) => find_executable_in_path(name),
        None => find_executable_in_path(DEFAULT_AGENT_BIN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_stub(dir: &Path, name: &str) -> PathBuf {
        let stub = dir.join(name);
        fs::write(&stub, "#!/bin/sh\necho ok\n").expect("write stub");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&stub).expect("meta").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&stub, perms).expect("chmod");
        }
        stub
    }

    #[test]
    fn find_executable_in_dirs_discovers_stub() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_stub(dir.path(), "claude");

        let found = find_executable_in_dirs("claude", &[dir.path().to_path_buf()]);
        assert_eq!(found, Some(dir.path().join("claude")));
        assert_eq!(
            find_executable_in_dirs("missing", &[dir.path().to_path_buf()]),
            None
        );
    }

    #[test]
    fn explicit_path_must_be_executable() {
        let dir = tempfile::tempdir().expect("temp dir");
        let stub = write_stub(dir.path(), "agent");
        let stub_str = stub.to_string_lossy().to_string();

        assert_eq!(resolve_agent_bin(Some(&stub_str)), Some(stub));
        let missing = dir.path().join("nope").to_string_lossy().to_string();
        assert_eq!(resolve_agent_bin(Some(&missing)), None);
    }
}
