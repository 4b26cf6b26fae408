//! Fixtures shared by the unit tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable stand-in for the build tool. `test_body` runs for the
/// `test` subcommand; every other subcommand succeeds. Each invocation echoes
/// its run id and arguments into the step log.
pub fn fake_tool(dir: &Path, test_body: &str) -> PathBuf {
    let path = dir.join("fake-cargo");
    let script = format!(
        "#!/bin/sh\necho \"run=$GATE_RUN_ID args=$*\"\ncase \"$1\" in\n  test)\n    {test_body}\n    ;;\n  *)\n    exit 0\n    ;;\nesac\n"
    );
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}
