//! Helpers for unit and integration tests. Must be public for visibility in
//! integration tests.

use std::path::PathBuf;
use uuid::Uuid;

/// A stub vendor CLI: an executable shell script in a temp directory that
/// tests hand to `CliInvoker` in place of the real tool. The script body can
/// inspect `"$@"` to branch per subcommand and write to scratch files under
/// the same directory to count invocations.
pub struct FakeCli {
    dir: tempfile::TempDir,
    program: PathBuf,
}

impl FakeCli {
    pub fn new(script_body: &str) -> FakeCli {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir for fake CLI");
        let program = dir.path().join("fake-cli");
        std::fs::write(&program, format!("#!/bin/sh\n{script_body}\n"))
            .expect("failed to write fake CLI script");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&program)
                .expect("failed to stat fake CLI script")
                .permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&program, perms)
                .expect("failed to mark fake CLI script executable");
        }

        FakeCli { dir, program }
    }

    pub fn program(&self) -> &str {
        self.program.to_str().expect("fake CLI path is not UTF-8")
    }

    /// A path under the fake CLI's directory, for scripts that need scratch
    /// state (e.g. invocation counters).
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Counts the lines of a scratch file written by a fake CLI script.
pub fn line_count(path: &std::path::Path) -> usize {
    std::fs::read_to_string(path)
        .map(|contents| contents.lines().count())
        .unwrap_or(0)
}

/// A fixed trace ID for tests that need a stable one.
pub fn test_trace_id() -> Uuid {
    Uuid::parse_str("22011d4a-ae2c-4f59-9fb1-5c2d6ea9d1e6").expect("fixed UUID is valid")
}

/// Canned `sts assume-role` output with the given RFC 3339 expiration.
pub fn canned_assume_role_output(expiration: &str) -> String {
    format!(
        r#"{{
    "Credentials": {{
        "AccessKeyId": "ASIAFAKEFAKEFAKE",
        "SecretAccessKey": "fake-secret",
        "SessionToken": "fake-session-token",
        "Expiration": "{expiration}"
    }},
    "AssumedRoleUser": {{
        "AssumedRoleId": "AROAFAKE:apm-session",
        "Arn": "arn:aws:sts::222222222222:assumed-role/APMReader/apm-session"
    }}
}}"#
    )
}
