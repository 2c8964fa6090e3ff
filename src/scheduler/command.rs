//! Running one command spec into one archive file.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::archive::paths;
use crate::archive::{StagingArchive, StagingError};
use crate::collectors::specs::{CommandSpec, StderrMode};
use crate::constants::{COMMANDS_DIR, TERMINATE_GRACE_SECS};
use crate::models::{CapturedItem, ItemKind};
use crate::scheduler::capture::{self, CappedOutput};
use crate::scheduler::process;
use crate::security::scrub_command_line;

/// Status shells report for a program that could not be found
const NOT_FOUND_STATUS: i32 = 127;
const NOT_EXECUTABLE_STATUS: i32 = 126;

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Exited,
    TimedOut,
    Cancelled,
}

/// Settings shared by every command of a wave.
#[derive(Debug, Clone)]
pub(crate) struct CommandRunner {
    pub sysroot: PathBuf,
    pub default_timeout: Duration,
    pub grace: Duration,
    pub cancel: CancellationToken,
}

impl CommandRunner {
    pub(crate) fn new(sysroot: &Path, default_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            sysroot: sysroot.to_path_buf(),
            default_timeout,
            grace: Duration::from_secs(TERMINATE_GRACE_SECS),
            cancel,
        }
    }

    fn chroot_target(&self, spec: &CommandSpec) -> Option<&Path> {
        if spec.chroot && self.sysroot != Path::new("/") {
            Some(&self.sysroot)
        } else {
            None
        }
    }

    /// Run `spec` for `collector`. Returns the output item plus any
    /// companions (stderr sibling, truncation note, root symlink).
    ///
    /// Only staging failures are errors; everything about the command itself
    /// is recorded on the items.
    pub(crate) async fn run(
        &self,
        staging: &StagingArchive,
        collector: &str,
        spec: &CommandSpec,
    ) -> Result<Vec<CapturedItem>, StagingError> {
        let command_line = scrub_command_line(&spec.argv);
        let wanted = format!("{}/{}/{}", COMMANDS_DIR, collector, spec.output_name());

        if staging.is_forbidden(&wanted) {
            return Ok(vec![CapturedItem::alert(collector, command_line, "output path is forbidden, not run")]);
        }

        let (archive_path, file) = match staging.create_output(&wanted) {
            Ok(created) => created,
            Err(e) if !e.is_fatal() => {
                return Ok(vec![CapturedItem::alert(collector, command_line, e.to_string())]);
            }
            Err(e) => return Err(e),
        };
        let mut output = Mutex::new(CappedOutput::new(file, staging.full_path(&archive_path), spec.size_limit));

        let mut stderr_path = None;
        let mut sibling = match spec.stderr {
            StderrMode::Sibling => {
                let (path, file) = staging.create_output(&format!("{}.stderr", archive_path))?;
                let sink = CappedOutput::new(file, staging.full_path(&path), spec.size_limit);
                stderr_path = Some(path);
                Some(Mutex::new(sink))
            }
            StderrMode::Fold | StderrMode::Discard => None,
        };

        let mut item = CapturedItem::new(collector, ItemKind::CommandOutput, command_line.clone()).at(&archive_path);
        let timeout = Duration::from_secs(spec.timeout_s.unwrap_or(self.default_timeout.as_secs()));
        let started = Instant::now();
        info!("[{}] running {}", collector, command_line);

        let mut result = self
            .execute(spec, self.chroot_target(spec), &output, sibling.as_ref(), timeout)
            .await?;

        if let Some(root) = self.chroot_target(spec) {
            let missing = matches!(&result, Err(e) if e.kind() == io::ErrorKind::NotFound)
                || matches!(&result, Ok((status, Ending::Exited)) if matches!(exit_code(status), NOT_FOUND_STATUS | NOT_EXECUTABLE_STATUS));
            if missing {
                debug!("[{}] {} not found under {}, retrying on the host", collector, spec.program_name(), root.display());
                output.get_mut().reset().await?;
                if let Some(sibling) = sibling.as_mut() {
                    sibling.get_mut().reset().await?;
                }
                result = self.execute(spec, None, &output, sibling.as_ref(), timeout).await?;
            }
        }
        let cut = output.into_inner().finish().await?;
        let stderr_cut = match sibling {
            Some(sibling) => sibling.into_inner().finish().await?,
            None => false,
        };
        item.runtime_s = Some(started.elapsed().as_secs_f64());

        let (status, ending) = match result {
            Ok(outcome) => outcome,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return self.not_found(staging, collector, &command_line, &archive_path, stderr_path.as_deref());
            }
            Err(e) => {
                warn!("[{}] failed to start {}: {}", collector, command_line, e);
                item.error = Some(format!("failed to start: {}", e));
                return Ok(vec![item]);
            }
        };

        let code = exit_code(&status);
        item.exit_status = Some(code);
        match ending {
            Ending::Exited if code == NOT_FOUND_STATUS => {
                return self.not_found(staging, collector, &command_line, &archive_path, stderr_path.as_deref());
            }
            Ending::Exited => {
                if code != 0 {
                    debug!("[{}] {} exited with {}", collector, command_line, code);
                }
            }
            Ending::TimedOut => {
                warn!("[{}] {} timed out after {}s", collector, command_line, timeout.as_secs());
                item.truncated = true;
                item.error = Some("timeout".to_string());
            }
            Ending::Cancelled => {
                item.truncated = true;
                item.error = Some("cancelled".to_string());
            }
        }

        let mut items = Vec::new();
        if let (true, Some(limit)) = (cut, spec.size_limit) {
            item.truncated = true;
            items.push(CapturedItem::alert(
                collector,
                archive_path.clone(),
                format!("output truncated to its last {} bytes", limit),
            ));
        }
        item.bytes_written = staging.captured_len(&archive_path);

        if let Some(path) = stderr_path {
            let mut stderr_item = CapturedItem::new(collector, ItemKind::CommandOutput, format!("{} (stderr)", command_line)).at(&path);
            stderr_item.exit_status = item.exit_status;
            stderr_item.truncated = stderr_cut;
            stderr_item.bytes_written = staging.captured_len(&path);
            items.push(stderr_item);
        }

        if let Some(name) = &spec.root_symlink {
            let link_name = paths::normalize(name)?;
            let link_text = paths::relative_link_target(&link_name, &archive_path);
            items.push(staging.add_link(collector, &command_line, &link_text, &link_name)?);
        }

        items.insert(0, item);
        Ok(items)
    }

    fn not_found(
        &self,
        staging: &StagingArchive,
        collector: &str,
        command_line: &str,
        archive_path: &str,
        stderr_path: Option<&str>,
    ) -> Result<Vec<CapturedItem>, StagingError> {
        staging.release(archive_path)?;
        if let Some(path) = stderr_path {
            staging.release(path)?;
        }
        info!("[{}] command not found: {}", collector, command_line);
        let mut alert = CapturedItem::alert(collector, command_line, "command not found");
        alert.exit_status = Some(NOT_FOUND_STATUS);
        Ok(vec![alert])
    }

    /// Spawn and wait, streaming the output pipes into their sinks. The
    /// outer error is a staging failure; the inner one is a spawn failure
    /// that belongs to the item.
    async fn execute(
        &self,
        spec: &CommandSpec,
        chroot: Option<&Path>,
        output: &Mutex<CappedOutput>,
        sibling: Option<&Mutex<CappedOutput>>,
        timeout: Duration,
    ) -> Result<io::Result<(ExitStatus, Ending)>, StagingError> {
        let mut command = match process::command(&spec.argv[0]) {
            Ok(command) => command,
            Err(e) => return Ok(Err(io::Error::new(io::ErrorKind::PermissionDenied, e.to_string()))),
        };
        command.args(&spec.argv[1..]);
        command.env("LC_ALL", "C");
        for (key, value) in &spec.env {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let stderr_sink = match spec.stderr {
            StderrMode::Fold => Some(output),
            StderrMode::Sibling => sibling,
            StderrMode::Discard => None,
        };
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(if stderr_sink.is_some() { Stdio::piped() } else { Stdio::null() });
        command.kill_on_drop(true);

        let chroot_dir = match chroot {
            Some(root) => match CString::new(root.as_os_str().as_bytes()) {
                Ok(c) => Some(c),
                Err(e) => return Ok(Err(io::Error::new(io::ErrorKind::InvalidInput, e))),
            },
            None => None,
        };

        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            command.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                if let Some(root) = &chroot_dir {
                    if libc::chroot(root.as_ptr()) != 0 || libc::chdir(b"/\0".as_ptr() as *const libc::c_char) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Ok(Err(e)),
        };
        let _group = child.id().map(process::track_group);
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let ending = {
            let finished = async {
                tokio::join!(
                    capture::pump(stdout_pipe, output),
                    capture::pump(stderr_pipe, stderr_sink.unwrap_or(output)),
                    child.wait(),
                )
            };
            tokio::select! {
                (stdout_done, stderr_done, status) = finished => {
                    stdout_done?;
                    stderr_done?;
                    return Ok(status.map(|s| (s, Ending::Exited)));
                }
                _ = tokio::time::sleep(timeout) => Ending::TimedOut,
                _ = self.cancel.cancelled() => Ending::Cancelled,
            }
        };

        Ok(self.terminate(&mut child).await.map(|status| (status, ending)))
    }

    /// SIGTERM the process group, then SIGKILL after the grace window.
    async fn terminate(&self, child: &mut Child) -> io::Result<ExitStatus> {
        if let Some(pid) = child.id() {
            process::signal_group(pid, libc::SIGTERM);
            if let Ok(status) = tokio::time::timeout(self.grace, child.wait()).await {
                return status;
            }
            process::signal_group(pid, libc::SIGKILL);
        } else {
            let _ = child.start_kill();
        }
        child.wait().await
    }
}

/// Exit code, or `128 + signal` for a process ended by a signal.
fn exit_code(status: &ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn runner() -> CommandRunner {
        CommandRunner::new(Path::new("/"), Duration::from_secs(30), CancellationToken::new())
    }

    fn staging() -> (TempDir, StagingArchive) {
        let base = TempDir::new().unwrap();
        let staging = StagingArchive::create(base.path(), "h").unwrap();
        (base, staging)
    }

    #[tokio::test]
    async fn test_output_captured_with_status() {
        let (_base, staging) = staging();
        let spec = CommandSpec::new(["sh", "-c", "echo out; echo err >&2; exit 3"]);
        let items = runner().run(&staging, "shell", &spec).await.unwrap();

        let item = &items[0];
        assert_eq!(item.kind, ItemKind::CommandOutput);
        assert_eq!(item.exit_status, Some(3));
        assert!(item.error.is_none());
        let path = item.archive_path.as_deref().unwrap();
        assert!(path.starts_with("sos_commands/shell/sh_-c_echo_out"));
        let content = String::from_utf8(staging.read_captured(path).unwrap()).unwrap();
        assert!(content.contains("out\n"));
        assert!(content.contains("err\n"));
    }

    #[tokio::test]
    async fn test_stderr_sibling_and_discard() {
        let (_base, staging) = staging();
        let sibling = CommandSpec::new(["sh", "-c", "echo out; echo err >&2"])
            .suggest_filename("both")
            .stderr(StderrMode::Sibling);
        let items = runner().run(&staging, "shell", &sibling).await.unwrap();
        assert_eq!(staging.read_captured("sos_commands/shell/both").unwrap(), b"out\n");
        assert_eq!(items[1].archive_path.as_deref(), Some("sos_commands/shell/both.stderr"));
        assert_eq!(staging.read_captured("sos_commands/shell/both.stderr").unwrap(), b"err\n");

        let discard = CommandSpec::new(["sh", "-c", "echo out; echo err >&2"])
            .suggest_filename("quiet")
            .stderr(StderrMode::Discard);
        runner().run(&staging, "shell", &discard).await.unwrap();
        assert_eq!(staging.read_captured("sos_commands/shell/quiet").unwrap(), b"out\n");
    }

    #[tokio::test]
    async fn test_not_found_leaves_no_output() {
        let (_base, staging) = staging();
        let spec = CommandSpec::new(["definitely-not-a-command-xyz", "--help"]);
        let items = runner().run(&staging, "x", &spec).await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, ItemKind::Alert);
        assert_eq!(items[0].exit_status, Some(127));
        assert!(!staging.contains("sos_commands/x/definitely-not-a-command-xyz_--help"));
    }

    #[tokio::test]
    async fn test_timeout_terminates_and_marks() {
        let (_base, staging) = staging();
        let spec = CommandSpec::new(["sleep", "30"]).timeout(1);
        let started = Instant::now();
        let items = runner().run(&staging, "slow", &spec).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        let item = &items[0];
        assert_eq!(item.error.as_deref(), Some("timeout"));
        assert!(item.truncated);
        assert_eq!(item.exit_status, Some(128 + libc::SIGTERM));
        assert_eq!(staging.read_captured(item.archive_path.as_deref().unwrap()).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let (_base, staging) = staging();
        let cancel = CancellationToken::new();
        let runner = CommandRunner::new(Path::new("/"), Duration::from_secs(60), cancel.clone());
        let spec = CommandSpec::new(["sleep", "30"]);

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
        let items = runner.run(&staging, "slow", &spec).await.unwrap();
        trigger.await.unwrap();
        assert_eq!(items[0].error.as_deref(), Some("cancelled"));
        assert!(items[0].truncated);
    }

    #[tokio::test]
    async fn test_env_overrides_and_size_limit() {
        let (_base, staging) = staging();
        std::env::set_var("DIAG_COLLECTOR_TEST_VAR", "present");
        let spec = CommandSpec::new(["sh", "-c", "echo \"$LC_ALL-${DIAG_COLLECTOR_TEST_VAR:-gone}-$EXTRA\"; printf 0123456789"])
            .suggest_filename("env")
            .unset_env("DIAG_COLLECTOR_TEST_VAR")
            .env("EXTRA", "x")
            .size_limit(4);
        let items = runner().run(&staging, "env", &spec).await.unwrap();

        assert!(items[0].truncated);
        assert_eq!(items[0].bytes_written, 4);
        assert_eq!(staging.read_captured("sos_commands/env/env").unwrap(), b"6789");
        assert_eq!(items[1].kind, ItemKind::Alert);

        let full = CommandSpec::new(["sh", "-c", "echo \"$LC_ALL-${DIAG_COLLECTOR_TEST_VAR:-gone}-$EXTRA\""])
            .suggest_filename("env-full")
            .unset_env("DIAG_COLLECTOR_TEST_VAR")
            .env("EXTRA", "x");
        runner().run(&staging, "env", &full).await.unwrap();
        assert_eq!(staging.read_captured("sos_commands/env/env-full").unwrap(), b"C-gone-x\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_size_limit_holds_while_command_runs() {
        let base = TempDir::new().unwrap();
        let staging = Arc::new(StagingArchive::create(base.path(), "h").unwrap());
        let spec = CommandSpec::new(["sh", "-c", "head -c 200000 /dev/zero; sleep 2; printf tail"])
            .suggest_filename("zeros")
            .size_limit(10);

        let running = {
            let staging = Arc::clone(&staging);
            tokio::spawn(async move { runner().run(&staging, "big", &spec).await })
        };
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let staged = std::fs::metadata(staging.full_path("sos_commands/big/zeros")).unwrap();
        assert!(staged.len() <= 10);

        let items = running.await.unwrap().unwrap();
        assert!(items[0].truncated);
        assert_eq!(items[0].bytes_written, 10);
        assert_eq!(staging.read_captured("sos_commands/big/zeros").unwrap(), b"\0\0\0\0\0\0tail");
    }

    #[tokio::test]
    async fn test_root_symlink_points_at_output() {
        let (_base, staging) = staging();
        let spec = CommandSpec::new(["echo", "Linux"]).root_symlink("uname");
        let items = runner().run(&staging, "host", &spec).await.unwrap();

        let link = items.iter().find(|i| i.kind == ItemKind::CopiedSymlink).unwrap();
        assert_eq!(link.archive_path.as_deref(), Some("uname"));
        let target = std::fs::read_link(staging.full_path("uname")).unwrap();
        assert_eq!(target, PathBuf::from("sos_commands/host/echo_Linux"));
        assert_eq!(std::fs::read(staging.full_path("uname")).unwrap(), b"Linux\n");
    }

    #[test]
    fn test_exit_code_from_signal() {
        assert_eq!(exit_code(&ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(&ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(&ExitStatus::from_raw(libc::SIGKILL)), 128 + libc::SIGKILL);
    }
}
