//! Subprocess invocation for role commands and hooks.
//!
//! Commands never time out: a failover command may legitimately block for
//! minutes waiting on a validator service restart. Stdout and stderr are
//! streamed into the log line by line and fully drained before the child is
//! reaped.

use std::collections::BTreeMap;
use std::process::Stdio;

use anyhow::{ensure, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Run a command with the given args and env. In dry-run mode the command
/// is logged as if run and returns success without forking.
pub async fn run(
    name: &str,
    command: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    dry_run: bool,
) -> Result<()> {
    let env_string = env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    let run_msg = format!("{env_string} {command} {}", args.join(" "));
    info!(command = %name, dry_run, "{}", run_msg.trim());

    if dry_run {
        debug!(command = %name, "command completed successfully - dry run");
        return Ok(());
    }

    let mut cmd = Command::new(command);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    for (key, value) in env {
        cmd.env(key.trim(), value.trim());
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start command {command}"))?;

    let stdout = child.stdout.take().context("missing stdout pipe")?;
    let stderr = child.stderr.take().context("missing stderr pipe")?;
    let out_task = stream_lines(name.to_string(), "stdout", stdout);
    let err_task = stream_lines(name.to_string(), "stderr", stderr);

    // Drain both pipes fully before reaping the child.
    let (out, err) = tokio::join!(out_task, err_task);
    out.context("stdout reader failed")?;
    err.context("stderr reader failed")?;

    let status = child.wait().await.context("failed to wait for command")?;
    ensure!(status.success(), "command exited with {status}");

    debug!(command = %name, "command completed successfully");
    Ok(())
}

fn stream_lines(
    name: String,
    stream: &'static str,
    pipe: impl AsyncRead + Unpin + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(command = %name, stream, "> {}", line);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn runs_a_successful_command() {
        let args = vec!["hello".to_string()];
        run("test", "echo", &args, &BTreeMap::new(), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn surfaces_nonzero_exit() {
        let args = vec!["-c".to_string(), "exit 3".to_string()];
        let err = run("test", "sh", &args, &BTreeMap::new(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn surfaces_missing_binary() {
        let err = run("test", "definitely-not-a-real-binary", &[], &BTreeMap::new(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start command"));
    }

    #[tokio::test]
    async fn env_is_passed_to_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let mut env = BTreeMap::new();
        env.insert("MARKER".to_string(), marker.display().to_string());
        let args = vec!["-c".to_string(), "touch \"$MARKER\"".to_string()];
        run("test", "sh", &args, &env, false).await.unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn dry_run_never_forks() {
        // A dry run of a nonexistent binary must still succeed, and a dry
        // run of a real command must have no side effects.
        run("test", "definitely-not-a-real-binary", &[], &BTreeMap::new(), true)
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let args = vec![marker.display().to_string()];
        run("test", "touch", &args, &BTreeMap::new(), true)
            .await
            .unwrap();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn drains_output_before_reaping() {
        // Large output on both streams must not deadlock the child.
        let mut script = tempfile::NamedTempFile::new().unwrap();
        write!(
            script,
            "for i in $(seq 1 2000); do echo line-$i; echo err-$i 1>&2; done"
        )
        .unwrap();
        let args = vec![script.path().display().to_string()];
        run("test", "sh", &args, &BTreeMap::new(), false)
            .await
            .unwrap();
    }
}
