use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// Run a command to completion, returning its output whatever the exit status
pub async fn run(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    envs: &[(&str, &str)],
) -> Result<Output> {
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(envs.iter().copied())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    debug!("Running {} {}", program, args.join(" "));
    command
        .output()
        .await
        .with_context(|| format!("Failed to spawn {}", program))
}

/// Run a command and fail unless it exits successfully
pub async fn run_checked(program: &str, args: &[&str], cwd: Option<&Path>) -> Result<Output> {
    let output = run(program, args, cwd, &[]).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "{} {} exited with {}:\n{}",
            program,
            args.join(" "),
            output.status,
            stderr.trim()
        ));
    }
    Ok(output)
}
