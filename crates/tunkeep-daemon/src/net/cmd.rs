use std::io;
use std::process::Command;

/// Execute a command with logging and return its trimmed stdout. A non-zero
/// exit becomes an error carrying stderr.
pub fn run_cmd(description: &str, program: &str, args: &[&str]) -> io::Result<String> {
    let cmd_line = format!("{program} {}", args.join(" "));
    tracing::debug!("{description}");
    tracing::debug!("exec: {cmd_line}");

    let output = Command::new(program).args(args).output().map_err(|e| {
        io::Error::new(e.kind(), format!("failed to execute {cmd_line}: {e}"))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::warn!("command failed: {cmd_line}\nstderr: {stderr}");
        return Err(io::Error::other(format!(
            "{description} failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Execute a command and report only whether it succeeded.
pub fn cmd_succeeds(program: &str, args: &[&str]) -> bool {
    tracing::debug!("exec (probe): {program} {}", args.join(" "));
    Command::new(program)
        .args(args)
        .output()
        .is_ok_and(|o| o.status.success())
}
