use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub fn locate(name: &str) -> Option<PathBuf> {
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for candidate in candidate_names(name) {
                let path = dir.join(candidate);
                if path.is_file() {
                    return Some(path);
                }
            }
        }
    }

    well_known_roots()
        .into_iter()
        .flat_map(|root| {
            candidate_names(name)
                .into_iter()
                .map(move |candidate| root.join(candidate))
                .collect::<Vec<_>>()
        })
        .find(|path| path.is_file())
}

fn candidate_names(name: &str) -> Vec<String> {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        vec![format!("{name}.exe"), name.to_string()]
    } else {
        vec![name.to_string()]
    }
}

#[cfg(windows)]
fn well_known_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for var in ["ProgramFiles", "ProgramFiles(x86)"] {
        if let Ok(base) = std::env::var(var) {
            let base = PathBuf::from(base);
            roots.push(base.join("7-Zip"));
            roots.push(base.join("WinRAR"));
            roots.push(base.join("Git").join("cmd"));
        }
    }
    roots
}

#[cfg(not(windows))]
fn well_known_roots() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/opt/homebrew/bin"),
        PathBuf::from("/usr/bin"),
    ]
}

pub async fn run(
    program: &Path,
    args: &[&str],
    working_dir: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<ToolOutput> {
    let tool_name = display_name(program);

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }
    #[cfg(windows)]
    command.creation_flags(0x0800_0000);

    let mut child = command.spawn().map_err(|err| Error::Tool {
        tool: tool_name.clone(),
        code: -1,
        stderr: format!("failed to start: {err}"),
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = tokio::spawn(collect_lines(stdout));
    let stderr_task = tokio::spawn(collect_lines(stderr));

    let status = tokio::select! {
        status = child.wait() => status.map_err(|err| Error::Tool {
            tool: tool_name.clone(),
            code: -1,
            stderr: format!("failed to wait for exit: {err}"),
        })?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(Error::Cancelled);
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(ToolOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

pub async fn run_checked(
    program: &Path,
    args: &[&str],
    working_dir: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<ToolOutput> {
    let output = run(program, args, working_dir, cancel).await?;
    if output.exit_code != 0 {
        return Err(Error::Tool {
            tool: display_name(program),
            code: output.exit_code,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

async fn collect_lines(stream: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let mut collected = String::new();
    if let Some(stream) = stream {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
        }
    }
    collected
}

fn display_name(program: &Path) -> String {
    program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_misses_for_nonexistent_tool() {
        assert!(locate("definitely-no-such-tool-acsm").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_captures_stdout_and_exit_code() {
        let sh = locate("sh").expect("sh on PATH");
        let output = run(
            &sh,
            &["-c", "echo out; echo err >&2"],
            None,
            &CancellationToken::new(),
        )
        .await
        .expect("run sh");

        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_checked_surfaces_stderr_on_failure() {
        let sh = locate("sh").expect("sh on PATH");
        let err = run_checked(
            &sh,
            &["-c", "echo broken >&2; exit 3"],
            None,
            &CancellationToken::new(),
        )
        .await
        .expect_err("must fail");

        match err {
            Error::Tool { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_kills_child_on_cancel() {
        let sh = locate("sh").expect("sh on PATH");
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            let sh = sh.clone();
            tokio::spawn(async move { run(&sh, &["-c", "sleep 30"], None, &cancel).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        let result = handle.await.expect("join");
        assert!(result.expect_err("must cancel").is_cancelled());
    }
}
