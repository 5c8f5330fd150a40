use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::error::TernError;

/// Default cap on bash output carried in the conversation, in bytes.
pub const DEFAULT_OUTPUT_LIMIT: usize = 200_000;

/// How often the runner polls for cancellation while the process runs.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Streamed chunk callback for UIs that render output live.
pub type OnChunk = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BashResult {
    /// Combined stdout+stderr, possibly truncated to the cap (with a
    /// sentinel line appended).
    pub output: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub was_cancelled: bool,
    /// Side file holding the full output when the cap was exceeded.
    pub full_output_path: Option<PathBuf>,
}

fn kill_process_tree(pid: u32) {
    #[cfg(unix)]
    {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(-(pid as i32)),
            nix::sys::signal::Signal::SIGKILL,
        );
    }
    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F", "/T"])
            .output();
    }
}

/// Run a bash command in its own process group, polling the cancellation
/// token every 50 ms. On cancel the whole process tree is killed; output is
/// still returned with `was_cancelled` set.
pub async fn run_bash(
    command: &str,
    working_dir: &Path,
    cancel: CancellationToken,
    output_limit: usize,
    side_file_dir: Option<&Path>,
    on_chunk: Option<OnChunk>,
) -> Result<BashResult, TernError> {
    use tokio::process::Command;

    let start = std::time::Instant::now();

    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut output: Vec<u8> = Vec::new();
    let mut was_cancelled = false;

    let mut read_buf = [0u8; 8192];
    loop {
        let mut made_progress = false;

        if let Some(out) = stdout.as_mut() {
            match tokio::time::timeout(CANCEL_POLL_INTERVAL, out.read(&mut read_buf)).await {
                Ok(Ok(0)) => stdout = None,
                Ok(Ok(n)) => {
                    if let Some(cb) = &on_chunk {
                        cb(&String::from_utf8_lossy(&read_buf[..n]));
                    }
                    output.extend_from_slice(&read_buf[..n]);
                    made_progress = true;
                }
                Ok(Err(_)) => stdout = None,
                Err(_) => {}
            }
        }

        if let Some(err) = stderr.as_mut() {
            match tokio::time::timeout(CANCEL_POLL_INTERVAL, err.read(&mut read_buf)).await {
                Ok(Ok(0)) => stderr = None,
                Ok(Ok(n)) => {
                    if let Some(cb) = &on_chunk {
                        cb(&String::from_utf8_lossy(&read_buf[..n]));
                    }
                    output.extend_from_slice(&read_buf[..n]);
                    made_progress = true;
                }
                Ok(Err(_)) => stderr = None,
                Err(_) => {}
            }
        }

        if cancel.is_cancelled() {
            was_cancelled = true;
            if let Some(pid) = pid {
                kill_process_tree(pid);
            }
            break;
        }

        if stdout.is_none() && stderr.is_none() {
            break;
        }

        if !made_progress {
            // Both pipes open but idle; the timeouts above already provided
            // the 50ms pacing.
            tokio::task::yield_now().await;
        }
    }

    let exit_code = if was_cancelled {
        let _ = child.wait().await;
        None
    } else {
        child.wait().await.ok().and_then(|status| status.code())
    };

    let full_output = String::from_utf8_lossy(&output).to_string();
    let duration_ms = start.elapsed().as_millis() as u64;

    let (output, full_output_path) = if full_output.len() > output_limit {
        let side_path = write_side_file(side_file_dir, &full_output)?;
        let mut end = output_limit;
        while end > 0 && !full_output.is_char_boundary(end) {
            end -= 1;
        }
        let mut truncated = full_output[..end].to_string();
        truncated.push_str(&format!(
            "\n\n[Output truncated: {} bytes total{}]",
            full_output.len(),
            match &side_path {
                Some(p) => format!(", full output saved to {}", p.display()),
                None => String::new(),
            }
        ));
        (truncated, side_path)
    } else {
        (full_output, None)
    };

    Ok(BashResult {
        output,
        exit_code,
        duration_ms,
        was_cancelled,
        full_output_path,
    })
}

fn write_side_file(dir: Option<&Path>, content: &str) -> Result<Option<PathBuf>, TernError> {
    let Some(dir) = dir else {
        return Ok(None);
    };
    crate::config::paths::ensure_dir(dir)?;
    let path = dir.join(format!("bash-{}.txt", uuid::Uuid::new_v4().simple()));
    let mut file = std::fs::File::create(&path)?;
    file.write_all(content.as_bytes())?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let result = run_bash(
            "echo hello; echo world >&2; exit 3",
            tmp.path(),
            CancellationToken::new(),
            DEFAULT_OUTPUT_LIMIT,
            None,
            None,
        )
        .await
        .unwrap();

        assert!(result.output.contains("hello"));
        assert!(result.output.contains("world"));
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.was_cancelled);
        assert!(result.full_output_path.is_none());
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let start = std::time::Instant::now();
        let result = run_bash(
            "sleep 30",
            tmp.path(),
            cancel,
            DEFAULT_OUTPUT_LIMIT,
            None,
            None,
        )
        .await
        .unwrap();

        assert!(result.was_cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_with_side_file() {
        let tmp = tempfile::tempdir().unwrap();
        let side_dir = tmp.path().join("side");
        let result = run_bash(
            "yes x | head -c 5000",
            tmp.path(),
            CancellationToken::new(),
            1000,
            Some(&side_dir),
            None,
        )
        .await
        .unwrap();

        assert!(result.output.contains("[Output truncated:"));
        let side = result.full_output_path.expect("side file");
        let full = std::fs::read_to_string(side).unwrap();
        assert_eq!(full.len(), 5000);
    }

    #[tokio::test]
    async fn chunks_are_streamed() {
        let tmp = tempfile::tempdir().unwrap();
        let chunks = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let sink = chunks.clone();
        let on_chunk: OnChunk = Box::new(move |chunk| {
            sink.lock().unwrap().push_str(chunk);
        });

        run_bash(
            "printf 'a\\nb\\n'",
            tmp.path(),
            CancellationToken::new(),
            DEFAULT_OUTPUT_LIMIT,
            None,
            Some(on_chunk),
        )
        .await
        .unwrap();

        assert!(chunks.lock().unwrap().contains("a\nb"));
    }
}
