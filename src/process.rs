//! Process spawning for cleanup commands. Grounded in the teacher's
//! `app/fs_runtime.rs`/`app/size_runtime.rs` worker-thread + channel
//! pattern, adapted here to collect a child process's combined output
//! instead of feeding a size cascade.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

/// One line of captured output, tagged by the stream it came from — the
/// minimal equivalent of QDirStat's `OutputWindow` line log.
#[derive(Debug, Clone)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
    Finished { exit_code: Option<i32> },
}

/// Spawn `shell -c command` in `working_dir`, streaming stdout/stderr back
/// line by line over a channel so a caller can forward them to a log or a
/// terminal without blocking on the whole process.
pub fn spawn_streamed(
    shell: &str,
    command: &str,
    working_dir: &std::path::Path,
) -> std::io::Result<mpsc::Receiver<OutputLine>> {
    let mut child = Command::new(shell)
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let (tx, rx) = mpsc::channel();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let tx_out = tx.clone();
    let out_handle = stdout.map(|s| {
        thread::spawn(move || {
            for line in BufReader::new(s).lines().map_while(Result::ok) {
                let _ = tx_out.send(OutputLine::Stdout(line));
            }
        })
    });

    let tx_err = tx.clone();
    let err_handle = stderr.map(|s| {
        thread::spawn(move || {
            for line in BufReader::new(s).lines().map_while(Result::ok) {
                let _ = tx_err.send(OutputLine::Stderr(line));
            }
        })
    });

    thread::spawn(move || {
        if let Some(h) = out_handle {
            let _ = h.join();
        }
        if let Some(h) = err_handle {
            let _ = h.join();
        }
        let status = child.wait().ok();
        let _ = tx.send(OutputLine::Finished {
            exit_code: status.and_then(|s| s.code()),
        });
    });

    Ok(rx)
}

/// Run `shell -c command` to completion and return its exit status, not
/// caring about streamed output — used for cleanups whose
/// `OutputWindowPolicy` is `ShowNever`.
pub fn run_to_completion(
    shell: &str,
    command: &str,
    working_dir: &std::path::Path,
) -> std::io::Result<std::process::ExitStatus> {
    Command::new(shell).arg("-c").arg(command).current_dir(working_dir).status()
}
