//! ST-008: Remote log relay.
//!
//! Output lines of a running command are streamed into a temporary file on
//! the target through a separate `cat` session. Only when that session
//! closes cleanly is the file moved to `<checksum>.log`, so a partial log
//! never masquerades as a complete one.

use super::error::RelayError;
use crate::commands::quote;
use crate::transport::{capture, Target};
use std::io::Write;
use std::sync::mpsc::Receiver;

/// Temporary and final log paths for a command.
pub fn log_paths(task_dir: &str, checksum: &str) -> (String, String) {
    (
        format!("{task_dir}/.{checksum}.log.tmp"),
        format!("{task_dir}/{checksum}.log"),
    )
}

/// Write every received line to the remote log, then finalize it. Returns
/// once the sending side has closed.
pub fn relay_log(
    target: &dyn Target,
    task_dir: &str,
    checksum: &str,
    lines: Receiver<String>,
) -> Result<(), RelayError> {
    let (tmp, log) = log_paths(task_dir, checksum);
    let mut session = target.command(&format!("cat > {}", quote(&tmp)))?;
    session.start()?;
    let Some(mut stdin) = session.take_stdin() else {
        session.wait()?;
        return Err(RelayError::NoStdin);
    };

    // Keep consuming after a write error so the producers never notice.
    let mut write_error = None;
    for line in lines {
        if write_error.is_some() {
            continue;
        }
        if let Err(e) = writeln!(stdin, "{line}") {
            write_error = Some(e.to_string());
        }
    }
    if write_error.is_none() {
        if let Err(e) = stdin.flush() {
            write_error = Some(e.to_string());
        }
    }
    drop(stdin);

    let exit_code = session.wait()?;
    if let Some(message) = write_error {
        return Err(RelayError::Write(message));
    }
    if exit_code != 0 {
        return Err(RelayError::Session { exit_code });
    }

    let out = capture(
        target,
        &format!(
            "mv {tmp} {log} && chmod g+w {log}",
            tmp = quote(&tmp),
            log = quote(&log)
        ),
    )?;
    if !out.success() {
        return Err(RelayError::Finalize {
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTarget;
    use std::sync::mpsc;

    #[test]
    fn test_st008_log_paths() {
        let (tmp, log) = log_paths("/c/t", "abc");
        assert_eq!(tmp, "/c/t/.abc.log.tmp");
        assert_eq!(log, "/c/t/abc.log");
    }

    #[test]
    fn test_st008_relay_writes_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let task_dir = dir.path().to_string_lossy().to_string();
        let (tx, rx) = mpsc::channel();
        tx.send("first".to_string()).unwrap();
        tx.send("second line".to_string()).unwrap();
        drop(tx);

        relay_log(&LocalTarget::new(), &task_dir, "cs", rx).unwrap();
        let content = std::fs::read_to_string(dir.path().join("cs.log")).unwrap();
        assert_eq!(content, "first\nsecond line\n");
        assert!(!dir.path().join(".cs.log.tmp").exists());
    }

    #[test]
    fn test_st008_relay_session_failure() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no/such/dir").to_string_lossy().to_string();
        let (tx, rx) = mpsc::channel();
        let _ = tx.send("lost".to_string());
        drop(tx);
        let err = relay_log(&LocalTarget::new(), &missing, "cs", rx).unwrap_err();
        assert!(matches!(
            err,
            RelayError::Session { .. } | RelayError::Write(_)
        ));
    }
}
