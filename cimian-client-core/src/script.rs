//! Script execution for catalog-supplied scripts (spec §4.G): pre/post
//! install and uninstall hooks, `installcheck_script`/`uninstallcheck_script`,
//! and the NUPKG `chocolateyBeforeInstall.ps1` hook.
//!
//! Interpreter is inferred from the script's first two characters: `@e`,
//! `re`, `::`, or `@E` mean batch; anything else runs under PowerShell.
//! PowerShell invocations always prepend `-NoProfile` and, when
//! `force_execution_policy_bypass` is set, `-ExecutionPolicy Bypass`.

use std::io::Write;
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("could not create temporary script file")]
    TempFile(#[source] std::io::Error),
    #[error("could not launch script interpreter")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptKind {
    Batch,
    PowerShell,
}

fn detect_kind(script: &str) -> ScriptKind {
    let prefix: String = script.chars().take(2).collect();
    match prefix.as_str() {
        "@e" | "re" | "::" | "@E" => ScriptKind::Batch,
        _ => ScriptKind::PowerShell,
    }
}

/// Writes `script` to a temp file and runs it, returning the process exit
/// code. `args` are appended verbatim after the script path.
pub fn run_inline(script: &str, args: &[String], force_execution_policy_bypass: bool) -> Result<i32, ScriptError> {
    let kind = detect_kind(script);
    let extension = match kind {
        ScriptKind::Batch => "bat",
        ScriptKind::PowerShell => "ps1",
    };

    let mut file = tempfile::Builder::new()
        .suffix(&format!(".{}", extension))
        .tempfile()
        .map_err(ScriptError::TempFile)?;
    file.write_all(script.as_bytes()).map_err(ScriptError::TempFile)?;
    file.flush().map_err(ScriptError::TempFile)?;

    run_script_file(file.path(), args, kind, force_execution_policy_bypass)
}

fn run_script_file(
    path: &std::path::Path,
    args: &[String],
    kind: ScriptKind,
    force_execution_policy_bypass: bool,
) -> Result<i32, ScriptError> {
    let mut command = match kind {
        ScriptKind::Batch => {
            let mut c = Command::new("cmd.exe");
            c.arg("/c").arg(path);
            c
        }
        ScriptKind::PowerShell => {
            let mut c = Command::new("powershell.exe");
            c.arg("-NoProfile");
            if force_execution_policy_bypass {
                c.arg("-ExecutionPolicy").arg("Bypass");
            }
            c.arg("-File").arg(path);
            c
        }
    };
    command.args(args);

    let output = command.output().map_err(ScriptError::Spawn)?;
    Ok(output.status.code().unwrap_or(-1))
}

/// Runs a PowerShell `.ps1` file already on disk (e.g. the extracted
/// `chocolateyBeforeInstall.ps1` hook) rather than an inline script string.
pub fn run_powershell_file(
    path: &std::path::Path,
    args: &[String],
    force_execution_policy_bypass: bool,
) -> Result<i32, ScriptError> {
    run_script_file(path, args, ScriptKind::PowerShell, force_execution_policy_bypass)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_kind_batch_prefixes() {
        assert_eq!(detect_kind("@echo off\r\necho hi"), ScriptKind::Batch);
        assert_eq!(detect_kind("rem comment\r\necho hi"), ScriptKind::Batch);
        assert_eq!(detect_kind(":: comment"), ScriptKind::Batch);
    }

    #[test]
    fn test_detect_kind_defaults_to_powershell() {
        assert_eq!(detect_kind("Write-Host 'hi'"), ScriptKind::PowerShell);
        assert_eq!(detect_kind(""), ScriptKind::PowerShell);
    }
}
