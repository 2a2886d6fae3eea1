use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::adb::commands;
use crate::adb::runner::run_command_with_timeout;
use crate::error::CoreError;

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

pub fn resolve_adb_program(config_command_path: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if normalized.is_empty() {
        "adb".to_string()
    } else {
        normalized
    }
}

pub fn validate_adb_program(program: &str) -> Result<(), CoreError> {
    if program.trim().is_empty() {
        return Err(CoreError::AdbMissing {
            program: program.to_string(),
        });
    }
    if program == "adb" {
        // Bare name resolves through PATH; check_adb proves it exists.
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() || !path.exists() {
        return Err(CoreError::AdbMissing {
            program: program.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AdbInfo {
    pub available: bool,
    pub version_output: String,
    pub command_path: String,
}

/// Startup gate: prove the adb binary runs before any service spins up.
pub fn check_adb(program: &str) -> Result<AdbInfo, CoreError> {
    validate_adb_program(program)?;
    let output =
        run_command_with_timeout(program, &commands::version(), Duration::from_secs(5))?;
    if output.exit_code != Some(0) {
        return Err(CoreError::AdbMissing {
            program: program.to_string(),
        });
    }
    Ok(AdbInfo {
        available: true,
        version_output: output.stdout.trim().to_string(),
        command_path: program.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_wrapping_quotes() {
        assert_eq!(
            normalize_command_path("  \"/opt/platform-tools/adb\"  "),
            "/opt/platform-tools/adb"
        );
        assert_eq!(
            normalize_command_path("  '/opt/platform-tools/adb'  "),
            "/opt/platform-tools/adb"
        );
    }

    #[test]
    fn resolves_empty_to_default_adb() {
        assert_eq!(resolve_adb_program(""), "adb");
        assert_eq!(resolve_adb_program("   "), "adb");
    }

    #[test]
    fn validates_nonexistent_path() {
        let err = validate_adb_program("/this/path/should/not/exist/adb")
            .expect_err("should reject missing file");
        assert!(matches!(err, CoreError::AdbMissing { .. }));
    }

    #[test]
    fn check_adb_fails_for_missing_binary() {
        let err = check_adb("/definitely/not/adb").expect_err("missing binary");
        assert!(matches!(err, CoreError::AdbMissing { .. }));
    }
}
