use std::fmt;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

/// External tools the bundling pipeline may require before doing any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Clang,
    CMake,
    Java,
    Maven,
    Gradle,
}

impl Tool {
    /// Name of the executable probed on the PATH.
    fn command(&self) -> &'static str {
        match self {
            Tool::Clang => "clang",
            Tool::CMake => "cmake",
            Tool::Java => "java",
            Tool::Maven => "mvn",
            Tool::Gradle => "gradle",
        }
    }

    /// Minimum version requirement surfaced in the error message, where one
    /// exists.
    fn minimum_version(&self) -> Option<&'static str> {
        match self {
            Tool::Clang => Some("11.0.0"),
            Tool::CMake => Some("3.16.0"),
            Tool::Java => Some("8"),
            Tool::Maven | Tool::Gradle => None,
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("missing dependency: {tool}{}", minimum_version_hint(.minimum_version))]
    Missing {
        tool: String,
        minimum_version: Option<String>,
    },
}

fn minimum_version_hint(minimum_version: &Option<String>) -> String {
    match minimum_version {
        Some(version) => format!(" (minimum version {version})"),
        None => String::new(),
    }
}

/// Pre-flight check for required tools, behind a trait so assembler tests
/// can substitute a fake.
pub trait DependencyCheck {
    fn check(&self, tools: &[Tool]) -> Result<(), DependencyError>;
}

/// Checks tools by invoking `<tool> --version` on the PATH.
#[derive(Default)]
pub struct SystemToolCheck {
    /// Replaces the inherited PATH for the probes when set.
    search_path: Option<std::ffi::OsString>,
}

impl DependencyCheck for SystemToolCheck {
    fn check(&self, tools: &[Tool]) -> Result<(), DependencyError> {
        for tool in tools {
            let mut command = Command::new(tool.command());
            if let Some(path) = &self.search_path {
                command.env("PATH", path);
            }
            let status = command
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(status) if status.success() => {
                    debug!("Found dependency: {tool}");
                }
                _ => {
                    return Err(DependencyError::Missing {
                        tool: tool.command().to_string(),
                        minimum_version: tool.minimum_version().map(str::to_string),
                    });
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependency_message_names_tool_and_version() {
        let err = DependencyError::Missing {
            tool: "clang".to_string(),
            minimum_version: Some("11.0.0".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "missing dependency: clang (minimum version 11.0.0)"
        );

        let err = DependencyError::Missing {
            tool: "mvn".to_string(),
            minimum_version: None,
        };
        assert_eq!(err.to_string(), "missing dependency: mvn");
    }

    #[test]
    fn missing_tool_is_reported_by_the_checker() {
        // An empty directory as the PATH makes every tool unresolvable.
        let empty = tempfile::tempdir().unwrap();
        let check = SystemToolCheck {
            search_path: Some(empty.path().as_os_str().to_os_string()),
        };
        let err = check.check(&[Tool::Clang]).unwrap_err();
        match err {
            DependencyError::Missing {
                tool,
                minimum_version,
            } => {
                assert_eq!(tool, "clang");
                assert_eq!(minimum_version.as_deref(), Some("11.0.0"));
            }
        }
    }
}
