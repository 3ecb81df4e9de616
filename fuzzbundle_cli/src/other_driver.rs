use fuzzbundle_core::build::{BuildDriver, BuildError, BuildResult};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use tracing::debug;

/// Build driver for the "other" build system: the user supplies a shell
/// command that is expected to honor the `CFLAGS`/`CXXFLAGS`/`LDFLAGS`/
/// `FUZZ_TEST_LDFLAGS` environment variables and produce an executable
/// named after the fuzz test somewhere below the project directory.
pub struct OtherDriver {
    project_dir: PathBuf,
    build_command: String,
}

impl OtherDriver {
    pub fn new(project_dir: PathBuf, build_command: String) -> Self {
        Self {
            project_dir,
            build_command,
        }
    }

    fn build_one(&self, sanitizers: &[String], fuzz_test: &str) -> Result<BuildResult, BuildError> {
        let is_coverage = sanitizers == ["coverage"];

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&self.build_command)
            .current_dir(&self.project_dir)
            .env("CC", "clang")
            .env("CXX", "clang++")
            .env("FUZZ_TEST", fuzz_test);

        if is_coverage {
            command
                .env(
                    "CFLAGS",
                    "-fprofile-instr-generate -fcoverage-mapping -O0 -gline-tables-only",
                )
                .env(
                    "CXXFLAGS",
                    "-fprofile-instr-generate -fcoverage-mapping -O0 -gline-tables-only",
                )
                .env("LDFLAGS", "-fprofile-instr-generate")
                .env("FUZZ_TEST_LDFLAGS", "-fsanitize=fuzzer")
                // Lets the build command detect a coverage build.
                .env("CIFUZZ_COVERAGE_BUILD", "1");
        } else {
            let sanitize = format!("-fsanitize={}", sanitizers.join(","));
            let cflags = format!(
                "-O1 -gline-tables-only {sanitize} -fsanitize-address-use-after-scope \
                 -fno-sanitize-recover=undefined"
            );
            command
                .env("CFLAGS", &cflags)
                .env("CXXFLAGS", &cflags)
                .env("LDFLAGS", &sanitize)
                .env("FUZZ_TEST_LDFLAGS", "-fsanitize=fuzzer");
        }

        debug!("Running build command: {}", self.build_command);
        let output = command.output()?;
        if !output.status.success() {
            return Err(BuildError::CommandFailed {
                command: self.build_command.clone(),
                working_dir: self.project_dir.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let executable = self.find_fuzz_test_executable(fuzz_test)?.ok_or_else(|| {
            BuildError::Other(format!(
                "could not find executable for fuzz test {fuzz_test:?} below {:?}",
                self.project_dir
            ))
        })?;

        // The default seed corpus is expected next to the executable.
        let mut seed_corpus = executable.clone().into_os_string();
        seed_corpus.push("_inputs");

        let runtime_deps = shared_library_dependencies(&executable)?;

        Ok(BuildResult {
            name: fuzz_test.to_string(),
            executable,
            build_dir: self.project_dir.clone(),
            project_dir: self.project_dir.clone(),
            sanitizers: sanitizers.to_vec(),
            generated_corpus: self
                .project_dir
                .join(".fuzzbundle-corpus")
                .join(fuzz_test),
            seed_corpus: PathBuf::from(seed_corpus),
            runtime_deps,
        })
    }

    /// Locates the built executable: either the fuzz test name is already a
    /// path to it, or the project tree is searched for a matching file with
    /// an executable bit set.
    fn find_fuzz_test_executable(&self, fuzz_test: &str) -> Result<Option<PathBuf>, BuildError> {
        let direct = self.project_dir.join(fuzz_test);
        if direct.is_file() {
            return Ok(Some(fs::canonicalize(direct)?));
        }

        let wanted = if cfg!(windows) {
            format!("{fuzz_test}.exe")
        } else {
            fuzz_test.to_string()
        };
        let found = find_file_named(&self.project_dir, &wanted)?;
        match found {
            Some(path) => Ok(Some(fs::canonicalize(path)?)),
            None => Ok(None),
        }
    }
}

impl BuildDriver for OtherDriver {
    fn build_for_variant(
        &mut self,
        sanitizers: &[String],
        fuzz_tests: &[String],
    ) -> Result<Vec<BuildResult>, BuildError> {
        let mut results = Vec::new();
        for fuzz_test in fuzz_tests {
            results.push(self.build_one(sanitizers, fuzz_test)?);
        }
        Ok(results)
    }
}

fn find_file_named(dir: &Path, name: &str) -> Result<Option<PathBuf>, BuildError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if let Some(found) = find_file_named(&path, name)? {
                return Ok(Some(found));
            }
            continue;
        }
        if entry.file_name().to_string_lossy() == name && is_executable(&path) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    // Some executable bit being set is a heuristic; it may still not be
    // executable by the current user.
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// Resolves the executable's shared-library dependencies via `ldd`,
/// dropping libraries under the standard system prefixes. `ldd` reports the
/// complete transitive set, so no recursion is needed.
///
/// A failing `ldd` run (statically linked executable, missing tool) is
/// treated as "no dependencies"; bundling proceeds without them.
fn shared_library_dependencies(executable: &Path) -> Result<Vec<PathBuf>, BuildError> {
    if cfg!(windows) {
        return Ok(Vec::new());
    }

    let output = Command::new("ldd").arg(executable).output()?;
    if !output.status.success() {
        debug!(
            "ldd failed for {:?}: {}",
            executable,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Ok(Vec::new());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut deps = Vec::new();
    for line in stdout.lines() {
        // "libfoo.so.1 => /opt/lib/libfoo.so.1 (0x...)"
        let Some((_, resolved)) = line.split_once("=>") else {
            continue;
        };
        let path = resolved
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or_default();
        if path.is_empty() || !path.starts_with('/') {
            continue;
        }
        if !shared_library_pattern().is_match(path) || is_system_library(path) {
            continue;
        }
        deps.push(PathBuf::from(path));
    }
    Ok(deps)
}

fn shared_library_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // The pattern is fixed, so compilation cannot fail.
        Regex::new(r"^.+\.((so)|(dylib))(\.\d\w*)*$").expect("invalid shared library pattern")
    })
}

fn is_system_library(library: &str) -> bool {
    ["/usr", "/lib", "/lib64", "/lib32", "/libx32"]
        .iter()
        .any(|prefix| library.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn system_library_prefixes_are_filtered() {
        assert!(is_system_library("/usr/lib/x86_64-linux-gnu/libz.so.1"));
        assert!(is_system_library("/lib64/ld-linux-x86-64.so.2"));
        assert!(!is_system_library("/opt/vendor/libmagic.so.1"));
    }

    #[test]
    fn shared_library_pattern_accepts_versioned_names() {
        for name in [
            "/opt/lib/libfoo.so",
            "/opt/lib/libfoo.so.1",
            "/opt/lib/libfoo.so.1.2b",
            "/opt/lib/libfoo.dylib",
        ] {
            assert!(shared_library_pattern().is_match(name), "{name}");
        }
        assert!(!shared_library_pattern().is_match("/opt/lib/README"));
        assert!(!shared_library_pattern().is_match("/opt/lib/libfoo.a"));
    }

    #[cfg(unix)]
    #[test]
    fn finds_the_executable_by_name_and_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let nested = dir.path().join("build/out");
        fs::create_dir_all(&nested).unwrap();

        // A non-executable file with the right name must be skipped.
        fs::write(dir.path().join("my_fuzz_test"), b"not the one").unwrap();
        fs::set_permissions(
            dir.path().join("my_fuzz_test"),
            fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        let real = nested.join("my_fuzz_test");
        fs::write(&real, b"ELF").unwrap();
        fs::set_permissions(&real, fs::Permissions::from_mode(0o755)).unwrap();

        let driver = OtherDriver::new(dir.path().to_path_buf(), "true".to_string());
        let found = driver
            .find_fuzz_test_executable("my_fuzz_test")
            .unwrap()
            .unwrap();
        assert_eq!(found, fs::canonicalize(real).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn failing_build_command_reports_command_and_working_dir() {
        let dir = tempdir().unwrap();
        let mut driver = OtherDriver::new(
            dir.path().to_path_buf(),
            "echo broken >&2; exit 1".to_string(),
        );
        let err = driver
            .build_for_variant(&["address".to_string()], &["t".to_string()])
            .unwrap_err();
        match err {
            BuildError::CommandFailed { message, .. } => assert_eq!(message, "broken"),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }
}
