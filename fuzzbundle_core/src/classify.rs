use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Operating system the bundle is assembled on. Kept explicit instead of
/// reading `cfg!` at the point of use so classification stays a pure
/// function and tests can exercise every table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
}

impl Os {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Os::Windows
        } else if cfg!(target_os = "macos") {
            Os::MacOs
        } else {
            Os::Linux
        }
    }
}

/// Result of classifying a single runtime dependency path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The dependency was produced by the current build. Carries the path
    /// relative to the build directory, used later for content-addressed
    /// placement in the archive.
    BuildTree(PathBuf),
    /// A system library common enough to be present in any reasonable
    /// runtime container image. Dropped silently.
    WellKnownSystem,
    /// Lives under a standard system library directory but is not on the
    /// well-known list. Dropped from the archive, surfaced to the user as
    /// an aggregated warning about required container image contents.
    UncommonSystem,
    /// Neither part of the build nor a system library. Must be staged into
    /// the archive and added to the runtime library search path.
    External,
}

/// Classifies a runtime dependency of a fuzz test executable.
///
/// The checks are ordered: the build-tree test runs before the system
/// directory test, so a dependency that is built into a directory below
/// `/usr/lib` (unusual, but possible) is still treated as part of the
/// build. Path containment is component-wise, not a string prefix test.
pub fn classify(dependency: &Path, build_dir: &Path, os: Os) -> Classification {
    if let Ok(rel) = dependency.strip_prefix(build_dir) {
        return Classification::BuildTree(rel.to_path_buf());
    }

    let dep_str = dependency.to_string_lossy();
    for pattern in well_known_system_libraries(os) {
        if pattern.is_match(&dep_str) {
            return Classification::WellKnownSystem;
        }
    }

    for lib_dir in system_library_dirs(os) {
        if dependency.starts_with(lib_dir) {
            return Classification::UncommonSystem;
        }
    }

    Classification::External
}

/// Standard system library directories per OS. Runtime dependencies below
/// these paths are expected to be provided by the runtime container image.
fn system_library_dirs(os: Os) -> &'static [&'static str] {
    match os {
        Os::Linux | Os::MacOs => &["/lib", "/usr/lib"],
        Os::Windows => &[],
    }
}

/// System libraries so common that no warning is emitted for them.
fn well_known_system_libraries(os: Os) -> &'static [Regex] {
    static LINUX: OnceLock<Vec<Regex>> = OnceLock::new();
    match os {
        Os::Linux => LINUX.get_or_init(|| {
            [
                "ld-linux-x86-64.so",
                "libc.so",
                "libgcc_s.so",
                "libm.so",
                "libstdc++.so",
            ]
            .iter()
            .map(|basename| versioned_library_pattern(basename))
            .collect()
        }),
        Os::MacOs | Os::Windows => &[],
    }
}

/// Builds a pattern matching `basename` with an optional version suffix,
/// e.g. `libc.so`, `libc.so.6` or `libc.so.6.0.1`.
fn versioned_library_pattern(unversioned_basename: &str) -> Regex {
    let pattern = format!(".*/{}[.0-9]*$", regex::escape(unversioned_basename));
    // The pattern is built from a fixed table, so compilation cannot fail.
    Regex::new(&pattern).expect("invalid library pattern")
}
