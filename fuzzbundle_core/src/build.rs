use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    /// An underlying build tool exited with a failure. The command line and
    /// working directory are captured for diagnostics.
    #[error("build command {command:?} failed in {working_dir:?}: {message}")]
    CommandFailed {
        command: String,
        working_dir: PathBuf,
        message: String,
    },

    /// The driver cannot enumerate fuzz tests; the caller must supply them.
    #[error("this build system cannot list fuzz tests, specify them explicitly")]
    DiscoveryUnsupported,

    #[error("build I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// The supported build systems. The set is closed and small by design; a
/// driver is selected once at coordinator startup from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSystem {
    CMake,
    Bazel,
    Other,
    Maven,
    Gradle,
}

impl BuildSystem {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cmake" => Some(BuildSystem::CMake),
            "bazel" => Some(BuildSystem::Bazel),
            "other" => Some(BuildSystem::Other),
            "maven" => Some(BuildSystem::Maven),
            "gradle" => Some(BuildSystem::Gradle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildSystem::CMake => "cmake",
            BuildSystem::Bazel => "bazel",
            BuildSystem::Other => "other",
            BuildSystem::Maven => "maven",
            BuildSystem::Gradle => "gradle",
        }
    }

    /// Build systems producing native libFuzzer executables.
    pub fn is_native(&self) -> bool {
        matches!(
            self,
            BuildSystem::CMake | BuildSystem::Bazel | BuildSystem::Other
        )
    }

    /// Build systems producing JVM fuzz test classes.
    pub fn is_jvm(&self) -> bool {
        matches!(self, BuildSystem::Maven | BuildSystem::Gradle)
    }
}

/// The output of one build-system invocation for one fuzz test variant.
///
/// Produced by a [`BuildDriver`], immutable once returned, and owned by the
/// assembler that requested it.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Fuzz test name (native) or fully qualified class name (JVM).
    pub name: String,
    /// Absolute path of the built executable, or the build output directory
    /// for JVM fuzz tests.
    pub executable: PathBuf,
    /// Root of the build tree; build-tree dependency paths and the CAS
    /// placement of the executable are computed relative to this.
    pub build_dir: PathBuf,
    /// Root of the project's source tree.
    pub project_dir: PathBuf,
    /// Sanitizers this variant was built with. `["coverage"]` marks a
    /// coverage replay build.
    pub sanitizers: Vec<String>,
    /// Directory where the fuzzer writes newly generated inputs.
    pub generated_corpus: PathBuf,
    /// Default seed corpus directory; may not exist on disk.
    pub seed_corpus: PathBuf,
    /// Transitively resolved runtime dependencies: shared libraries for
    /// native builds, classpath entries (jars or class directories) for JVM
    /// builds. Entries may have vanished from disk since the build.
    pub runtime_deps: Vec<PathBuf>,
}

impl BuildResult {
    pub fn is_coverage_build(&self) -> bool {
        self.sanitizers.len() == 1 && self.sanitizers[0] == "coverage"
    }
}

/// Interface presented by the build-system drivers to the bundling core.
///
/// Drivers are external collaborators; the core only depends on this trait.
pub trait BuildDriver {
    /// Builds the given fuzz tests with the given sanitizers and returns
    /// one [`BuildResult`] per fuzz test.
    fn build_for_variant(
        &mut self,
        sanitizers: &[String],
        fuzz_tests: &[String],
    ) -> Result<Vec<BuildResult>, BuildError>;

    /// Enumerates the fuzz tests the build system knows about. Only CMake
    /// supports this; other drivers keep the default.
    fn list_fuzz_tests(&mut self) -> Result<Vec<String>, BuildError> {
        Err(BuildError::DiscoveryUnsupported)
    }
}
