use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the metadata document at the archive root.
pub const METADATA_FILE_NAME: &str = "bundle.yaml";

/// Runtime driver tag recorded for each fuzzer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Engine {
    #[serde(rename = "LIBFUZZER")]
    LibFuzzer,
    #[serde(rename = "LLVM_COV")]
    LlvmCov,
    #[serde(rename = "JAVA_LIBFUZZER")]
    JavaLibFuzzer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

/// One runnable fuzzer inside the bundle. Created once per fuzz test and
/// applicable variant, then serialized into the metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fuzzer {
    pub target: String,
    /// Archive path of the executable (native) or unset for JVM fuzzers,
    /// which are identified by their manifest jar in `runtime_paths`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub engine: Engine,
    /// Uppercase sanitizer tag; empty for coverage and JVM fuzzers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitizer: Option<String>,
    pub project_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dict: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seeds: Option<String>,
    /// Extra library search path prefixes inside the archive (native).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub library_paths: Vec<String>,
    /// Ordered classpath entries inside the archive (JVM). The manifest jar
    /// is always first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtime_paths: Vec<String>,
    #[serde(default)]
    pub engine_options: EngineOptions,
    /// Maximum run time in seconds; 0 means unlimited.
    pub max_run_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEnvironment {
    /// Docker image the bundle is expected to run in.
    pub docker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRevision {
    pub commit: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRevision {
    pub git: GitRevision,
}

/// Top-level manifest of a bundle. Written as YAML at
/// [`METADATA_FILE_NAME`] in the archive root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub fuzzers: Vec<Fuzzer>,
    pub run_environment: RunEnvironment,
    /// Best-effort VCS information; absent when retrieval failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_revision: Option<CodeRevision>,
}

impl Metadata {
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
