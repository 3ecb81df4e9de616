use crate::archive::{ArchiveError, ArchiveWriter, join_archive_path};
use crate::build::{BuildDriver, BuildError, BuildSystem};
use crate::cas::CasError;
use crate::classify::Os;
use crate::deps::{DependencyCheck, DependencyError};
use crate::jvm::JvmAssembler;
use crate::metadata::{CodeRevision, GitRevision, METADATA_FILE_NAME, Metadata, RunEnvironment};
use crate::native::NativeAssembler;
use crate::vcs;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The (possibly empty) directory inside the archive that will be the
/// fuzzer's working directory. Required by the archive format even when
/// unused.
pub const WORK_DIR_PATH: &str = "work_dir";

/// Default runtime images when the user specified none.
const DEFAULT_NATIVE_DOCKER_IMAGE: &str = "ubuntu:rolling";
const DEFAULT_JVM_DOCKER_IMAGE: &str = "openjdk:latest";

#[derive(Error, Debug)]
pub enum BundleError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// Two distinct external libraries wanted the same staged path. This
    /// indicates two different binaries would overwrite each other at
    /// runtime, so it is treated as a configuration bug, not a transient
    /// condition.
    #[error(
        "fuzz test {fuzz_test:?} has conflicting runtime dependencies: {first:?} and {second:?}"
    )]
    ConflictingRuntimeDeps {
        fuzz_test: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("fuzz test executable ({executable:?}) is not below build directory ({build_dir:?})")]
    ExecutableOutsideBuildDir {
        executable: PathBuf,
        build_dir: PathBuf,
    },

    /// A user/configuration error with an actionable message.
    #[error("{0}")]
    InvalidArgument(String),

    /// Should be unreachable given upstream validation.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("failed to serialize bundle metadata: {0}")]
    Metadata(#[from] serde_yaml::Error),

    #[error("failed to create manifest jar: {0}")]
    Jar(#[from] zip::result::ZipError),

    #[error("bundle I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Explicitly constructed configuration for one bundle operation. Passed
/// down instead of process-global state so the bundling components stay
/// unit-testable in isolation.
#[derive(Debug, Clone)]
pub struct BundleOptions {
    /// Fuzz test names (native) or fully qualified class names (JVM).
    /// May be empty where the build system supports discovery.
    pub fuzz_tests: Vec<String>,
    pub build_system: BuildSystem,
    /// Required for [`BuildSystem::Other`].
    pub build_command: Option<String>,
    /// Final bundle location; derived from the fuzz test name when unset.
    pub output_path: Option<PathBuf>,
    pub project_dir: PathBuf,
    pub dictionary: Option<PathBuf>,
    pub seed_corpus_dirs: Vec<PathBuf>,
    /// Extra flags passed through to the fuzzing engine.
    pub engine_args: Vec<String>,
    /// `KEY=VALUE` entries; bare `KEY` entries are resolved from the
    /// current environment during validation.
    pub env: Vec<String>,
    pub timeout: Option<Duration>,
    pub docker_image: Option<String>,
    /// VCS overrides; when unset the information is read from git.
    pub commit: Option<String>,
    pub branch: Option<String>,
    /// `source` or `source;target` arguments for extra archive content.
    pub additional_files: Vec<String>,
    /// Debug override: keep the scratch directory instead of removing it.
    pub keep_scratch: bool,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            fuzz_tests: Vec::new(),
            build_system: BuildSystem::Other,
            build_command: None,
            output_path: None,
            project_dir: PathBuf::from("."),
            dictionary: None,
            seed_corpus_dirs: Vec::new(),
            engine_args: Vec::new(),
            env: Vec::new(),
            timeout: None,
            docker_image: None,
            commit: None,
            branch: None,
            additional_files: Vec::new(),
            keep_scratch: false,
        }
    }
}

impl BundleOptions {
    /// Validates and normalizes the options. Must be called before
    /// [`Bundler::bundle`]; the assemblers assume these checks passed.
    pub fn validate(&mut self) -> Result<(), BundleError> {
        // Duplicate fuzz tests would produce archive path conflicts later;
        // drop them here while preserving order.
        let mut seen = std::collections::HashSet::new();
        self.fuzz_tests.retain(|t| seen.insert(t.clone()));

        if let Some(dict) = &self.dictionary {
            fs::metadata(dict).map_err(|_| {
                BundleError::InvalidArgument(format!(
                    "dictionary {:?} does not exist or cannot be accessed",
                    dict
                ))
            })?;
        }

        for dir in &self.seed_corpus_dirs {
            let metadata = fs::metadata(dir).map_err(|_| {
                BundleError::InvalidArgument(format!("seed corpus directory {dir:?} not found"))
            })?;
            if !metadata.is_dir() {
                return Err(BundleError::InvalidArgument(format!(
                    "seed corpus {dir:?} is not a directory"
                )));
            }
        }

        if self.build_system == BuildSystem::Other {
            if self.build_command.is_none() {
                return Err(BundleError::InvalidArgument(
                    "a build command must be set when using build system type \"other\""
                        .to_string(),
                ));
            }
            if self.fuzz_tests.is_empty() {
                return Err(BundleError::InvalidArgument(
                    "at least one fuzz test must be specified when using build system type \
                     \"other\""
                        .to_string(),
                ));
            }
        }

        if self.build_system == BuildSystem::Bazel && self.fuzz_tests.is_empty() {
            return Err(BundleError::InvalidArgument(
                "at least one fuzz test must be specified when using the bazel build system"
                    .to_string(),
            ));
        }

        if let Some(timeout) = self.timeout {
            if timeout < Duration::from_secs(1) {
                return Err(BundleError::InvalidArgument(format!(
                    "invalid timeout {timeout:?}: timeout can't be less than a second"
                )));
            }
        }

        // Bare KEY entries take their value from the current environment;
        // unset ones are dropped.
        let mut env = Vec::new();
        for entry in &self.env {
            if entry.contains('=') {
                env.push(entry.clone());
                continue;
            }
            match std::env::var(entry) {
                Ok(value) if !value.is_empty() => env.push(format!("{entry}={value}")),
                _ => {}
            }
        }
        self.env = env;

        Ok(())
    }

    /// Maximum run time recorded in the metadata, in seconds.
    pub(crate) fn max_run_time_secs(&self) -> u64 {
        self.timeout.map(|t| t.as_secs()).unwrap_or(0)
    }
}

/// Top-level driver for one bundle operation. Owns the scratch directory
/// and the archive manifest for the lifetime of one [`bundle`](Self::bundle)
/// call; no two concurrent bundle operations may target the same output
/// path.
pub struct Bundler<'a> {
    opts: &'a BundleOptions,
}

impl<'a> Bundler<'a> {
    pub fn new(opts: &'a BundleOptions) -> Self {
        Self { opts }
    }

    /// Builds all configured variants, assembles the archive and writes it
    /// to the output path. On any error no partial archive is left at the
    /// final output path.
    pub fn bundle(
        &self,
        driver: &mut dyn BuildDriver,
        checker: &dyn DependencyCheck,
    ) -> Result<PathBuf, BundleError> {
        let scratch = tempfile::Builder::new()
            .prefix("fuzzbundle-")
            .tempdir()?;

        let output_path = self.output_path();
        let bundle_file = File::create(&output_path).map_err(|e| {
            BundleError::InvalidArgument(format!(
                "failed to create bundle at {output_path:?}: {e}"
            ))
        })?;

        let result = self.write_bundle(bundle_file, scratch.path(), driver, checker);

        if self.opts.keep_scratch {
            let kept = scratch.keep();
            info!("Keeping scratch directory: {:?}", kept);
        }

        match result {
            Ok(()) => {
                info!("Created bundle: {:?}", output_path);
                Ok(output_path)
            }
            Err(err) => {
                // Never leave a partial archive at the final path.
                let _ = fs::remove_file(&output_path);
                Err(err)
            }
        }
    }

    fn output_path(&self) -> PathBuf {
        if let Some(path) = &self.opts.output_path {
            return path.clone();
        }
        if self.opts.fuzz_tests.len() == 1 {
            let basename = Path::new(&self.opts.fuzz_tests[0])
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.opts.fuzz_tests[0].clone());
            PathBuf::from(format!("{basename}.tar.gz"))
        } else {
            PathBuf::from("fuzz_tests.tar.gz")
        }
    }

    fn write_bundle(
        &self,
        bundle_file: File,
        scratch: &Path,
        driver: &mut dyn BuildDriver,
        checker: &dyn DependencyCheck,
    ) -> Result<(), BundleError> {
        let mut writer = ArchiveWriter::new(BufWriter::new(bundle_file));

        let docker_image = self.opts.docker_image.clone().unwrap_or_else(|| {
            if self.opts.build_system.is_jvm() {
                DEFAULT_JVM_DOCKER_IMAGE.to_string()
            } else {
                DEFAULT_NATIVE_DOCKER_IMAGE.to_string()
            }
        });

        let fuzzers = if self.opts.build_system.is_jvm() {
            JvmAssembler::new(self.opts, scratch).assemble(&mut writer, driver, checker)?
        } else {
            NativeAssembler::new(self.opts, Os::current(), &docker_image).assemble(
                &mut writer,
                driver,
                checker,
            )?
        };

        let metadata = Metadata {
            fuzzers,
            run_environment: RunEnvironment {
                docker: docker_image,
            },
            code_revision: self.code_revision(),
        };
        let metadata_path = scratch.join(METADATA_FILE_NAME);
        fs::write(&metadata_path, metadata.to_yaml()?)?;
        writer.write_file(METADATA_FILE_NAME, &metadata_path)?;

        // The archive format requires this directory even if it is empty.
        let work_dir = scratch.join(WORK_DIR_PATH);
        fs::create_dir_all(&work_dir)?;
        writer.write_dir(WORK_DIR_PATH, &work_dir)?;

        for arg in &self.opts.additional_files {
            let (source, target) = parse_additional_files_argument(arg)?;
            let source = if source.is_absolute() {
                source
            } else {
                self.opts.project_dir.join(source)
            };
            if source.is_dir() {
                writer.write_dir(&target, &source)?;
            } else {
                writer.write_file(&target, &source)?;
            }
        }

        // Finalize the archive before the buffered file, in that order, so
        // a flush failure cannot masquerade as a valid bundle.
        let mut sink = writer.close()?;
        sink.flush()?;
        let bundle_file = sink
            .into_inner()
            .map_err(|e| BundleError::Io(e.into_error()))?;
        bundle_file.sync_all()?;
        Ok(())
    }

    /// Best-effort VCS information. Failures degrade to `None` with a
    /// debug log; they never fail the bundle.
    fn code_revision(&self) -> Option<CodeRevision> {
        let commit = match &self.opts.commit {
            Some(commit) => commit.clone(),
            None => match vcs::git_commit(&self.opts.project_dir) {
                Ok(commit) => commit,
                Err(err) => {
                    debug!("failed to get Git commit: {err}");
                    return None;
                }
            },
        };

        let branch = match &self.opts.branch {
            Some(branch) => branch.clone(),
            None => match vcs::git_branch(&self.opts.project_dir) {
                Ok(branch) => branch,
                Err(err) => {
                    debug!("failed to get Git branch: {err}");
                    return None;
                }
            },
        };

        if vcs::git_is_dirty(&self.opts.project_dir) {
            warn!("The Git repository has uncommitted changes. Bundle metadata may be inaccurate.");
        }

        Some(CodeRevision {
            git: GitRevision { commit, branch },
        })
    }
}

/// Parses a `source` or `source;target` argument for extra archive content.
/// Without a target the file lands under the working directory, named after
/// the source's basename. Absolute targets are rejected.
pub fn parse_additional_files_argument(arg: &str) -> Result<(PathBuf, String), BundleError> {
    let parts: Vec<&str> = arg.split(';').collect();

    let (source, target) = if parts.len() == 1 {
        let source = parts[0];
        let basename = Path::new(source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        (source.to_string(), format!("{WORK_DIR_PATH}/{basename}"))
    } else {
        (parts[0].to_string(), parts[1].replace('\\', "/"))
    };

    if parts.len() > 2 || source.is_empty() || target.is_empty() || target == WORK_DIR_PATH.to_string() + "/" {
        return Err(BundleError::InvalidArgument(
            "could not parse '--add' argument".to_string(),
        ));
    }

    if Path::new(&target).is_absolute() {
        return Err(BundleError::InvalidArgument(
            "when using '--add source;target', target has to be a relative path".to_string(),
        ));
    }

    Ok((PathBuf::from(source), target))
}

/// Writes each seed corpus directory below `archive_seeds_dir`, giving every
/// source its own uniquely named subdirectory so seed sets sharing a
/// basename cannot override each other.
pub(crate) fn prepare_seeds<W: Write>(
    seed_corpus_dirs: &[PathBuf],
    archive_seeds_dir: &str,
    writer: &mut ArchiveWriter<W>,
) -> Result<(), BundleError> {
    let mut target_dirs: Vec<String> = Vec::new();
    for source_dir in seed_corpus_dirs {
        let basename = source_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "seeds".to_string());
        let base_target = join_archive_path(archive_seeds_dir, &basename);

        let mut target = base_target.clone();
        let mut suffix = 1;
        while target_dirs.contains(&target) {
            target = format!("{base_target}-{suffix}");
            suffix += 1;
        }
        target_dirs.push(target.clone());

        writer.write_dir(&target, source_dir)?;
    }
    Ok(())
}

/// Returns `env` with `key` set to `value`, replacing an existing entry.
pub(crate) fn set_env_entry(env: &[String], key: &str, value: &str) -> Vec<String> {
    let mut out = env.to_vec();
    let prefix = format!("{key}=");
    match out.iter_mut().find(|e| e.starts_with(&prefix)) {
        Some(entry) => *entry = format!("{key}={value}"),
        None => out.push(format!("{key}={value}")),
    }
    out
}
