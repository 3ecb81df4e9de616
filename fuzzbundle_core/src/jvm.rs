use crate::archive::{ArchiveWriter, join_archive_path};
use crate::build::{BuildDriver, BuildSystem};
use crate::bundle::{BundleError, BundleOptions, prepare_seeds};
use crate::deps::{DependencyCheck, Tool};
use crate::metadata::{Engine, EngineOptions, Fuzzer};
use regex::Regex;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;

/// Assembles archive content and fuzzer descriptors for JVM fuzz tests.
///
/// Unlike the native path there is no content-addressed dedup here:
/// classpath entries are staged directly per fuzz test. JVM artifacts are
/// typically small and differ per build, so the extra machinery would not
/// pay for itself.
pub struct JvmAssembler<'a> {
    opts: &'a BundleOptions,
    scratch_dir: &'a Path,
}

impl<'a> JvmAssembler<'a> {
    pub fn new(opts: &'a BundleOptions, scratch_dir: &'a Path) -> Self {
        Self { opts, scratch_dir }
    }

    pub fn assemble<W: Write>(
        &self,
        writer: &mut ArchiveWriter<W>,
        driver: &mut dyn BuildDriver,
        checker: &dyn DependencyCheck,
    ) -> Result<Vec<Fuzzer>, BundleError> {
        checker.check(&self.required_tools())?;

        let classes = if self.opts.fuzz_tests.is_empty() {
            let classes = list_fuzz_test_classes(&self.opts.project_dir)?;
            if classes.is_empty() {
                return Err(BundleError::InvalidArgument(
                    "no fuzz tests found in the project".to_string(),
                ));
            }
            classes
        } else {
            self.opts.fuzz_tests.clone()
        };

        info!("Building fuzz tests: {}", classes.join(", "));
        let results = driver.build_for_variant(&[], &classes)?;

        // Dictionary and seeds are shared across all fuzz test classes.
        let dict = match &self.opts.dictionary {
            Some(dictionary) => {
                writer.write_file("dict", dictionary)?;
                Some("dict".to_string())
            }
            None => None,
        };

        // Classes often share a seed corpus; each directory is staged once.
        let mut seen = std::collections::HashSet::new();
        let mut seed_sources: Vec<PathBuf> = results
            .iter()
            .filter(|r| r.seed_corpus.is_dir())
            .map(|r| r.seed_corpus.clone())
            .filter(|dir| seen.insert(dir.clone()))
            .collect();
        seed_sources.extend(self.opts.seed_corpus_dirs.iter().cloned());

        let seeds = if seed_sources.is_empty() {
            None
        } else {
            prepare_seeds(&seed_sources, "seeds", writer)?;
            Some("seeds".to_string())
        };

        let mut fuzzers = Vec::new();
        for result in &results {
            let mut runtime_paths = Vec::new();

            // The manifest jar must come first: the runtime engine reads it
            // to discover which class to fuzz.
            let manifest_jar = self.create_manifest_jar(&result.name)?;
            let manifest_archive_path = join_archive_path(&result.name, "manifest.jar");
            writer.write_file(&manifest_archive_path, &manifest_jar)?;
            runtime_paths.push(manifest_archive_path);

            for dep in &result.runtime_deps {
                // Classpath resolution is best effort; entries may have
                // vanished since the build.
                if !dep.exists() {
                    continue;
                }

                if dep.is_dir() {
                    // All files below the directory are staged, but the
                    // classpath gets a single directory entry.
                    let rel = dep
                        .strip_prefix(&result.project_dir)
                        .map(|rel| rel.to_string_lossy().into_owned())
                        .unwrap_or_else(|_| {
                            dep.file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default()
                        });
                    let archive_path = join_archive_path("runtime_deps", &rel);
                    writer.write_dir(&archive_path, dep)?;
                    runtime_paths.push(archive_path);
                } else {
                    let basename = dep
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let archive_path = join_archive_path("runtime_deps", &basename);
                    writer.write_file(&archive_path, dep)?;
                    runtime_paths.push(archive_path);
                }
            }

            fuzzers.push(Fuzzer {
                target: result.name.clone(),
                path: None,
                engine: Engine::JavaLibFuzzer,
                sanitizer: None,
                project_dir: result.project_dir.clone(),
                dict: dict.clone(),
                seeds: seeds.clone(),
                library_paths: Vec::new(),
                runtime_paths,
                engine_options: EngineOptions {
                    env: self.opts.env.clone(),
                    flags: self.opts.engine_args.clone(),
                },
                max_run_time: self.opts.max_run_time_secs(),
            });
        }

        Ok(fuzzers)
    }

    fn required_tools(&self) -> Vec<Tool> {
        let build_tool = if self.opts.build_system == BuildSystem::Gradle {
            Tool::Gradle
        } else {
            Tool::Maven
        };
        vec![Tool::Java, build_tool]
    }

    /// Synthesizes a minimal jar containing only a `META-INF/MANIFEST.MF`
    /// that names the fuzz test class.
    fn create_manifest_jar(&self, class: &str) -> Result<PathBuf, BundleError> {
        let jar_dir = self.scratch_dir.join("jazzer").join(class);
        fs::create_dir_all(&jar_dir)?;
        let jar_path = jar_dir.join("manifest.jar");

        let mut jar = zip::ZipWriter::new(File::create(&jar_path)?);
        let dir_options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o755);
        jar.add_directory("META-INF/", dir_options)?;

        let file_options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o644);
        jar.start_file("META-INF/MANIFEST.MF", file_options)?;
        jar.write_all(format!("Jazzer-Fuzz-Target-Class: {class}\n").as_bytes())?;
        jar.finish()?;

        Ok(jar_path)
    }
}

/// Discovers fuzz test classes by scanning the test source tree for files
/// carrying a fuzz test marker, either the `@FuzzTest` annotation or a
/// `fuzzerTestOneInput` entry method.
///
/// The fully qualified class name is derived from the file path relative to
/// `src/test`, with the `java.` or `kotlin.` source-root prefix trimmed.
pub fn list_fuzz_test_classes(project_dir: &Path) -> Result<Vec<String>, BundleError> {
    let test_dir = project_dir.join("src").join("test");
    if !test_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut classes = Vec::new();
    collect_fuzz_test_classes(&test_dir, &test_dir, &mut classes)?;
    classes.sort();
    Ok(classes)
}

fn collect_fuzz_test_classes(
    test_dir: &Path,
    dir: &Path,
    classes: &mut Vec<String>,
) -> Result<(), BundleError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_fuzz_test_classes(test_dir, &path, classes)?;
            continue;
        }

        let is_source = path
            .extension()
            .is_some_and(|ext| ext == "java" || ext == "kt");
        if !is_source {
            continue;
        }

        let content = fs::read_to_string(&path)?;
        if !fuzz_test_marker().is_match(&content) {
            continue;
        }

        // src/test/java/com/example/Test.java -> com.example.Test
        let rel = path
            .with_extension("")
            .strip_prefix(test_dir)
            .map(|rel| rel.to_path_buf())
            .unwrap_or_default();
        let class = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(".");
        let class = class
            .strip_prefix("java.")
            .or_else(|| class.strip_prefix("kotlin."))
            .unwrap_or(&class)
            .to_string();
        classes.push(class);
    }
    Ok(())
}

fn fuzz_test_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        // The pattern is fixed, so compilation cannot fail.
        Regex::new(r"@FuzzTest|\sfuzzerTestOneInput\s*\(").expect("invalid fuzz test marker")
    })
}
