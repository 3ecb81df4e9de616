use crate::archive::{ArchiveWriter, join_archive_path};
use crate::build::{BuildDriver, BuildResult, BuildSystem};
use crate::bundle::{BundleError, BundleOptions, prepare_seeds, set_env_entry};
use crate::cas::stage_build_tree_dependency;
use crate::classify::{Classification, Os, classify};
use crate::deps::{DependencyCheck, Tool};
use crate::metadata::{Engine, EngineOptions, Fuzzer};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Sanitizer tag marking a coverage replay build. Not a sanitizer in the
/// compiler sense, but it travels through the same variant machinery.
pub(crate) const COVERAGE_SANITIZER: &str = "coverage";

/// Assembles archive content and fuzzer descriptors for native libFuzzer
/// executables: one fuzzing variant and one coverage variant per fuzz test,
/// with runtime dependencies classified, deduplicated and staged.
pub struct NativeAssembler<'a> {
    opts: &'a BundleOptions,
    os: Os,
    docker_image: &'a str,
}

impl<'a> NativeAssembler<'a> {
    pub fn new(opts: &'a BundleOptions, os: Os, docker_image: &'a str) -> Self {
        Self {
            opts,
            os,
            docker_image,
        }
    }

    pub fn assemble<W: Write>(
        &self,
        writer: &mut ArchiveWriter<W>,
        driver: &mut dyn BuildDriver,
        checker: &dyn DependencyCheck,
    ) -> Result<Vec<Fuzzer>, BundleError> {
        checker.check(&self.required_tools())?;

        let fuzz_tests = self.resolve_fuzz_tests(driver)?;

        let mut fuzzers = Vec::new();
        // Collected across all fuzz tests and variants, surfaced once.
        let mut system_deps = BTreeSet::new();

        // Fixed build order so build log output is predictable.
        for sanitizers in default_variants(self.os) {
            if sanitizers == [COVERAGE_SANITIZER] {
                info!("Building for coverage");
            } else {
                info!("Building with sanitizers: {}", sanitizers.join(", "));
            }

            let results = driver.build_for_variant(&sanitizers, &fuzz_tests)?;
            for result in &results {
                self.assemble_artifacts(writer, result, &mut fuzzers, &mut system_deps)?;
            }
        }

        if !system_deps.is_empty() {
            let list: Vec<String> = system_deps.into_iter().collect();
            warn!(
                "The following system libraries are not part of the bundle. Make sure they are \
                 provided by the Docker image {}:\n  {}",
                self.docker_image,
                list.join("\n  ")
            );
        }

        Ok(fuzzers)
    }

    fn required_tools(&self) -> Vec<Tool> {
        let mut tools = vec![Tool::Clang];
        if self.opts.build_system == BuildSystem::CMake {
            tools.push(Tool::CMake);
        }
        tools
    }

    fn resolve_fuzz_tests(&self, driver: &mut dyn BuildDriver) -> Result<Vec<String>, BundleError> {
        if !self.opts.fuzz_tests.is_empty() {
            return Ok(self.opts.fuzz_tests.clone());
        }

        if self.opts.build_system == BuildSystem::CMake {
            let fuzz_tests = driver.list_fuzz_tests()?;
            if fuzz_tests.is_empty() {
                return Err(BundleError::InvalidArgument(
                    "no fuzz tests found in the project".to_string(),
                ));
            }
            return Ok(fuzz_tests);
        }

        // Options validation requires explicit fuzz tests for every build
        // system without discovery; should be unreachable.
        debug_assert!(false, "bundling dispatched with zero fuzz tests");
        Err(BundleError::Invariant(
            "no fuzz tests to bundle".to_string(),
        ))
    }

    /// Stages the executable and its runtime dependencies for one build
    /// result and appends the resulting fuzzer descriptors.
    fn assemble_artifacts<W: Write>(
        &self,
        writer: &mut ArchiveWriter<W>,
        result: &BuildResult,
        fuzzers: &mut Vec<Fuzzer>,
        system_deps: &mut BTreeSet<String>,
    ) -> Result<(), BundleError> {
        let prefix = fuzz_test_prefix(result);
        let bin_prefix = join_archive_path(&prefix, "bin");

        let executable_rel = result
            .executable
            .strip_prefix(&result.build_dir)
            .map_err(|_| BundleError::ExecutableOutsideBuildDir {
                executable: result.executable.clone(),
                build_dir: result.build_dir.clone(),
            })?;
        let executable_archive_path =
            join_archive_path(&bin_prefix, &executable_rel.to_string_lossy());
        // The executable is never routed through the CAS.
        writer.write_file(&executable_archive_path, &result.executable)?;

        // Debug info next to the executable so stack traces resolve source
        // locations.
        if self.os == Os::MacOs {
            let mut dsym = result.executable.clone().into_os_string();
            dsym.push(".dSYM");
            let dsym = Path::new(&dsym);
            if dsym.is_dir() {
                let dsym_archive_path = format!("{executable_archive_path}.dSYM");
                writer.write_dir(&dsym_archive_path, dsym)?;
            }
        }

        let external_libs_dir = join_archive_path(&prefix, "external_libs");
        let mut library_paths = Vec::new();

        for dep in &result.runtime_deps {
            // Partial dependency resolution is expected; entries may have
            // vanished since the build.
            if !dep.exists() {
                continue;
            }

            match classify(dep, &result.build_dir, self.os) {
                Classification::BuildTree(rel) => {
                    stage_build_tree_dependency(writer, dep, &rel, &bin_prefix)?;
                }
                Classification::WellKnownSystem => {}
                Classification::UncommonSystem => {
                    system_deps.insert(dep.to_string_lossy().into_owned());
                }
                Classification::External => {
                    let basename = dep
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let archive_path = join_archive_path(&external_libs_dir, &basename);
                    if let Some(existing) = writer.get_source_path(&archive_path) {
                        if existing != dep.as_path() {
                            return Err(BundleError::ConflictingRuntimeDeps {
                                fuzz_test: result.name.clone(),
                                first: existing.to_path_buf(),
                                second: dep.clone(),
                            });
                        }
                        continue;
                    }
                    writer.write_file(&archive_path, dep)?;
                    if !library_paths.contains(&external_libs_dir) {
                        library_paths.push(external_libs_dir.clone());
                    }
                }
            }
        }

        let dict = match &self.opts.dictionary {
            Some(dictionary) => {
                let archive_path = join_archive_path(&prefix, "dict");
                writer.write_file(&archive_path, dictionary)?;
                Some(archive_path)
            }
            None => None,
        };

        // The build's own seed corpus comes first, then the user-specified
        // corpora.
        let mut seed_sources = Vec::new();
        if result.seed_corpus.is_dir() {
            seed_sources.push(result.seed_corpus.clone());
        }
        seed_sources.extend(self.opts.seed_corpus_dirs.iter().cloned());

        let seeds = if seed_sources.is_empty() {
            None
        } else {
            let archive_seeds_dir = join_archive_path(&prefix, "seeds");
            prepare_seeds(&seed_sources, &archive_seeds_dir, writer)?;
            Some(archive_seeds_dir)
        };

        // Keeps a bundled fuzz test from recursively invoking the
        // orchestrator at runtime.
        let env = set_env_entry(&self.opts.env, "NO_CIFUZZ", "1");

        if result.is_coverage_build() {
            // User engine args are deliberately dropped here; most libFuzzer
            // flags are meaningless or harmful for a coverage replay pass.
            fuzzers.push(Fuzzer {
                target: result.name.clone(),
                path: Some(executable_archive_path),
                engine: Engine::LlvmCov,
                sanitizer: None,
                project_dir: result.project_dir.clone(),
                dict,
                seeds,
                library_paths,
                runtime_paths: Vec::new(),
                engine_options: EngineOptions {
                    env,
                    flags: vec!["-merge=1".to_string(), ".".to_string()],
                },
                max_run_time: self.opts.max_run_time_secs(),
            });
            return Ok(());
        }

        for sanitizer in &result.sanitizers {
            // The archive format has no slot for UBSan as its own engine; it
            // only ever rides along with the address sanitizer.
            if sanitizer == "undefined" {
                warn!(
                    "Sanitizer \"undefined\" is bundled together with \"address\" and does not \
                     get its own fuzzer entry"
                );
                continue;
            }
            fuzzers.push(Fuzzer {
                target: result.name.clone(),
                path: Some(executable_archive_path.clone()),
                engine: Engine::LibFuzzer,
                sanitizer: Some(sanitizer.to_uppercase()),
                project_dir: result.project_dir.clone(),
                dict: dict.clone(),
                seeds: seeds.clone(),
                library_paths: library_paths.clone(),
                runtime_paths: Vec::new(),
                engine_options: EngineOptions {
                    env: env.clone(),
                    flags: self.opts.engine_args.clone(),
                },
                max_run_time: self.opts.max_run_time_secs(),
            });
        }

        Ok(())
    }
}

/// The sanitizer combinations built by default, in build order: the fuzzing
/// variant first, then coverage. Windows gets neither the undefined
/// sanitizer nor a coverage build.
pub(crate) fn default_variants(os: Os) -> Vec<Vec<String>> {
    let mut fuzzing = vec!["address".to_string()];
    if os != Os::Windows {
        fuzzing.push("undefined".to_string());
    }

    let mut variants = vec![fuzzing];
    if os != Os::Windows {
        variants.push(vec![COVERAGE_SANITIZER.to_string()]);
    }
    variants
}

/// Archive path prefix for one fuzz test and variant:
/// `<engine>/<sanitizers joined with "+">/<name>`.
///
/// The engine segment is `replayer` for coverage builds; the remote
/// execution backend special-cases that substring to decide how the corpus
/// is passed to the process.
pub(crate) fn fuzz_test_prefix(result: &BuildResult) -> String {
    let engine = if result.is_coverage_build() {
        "replayer"
    } else {
        "libfuzzer"
    };
    let sanitizer_segment = if result.sanitizers.is_empty() {
        "none".to_string()
    } else {
        result.sanitizers.join("+")
    };
    format!("{engine}/{sanitizer_segment}/{}", result.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::test_utils::FakeDriver;
    use crate::deps::test_utils::NoopDependencyCheck;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    /// Lays out a fake build tree with an executable, a build-tree library
    /// and an external library, and returns a matching build result.
    fn fake_build(dir: &TempDir, name: &str) -> BuildResult {
        let build_dir = dir.path().join(format!("{name}-build"));
        fs::create_dir_all(build_dir.join("lib")).unwrap();

        let executable = build_dir.join(name);
        fs::write(&executable, b"ELF").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&executable, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let build_tree_dep = build_dir.join("lib/libbuilt.so");
        fs::write(&build_tree_dep, b"built").unwrap();

        let external_dir = dir.path().join(format!("{name}-vendor"));
        fs::create_dir_all(&external_dir).unwrap();
        let external_dep = external_dir.join("libvendor.so");
        fs::write(&external_dep, b"vendor").unwrap();

        // Matches a well-known pattern by basename; must be dropped.
        let well_known = dir.path().join("libc.so.6");
        fs::write(&well_known, b"libc").unwrap();

        BuildResult {
            name: name.to_string(),
            executable,
            build_dir: build_dir.clone(),
            project_dir: dir.path().to_path_buf(),
            sanitizers: vec![],
            generated_corpus: dir.path().join("corpus"),
            seed_corpus: build_dir.join("seeds-that-do-not-exist"),
            runtime_deps: vec![
                build_tree_dep,
                external_dep,
                well_known,
                // Vanished dependencies are skipped silently.
                dir.path().join("gone/libgone.so"),
            ],
        }
    }

    fn assemble(
        opts: &BundleOptions,
        driver: &mut FakeDriver,
    ) -> (Vec<Fuzzer>, ArchiveWriter<Vec<u8>>) {
        let mut writer = ArchiveWriter::new(Vec::new());
        let assembler = NativeAssembler::new(opts, Os::Linux, "ubuntu:rolling");
        let fuzzers = assembler
            .assemble(&mut writer, driver, &NoopDependencyCheck)
            .unwrap();
        (fuzzers, writer)
    }

    #[test]
    fn default_variants_follow_the_platform() {
        assert_eq!(
            default_variants(Os::Linux),
            vec![
                vec!["address".to_string(), "undefined".to_string()],
                vec!["coverage".to_string()],
            ]
        );
        assert_eq!(
            default_variants(Os::Windows),
            vec![vec!["address".to_string()]]
        );
    }

    #[test]
    fn fuzz_test_prefix_uses_replayer_for_coverage() {
        let dir = tempdir().unwrap();
        let mut result = fake_build(&dir, "parse_fuzz_test");
        result.sanitizers = vec!["address".to_string(), "undefined".to_string()];
        assert_eq!(
            fuzz_test_prefix(&result),
            "libfuzzer/address+undefined/parse_fuzz_test"
        );

        result.sanitizers = vec!["coverage".to_string()];
        assert_eq!(fuzz_test_prefix(&result), "replayer/coverage/parse_fuzz_test");
    }

    #[test]
    fn assemble_stages_executable_deps_and_emits_descriptors() {
        let dir = tempdir().unwrap();
        let opts = BundleOptions {
            fuzz_tests: vec!["parse_fuzz_test".to_string()],
            build_system: BuildSystem::Other,
            build_command: Some("make".to_string()),
            project_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut driver = FakeDriver::new(vec![fake_build(&dir, "parse_fuzz_test")]);

        let (fuzzers, writer) = assemble(&opts, &mut driver);

        // Fuzzing variant: only address gets a descriptor, undefined rides
        // along. Coverage variant: exactly one LLVM_COV descriptor.
        assert_eq!(fuzzers.len(), 2);
        assert_eq!(fuzzers[0].engine, Engine::LibFuzzer);
        assert_eq!(fuzzers[0].sanitizer.as_deref(), Some("ADDRESS"));
        assert_eq!(
            fuzzers[0].path.as_deref(),
            Some("libfuzzer/address+undefined/parse_fuzz_test/bin/parse_fuzz_test")
        );
        assert!(
            fuzzers[0]
                .engine_options
                .env
                .contains(&"NO_CIFUZZ=1".to_string())
        );

        assert_eq!(fuzzers[1].engine, Engine::LlvmCov);
        assert_eq!(fuzzers[1].sanitizer, None);
        assert_eq!(
            fuzzers[1].engine_options.flags,
            vec!["-merge=1".to_string(), ".".to_string()]
        );

        // Build-tree dep goes through the CAS, external dep under
        // external_libs, the well-known library is dropped.
        assert!(writer.has_file_entry(
            "libfuzzer/address+undefined/parse_fuzz_test/bin/lib/libbuilt.so"
        ));
        assert!(writer.has_file_entry(
            "libfuzzer/address+undefined/parse_fuzz_test/external_libs/libvendor.so"
        ));
        assert!(!writer.has_file_entry(
            "libfuzzer/address+undefined/parse_fuzz_test/external_libs/libc.so.6"
        ));
        assert_eq!(
            fuzzers[0].library_paths,
            vec!["libfuzzer/address+undefined/parse_fuzz_test/external_libs".to_string()]
        );
    }

    #[test]
    fn coverage_build_never_contributes_a_libfuzzer_descriptor() {
        let dir = tempdir().unwrap();
        let opts = BundleOptions {
            fuzz_tests: vec!["t".to_string()],
            build_system: BuildSystem::Other,
            build_command: Some("make".to_string()),
            engine_args: vec!["-max_len=4096".to_string()],
            ..Default::default()
        };
        let mut driver = FakeDriver::new(vec![fake_build(&dir, "t")]);

        let (fuzzers, _) = assemble(&opts, &mut driver);
        let coverage: Vec<_> = fuzzers
            .iter()
            .filter(|f| f.engine == Engine::LlvmCov)
            .collect();
        assert_eq!(coverage.len(), 1);
        // User engine args must not leak into the coverage descriptor.
        assert_eq!(
            coverage[0].engine_options.flags,
            vec!["-merge=1".to_string(), ".".to_string()]
        );
        assert!(
            fuzzers
                .iter()
                .filter(|f| f.engine == Engine::LibFuzzer)
                .all(|f| f.engine_options.flags == vec!["-max_len=4096".to_string()])
        );
    }

    #[test]
    fn conflicting_external_basenames_are_a_hard_error() {
        let dir = tempdir().unwrap();
        let mut result = fake_build(&dir, "t");

        let other_vendor = dir.path().join("other-vendor");
        fs::create_dir_all(&other_vendor).unwrap();
        let conflicting = other_vendor.join("libvendor.so");
        fs::write(&conflicting, b"different bytes").unwrap();
        result.runtime_deps.push(conflicting);

        let opts = BundleOptions {
            fuzz_tests: vec!["t".to_string()],
            build_system: BuildSystem::Other,
            build_command: Some("make".to_string()),
            ..Default::default()
        };
        let mut driver = FakeDriver::new(vec![result]);

        let mut writer = ArchiveWriter::new(Vec::new());
        let assembler = NativeAssembler::new(&opts, Os::Linux, "ubuntu:rolling");
        let err = assembler
            .assemble(&mut writer, &mut driver, &NoopDependencyCheck)
            .unwrap_err();
        assert!(matches!(err, BundleError::ConflictingRuntimeDeps { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn uncommon_system_libraries_are_collected_once_across_fuzz_tests() {
        let dir = tempdir().unwrap();
        let opts = BundleOptions {
            fuzz_tests: vec!["first".to_string(), "second".to_string()],
            build_system: BuildSystem::Other,
            build_command: Some("make".to_string()),
            ..Default::default()
        };

        // An existing path under the system tree that matches no well-known
        // library pattern classifies as an uncommon system dependency.
        let system_dep = std::path::PathBuf::from("/usr/lib");

        let mut first = fake_build(&dir, "first");
        first.sanitizers = vec!["address".to_string()];
        first.runtime_deps.push(system_dep.clone());
        let mut second = fake_build(&dir, "second");
        second.sanitizers = vec!["address".to_string()];
        second.runtime_deps.push(system_dep);

        let assembler = NativeAssembler::new(&opts, Os::Linux, "ubuntu:rolling");
        let mut writer = ArchiveWriter::new(Vec::new());
        let mut fuzzers = Vec::new();
        let mut system_deps = BTreeSet::new();
        for result in [&first, &second] {
            assembler
                .assemble_artifacts(&mut writer, result, &mut fuzzers, &mut system_deps)
                .unwrap();
        }

        // Shared across both fuzz tests, collected exactly once.
        assert_eq!(system_deps.iter().collect::<Vec<_>>(), vec!["/usr/lib"]);

        // The library is only named in the warning; nothing from the system
        // tree is staged, neither under external_libs nor in the CAS.
        assert!(!writer.has_file_entry("libfuzzer/address/first/external_libs/lib"));
        assert!(!writer.has_file_entry("libfuzzer/address/second/external_libs/lib"));
        let bytes = writer.close().unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes.as_slice()));
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            assert!(!path.ends_with("/lib"), "system path staged at {path}");
        }
    }

    #[test]
    fn seed_corpora_are_staged_with_the_build_corpus_first() {
        let dir = tempdir().unwrap();
        let mut result = fake_build(&dir, "t");

        let build_corpus = result.build_dir.join("t_seed_corpus");
        fs::create_dir_all(&build_corpus).unwrap();
        fs::write(build_corpus.join("build_seed"), b"b").unwrap();
        result.seed_corpus = build_corpus;

        let user_corpus = dir.path().join("t_seed_corpus");
        fs::create_dir_all(&user_corpus).unwrap();
        fs::write(user_corpus.join("user_seed"), b"u").unwrap();

        let opts = BundleOptions {
            fuzz_tests: vec!["t".to_string()],
            build_system: BuildSystem::Other,
            build_command: Some("make".to_string()),
            seed_corpus_dirs: vec![user_corpus],
            ..Default::default()
        };
        let mut driver = FakeDriver::new(vec![result]);

        let (fuzzers, writer) = assemble(&opts, &mut driver);
        assert_eq!(
            fuzzers[0].seeds.as_deref(),
            Some("libfuzzer/address+undefined/t/seeds")
        );
        // Same basename: the build corpus claims it first, the user corpus
        // gets a uniquified subdirectory.
        assert!(
            writer.has_file_entry("libfuzzer/address+undefined/t/seeds/t_seed_corpus/build_seed")
        );
        assert!(
            writer.has_file_entry("libfuzzer/address+undefined/t/seeds/t_seed_corpus-1/user_seed")
        );
    }

    #[test]
    fn cmake_discovery_is_used_when_no_fuzz_tests_are_given() {
        let dir = tempdir().unwrap();
        let opts = BundleOptions {
            fuzz_tests: vec![],
            build_system: BuildSystem::CMake,
            ..Default::default()
        };
        let mut driver = FakeDriver::new(vec![fake_build(&dir, "discovered_test")]);
        driver.discoverable = Some(vec!["discovered_test".to_string()]);

        let (fuzzers, _) = assemble(&opts, &mut driver);
        assert!(fuzzers.iter().all(|f| f.target == "discovered_test"));
        assert!(!fuzzers.is_empty());
    }

    #[test]
    fn executable_outside_build_dir_is_rejected() {
        let dir = tempdir().unwrap();
        let mut result = fake_build(&dir, "t");
        let stray = dir.path().join("stray_executable");
        fs::write(&stray, b"ELF").unwrap();
        result.executable = stray;

        let opts = BundleOptions {
            fuzz_tests: vec!["t".to_string()],
            build_system: BuildSystem::Other,
            build_command: Some("make".to_string()),
            ..Default::default()
        };
        let mut driver = FakeDriver::new(vec![result]);

        let mut writer = ArchiveWriter::new(Vec::new());
        let assembler = NativeAssembler::new(&opts, Os::Linux, "ubuntu:rolling");
        let err = assembler
            .assemble(&mut writer, &mut driver, &NoopDependencyCheck)
            .unwrap_err();
        assert!(matches!(err, BundleError::ExecutableOutsideBuildDir { .. }));
    }
}
