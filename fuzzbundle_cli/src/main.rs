mod other_driver;

use fuzzbundle_core::build::BuildSystem;
use fuzzbundle_core::bundle::{BundleOptions, Bundler};
use fuzzbundle_core::config::BundleConfig;
use fuzzbundle_core::deps::SystemToolCheck;
use other_driver::OtherDriver;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Bundles fuzz tests into self-contained archives", long_about = None)]
struct Cli {
    /// Fuzz test names (native) or fully qualified class names (JVM).
    fuzz_tests: Vec<String>,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Output archive path; defaults to `<fuzz test>.tar.gz`.
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// One of: cmake, bazel, other, maven, gradle.
    #[clap(long)]
    build_system: Option<String>,
    /// Shell command producing the fuzz test executables ("other" only).
    #[clap(long)]
    build_command: Option<String>,
    #[clap(long)]
    project_dir: Option<PathBuf>,
    /// libFuzzer dictionary file to bundle.
    #[clap(long)]
    dict: Option<PathBuf>,
    /// Seed corpus directory; can be given multiple times.
    #[clap(long = "seed-corpus")]
    seed_corpus: Vec<PathBuf>,
    /// Extra engine flag; can be given multiple times.
    #[clap(long = "engine-arg")]
    engine_arg: Vec<String>,
    /// `KEY=VALUE` or `KEY` (resolved from the current environment).
    #[clap(long = "env")]
    env: Vec<String>,
    /// Maximum fuzzing run time in seconds.
    #[clap(long)]
    timeout: Option<u64>,
    /// Docker image the bundle is expected to run in.
    #[clap(long)]
    docker_image: Option<String>,
    #[clap(long)]
    commit: Option<String>,
    #[clap(long)]
    branch: Option<String>,
    /// Extra file to bundle, as `source` or `source;target`; can be given
    /// multiple times.
    #[clap(long = "add")]
    add: Vec<String>,
    /// Keep the temporary scratch directory for debugging.
    #[clap(long)]
    keep_scratch: bool,
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            BundleConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("fuzzbundle.toml");
            if default_config_path.exists() {
                info!("Loading configuration from {default_config_path:?}");
                BundleConfig::load_from_file(&default_config_path)?
            } else {
                BundleConfig::default()
            }
        }
    };

    // CLI flags win over config file values.
    let build_system_name = cli
        .build_system
        .or(config.build_system)
        .unwrap_or_else(|| "other".to_string());
    let build_system = BuildSystem::parse(&build_system_name).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown build system {build_system_name:?}; expected one of: cmake, bazel, other, \
             maven, gradle"
        )
    })?;

    let mut seed_corpus_dirs = config.seed_corpus_dirs;
    seed_corpus_dirs.extend(cli.seed_corpus);

    let mut env = config.env;
    env.extend(cli.env);

    let mut engine_args = config.engine_args;
    engine_args.extend(cli.engine_arg);

    let mut opts = BundleOptions {
        fuzz_tests: cli.fuzz_tests,
        build_system,
        build_command: cli.build_command.or(config.build_command),
        output_path: cli.output.or(config.output),
        project_dir: cli
            .project_dir
            .or(config.project_dir)
            .unwrap_or_else(|| PathBuf::from(".")),
        dictionary: cli.dict.or(config.dict),
        seed_corpus_dirs,
        engine_args,
        env,
        timeout: cli.timeout.or(config.timeout_secs).map(Duration::from_secs),
        docker_image: cli.docker_image.or(config.docker_image),
        commit: cli.commit,
        branch: cli.branch,
        additional_files: cli.add,
        keep_scratch: cli.keep_scratch,
    };
    opts.validate()?;

    let mut driver = match opts.build_system {
        BuildSystem::Other => {
            // validate() guarantees the build command is present.
            let build_command = opts
                .build_command
                .clone()
                .ok_or_else(|| anyhow::anyhow!("a build command must be set"))?;
            OtherDriver::new(opts.project_dir.clone(), build_command)
        }
        other => {
            anyhow::bail!(
                "The {:?} build system is not wired in this build; use --build-system other with \
                 a --build-command",
                other.as_str()
            );
        }
    };

    let output_path = Bundler::new(&opts).bundle(&mut driver, &SystemToolCheck::default())?;
    println!("Bundle written to {output_path:?}");
    Ok(())
}
