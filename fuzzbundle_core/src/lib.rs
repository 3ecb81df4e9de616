pub mod archive;
pub mod build;
pub mod bundle;
pub mod cas;
pub mod classify;
pub mod config;
pub mod deps;
pub mod jvm;
pub mod metadata;
pub mod native;
pub mod vcs;

pub use archive::{ArchiveError, ArchiveWriter};
pub use build::{BuildDriver, BuildError, BuildResult, BuildSystem};
pub use bundle::{BundleError, BundleOptions, Bundler};
pub use classify::{Classification, Os, classify};
pub use config::BundleConfig;
pub use deps::{DependencyCheck, DependencyError, SystemToolCheck, Tool};
pub use metadata::{Engine, Fuzzer, Metadata};
