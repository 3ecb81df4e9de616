use crate::archive::{ArchiveError, ArchiveWriter, join_archive_path};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CasError {
    #[error("failed to hash {path:?}: {source}")]
    Hash {
        path: std::path::PathBuf,
        source: io::Error,
    },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Stages a build-tree runtime dependency through the content-addressed
/// store.
///
/// The payload is written once under `cas/<2 hex>/<62 hex>/<basename>` and
/// a hard link is always added from the CAS entry to the dependency's
/// logical path below `bin_prefix`. Fuzz tests that depend on bit-identical
/// files therefore share a single physical copy while each keeps its own
/// correctly located link. The fuzz test executable itself must not be
/// routed through here; only dependencies are deduplicated.
pub fn stage_build_tree_dependency<W: Write>(
    writer: &mut ArchiveWriter<W>,
    dependency: &Path,
    build_dir_rel_path: &Path,
    bin_prefix: &str,
) -> Result<(), CasError> {
    let hash = sha256_hex(dependency).map_err(|source| CasError::Hash {
        path: dependency.to_path_buf(),
        source,
    })?;

    let basename = dependency
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    // Two levels of fan-out keep any one CAS directory reasonably small.
    let cas_path = format!("cas/{}/{}/{}", &hash[..2], &hash[2..], basename);

    if !writer.has_file_entry(&cas_path) {
        writer.write_file(&cas_path, dependency)?;
    }

    let link_path = join_archive_path(bin_prefix, &build_dir_rel_path.to_string_lossy());
    writer.write_hard_link(&cas_path, &link_path)?;
    Ok(())
}

/// Whole-file SHA-256 digest as lowercase hex.
fn sha256_hex(path: &Path) -> Result<String, io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn sha256_hex_matches_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();
        assert_eq!(
            sha256_hex(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn identical_deps_from_two_fuzz_tests_share_one_cas_entry() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a/libshared.so");
        let second = dir.path().join("b/libshared.so");
        fs::create_dir_all(first.parent().unwrap()).unwrap();
        fs::create_dir_all(second.parent().unwrap()).unwrap();
        fs::write(&first, b"identical bytes").unwrap();
        fs::write(&second, b"identical bytes").unwrap();

        let mut writer = ArchiveWriter::new(Vec::new());
        stage_build_tree_dependency(
            &mut writer,
            &first,
            Path::new("lib/libshared.so"),
            "libfuzzer/address/test_one/bin",
        )
        .unwrap();
        stage_build_tree_dependency(
            &mut writer,
            &second,
            Path::new("lib/libshared.so"),
            "libfuzzer/address/test_two/bin",
        )
        .unwrap();

        assert!(writer.has_file_entry("libfuzzer/address/test_one/bin/lib/libshared.so"));
        assert!(writer.has_file_entry("libfuzzer/address/test_two/bin/lib/libshared.so"));

        let bytes = writer.close().unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes.as_slice()));
        let mut regular = 0;
        let mut links = 0;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            match entry.header().entry_type() {
                tar::EntryType::Regular => regular += 1,
                tar::EntryType::Link => links += 1,
                _ => {}
            }
        }
        assert_eq!(regular, 1, "payload must be stored exactly once");
        assert_eq!(links, 2, "each fuzz test gets its own hard link");
    }

    #[test]
    fn different_content_yields_distinct_cas_entries() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("libone.so");
        let second = dir.path().join("libtwo.so");
        fs::write(&first, b"one").unwrap();
        fs::write(&second, b"two").unwrap();

        let mut writer = ArchiveWriter::new(Vec::new());
        stage_build_tree_dependency(&mut writer, &first, Path::new("libone.so"), "t/bin").unwrap();
        stage_build_tree_dependency(&mut writer, &second, Path::new("libtwo.so"), "t/bin").unwrap();

        let bytes = writer.close().unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes.as_slice()));
        let regular = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.header().entry_type() == tar::EntryType::Regular)
            .count();
        assert_eq!(regular, 2);
    }
}
