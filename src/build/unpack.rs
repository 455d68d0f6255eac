//! Source unpacking
//!
//! Materializes a cached source object into a build work directory. The
//! format is picked from the original file name, since cache objects are
//! stored by digest without an extension.

use crate::error::{KilnError, KilnResult};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Scratch directory used during extraction, inside the destination
const EXTRACT_DIR: &str = ".kiln-extract";

/// Archive formats understood by the unpacker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Tar,
    Zip,
    /// Anything else is copied as-is
    Plain,
}

impl ArchiveKind {
    /// Detect the archive format from a file name
    pub fn detect(file_name: &str) -> Self {
        let lower = file_name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Self::TarGz
        } else if lower.ends_with(".tar") {
            Self::Tar
        } else if lower.ends_with(".zip") {
            Self::Zip
        } else {
            Self::Plain
        }
    }
}

/// Unpack `archive` into `dest`, stripping a single top-level directory.
///
/// `file_name` is the name the source had at its URL. Blocking; call from
/// `spawn_blocking` in async contexts.
pub fn unpack(archive: &Path, file_name: &str, dest: &Path) -> KilnResult<ArchiveKind> {
    let kind = ArchiveKind::detect(file_name);
    debug!("Unpacking {} ({:?}) into {}", file_name, kind, dest.display());

    fs::create_dir_all(dest)
        .map_err(|e| KilnError::io(format!("creating {}", dest.display()), e))?;

    if kind == ArchiveKind::Plain {
        let target = dest.join(plain_name(file_name));
        fs::copy(archive, &target)
            .map_err(|e| KilnError::io(format!("copying source to {}", target.display()), e))?;
        return Ok(kind);
    }

    let scratch = dest.join(EXTRACT_DIR);
    fs::create_dir_all(&scratch)
        .map_err(|e| KilnError::io(format!("creating {}", scratch.display()), e))?;

    let context = || format!("unpacking {}", file_name);
    let file = File::open(archive).map_err(|e| KilnError::io(context(), e))?;
    match kind {
        ArchiveKind::TarGz => tar::Archive::new(GzDecoder::new(file))
            .unpack(&scratch)
            .map_err(|e| KilnError::io(context(), e))?,
        ArchiveKind::Tar => tar::Archive::new(file)
            .unpack(&scratch)
            .map_err(|e| KilnError::io(context(), e))?,
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file).map_err(|e| {
                KilnError::io(context(), io::Error::new(io::ErrorKind::InvalidData, e))
            })?;
            zip.extract(&scratch).map_err(|e| {
                KilnError::io(context(), io::Error::new(io::ErrorKind::InvalidData, e))
            })?;
        }
        ArchiveKind::Plain => {}
    }

    let root = single_root(&scratch)?.unwrap_or_else(|| scratch.clone());
    move_children(&root, dest)?;
    fs::remove_dir_all(&scratch)
        .map_err(|e| KilnError::io(format!("removing {}", scratch.display()), e))?;

    Ok(kind)
}

/// Async wrapper around [`unpack`]
pub async fn unpack_source(archive: PathBuf, file_name: String, dest: PathBuf) -> KilnResult<ArchiveKind> {
    tokio::task::spawn_blocking(move || unpack(&archive, &file_name, &dest))
        .await
        .map_err(|e| KilnError::Internal(format!("unpack task failed: {}", e)))?
}

/// The only entry of `dir` when it is a directory
fn single_root(dir: &Path) -> KilnResult<Option<PathBuf>> {
    let entries: Vec<fs::DirEntry> = fs::read_dir(dir)
        .map_err(|e| KilnError::io(format!("reading {}", dir.display()), e))?
        .collect::<Result<_, _>>()
        .map_err(|e| KilnError::io(format!("reading {}", dir.display()), e))?;

    match entries.as_slice() {
        [only] if only.path().is_dir() => Ok(Some(only.path())),
        _ => Ok(None),
    }
}

fn move_children(from: &Path, to: &Path) -> KilnResult<()> {
    let entries = fs::read_dir(from)
        .map_err(|e| KilnError::io(format!("reading {}", from.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| KilnError::io(format!("reading {}", from.display()), e))?;
        let target = to.join(entry.file_name());
        fs::rename(entry.path(), &target)
            .map_err(|e| KilnError::io(format!("moving {}", target.display()), e))?;
    }
    Ok(())
}

fn plain_name(file_name: &str) -> &str {
    if file_name.is_empty() || file_name == EXTRACT_DIR {
        "source"
    } else {
        file_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn tar_gz(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn detect_by_extension() {
        assert_eq!(ArchiveKind::detect("Loop-0.3.3.tar.gz"), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::detect("src.TGZ"), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::detect("src.tar"), ArchiveKind::Tar);
        assert_eq!(ArchiveKind::detect("master.zip"), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::detect("install.sh"), ArchiveKind::Plain);
    }

    #[test]
    fn strips_single_top_level_dir() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pkg.tar.gz");
        tar_gz(
            &archive,
            &[("pkg-1.0/Cargo.toml", "[package]"), ("pkg-1.0/src/main.rs", "fn main() {}")],
        );

        let dest = tmp.path().join("work");
        let kind = unpack(&archive, "pkg-1.0.tar.gz", &dest).unwrap();

        assert_eq!(kind, ArchiveKind::TarGz);
        assert!(dest.join("Cargo.toml").is_file());
        assert!(dest.join("src/main.rs").is_file());
        assert!(!dest.join(EXTRACT_DIR).exists());
    }

    #[test]
    fn keeps_flat_archives() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("flat.tar.gz");
        tar_gz(&archive, &[("a.txt", "a"), ("b.txt", "b")]);

        let dest = tmp.path().join("work");
        unpack(&archive, "flat.tar.gz", &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dest.join("b.txt")).unwrap(), "b");
    }

    #[test]
    fn unpacks_zip() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("master.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            zip.start_file("Loop-master/README.md", options).unwrap();
            zip.write_all(b"loop").unwrap();
            zip.finish().unwrap();
        }

        let dest = tmp.path().join("work");
        unpack(&archive, "master.zip", &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("README.md")).unwrap(), "loop");
    }

    #[test]
    fn copies_plain_files() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("object");
        fs::write(&source, "#!/bin/sh\necho hi\n").unwrap();

        let dest = tmp.path().join("work");
        let kind = unpack(&source, "hello.sh", &dest).unwrap();
        assert_eq!(kind, ArchiveKind::Plain);
        assert!(dest.join("hello.sh").is_file());
    }

    #[test]
    fn corrupt_archive_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("object");
        fs::write(&source, "not a zip").unwrap();

        let err = unpack(&source, "broken.zip", &tmp.path().join("work")).unwrap_err();
        assert!(matches!(err, KilnError::Io { .. }));
    }
}
