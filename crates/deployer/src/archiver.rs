use std::{
    fs::File,
    io::{self, Seek, Write},
    path::{Path, StripPrefixError},
};

use derive_more::{Display, Error, From};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};
use zip::{write::FileOptions, CompressionMethod, DateTime, ZipWriter};

use crate::selector::PackageCandidate;

/// Highest zlib compression level.
const COMPRESSION_LEVEL: i32 = 9;

/// Upload file name used when more than one package is archived.
const MULTI_PACKAGE_FILE_NAME: &str = "packages.zip";

/// Errors that may occur during the archive creation process.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ArchiverError {
    /// [`zip`]-crate specific error.
    Zip(zip::result::ZipError),

    /// [`walkdir`]-crate specific error.
    WalkDir(walkdir::Error),

    /// IO error.
    Io(io::Error),

    /// Unable to strip package directory prefix from path.
    StripPrefix(StripPrefixError),
}

/// Archive ready to be uploaded.
///
/// The underlying temporary file is removed once the artifact is dropped,
/// so a failed run never leaves a stale archive behind.
pub(crate) struct Artifact {
    /// Temporary file with the archive contents.
    file: NamedTempFile,

    /// File name reported to the server.
    file_name: String,
}

impl Artifact {
    /// Path of the archive on the local filesystem.
    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }

    /// File name used for the multipart upload.
    pub(crate) fn file_name(&self) -> &str {
        &self.file_name
    }
}

/// Archive all `candidates` into a new temporary file.
pub(crate) fn archive(candidates: &[PackageCandidate]) -> Result<Artifact, ArchiverError> {
    let mut file = NamedTempFile::new()?;

    build_zip_archive(file.as_file_mut(), candidates)?.flush()?;

    Ok(Artifact {
        file,
        file_name: artifact_file_name(candidates),
    })
}

/// Upload file name: `{name}.zip` for a single package, a generic name otherwise.
fn artifact_file_name(candidates: &[PackageCandidate]) -> String {
    match candidates {
        [candidate] => format!("{}.zip", candidate.name),
        _ => String::from(MULTI_PACKAGE_FILE_NAME),
    }
}

/// Archive package directories into the provided `file`.
///
/// Each package becomes a top-level directory of the archive named after the package,
/// containing every file and directory below it. Entries are written in file name order
/// with a fixed modification time, so identical directories produce identical archives.
pub(crate) fn build_zip_archive<W: Write + Seek>(
    file: W,
    candidates: &[PackageCandidate],
) -> Result<W, ArchiverError> {
    let mut writer = ZipWriter::new(file);

    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(COMPRESSION_LEVEL))
        .last_modified_time(DateTime::default());

    for candidate in candidates {
        debug!(package = %candidate.name, "archiving package");

        let mut entries = walk_package_directory(&candidate.source_path);

        while let Some(entry) = entries.next().transpose()? {
            let relative = entry.path().strip_prefix(&candidate.source_path)?;

            let Some(name) = entry_name(&candidate.name, relative) else {
                warn!(path = %entry.path().display(), "skipping entry with non-unicode path");
                continue;
            };

            if entry.file_type().is_dir() {
                writer.add_directory(name, options)?;
            } else if entry.file_type().is_file() {
                writer.start_file(name, options)?;
                io::copy(&mut File::open(entry.path())?, &mut writer)?;
            }
        }
    }

    Ok(writer.finish()?)
}

/// Build an archive entry name from the package name and a path relative to the package root.
///
/// Components are joined with `/` regardless of the platform.
fn entry_name(package: &str, relative: &Path) -> Option<String> {
    let mut name = String::from(package);

    for component in relative.components() {
        name.push('/');
        name.push_str(component.as_os_str().to_str()?);
    }

    Some(name)
}

/// Recursively iterate over the package files and directories in file name order.
///
/// The package directory itself is yielded first.
fn walk_package_directory(dir: &Path) -> impl Iterator<Item = Result<DirEntry, walkdir::Error>> {
    WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
}
