//! Archive extraction for core assets.
//!
//! Windows assets are zip archives that may carry more than one file; only
//! the entry whose name contains the expected executable name is written.
//! Other platforms ship a single gzip-compressed executable.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::{Result, UpdateError};
use crate::platform::ArchiveFormat;

/// Extracts the core executable from `archive` into `dest`.
pub fn extract(
    format: ArchiveFormat,
    archive: &Path,
    executable_name: &str,
    dest: &Path,
) -> Result<()> {
    match format {
        ArchiveFormat::Zip => extract_zip_entry(archive, executable_name, dest),
        ArchiveFormat::Gzip => extract_gzip(archive, dest),
    }
}

/// Writes the first file entry whose name contains `executable_name` to `dest`.
pub fn extract_zip_entry(archive: &Path, executable_name: &str, dest: &Path) -> Result<()> {
    tracing::debug!("Extracting {} from {}", executable_name, archive.display());

    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file))?;

    let index = (0..zip.len())
        .find(|&i| {
            zip.by_index(i)
                .is_ok_and(|entry| !entry.is_dir() && entry.name().contains(executable_name))
        })
        .ok_or_else(|| UpdateError::ExecutableNotFound {
            expected: executable_name.to_string(),
        })?;

    let mut entry = zip.by_index(index)?;
    write_decoded(&mut entry, dest)
}

/// Decompresses a single-file gzip archive into `dest`.
pub fn extract_gzip(archive: &Path, dest: &Path) -> Result<()> {
    tracing::debug!("Decompressing {}", archive.display());

    let file = File::open(archive)?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    write_decoded(&mut decoder, dest)
}

/// Copies a decoding reader into a new file at `dest`.
///
/// Decode failures become [`UpdateError::ArchiveCorrupt`]; failures to
/// create or write `dest` keep their I/O meaning.
fn write_decoded(reader: &mut impl io::Read, dest: &Path) -> Result<()> {
    let out = File::create(dest).map_err(|e| UpdateError::from_write(&e, dest))?;
    let mut writer = BufWriter::new(out);

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(UpdateError::ArchiveCorrupt(e.to_string())),
        };
        writer
            .write_all(&buf[..n])
            .map_err(|e| UpdateError::from_write(&e, dest))?;
    }

    let out = writer
        .into_inner()
        .map_err(|e| UpdateError::from_write(e.error(), dest))?;
    out.sync_all().map_err(|e| UpdateError::from_write(&e, dest))?;
    Ok(())
}
