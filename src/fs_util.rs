use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek};
use std::path::Path;

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::CutoutError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    Zip,
}

pub fn detect_archive(path: &Path) -> Result<ArchiveKind, CutoutError> {
    let mut file = File::open(path)
        .map_err(|err| CutoutError::Filesystem(format!("open archive {}: {err}", path.display())))?;
    let mut head = Vec::with_capacity(512);
    file.by_ref()
        .take(512)
        .read_to_end(&mut head)
        .map_err(|err| CutoutError::Filesystem(err.to_string()))?;

    if head.starts_with(&[0x1f, 0x8b]) {
        return Ok(ArchiveKind::TarGz);
    }
    if head.starts_with(b"PK\x03\x04") {
        return Ok(ArchiveKind::Zip);
    }
    if head.len() >= 262 && &head[257..262] == b"ustar" {
        return Ok(ArchiveKind::Tar);
    }
    Err(CutoutError::Extraction(format!(
        "unrecognised archive format: {}",
        path.display()
    )))
}

pub fn unpack_archive(archive_path: &Path, target_dir: &Path) -> Result<ArchiveKind, CutoutError> {
    let kind = detect_archive(archive_path)?;
    let file = File::open(archive_path).map_err(|err| {
        CutoutError::Filesystem(format!("open archive {}: {err}", archive_path.display()))
    })?;
    match kind {
        ArchiveKind::Tar => extract_tar(BufReader::new(file), target_dir)?,
        ArchiveKind::TarGz => extract_tar(GzDecoder::new(BufReader::new(file)), target_dir)?,
        ArchiveKind::Zip => extract_zip(BufReader::new(file), target_dir)?,
    }
    Ok(kind)
}

fn extract_tar<R: Read>(reader: R, target_dir: &Path) -> Result<(), CutoutError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|err| CutoutError::Extraction(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| CutoutError::Extraction(err.to_string()))?;
        let unpacked = entry
            .unpack_in(target_dir)
            .map_err(|err| CutoutError::Extraction(err.to_string()))?;
        if !unpacked {
            return Err(CutoutError::Extraction(
                "tar entry path traversal detected".to_string(),
            ));
        }
    }
    Ok(())
}

fn extract_zip<R: Read + Seek>(reader: R, target_dir: &Path) -> Result<(), CutoutError> {
    let mut archive =
        ZipArchive::new(reader).map_err(|err| CutoutError::Extraction(err.to_string()))?;
    for index in 0..archive.len() {
        let mut member = archive
            .by_index(index)
            .map_err(|err| CutoutError::Extraction(err.to_string()))?;
        let Some(relative) = member.enclosed_name() else {
            return Err(CutoutError::Extraction(format!(
                "zip member escapes the target directory: {}",
                member.name()
            )));
        };
        let destination = target_dir.join(relative);
        let dir = if member.is_dir() {
            Some(destination.as_path())
        } else {
            destination.parent()
        };
        if let Some(dir) = dir {
            fs::create_dir_all(dir).map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        }
        if member.is_dir() {
            continue;
        }
        let mut output = File::create(&destination).map_err(|err| {
            CutoutError::Filesystem(format!("create {}: {err}", destination.display()))
        })?;
        io::copy(&mut member, &mut output)
            .map_err(|err| CutoutError::Extraction(err.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn tar_bytes(name: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn detects_and_unpacks_plain_tar() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("unit.tar");
        std::fs::write(&archive, tar_bytes("arch-1/2-cutout-HSC-G.fits", b"fits")).unwrap();
        let target = temp.path().join("out");
        std::fs::create_dir_all(&target).unwrap();

        let kind = unpack_archive(&archive, &target).unwrap();
        assert_eq!(kind, ArchiveKind::Tar);
        let content = std::fs::read(target.join("arch-1/2-cutout-HSC-G.fits")).unwrap();
        assert_eq!(content, b"fits");
    }

    #[test]
    fn detects_gzip_wrapped_tar() {
        use std::io::Write;

        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("unit.tar");
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&tar_bytes("arch/2-cutout-HSC-R.fits", b"r"))
            .unwrap();
        std::fs::write(&archive, encoder.finish().unwrap()).unwrap();
        assert_eq!(detect_archive(&archive).unwrap(), ArchiveKind::TarGz);
    }

    #[test]
    fn zip_member_outside_target_is_rejected() {
        use std::io::Write;

        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("unit.tar");
        let mut writer = zip::ZipWriter::new(File::create(&archive).unwrap());
        writer
            .start_file("../escape.fits", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"fits").unwrap();
        writer.finish().unwrap();

        let target = temp.path().join("out");
        std::fs::create_dir_all(&target).unwrap();
        let err = unpack_archive(&archive, &target).unwrap_err();
        assert_matches!(err, CutoutError::Extraction(_));
        assert!(!temp.path().join("escape.fits").exists());
    }

    #[test]
    fn rejects_garbage() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("unit.tar");
        std::fs::write(&archive, b"<html>service error</html>").unwrap();
        let err = unpack_archive(&archive, temp.path()).unwrap_err();
        assert_matches!(err, CutoutError::Extraction(_));
    }
}
