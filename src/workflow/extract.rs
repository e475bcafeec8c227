use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use sevenz_rust::{Password, SevenZReader};
use tar::Archive;
use zip::ZipArchive;

use crate::core::errors::WorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArchiveFormat {
    SevenZip,
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub(crate) fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".7z") {
            Some(ArchiveFormat::SevenZip)
        } else if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

pub(crate) fn extract_archive(archive_path: &Path, destination: &Path) -> Result<(), WorkflowError> {
    let format = ArchiveFormat::detect(archive_path).ok_or_else(|| {
        WorkflowError::ExtractFailed(format!(
            "unsupported archive format: {}",
            archive_path.display()
        ))
    })?;
    fs::create_dir_all(destination).map_err(extract_error)?;
    match format {
        ArchiveFormat::SevenZip => extract_7z_archive(archive_path, destination),
        ArchiveFormat::Zip => extract_zip_archive(archive_path, destination),
        ArchiveFormat::TarGz => extract_tar_gz_archive(archive_path, destination),
    }
}

fn extract_error<E: std::fmt::Display>(err: E) -> WorkflowError {
    WorkflowError::ExtractFailed(err.to_string())
}

fn unsafe_entry(name: &str) -> WorkflowError {
    WorkflowError::ExtractFailed(format!("unsafe archive entry: {}", name))
}

/// Strips `.` components; rejects absolute paths and `..`.
pub(crate) fn normalize_archive_member_path(raw: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if normalized.as_os_str().is_empty() {
        None
    } else {
        Some(normalized)
    }
}

fn extract_zip_archive(archive_path: &Path, destination: &Path) -> Result<(), WorkflowError> {
    let file = fs::File::open(archive_path).map_err(extract_error)?;
    let mut zip = ZipArchive::new(file).map_err(extract_error)?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(extract_error)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(unsafe_entry(entry.name()));
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & 0o170000 == 0o120000)
        {
            return Err(WorkflowError::ExtractFailed(format!(
                "unsupported symlink entry: {}",
                entry.name()
            )));
        }
        let target = destination.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(extract_error)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(extract_error)?;
            }
            let mut outfile = fs::File::create(&target).map_err(extract_error)?;
            io::copy(&mut entry, &mut outfile).map_err(extract_error)?;
            restore_mode(&target, entry.unix_mode());
        }
    }
    Ok(())
}

fn extract_tar_gz_archive(archive_path: &Path, destination: &Path) -> Result<(), WorkflowError> {
    let file = fs::File::open(archive_path).map_err(extract_error)?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);
    for item in archive.entries().map_err(extract_error)? {
        let mut entry = item.map_err(extract_error)?;
        let raw_path = entry.path().map_err(extract_error)?.into_owned();
        let Some(relative) = normalize_archive_member_path(&raw_path) else {
            return Err(unsafe_entry(&raw_path.to_string_lossy()));
        };
        let target = destination.join(relative);
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            return Err(WorkflowError::ExtractFailed(format!(
                "unsupported link entry: {}",
                raw_path.to_string_lossy()
            )));
        }
        if entry_type.is_dir() {
            fs::create_dir_all(&target).map_err(extract_error)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(extract_error)?;
        }
        entry.unpack(&target).map_err(extract_error)?;
    }
    Ok(())
}

fn extract_7z_archive(archive_path: &Path, destination: &Path) -> Result<(), WorkflowError> {
    let mut archive =
        SevenZReader::open(archive_path, Password::empty()).map_err(sevenz_error)?;
    archive
        .for_each_entries(|entry, reader| {
            let name = entry.name().replace('\\', "/");
            let Some(relative) = normalize_archive_member_path(Path::new(&name)) else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsafe archive entry: {}", name),
                )
                .into());
            };
            let target = destination.join(relative);
            if entry.is_directory() {
                fs::create_dir_all(&target)?;
                return Ok(true);
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = fs::File::create(&target)?;
            io::copy(reader, &mut outfile)?;
            Ok(true)
        })
        .map_err(sevenz_error)
}

/// sevenz-rust wraps io errors with an empty context string; surface the io message.
fn sevenz_error(err: sevenz_rust::Error) -> WorkflowError {
    match err {
        sevenz_rust::Error::Io(io_err, _) => WorkflowError::ExtractFailed(io_err.to_string()),
        other => extract_error(other),
    }
}

#[cfg(unix)]
fn restore_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777));
    }
}

#[cfg(not(unix))]
fn restore_mode(_path: &Path, _mode: Option<u32>) {}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use sevenz_rust::{SevenZArchiveEntry, SevenZWriter};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    use super::*;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    fn write_7z(path: &Path, entries: &[(&str, &[u8])]) {
        let sources = path.with_extension("src");
        fs::create_dir_all(&sources).unwrap();
        let mut writer = SevenZWriter::create(path).unwrap();
        for (index, (name, data)) in entries.iter().enumerate() {
            let source = sources.join(format!("{}.bin", index));
            fs::write(&source, data).unwrap();
            let entry = SevenZArchiveEntry::from_path(&source, name.to_string());
            writer
                .push_archive_entry(entry, Some(fs::File::open(&source).unwrap()))
                .unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn detects_formats_by_extension() {
        assert_eq!(
            ArchiveFormat::detect(Path::new("RetroArch_cores.7z")),
            Some(ArchiveFormat::SevenZip)
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("master.ZIP")),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            ArchiveFormat::detect(Path::new("cores.tgz")),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(ArchiveFormat::detect(Path::new("cores.rar")), None);
    }

    #[test]
    fn normalizes_member_paths() {
        assert_eq!(
            normalize_archive_member_path(Path::new("./cores/a.so")),
            Some(PathBuf::from("cores/a.so"))
        );
        assert_eq!(normalize_archive_member_path(Path::new("../a.so")), None);
        assert_eq!(normalize_archive_member_path(Path::new("/etc/passwd")), None);
        assert_eq!(normalize_archive_member_path(Path::new(".")), None);
    }

    #[test]
    fn extracts_zip_entries() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("cores.zip");
        write_zip(
            &archive,
            &[
                ("cores/snes9x_libretro.so", &b"snes"[..]),
                ("cores/info/snes9x_libretro.info", &b"info"[..]),
            ],
        );

        let out = dir.path().join("out");
        extract_archive(&archive, &out).unwrap();
        assert_eq!(fs::read(out.join("cores/snes9x_libretro.so")).unwrap(), b"snes");
        assert!(out.join("cores/info/snes9x_libretro.info").exists());
    }

    #[test]
    fn rejects_zip_path_traversal() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escaped.so", &b"evil"[..])]);

        let out = dir.path().join("out");
        let err = extract_archive(&archive, &out).unwrap_err();
        assert!(matches!(err, WorkflowError::ExtractFailed(_)));
        assert!(!dir.path().join("escaped.so").exists());
    }

    #[test]
    fn extracts_tar_gz_entries() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("cores.tar.gz");
        let encoder = GzEncoder::new(fs::File::create(&archive).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let data = b"genesis";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "genesis_plus_gx_libretro.so", &data[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let out = dir.path().join("out");
        extract_archive(&archive, &out).unwrap();
        assert_eq!(
            fs::read(out.join("genesis_plus_gx_libretro.so")).unwrap(),
            b"genesis"
        );
    }

    #[test]
    fn extracts_nested_7z_cores() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("RetroArch_cores.7z");
        write_7z(
            &archive,
            &[
                (
                    "RetroArch-Linux-x86_64/RetroArch-Linux-x86_64.AppImage.home/.config/retroarch/cores/snes9x_libretro.so",
                    &b"snes"[..],
                ),
                ("RetroArch-Linux-x86_64/retroarch", &b"bin"[..]),
            ],
        );

        let out = dir.path().join("out");
        extract_archive(&archive, &out).unwrap();
        assert_eq!(
            fs::read(out.join(
                "RetroArch-Linux-x86_64/RetroArch-Linux-x86_64.AppImage.home/.config/retroarch/cores/snes9x_libretro.so"
            ))
            .unwrap(),
            b"snes"
        );
        assert!(out.join("RetroArch-Linux-x86_64/retroarch").exists());
    }

    #[test]
    fn rejects_7z_path_traversal_with_readable_message() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.7z");
        write_7z(&archive, &[("../escaped.so", &b"evil"[..])]);

        let out = dir.path().join("out");
        let err = extract_archive(&archive, &out).unwrap_err();
        assert!(matches!(err, WorkflowError::ExtractFailed(_)));
        assert_eq!(
            err.to_string(),
            "extraction failed: unsafe archive entry: ../escaped.so"
        );
        assert!(!dir.path().join("escaped.so").exists());
    }

    #[test]
    fn corrupt_archive_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("RetroArch_cores.7z");
        fs::write(&archive, b"definitely not a 7z archive").unwrap();

        let err = extract_archive(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, WorkflowError::ExtractFailed(_)));
    }

    #[test]
    fn unsupported_format_is_an_extract_failure() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("cores.rar");
        fs::write(&archive, b"rar").unwrap();

        let err = extract_archive(&archive, &dir.path().join("out")).unwrap_err();
        assert!(err.to_string().contains("unsupported archive format"));
    }
}
