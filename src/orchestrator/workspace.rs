//! Staging directories shared with the engine.

use crate::model::ImageAsset;
use filetime::FileTime;
use std::io;
use std::path::Path;

/// Image extensions the engine accepts, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "tif", "bmp"];

/// Remove both staging directories (if present) and recreate them empty.
pub fn prepare(image_dir: &Path, output_dir: &Path) -> io::Result<()> {
    for dir in [image_dir, output_dir] {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::fs::create_dir_all(dir)?;
    }
    tracing::debug!(image_dir = %image_dir.display(), output_dir = %output_dir.display(), "Workspace reset");
    Ok(())
}

pub fn is_eligible_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
}

/// Copy eligible images from `source` into `staging`, in filename order,
/// keeping each file's access and modification times.
pub fn import_images(source: &Path, staging: &Path) -> io::Result<Vec<ImageAsset>> {
    let mut candidates: Vec<_> = std::fs::read_dir(source)?
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| is_eligible_image(path))
        .collect();
    candidates.sort();

    let mut imported = Vec::with_capacity(candidates.len());
    for src in candidates {
        let Some(file_name) = src.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let staged = staging.join(&file_name);
        std::fs::copy(&src, &staged)?;
        let meta = std::fs::metadata(&src)?;
        filetime::set_file_times(
            &staged,
            FileTime::from_last_access_time(&meta),
            FileTime::from_last_modification_time(&meta),
        )?;
        imported.push(ImageAsset {
            file_name,
            source: src,
            staged,
        });
    }
    tracing::info!(count = imported.len(), source = %source.display(), "Images staged");
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_wipes_previous_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let img = tmp.path().join("engine/img");
        let out = tmp.path().join("engine/outputs");
        std::fs::create_dir_all(img.join("nested")).unwrap();
        std::fs::write(img.join("old.png"), b"x").unwrap();
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("old.csv"), b"x").unwrap();

        prepare(&img, &out).unwrap();
        assert!(img.is_dir() && out.is_dir());
        assert_eq!(std::fs::read_dir(&img).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);

        // Also fine on a fresh root.
        let fresh = tmp.path().join("fresh");
        prepare(&fresh.join("img"), &fresh.join("outputs")).unwrap();
        assert!(fresh.join("outputs").is_dir());
    }

    #[test]
    fn import_copies_only_allowed_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let staging = tmp.path().join("img");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&staging).unwrap();
        for name in ["b.PNG", "a.jpg", "c.tif", "d.Bmp", "e.jpeg", "notes.txt", "f"] {
            std::fs::write(src.join(name), name.as_bytes()).unwrap();
        }
        std::fs::create_dir(src.join("folder.png")).unwrap();

        let assets = import_images(&src, &staging).unwrap();
        let names: Vec<_> = assets.iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.tif", "d.Bmp"]);
        assert_eq!(std::fs::read(staging.join("b.PNG")).unwrap(), b"b.PNG");
        assert_eq!(assets[0].source, src.join("a.jpg"));
        assert_eq!(assets[0].staged, staging.join("a.jpg"));
    }

    #[test]
    fn empty_source_imports_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let assets = import_images(tmp.path(), tmp.path()).unwrap();
        assert!(assets.is_empty());
    }

    #[test]
    fn import_keeps_acquisition_timestamps() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let staging = tmp.path().join("img");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&staging).unwrap();
        let original = src.join("well_A1.tif");
        std::fs::write(&original, b"tiff").unwrap();
        let acquired = FileTime::from_unix_time(978_307_200, 0);
        filetime::set_file_times(&original, acquired, acquired).unwrap();

        import_images(&src, &staging).unwrap();
        let meta = std::fs::metadata(staging.join("well_A1.tif")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta), acquired);
    }
}
