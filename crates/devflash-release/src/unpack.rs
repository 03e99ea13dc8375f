//! Zip asset extraction

use std::path::Path;

use tokio::task;

use crate::error::ReleaseError;

/// Extract a zip archive into `output_dir`.
///
/// Extraction is blocking work and runs on the blocking pool. Entries with
/// unsafe names (absolute paths, `..`) are skipped.
pub async fn extract_zip(archive_path: &Path, output_dir: &Path) -> Result<(), ReleaseError> {
    let archive_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| archive_path.display().to_string());
    let archive_path = archive_path.to_path_buf();
    let output_dir = output_dir.to_path_buf();

    let fail = {
        let archive_name = archive_name.clone();
        move |reason: String| ReleaseError::Unpack {
            archive: archive_name.clone(),
            reason,
        }
    };

    task::spawn_blocking(move || -> Result<(), ReleaseError> {
        std::fs::create_dir_all(&output_dir)?;

        let file = std::fs::File::open(&archive_path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| fail(e.to_string()))?;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|e| fail(e.to_string()))?;

            let Some(enclosed_name) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
                continue;
            };

            let destination = output_dir.join(enclosed_name);
            if entry.is_dir() {
                std::fs::create_dir_all(&destination)?;
                continue;
            }

            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let mut out_file = std::fs::File::create(&destination)?;
            std::io::copy(&mut entry, &mut out_file)?;
        }

        Ok(())
    })
    .await
    .map_err(|e| ReleaseError::Unpack {
        archive: archive_name,
        reason: format!("extraction task failed: {e}"),
    })?
}
