use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use lopdf::{Document, Object, ObjectId};

pub fn normalize_angle(angle: i32) -> Result<i64> {
    if angle % 90 != 0 {
        bail!("rotation must be a multiple of 90 degrees, got {angle}");
    }
    Ok(i64::from(angle).rem_euclid(360))
}

/// Rotate every page of the PDF at `path` by `angle` degrees clockwise,
/// rewriting the file in place. Returns the number of pages touched.
pub fn rotate_document(path: &Path, angle: i32) -> Result<usize> {
    let is_pdf = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    if !is_pdf {
        bail!("rotation is only supported for PDF documents");
    }
    let delta = normalize_angle(angle)?;
    if delta == 0 {
        return Ok(0);
    }

    let mut doc =
        Document::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    let pages: Vec<ObjectId> = doc.get_pages().values().copied().collect();
    for id in &pages {
        let page = doc
            .get_object_mut(*id)
            .and_then(Object::as_dict_mut)
            .with_context(|| format!("page object {id:?} is not a dictionary"))?;
        let current = page.get(b"Rotate").and_then(Object::as_i64).unwrap_or(0);
        page.set("Rotate", (current + delta).rem_euclid(360));
    }

    let rotated = path.with_extension("rotated.pdf");
    doc.save(&rotated)
        .with_context(|| format!("failed to write {}", rotated.display()))?;
    fs::rename(&rotated, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(pages.len())
}
