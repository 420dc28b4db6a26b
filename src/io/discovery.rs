use crate::domain::model::ImageEntry;
use crate::utils::error::{HarmonizeError, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

pub const ADJUSTED_SUFFIX: &str = "_CBadj";

fn subject_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"sub-([^_.]+)").expect("static regex"))
}

/// Subject identifier from names such as `sub-1001.nii.gz` or
/// `sub-1001_space-dtitk_AD.nii.gz`.
pub fn subject_id(file_name: &str) -> Option<String> {
    subject_pattern()
        .captures(file_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `sub-1001_FA.nii.gz` -> `sub-1001_FA_CBadj.nii.gz`.
pub fn adjusted_name(file_name: &str) -> String {
    for ext in [".nii.gz", ".nii"] {
        if let Some(stem) = file_name.strip_suffix(ext) {
            return format!("{}{}{}", stem, ADJUSTED_SUFFIX, ext);
        }
    }
    format!("{}{}", file_name, ADJUSTED_SUFFIX)
}

/// Lists images in `dir` whose name contains `prefix` and ends with
/// `suffix`, sorted by file name. Previously written outputs are skipped.
pub fn discover_images(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<ImageEntry>> {
    if !dir.is_dir() {
        return Err(HarmonizeError::InvalidConfigValueError {
            field: "voxelwise.image_dir".to_string(),
            value: dir.display().to_string(),
            reason: "not a directory".to_string(),
        });
    }

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !file_name.contains(prefix) || !file_name.ends_with(suffix) {
            continue;
        }
        if file_name.contains(ADJUSTED_SUFFIX) {
            tracing::debug!("Skipping previous output {}", file_name);
            continue;
        }
        entries.push(ImageEntry {
            path: entry.path(),
            subject_id: subject_id(&file_name),
            file_name,
        });
    }

    entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    tracing::info!("Found {} images in {}", entries.len(), dir.display());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_id() {
        assert_eq!(subject_id("sub-1001.nii.gz").as_deref(), Some("1001"));
        assert_eq!(
            subject_id("sub-1001_space-dtitk_AD.nii.gz").as_deref(),
            Some("1001")
        );
        assert_eq!(subject_id("mean_FA.nii.gz"), None);
    }

    #[test]
    fn test_adjusted_name() {
        assert_eq!(adjusted_name("sub-01.nii.gz"), "sub-01_CBadj.nii.gz");
        assert_eq!(adjusted_name("sub-01_FA.nii"), "sub-01_FA_CBadj.nii");
    }

    #[test]
    fn test_discover_images_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "sub-003.nii.gz",
            "sub-001.nii.gz",
            "sub-002_CBadj.nii.gz",
            "sub-002.nii",
            "readme.txt",
            "template.nii.gz",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let found = discover_images(dir.path(), "sub-", ".nii.gz").unwrap();
        let names: Vec<&str> = found.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, vec!["sub-001.nii.gz", "sub-003.nii.gz"]);
        assert_eq!(found[1].subject_id.as_deref(), Some("003"));
    }
}
