//! Caller-side checks run before a file is handed to the gateway.

use crate::{error::ValidationError, gateway::UploadFile};

pub const ALLOWED_EXTENSIONS: &[&str] = &["csv", "xlsx", "xls", "json", "md", "html"];
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

pub fn validate_upload(file: &UploadFile, max_bytes: u64) -> Result<(), ValidationError> {
    let allowed = file
        .extension()
        .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()));
    if !allowed {
        return Err(ValidationError::UnsupportedFileType {
            filename: file.filename.clone(),
            allowed: ALLOWED_EXTENSIONS
                .iter()
                .map(|ext| format!(".{ext}"))
                .collect::<Vec<_>>()
                .join(", "),
        });
    }
    if file.content.is_empty() {
        return Err(ValidationError::EmptyFile {
            filename: file.filename.clone(),
        });
    }
    if file.size() > max_bytes {
        return Err(ValidationError::FileTooLarge {
            filename: file.filename.clone(),
            size: file.size(),
            limit: max_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_every_listed_extension_in_any_case() {
        for name in [
            "roster.csv",
            "grades.XLSX",
            "old.xls",
            "tracks.json",
            "notes.md",
            "syllabus.Html",
        ] {
            let file = UploadFile::new(name, b"x".to_vec());
            assert_eq!(validate_upload(&file, 10), Ok(()), "{name}");
        }
    }

    #[test]
    fn rejects_unknown_or_missing_extension() {
        for name in ["payload.exe", "archive.csv.zip", "README"] {
            let file = UploadFile::new(name, b"x".to_vec());
            assert!(
                matches!(
                    validate_upload(&file, 10),
                    Err(ValidationError::UnsupportedFileType { .. })
                ),
                "{name}"
            );
        }
    }

    #[test]
    fn rejects_empty_and_oversized_files() {
        assert_eq!(
            validate_upload(&UploadFile::new("a.csv", Vec::new()), 10),
            Err(ValidationError::EmptyFile {
                filename: "a.csv".into()
            })
        );
        assert_eq!(
            validate_upload(&UploadFile::new("a.csv", vec![b'x'; 11]), 10),
            Err(ValidationError::FileTooLarge {
                filename: "a.csv".into(),
                size: 11,
                limit: 10,
            })
        );
    }
}
