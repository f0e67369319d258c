use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use unicode_normalization::UnicodeNormalization;

/// Filename length cap after sanitization.
const MAX_NAME_CHARS: usize = 200;

/// File extensions rejected by the knowledge pipeline regardless of the
/// declared content type.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp", "heic", "svg"];

/// On-disk storage for uploaded knowledge documents.
///
/// The base directory is created with mode 0o700; every stored file gets
/// 0o600. Writes that would land outside the base directory are refused.
pub struct FileStore {
    base_dir: PathBuf,
    max_upload_bytes: u64,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>, max_upload_bytes: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_upload_bytes,
        }
    }

    /// Creates the base directory and locks down its permissions.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            fs::set_permissions(&self.base_dir, perms).await?;
        }
        Ok(())
    }

    /// Sanitizes an original filename: NFKC normalization, control characters
    /// and path separators replaced, whitespace collapsed, length capped.
    pub fn safe_name(original: &str) -> String {
        let base = original
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("uploaded");

        let normalized: String = base.nfkc().collect();
        let mut cleaned = String::with_capacity(normalized.len());
        for ch in normalized.chars() {
            if ch.is_control() || matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') {
                cleaned.push('_');
            } else {
                cleaned.push(ch);
            }
        }

        let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        let trimmed = collapsed.trim();
        let capped: String = trimmed.chars().take(MAX_NAME_CHARS).collect();
        if capped.is_empty() || capped == "." || capped == ".." {
            "uploaded".to_string()
        } else {
            capped
        }
    }

    /// Resolves the destination for `filename` inside the base directory,
    /// refusing anything that would escape it.
    fn resolve_dest(&self, filename: &str) -> Result<PathBuf> {
        let candidate = Path::new(filename);
        if candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::Validation(format!(
                "invalid destination filename: {:?}",
                filename
            )));
        }

        let dest = self.base_dir.join(candidate);

        // Symlink check: the real parent of the destination must still be the
        // real base directory.
        let real_base = std::fs::canonicalize(&self.base_dir)?;
        let real_parent = dest
            .parent()
            .map(std::fs::canonicalize)
            .transpose()?
            .unwrap_or_else(|| real_base.clone());
        if real_parent != real_base {
            return Err(Error::Validation(format!(
                "destination escapes the upload directory: {:?}",
                filename
            )));
        }

        Ok(dest)
    }

    /// Policy checks applied before accepting a knowledge upload.
    pub fn validate_upload(&self, filename: &str, content_type: Option<&str>, size: u64) -> Result<()> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let is_image = IMAGE_EXTENSIONS.contains(&ext.as_str())
            || content_type.is_some_and(|ct| ct.starts_with("image/"));
        if is_image {
            return Err(Error::Validation("images_not_allowed".to_string()));
        }

        if size > self.max_upload_bytes {
            return Err(Error::Validation(format!(
                "file too large: {} bytes (max {})",
                size, self.max_upload_bytes
            )));
        }

        Ok(())
    }

    /// Streams an upload to disk and returns the absolute path.
    pub async fn save_stream<R>(&self, filename: &str, mut stream: R) -> Result<PathBuf>
    where
        R: AsyncRead + Unpin,
    {
        self.init().await?;
        let dest = self.resolve_dest(filename)?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() as u64 > self.max_upload_bytes {
                return Err(Error::Validation(format!(
                    "file too large (max {} bytes)",
                    self.max_upload_bytes
                )));
            }
        }

        fs::write(&dest, &buf).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            fs::set_permissions(&dest, perms).await?;
        }

        Ok(dest)
    }

    /// Best-effort delete; missing files are not an error.
    pub async fn delete(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path).await {
            tracing::debug!(path = %path.display(), error = %e, "file delete skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> FileStore {
        FileStore::new(dir.path(), 1024 * 1024)
    }

    #[test]
    fn safe_name_strips_separators_and_controls() {
        assert_eq!(FileStore::safe_name("../../etc/passwd"), "passwd");
        assert_eq!(FileStore::safe_name("re\u{0000}port.pdf"), "re_port.pdf");
        assert_eq!(FileStore::safe_name("a<b>c.txt"), "a_b_c.txt");
        assert_eq!(FileStore::safe_name("  spaced   name.txt "), "spaced name.txt");
    }

    #[test]
    fn safe_name_caps_length() {
        let long = "x".repeat(400) + ".txt";
        assert_eq!(FileStore::safe_name(&long).chars().count(), 200);
    }

    #[test]
    fn safe_name_never_empty() {
        assert_eq!(FileStore::safe_name(""), "uploaded");
        assert_eq!(FileStore::safe_name("///"), "uploaded");
        assert_eq!(FileStore::safe_name(".."), "uploaded");
    }

    #[tokio::test]
    async fn save_refuses_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.init().await.unwrap();

        let escape = store.save_stream("../escape.txt", &b"data"[..]).await;
        assert!(matches!(escape, Err(Error::Validation(_))));

        let absolute = store.save_stream("/etc/passwd", &b"data"[..]).await;
        assert!(matches!(absolute, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn save_writes_inside_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let path = store.save_stream("report.txt", &b"hello"[..]).await.unwrap();
        assert!(path.starts_with(dir.path()));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn save_enforces_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), 8);
        let res = store.save_stream("big.txt", &b"123456789"[..]).await;
        assert!(matches!(res, Err(Error::Validation(_))));
    }

    #[test]
    fn upload_policy_rejects_images_and_oversize() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.validate_upload("photo.png", None, 10).is_err());
        assert!(store
            .validate_upload("doc.bin", Some("image/jpeg"), 10)
            .is_err());
        assert!(store.validate_upload("doc.pdf", Some("application/pdf"), 10).is_ok());
        assert!(store
            .validate_upload("doc.pdf", None, 2 * 1024 * 1024)
            .is_err());
    }

    #[tokio::test]
    async fn delete_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        // deleting a missing file must not panic or error
        store.delete(Path::new("/nonexistent/file.bin")).await;
    }
}
