//! The logical file being transferred.

use serde::{Deserialize, Serialize};

use crate::crypt::FileCryptMeta;
use crate::hash::ContentDigest;

/// A public link attached to a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicLink {
    /// Link URI as handed out to the public.
    pub uri: String,
}

/// A file moving through the pipeline.
///
/// `original_size` is always the plaintext size. The on-wire size differs from
/// it only when `crypt` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    /// Absolute remote path, `/`-separated.
    pub path: String,
    /// Plaintext size in bytes.
    pub original_size: u64,
    /// Digest of the on-wire content, if known in advance.
    pub digest: Option<ContentDigest>,
    /// Public link, if the file has one.
    pub link: Option<PublicLink>,
    /// Per-file crypto metadata, if the file is encrypted.
    pub crypt: Option<FileCryptMeta>,
}

impl FileHandle {
    /// Handle for `path` with `original_size` plaintext bytes.
    pub fn new(path: impl AsRef<str>, original_size: u64) -> Self {
        Self {
            path: normalize(path.as_ref()),
            original_size,
            digest: None,
            link: None,
            crypt: None,
        }
    }

    /// Attach a precomputed digest.
    pub fn with_digest(mut self, digest: ContentDigest) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Attach a public link.
    pub fn with_link(mut self, uri: impl Into<String>) -> Self {
        self.link = Some(PublicLink { uri: uri.into() });
        self
    }

    /// Attach crypto metadata.
    pub fn with_crypt(mut self, meta: FileCryptMeta) -> Self {
        self.crypt = Some(meta);
        self
    }

    /// True if the content is stored encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.crypt.is_some()
    }

    /// Bytes stored on (and transmitted to) the backend.
    pub fn on_wire_size(&self) -> u64 {
        self.crypt
            .as_ref()
            .map(|meta| meta.wire_size())
            .unwrap_or(self.original_size)
    }

    /// Last path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// Parent folder path (`/` for top-level files).
    pub fn parent(&self) -> &str {
        parent_of(&self.path)
    }

    /// Ancestor folders from the root down to the parent.
    pub fn ancestors(&self) -> Vec<String> {
        let mut out = vec!["/".to_string()];
        let parent = self.parent();
        let mut current = String::new();
        for segment in parent.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            out.push(current.clone());
        }
        out
    }
}

/// Collapse repeated separators, force a leading `/` and drop a trailing one.
pub fn normalize(path: &str) -> String {
    let joined = path
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}", joined)
}

/// Parent folder of a normalized path.
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Join a folder and a child name.
pub fn join(folder: &str, name: &str) -> String {
    normalize(&format!("{}/{}", folder, name))
}

/// True if normalized `path` is `folder` or lies below it.
pub fn is_within(path: &str, folder: &str) -> bool {
    folder == "/"
        || path == folder
        || path
            .strip_prefix(folder)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}

/// Percent-encode every segment of `path`, keeping the separators.
pub fn escape_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_and_parent() {
        let handle = FileHandle::new("docs//reports/q1.pdf/", 10);
        assert_eq!(handle.path, "/docs/reports/q1.pdf");
        assert_eq!(handle.parent(), "/docs/reports");
        assert_eq!(handle.name(), "q1.pdf");
        assert_eq!(FileHandle::new("/top.txt", 1).parent(), "/");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn test_ancestors_root_to_leaf() {
        let handle = FileHandle::new("/a/b/c.txt", 0);
        assert_eq!(handle.ancestors(), vec!["/", "/a", "/a/b"]);
        assert_eq!(FileHandle::new("/c.txt", 0).ancestors(), vec!["/"]);
    }

    #[test]
    fn test_is_within_respects_segments() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(is_within("/a", "/"));
        assert!(!is_within("/ab", "/a"));
        assert!(!is_within("/a", "/a/b"));
    }

    #[test]
    fn test_escape_path_keeps_separators() {
        assert_eq!(escape_path("/My Docs/a&b.txt"), "/My%20Docs/a%26b.txt");
        assert_eq!(join("/", "x"), "/x");
        assert_eq!(join("/a/", "/x"), "/a/x");
    }

    #[test]
    fn test_on_wire_size_follows_crypt_meta() {
        use crate::crypt::{CryptKey, SALT_LEN};
        let key = CryptKey::derive("pw", [3u8; SALT_LEN]).unwrap();
        let plain = FileHandle::new("/x", 1000);
        assert_eq!(plain.on_wire_size(), 1000);
        assert!(!plain.is_encrypted());
        let enc = plain.with_crypt(FileCryptMeta::new(&key, 1000, 512));
        assert_eq!(enc.on_wire_size(), 1024);
        assert_eq!(enc.original_size, 1000);
    }
}
