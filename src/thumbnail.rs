use std::path::{Path, PathBuf};

use base64::Engine;

use crate::db::models::hex_encode;
use crate::error::Error;

/// ASCII prefix every thumbnail file on disk starts with, so a read can be
/// streamed straight into the HTML form without re-encoding at request time.
const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

/// Content-addressed thumbnail store: one file per face crop, named by the
/// hex MD5 of the *source* image it was cropped from, under
/// `<root>/images/`. Each file already holds the complete `data:` URI text
/// (prefix + base64 JPEG) it will be embedded as, so grid cells are served
/// verbatim with no decode/re-encode round trip.
#[derive(Debug, Clone)]
pub struct ThumbnailStore {
    dir: PathBuf,
}

impl ThumbnailStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ThumbnailStore { dir: dir.into() }
    }

    fn path_for(&self, md5: &[u8; 16]) -> PathBuf {
        self.dir.join(hex_encode(md5))
    }

    /// Base64-wraps `jpeg_bytes` as a `data:` URI and writes it with
    /// create/truncate semantics and `0600` permissions. Existence is
    /// assumed to imply completeness; a crash mid-write is acceptable (the
    /// captcha engine simply treats a missing/partial file as absent).
    pub fn store(&self, md5: &[u8; 16], jpeg_bytes: &[u8]) -> Result<(), Error> {
        let path = self.path_for(md5);
        let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg_bytes);
        std::fs::write(&path, format!("{DATA_URI_PREFIX}{encoded}"))?;
        set_owner_only(&path)?;
        Ok(())
    }

    pub fn exists(&self, md5: &[u8; 16]) -> bool {
        self.path_for(md5).exists()
    }

    pub fn remove(&self, md5: &[u8; 16]) -> Result<(), Error> {
        let path = self.path_for(md5);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Streams the stored `data:image/jpeg;base64,...` URI verbatim, for
    /// direct embedding in the captcha HTML form.
    pub fn data_uri(&self, md5: &[u8; 16]) -> Result<String, Error> {
        Ok(std::fs::read_to_string(self.path_for(md5))?)
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<(), Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThumbnailStore::new(dir.path());
        let md5 = [7u8; 16];
        store.store(&md5, b"fake-jpeg-bytes").unwrap();
        assert!(store.exists(&md5));
        let uri = store.data_uri(&md5).unwrap();
        assert_eq!(uri, format!("{DATA_URI_PREFIX}{}", base64::engine::general_purpose::STANDARD.encode(b"fake-jpeg-bytes")));
    }

    #[test]
    fn data_uri_has_expected_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThumbnailStore::new(dir.path());
        let md5 = [9u8; 16];
        store.store(&md5, b"abc").unwrap();
        let uri = store.data_uri(&md5).unwrap();
        assert!(uri.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn remove_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThumbnailStore::new(dir.path());
        store.remove(&[1u8; 16]).unwrap();
    }
}
