//! Content-addressed file names: `<stem>_md5_<hexdigest><ext>`.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};

use crate::error::{EcocalcError, Result};

fn hash_segment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_?md5_[0-9a-f]+").expect("static regex"))
}

/// Remove an `md5_<hex>_` segment from a file name.
pub fn strip_hash(name: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(.*)md5_[0-9a-f]+_(.*)$").expect("static regex"));
    re.replace(name, "${1}${2}").into_owned()
}

/// Name `path` gets after hashing to `digest`.
pub fn hashed_name(path: &Path, digest: &str) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let stem = hash_segment().replace_all(&stem, "");
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{stem}_md5_{digest}{ext}"))
}

/// MD5 hex digest of the file. With `rename`, the file is moved to its
/// hashed name; an existing file at that name is an `AlreadyExists` error.
pub fn hash_file(path: &Path, rename: bool) -> Result<String> {
    let bytes = fs::read(path)?;
    let digest = format!("{:x}", md5::compute(&bytes));
    if rename {
        let target = hashed_name(path, &digest);
        if target != path {
            if target.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", target.display()),
                )
                .into());
            }
            fs::rename(path, &target)?;
            info!(from = %path.display(), to = %target.display(), "renamed to hashed name");
        }
    }
    Ok(digest)
}

/// Copy `base` into `target_dir` under its hash-free name, then rename the
/// copy with its own hash. A collision with an identical hashed file already
/// present is logged and yields `None`.
pub fn copy_and_rehash(base: &Path, target_dir: &Path) -> Result<Option<PathBuf>> {
    let name = base
        .file_name()
        .ok_or_else(|| EcocalcError::InvalidArgument(format!("{} has no file name", base.display())))?
        .to_string_lossy();
    fs::create_dir_all(target_dir)?;
    let plain = target_dir.join(strip_hash(&name));
    fs::copy(base, &plain)?;

    match hash_file(&plain, true) {
        Ok(digest) => Ok(Some(hashed_name(&plain, &digest))),
        Err(EcocalcError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
            warn!(file = %plain.display(), "hashed copy already exists, keeping it");
            fs::remove_file(&plain)?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_removes_hash_segment() {
        assert_eq!(strip_hash("lulc_md5_0a1b2c_esa.tif"), "lulc_esa.tif");
        assert_eq!(strip_hash("plain.tif"), "plain.tif");
    }

    #[test]
    fn hashed_name_replaces_old_hash() {
        let p = Path::new("out/service_md5_deadbeef.tif");
        assert_eq!(hashed_name(p, "0123"), PathBuf::from("out/service_md5_0123.tif"));
        let q = Path::new("out/service.tif");
        assert_eq!(hashed_name(q, "0123"), PathBuf::from("out/service_md5_0123.tif"));
    }

    #[test]
    fn hash_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.tif");
        fs::write(&p, b"abc").unwrap();
        let digest = hash_file(&p, true).unwrap();
        assert_eq!(digest, "900150983cd24fb0d6963f7d28e17f72");
        assert!(!p.exists());
        assert!(dir.path().join(format!("a_md5_{digest}.tif")).exists());
    }

    #[test]
    fn rename_collision_is_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.tif");
        fs::write(&p, b"abc").unwrap();
        fs::write(dir.path().join("a_md5_900150983cd24fb0d6963f7d28e17f72.tif"), b"abc").unwrap();
        let err = hash_file(&p, true).unwrap_err();
        assert!(matches!(err, EcocalcError::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
    }

    #[test]
    fn copy_and_rehash_twice_is_not_fatal() {
        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let base = src_dir.path().join("svc_md5_ffff_masked.tif");
        fs::write(&base, b"abc").unwrap();

        let first = copy_and_rehash(&base, out_dir.path()).unwrap().unwrap();
        assert_eq!(
            first.file_name().unwrap().to_string_lossy(),
            "svc_masked_md5_900150983cd24fb0d6963f7d28e17f72.tif"
        );
        assert!(copy_and_rehash(&base, out_dir.path()).unwrap().is_none());
        assert_eq!(fs::read_dir(out_dir.path()).unwrap().count(), 1);
    }
}
