use crate::types::BundleDigest;
use crate::ModelError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component as PathComponent, Path};

/// Instance-definition files shipped with a deploy command, keyed by
/// relative path, with a blake3 digest over the whole set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceBundle {
    pub files: BTreeMap<String, Vec<u8>>,
    pub digest: BundleDigest,
}

impl ResourceBundle {
    pub fn new(files: BTreeMap<String, Vec<u8>>) -> Self {
        let digest = Self::compute_digest(&files);
        Self { files, digest }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn compute_digest(files: &BTreeMap<String, Vec<u8>>) -> BundleDigest {
        let mut hasher = blake3::Hasher::new();
        for (name, content) in files {
            hasher.update(format!("file:{name}:{}:", content.len()).as_bytes());
            hasher.update(content);
        }
        BundleDigest::new(hasher.finalize().to_hex().to_string())
    }

    /// Recompute the digest and compare it with the one carried along.
    pub fn verify(&self) -> Result<(), ModelError> {
        let actual = Self::compute_digest(&self.files);
        if actual == self.digest {
            Ok(())
        } else {
            Err(ModelError::BundleIntegrity {
                expected: self.digest.to_string(),
                actual: actual.into_inner(),
            })
        }
    }

    /// Collect every regular file below `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, ModelError> {
        let mut files = BTreeMap::new();
        collect_files(dir, dir, &mut files)?;
        Ok(Self::new(files))
    }

    /// Write the files below `dir`, refusing paths that would escape it.
    pub fn write_to(&self, dir: &Path) -> Result<(), ModelError> {
        for (name, content) in &self.files {
            let relative = Path::new(name);
            let safe = relative
                .components()
                .all(|c| matches!(c, PathComponent::Normal(_)));
            if !safe || name.is_empty() {
                return Err(ModelError::UnsafeBundlePath(name.clone()));
            }
            let dest = dir.join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, content)?;
        }
        Ok(())
    }
}

fn collect_files(
    base: &Path,
    dir: &Path,
    files: &mut BTreeMap<String, Vec<u8>>,
) -> Result<(), ModelError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(base, &path, files)?;
        } else if file_type.is_file() {
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(key, fs::read(&path)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResourceBundle {
        let mut files = BTreeMap::new();
        files.insert("scripts/deploy.sh".to_owned(), b"echo deploy".to_vec());
        files.insert("app.conf".to_owned(), b"port=8080".to_vec());
        ResourceBundle::new(files)
    }

    #[test]
    fn digest_is_deterministic_and_verified() {
        let a = sample();
        let b = sample();
        assert_eq!(a.digest, b.digest);
        assert!(a.verify().is_ok());
    }

    #[test]
    fn tampered_bundle_fails_verification() {
        let mut bundle = sample();
        bundle
            .files
            .insert("app.conf".to_owned(), b"port=9090".to_vec());
        assert!(matches!(
            bundle.verify(),
            Err(ModelError::BundleIntegrity { .. })
        ));
    }

    #[test]
    fn dir_roundtrip() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("scripts")).unwrap();
        fs::write(src.path().join("scripts/start.sh"), "echo start").unwrap();
        fs::write(src.path().join("readme"), "hi").unwrap();

        let bundle = ResourceBundle::from_dir(src.path()).unwrap();
        assert_eq!(bundle.files.len(), 2);
        assert!(bundle.files.contains_key("scripts/start.sh"));

        let dest = tempfile::tempdir().unwrap();
        bundle.write_to(dest.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dest.path().join("scripts/start.sh")).unwrap(),
            "echo start"
        );
    }

    #[test]
    fn escaping_paths_rejected() {
        let mut files = BTreeMap::new();
        files.insert("../evil".to_owned(), b"x".to_vec());
        let bundle = ResourceBundle::new(files);
        let dest = tempfile::tempdir().unwrap();
        assert!(matches!(
            bundle.write_to(dest.path()),
            Err(ModelError::UnsafeBundlePath(_))
        ));
    }
}
