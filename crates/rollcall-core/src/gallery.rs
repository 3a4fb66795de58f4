//! Reference-image gallery: one cropped face image per identity.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::types::{GalleryEntry, Identity};
use image::{imageops, ImageFormat, RgbImage};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const REFERENCE_EXTENSION: &str = "jpg";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("no face found in the supplied image")]
    NoFaceDetected,
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("failed to write reference image {path}: {source}")]
    Save {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("gallery io: {0}")]
    Io(#[from] std::io::Error),
}

/// Directory of reference images keyed by identity.
pub struct GalleryStore {
    dir: PathBuf,
}

impl GalleryStore {
    /// Open the gallery at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, GalleryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the reference image stored for `identity`.
    pub fn reference_path(&self, identity: &Identity) -> PathBuf {
        self.dir.join(format!("{identity}.{REFERENCE_EXTENSION}"))
    }

    /// Crop the first face the encoder finds in `image` and store it as the
    /// reference image for `identity`, replacing any previous one.
    ///
    /// When several faces are present the encoder's first box wins; no
    /// attempt is made to pick the "right" person.
    pub fn register<E: FaceEncoder + ?Sized>(
        &self,
        identity: &Identity,
        image: &RgbImage,
        encoder: &mut E,
    ) -> Result<PathBuf, GalleryError> {
        let faces = encoder.locate_faces(image)?;
        let Some(first) = faces.first() else {
            return Err(GalleryError::NoFaceDetected);
        };
        if encoder.encode_faces(image, std::slice::from_ref(first))?.is_empty() {
            return Err(GalleryError::NoFaceDetected);
        }
        let (x, y, w, h) = first
            .clamped_rect(image.width(), image.height())
            .ok_or(GalleryError::NoFaceDetected)?;

        let crop = imageops::crop_imm(image, x, y, w, h).to_image();
        let path = self.reference_path(identity);
        crop.save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|source| GalleryError::Save { path: path.clone(), source })?;

        for (other_identity, other) in self.image_files()? {
            if other_identity == *identity && other != path {
                fs::remove_file(&other)?;
                tracing::info!(path = %other.display(), "removed superseded reference image");
            }
        }

        tracing::info!(
            identity = %identity,
            faces = faces.len(),
            path = %path.display(),
            "registered reference face"
        );
        Ok(path)
    }

    /// Identities with a reference image on disk, sorted.
    pub fn identities(&self) -> Result<Vec<Identity>, GalleryError> {
        Ok(self
            .reference_files()?
            .into_iter()
            .map(|(identity, _)| identity)
            .collect())
    }

    /// Re-encode every stored reference image.
    ///
    /// Files that do not decode, that the encoder fails on, or in which it
    /// finds no face are skipped. Entries come back sorted by identity.
    pub fn load_all<E: FaceEncoder + ?Sized>(
        &self,
        encoder: &mut E,
    ) -> Result<Vec<GalleryEntry>, GalleryError> {
        let mut entries = Vec::new();

        for (identity, path) in self.reference_files()? {
            let image = match image::open(&path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable reference image");
                    continue;
                }
            };

            let faces = match encoder.locate_faces(&image) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "face location failed, skipping");
                    continue;
                }
            };
            let Some(first) = faces.first() else {
                tracing::warn!(identity = %identity, "no face in reference image, skipping");
                continue;
            };
            let embedding = match encoder.encode_faces(&image, std::slice::from_ref(first)) {
                Ok(embeddings) => embeddings.into_iter().next(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "face encoding failed, skipping");
                    continue;
                }
            };
            let Some(embedding) = embedding else {
                continue;
            };

            entries.push(GalleryEntry { identity, embedding });
        }

        tracing::info!(count = entries.len(), dir = %self.dir.display(), "gallery loaded");
        Ok(entries)
    }

    /// One `(identity, path)` per identity, in identity order. When several
    /// files normalize to the same identity the canonical `<identity>.jpg`
    /// wins, otherwise the first path in sort order.
    fn reference_files(&self) -> Result<Vec<(Identity, PathBuf)>, GalleryError> {
        let mut chosen: BTreeMap<Identity, PathBuf> = BTreeMap::new();
        for (identity, path) in self.image_files()? {
            let canonical = self.reference_path(&identity);
            match chosen.get(&identity) {
                Some(existing) if *existing == canonical => {}
                Some(existing) if path != canonical && *existing <= path => {}
                _ => {
                    chosen.insert(identity, path);
                }
            }
        }
        Ok(chosen.into_iter().collect())
    }

    /// Every file whose stem is a valid identity and whose extension is a
    /// known image format, duplicates included.
    fn image_files(&self) -> Result<Vec<(Identity, PathBuf)>, GalleryError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() || ImageFormat::from_path(&path).is_err() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Identity::new(stem) {
                Ok(identity) => files.push((identity, path)),
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "ignoring gallery file"),
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{faces_image, TileEncoder, BLUE, GREEN, RED, TILE};
    use image::Rgb;

    fn store() -> (tempfile::TempDir, GalleryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path().join("faces")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, store) = store();
        assert!(store.dir().is_dir());
        assert!(store.identities().unwrap().is_empty());
    }

    #[test]
    fn test_register_then_load_has_one_entry() {
        let (_dir, store) = store();
        let mut enc = TileEncoder::default();
        let alice = Identity::new("Alice").unwrap();

        let path = store.register(&alice, &faces_image(&[RED]), &mut enc).unwrap();
        assert_eq!(path.file_name().unwrap(), "alice.jpg");

        let gallery = store.load_all(&mut enc).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].identity, alice);
        assert!(gallery[0].embedding.values[0] > 0.9);
    }

    #[test]
    fn test_register_crops_to_first_face() {
        let (_dir, store) = store();
        let mut enc = TileEncoder::default();
        let bob = Identity::new("bob").unwrap();

        let path = store.register(&bob, &faces_image(&[GREEN, BLUE]), &mut enc).unwrap();
        let saved = image::open(path).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (TILE, TILE));
        let centre = saved.get_pixel(TILE / 2, TILE / 2);
        assert!(centre[1] > 200 && centre[2] < 60, "expected green crop, got {centre:?}");
    }

    #[test]
    fn test_register_without_face_writes_nothing() {
        let (_dir, store) = store();
        let mut enc = TileEncoder::default();
        let carol = Identity::new("carol").unwrap();

        let err = store.register(&carol, &RgbImage::new(32, 32), &mut enc).unwrap_err();
        assert!(matches!(err, GalleryError::NoFaceDetected));
        assert!(!store.reference_path(&carol).exists());
    }

    #[test]
    fn test_reregister_overwrites() {
        let (_dir, store) = store();
        let mut enc = TileEncoder::default();
        let alice = Identity::new("alice").unwrap();

        store.register(&alice, &faces_image(&[RED]), &mut enc).unwrap();
        store.register(&Identity::new("ALICE").unwrap(), &faces_image(&[BLUE]), &mut enc).unwrap();

        let gallery = store.load_all(&mut enc).unwrap();
        assert_eq!(gallery.len(), 1);
        assert!(gallery[0].embedding.values[2] > 0.9, "blue reference should replace red");
    }

    #[test]
    fn test_load_all_skips_bad_files_and_sorts() {
        let (_dir, store) = store();
        let mut enc = TileEncoder::default();

        store.register(&Identity::new("zed").unwrap(), &faces_image(&[RED]), &mut enc).unwrap();
        store.register(&Identity::new("amy").unwrap(), &faces_image(&[GREEN]), &mut enc).unwrap();
        // corrupt image, faceless image, and a non-image file
        fs::write(store.dir().join("broken.jpg"), b"not a jpeg").unwrap();
        RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]))
            .save(store.dir().join("blank.png"))
            .unwrap();
        fs::write(store.dir().join("notes.txt"), b"hello").unwrap();

        let names: Vec<String> = store
            .load_all(&mut enc)
            .unwrap()
            .into_iter()
            .map(|e| e.identity.to_string())
            .collect();
        assert_eq!(names, vec!["amy", "zed"]);

        let listed: Vec<String> = store.identities().unwrap().iter().map(|i| i.to_string()).collect();
        assert_eq!(listed, vec!["amy", "blank", "broken", "zed"]);
    }

    #[test]
    fn test_uppercase_file_stem_is_normalized() {
        let (_dir, store) = store();
        faces_image(&[RED]).save(store.dir().join("Dave.png")).unwrap();
        let ids = store.identities().unwrap();
        assert_eq!(ids, vec![Identity::new("dave").unwrap()]);
    }

    #[test]
    fn test_register_removes_stale_extensions() {
        let (_dir, store) = store();
        let mut enc = TileEncoder::default();
        let stale = store.dir().join("alice.png");
        faces_image(&[RED]).save(&stale).unwrap();

        store.register(&Identity::new("alice").unwrap(), &faces_image(&[BLUE]), &mut enc).unwrap();

        assert!(!stale.exists());
        let gallery = store.load_all(&mut enc).unwrap();
        assert_eq!(gallery.len(), 1);
        assert!(gallery[0].embedding.values[2] > 0.9, "registered blue face should win");
    }

    #[test]
    fn test_one_entry_per_identity_across_case_and_extension() {
        let (_dir, store) = store();
        let mut enc = TileEncoder::default();
        faces_image(&[GREEN]).save(store.dir().join("Alice.jpg")).unwrap();
        faces_image(&[RED]).save(store.dir().join("alice.png")).unwrap();
        faces_image(&[BLUE]).save(store.dir().join("bob.png")).unwrap();

        let ids: Vec<String> = store.identities().unwrap().iter().map(|i| i.to_string()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
        assert_eq!(store.load_all(&mut enc).unwrap().len(), 2);
    }

    #[test]
    fn test_canonical_reference_preferred() {
        let (_dir, store) = store();
        let mut enc = TileEncoder::default();
        faces_image(&[RED]).save(store.dir().join("alice.bmp")).unwrap();
        faces_image(&[GREEN]).save(store.dir().join("alice.jpg")).unwrap();

        let gallery = store.load_all(&mut enc).unwrap();
        assert_eq!(gallery.len(), 1);
        assert!(gallery[0].embedding.values[1] > 0.9, "alice.jpg should be the reference");
    }

    /// Fails to encode blue faces, delegating everything else.
    struct BlueFails(TileEncoder);

    impl FaceEncoder for BlueFails {
        fn locate_faces(
            &mut self,
            image: &RgbImage,
        ) -> Result<Vec<crate::types::BoundingBox>, EncoderError> {
            self.0.locate_faces(image)
        }

        fn encode_faces(
            &mut self,
            image: &RgbImage,
            faces: &[crate::types::BoundingBox],
        ) -> Result<Vec<crate::types::Embedding>, EncoderError> {
            let embeddings = self.0.encode_faces(image, faces)?;
            if embeddings.iter().any(|e| e.values[2] > 0.9) {
                return Err(crate::detector::DetectorError::InferenceFailed("blue".into()).into());
            }
            Ok(embeddings)
        }
    }

    #[test]
    fn test_load_all_skips_encoder_failures() {
        let (_dir, store) = store();
        let mut tiles = TileEncoder::default();
        store.register(&Identity::new("amy").unwrap(), &faces_image(&[RED]), &mut tiles).unwrap();
        store.register(&Identity::new("bea").unwrap(), &faces_image(&[BLUE]), &mut tiles).unwrap();
        store.register(&Identity::new("cy").unwrap(), &faces_image(&[GREEN]), &mut tiles).unwrap();

        let names: Vec<String> = store
            .load_all(&mut BlueFails(tiles))
            .unwrap()
            .into_iter()
            .map(|e| e.identity.to_string())
            .collect();
        assert_eq!(names, vec!["amy", "cy"]);
    }
}
