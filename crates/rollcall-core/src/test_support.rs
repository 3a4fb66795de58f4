//! Deterministic stand-ins for the ONNX encoder.
//!
//! Images are read as a grid of 16×16 tiles: every tile whose centre pixel is
//! not black counts as a face, and its embedding is the centre colour scaled
//! to `[0, 1]`. Distinct primary colours are therefore ~1.41 apart, well past
//! the match threshold, while JPEG round trips of the same colour stay close.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::types::{BoundingBox, Embedding};
use image::{Rgb, RgbImage};

pub const TILE: u32 = 16;

pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const BLUE: Rgb<u8> = Rgb([0, 0, 255]);

#[derive(Default)]
pub struct TileEncoder {
    pub locate_calls: usize,
}

impl FaceEncoder for TileEncoder {
    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError> {
        self.locate_calls += 1;
        let mut faces = Vec::new();
        for ty in 0..image.height() / TILE {
            for tx in 0..image.width() / TILE {
                let centre = image.get_pixel(tx * TILE + TILE / 2, ty * TILE + TILE / 2);
                if centre.0.iter().map(|&c| c as u32).sum::<u32>() > 60 {
                    faces.push(BoundingBox {
                        x: (tx * TILE) as f32,
                        y: (ty * TILE) as f32,
                        width: TILE as f32,
                        height: TILE as f32,
                        confidence: 1.0,
                        landmarks: None,
                    });
                }
            }
        }
        Ok(faces)
    }

    fn encode_faces(
        &mut self,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<Embedding>, EncoderError> {
        Ok(faces
            .iter()
            .map(|face| {
                let px = image.get_pixel(
                    (face.x + face.width / 2.0) as u32,
                    (face.y + face.height / 2.0) as u32,
                );
                Embedding {
                    values: px.0.iter().map(|&c| c as f32 / 255.0).collect(),
                    model_version: Some("tile".into()),
                }
            })
            .collect())
    }
}

/// A horizontal strip of solid tiles, one "face" per colour.
pub fn faces_image(colors: &[Rgb<u8>]) -> RgbImage {
    let width = TILE * colors.len().max(1) as u32;
    RgbImage::from_fn(width, TILE, |x, _| {
        colors.get((x / TILE) as usize).copied().unwrap_or(Rgb([0, 0, 0]))
    })
}
