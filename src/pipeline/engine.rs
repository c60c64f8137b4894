use std::io::Cursor;

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageFormat};

use crate::domain::photo::BoundingBox;
use crate::model::error::Result;

pub const DESCRIPTOR_DIM: usize = 512;
const THUMB_SIZE: u32 = 160;

/// One face found in a photo: its box in the source image and the crop as
/// encoded JPEG bytes, which the other engine calls take as input.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub bbox: BoundingBox,
    pub det_score: f32,
    pub thumb_jpeg: Vec<u8>,
}

/// Pluggable analysis backend. Implementations are synchronous and CPU bound;
/// the pipeline drives them through `spawn_blocking`, one photo at a time.
pub trait FaceEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Find every face in one encoded image.
    fn detect_faces(&self, image_bytes: &[u8]) -> Result<Vec<FaceCrop>>;

    /// Identity descriptor for a crop; unit normalization is the caller's job.
    fn embed(&self, face: &FaceCrop) -> Result<Vec<f32>>;

    /// Smile probability in [0,1].
    fn score_smile(&self, face: &FaceCrop) -> Result<f32>;

    /// Raw sharpness, normalized later across the whole job.
    fn score_sharpness(&self, face: &FaceCrop) -> Result<f32>;
}

/// Backend that needs no model files: the whole frame counts as one face,
/// described by a downsampled grey signature. Good enough for grouping
/// near-duplicate shots and for running the full service without weights.
pub struct OfflineEngine;

impl OfflineEngine {
    pub fn new() -> Self {
        OfflineEngine
    }

    fn decode(face: &FaceCrop) -> Result<DynamicImage> {
        Ok(image::load_from_memory(&face.thumb_jpeg)?)
    }
}

impl Default for OfflineEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceEngine for OfflineEngine {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn detect_faces(&self, image_bytes: &[u8]) -> Result<Vec<FaceCrop>> {
        let img = image::load_from_memory(image_bytes)?;
        let (w, h) = img.dimensions();

        let thumb = img.resize(THUMB_SIZE, THUMB_SIZE, FilterType::Triangle);
        let mut thumb_jpeg = Vec::new();
        thumb.write_to(&mut Cursor::new(&mut thumb_jpeg), ImageFormat::Jpeg)?;

        Ok(vec![FaceCrop {
            bbox: BoundingBox { x: 0, y: 0, w, h },
            det_score: 1.0,
            thumb_jpeg,
        }])
    }

    /// 32x16 grey thumbnail flattened to 512 dims.
    fn embed(&self, face: &FaceCrop) -> Result<Vec<f32>> {
        let grey = Self::decode(face)?.to_luma8();
        let small = image::imageops::resize(&grey, 32, 16, FilterType::Triangle);
        let out: Vec<f32> = small.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        debug_assert_eq!(out.len(), DESCRIPTOR_DIM);
        Ok(out)
    }

    /// No expression model without weights; a flat low probability leaves the
    /// ranking to sharpness.
    fn score_smile(&self, _face: &FaceCrop) -> Result<f32> {
        Ok(0.1)
    }

    /// Variance of the 4-neighbour Laplacian over the grey crop.
    fn score_sharpness(&self, face: &FaceCrop) -> Result<f32> {
        let grey = Self::decode(face)?.to_luma8();
        let (w, h) = grey.dimensions();
        if w < 3 || h < 3 {
            return Ok(0.0);
        }
        let px = |x: u32, y: u32| grey.get_pixel(x, y).0[0] as f64;
        let mut responses = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1)
                    - 4.0 * px(x, y);
                responses.push(lap);
            }
        }
        let n = responses.len() as f64;
        let mean = responses.iter().sum::<f64>() / n;
        let var = responses.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;
        Ok(var as f32)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_image(shade_step: bool) -> Vec<u8> {
        let mut img = image::GrayImage::new(64, 64);
        for (x, _y, p) in img.enumerate_pixels_mut() {
            p.0[0] = if shade_step && x >= 32 { 255 } else { 40 };
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_offline_engine_detects_whole_frame() {
        let engine = OfflineEngine::new();
        let faces = engine.detect_faces(&encoded_image(true)).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!((faces[0].bbox.w, faces[0].bbox.h), (64, 64));
        assert!(!faces[0].thumb_jpeg.is_empty());

        let descriptor = engine.embed(&faces[0]).unwrap();
        assert_eq!(descriptor.len(), DESCRIPTOR_DIM);
        assert!(descriptor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_sharpness_orders_flat_below_edge() {
        let engine = OfflineEngine::new();
        let flat = engine.detect_faces(&encoded_image(false)).unwrap();
        let edged = engine.detect_faces(&encoded_image(true)).unwrap();
        assert!(
            engine.score_sharpness(&flat[0]).unwrap() < engine.score_sharpness(&edged[0]).unwrap()
        );
    }

    #[test]
    fn test_offline_engine_rejects_garbage() {
        assert!(OfflineEngine::new().detect_faces(b"not an image").is_err());
    }

    #[test]
    fn test_stub_engine_parses_directives() {
        use testing::StubEngine;
        let faces = StubEngine.detect_faces(b"persona=B;smile=0.9;sharp=50;seed=2").unwrap();
        assert_eq!(faces.len(), 1);
        assert!((StubEngine.score_smile(&faces[0]).unwrap() - 0.9).abs() < 1e-6);
        assert!((StubEngine.score_sharpness(&faces[0]).unwrap() - 50.0).abs() < 1e-6);
        assert!(StubEngine.detect_faces(b"none").unwrap().is_empty());

        // same persona, different seeds: descriptors stay close
        let a = StubEngine.detect_faces(b"persona=A;seed=1").unwrap();
        let b = StubEngine.detect_faces(b"persona=A;seed=3").unwrap();
        let (va, vb) = (StubEngine.embed(&a[0]).unwrap(), StubEngine.embed(&b[0]).unwrap());
        let dot: f32 = va.iter().zip(vb.iter()).map(|(x, y)| x * y).sum();
        assert!(dot > 0.99);
    }
}
