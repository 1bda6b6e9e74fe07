//! Shared test helpers: a fake codec whose "pixels" are a small JSON header.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use image_cache::cache::EncodeTarget;
use image_cache::{CacheConfig, ImageCache, ImageCodec};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct FakeImage {
    pub width: u32,
    pub height: u32,
    pub frames: u32,
    pub has_alpha: bool,
    pub scale: f32,
}

impl FakeImage {
    pub fn still(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            frames: 1,
            has_alpha: false,
            scale: 1.0,
        })
    }

    pub fn animated(width: u32, height: u32, frames: u32, scale: f32) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            frames,
            has_alpha: true,
            scale,
        })
    }

    /// Bytes as a network producer would have received them.
    pub fn original_bytes(&self) -> Vec<u8> {
        encode_header(self, "original")
    }
}

fn encode_header(image: &FakeImage, kind: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "kind": kind,
        "width": image.width,
        "height": image.height,
        "frames": image.frames,
        "alpha": image.has_alpha,
    }))
    .unwrap()
}

#[derive(Debug, Clone, Default)]
pub struct FakeCodec {
    /// Simulates an expensive decode
    pub decode_delay: Option<Duration>,
}

impl ImageCodec for FakeCodec {
    type Image = Arc<FakeImage>;

    fn decode(&self, bytes: &[u8], scale: f32) -> Option<Self::Image> {
        if let Some(delay) = self.decode_delay {
            std::thread::sleep(delay);
        }
        let header: Value = serde_json::from_slice(bytes).ok()?;
        Some(Arc::new(FakeImage {
            width: header["width"].as_u64()? as u32,
            height: header["height"].as_u64()? as u32,
            frames: header["frames"].as_u64()? as u32,
            has_alpha: header["alpha"].as_bool()?,
            scale,
        }))
    }

    fn encode(&self, image: &Self::Image, target: EncodeTarget) -> Option<Vec<u8>> {
        match target {
            // Lossy stills carry no alpha and a single frame
            EncodeTarget::Compact => Some(encode_header(
                &FakeImage {
                    has_alpha: false,
                    frames: 1,
                    ..image.as_ref().clone()
                },
                "compact",
            )),
            EncodeTarget::Lossless => Some(encode_header(
                &FakeImage {
                    frames: 1,
                    ..image.as_ref().clone()
                },
                "lossless",
            )),
            EncodeTarget::Animated => Some(encode_header(image, "animated")),
        }
    }

    fn cost(&self, image: &Self::Image) -> u64 {
        u64::from(image.width) * u64::from(image.height) * 4 * u64::from(image.frames)
    }
}

pub fn test_config(dir: &tempfile::TempDir) -> CacheConfig {
    CacheConfig::new(dir.path())
}

pub fn open_cache(config: CacheConfig) -> ImageCache<FakeCodec> {
    ImageCache::open(config, FakeCodec::default()).unwrap()
}
