//! Producer boundary.
//!
//! The cache never inspects decoded images itself. Producers tag what they
//! hand over with an [`ImageFormat`], and an [`ImageCodec`] supplied at
//! construction converts between decoded images and bytes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::disk::ExtendedData;

// == Image Format ==
/// What kind of image a producer is storing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFormat {
    /// Single frame without an alpha channel
    StillNoAlpha,
    /// Single frame with an alpha channel
    StillAlpha,
    /// Multi-frame image (GIF, APNG, animated WebP)
    Animated { frame_count: u32 },
    Unknown,
}

impl ImageFormat {
    /// Encoding used when no original bytes are available.
    pub fn encode_target(&self) -> EncodeTarget {
        match self {
            ImageFormat::StillNoAlpha => EncodeTarget::Compact,
            ImageFormat::StillAlpha | ImageFormat::Unknown => EncodeTarget::Lossless,
            ImageFormat::Animated { .. } => EncodeTarget::Animated,
        }
    }
}

/// Re-encoding requested from the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeTarget {
    /// Smallest acceptable still encoding, lossy allowed (JPEG-like)
    Compact,
    /// Lossless still encoding that keeps alpha (PNG-like)
    Lossless,
    /// Container that keeps every frame
    Animated,
}

// == Codec ==
/// Decode/encode layer the cache delegates to.
///
/// `Image` clones should be cheap (typically an `Arc`), since every memory
/// hit hands out a clone.
pub trait ImageCodec: Send + Sync + 'static {
    type Image: Clone + Send + Sync + 'static;

    /// Decodes stored bytes; `scale` is the display scale recorded at store time.
    fn decode(&self, bytes: &[u8], scale: f32) -> Option<Self::Image>;

    /// Encodes an image for persistence.
    fn encode(&self, image: &Self::Image, target: EncodeTarget) -> Option<Vec<u8>>;

    /// Memory cost of a decoded image.
    fn cost(&self, image: &Self::Image) -> u64;
}

/// Codec for callers that cache encoded bytes without decoding them.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl ImageCodec for BytesCodec {
    type Image = Arc<Vec<u8>>;

    fn decode(&self, bytes: &[u8], _scale: f32) -> Option<Self::Image> {
        Some(Arc::new(bytes.to_vec()))
    }

    fn encode(&self, image: &Self::Image, _target: EncodeTarget) -> Option<Vec<u8>> {
        Some(image.as_ref().clone())
    }

    fn cost(&self, image: &Self::Image) -> u64 {
        image.len() as u64
    }
}

// == Store Request ==
/// What a producer hands to `store`: the decoded image, the bytes it was
/// decoded from, their format and the display scale.
#[derive(Debug, Clone)]
pub struct StoreRequest<I> {
    pub image: Option<I>,
    pub data: Option<Vec<u8>>,
    pub format: ImageFormat,
    pub scale: f32,
}

impl<I> StoreRequest<I> {
    /// A decoded image with no original bytes.
    pub fn new(image: I) -> Self {
        Self {
            image: Some(image),
            data: None,
            format: ImageFormat::Unknown,
            scale: 1.0,
        }
    }

    /// Original bytes only; memory storage decodes them on demand.
    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            image: None,
            data: Some(data),
            format: ImageFormat::Unknown,
            scale: 1.0,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Bytes to persist: the original encoding when there is one, otherwise a
    /// fresh encoding chosen by format.
    pub fn disk_payload<C>(&self, codec: &C) -> Option<Vec<u8>>
    where
        C: ImageCodec<Image = I>,
    {
        match (&self.data, &self.image) {
            (Some(data), _) if !data.is_empty() => Some(data.clone()),
            (_, Some(image)) => codec.encode(image, self.format.encode_target()),
            _ => None,
        }
    }

    /// Sidecar data, needed only for a non-unit scale.
    pub fn extended_data(&self) -> Option<ExtendedData> {
        let scale_is_unit = (self.scale - 1.0).abs() < f32::EPSILON;
        (self.scale.is_finite() && self.scale > 0.0 && !scale_is_unit)
            .then_some(ExtendedData { scale: self.scale })
    }
}

// == Store Targets ==
/// Which tiers a write or removal fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTargets {
    pub memory: bool,
    pub disk: bool,
}

impl StoreTargets {
    pub const ALL: Self = Self {
        memory: true,
        disk: true,
    };
    pub const MEMORY: Self = Self {
        memory: true,
        disk: false,
    };
    pub const DISK: Self = Self {
        memory: false,
        disk: true,
    };
}

impl Default for StoreTargets {
    fn default() -> Self {
        Self::ALL
    }
}
