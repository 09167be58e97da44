//! Image-to-tensor transform.
//!
//! An image URL is fetched, decoded (PNG or JPEG), resized to 224x224 with a
//! bilinear filter and turned into normalized RGB intensities. The flat form
//! is row-major over `(y, x)` with the `(r, g, b)` triple innermost, which is
//! the layout the inference stage reshapes into `[224, 224, 3]`.

use std::time::Duration;

use image::{
    imageops::FilterType,
    DynamicImage,
};
use log::debug;
use reqwest::Client;
use tokio::task;

use crate::{
    config::FetchConfig,
    error::TransformError,
};

pub const WIDTH: u32 = 224;
pub const HEIGHT: u32 = 224;
pub const CHANNELS: usize = 3;
pub const TENSOR_LEN: usize = (WIDTH * HEIGHT) as usize * CHANNELS;

/// A `[HEIGHT][WIDTH][CHANNELS]` tensor of intensities in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    // row-major pixels
    pixels: Vec<[f32; CHANNELS]>,
}

impl Tensor {
    /// Resizes `img` and reads its RGB channels, dropping alpha.
    pub fn from_image(img: &DynamicImage) -> Self {
        let resized = img
            .resize_exact(WIDTH, HEIGHT, FilterType::Triangle)
            .to_rgb8();
        let pixels = resized
            .pixels()
            .map(|p| [
                f32::from(p[0]) / 255.0,
                f32::from(p[1]) / 255.0,
                f32::from(p[2]) / 255.0,
            ])
            .collect();
        Self { pixels }
    }

    /// Channels of pixel `(x, y)`; `None` outside the 224x224 grid.
    pub fn at(&self, x: u32, y: u32) -> Option<[f32; CHANNELS]> {
        if x >= WIDTH || y >= HEIGHT {
            return None;
        }
        self.pixels.get((y * WIDTH + x) as usize).copied()
    }

    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(TENSOR_LEN);
        for pixel in &self.pixels {
            flat.extend_from_slice(pixel);
        }
        flat
    }

    /// Inverse of `flatten`; `None` unless exactly `TENSOR_LEN` values are given.
    pub fn from_flat(flat: &[f32]) -> Option<Self> {
        if flat.len() != TENSOR_LEN {
            return None;
        }
        let pixels = flat
            .chunks_exact(CHANNELS)
            .map(|c| [c[0], c[1], c[2]])
            .collect();
        Some(Self { pixels })
    }
}

pub fn decode_to_tensor(bytes: &[u8]) -> Result<Tensor, TransformError> {
    let img = image::load_from_memory(bytes)?;
    debug!("Decoded a {}x{} image", img.width(), img.height());
    Ok(Tensor::from_image(&img))
}

/// HTTP side of the transform: one bounded GET per image, no retries.
#[derive(Clone)]
pub struct ImageFetcher {
    client: Client,
    timeout: Duration,
}

impl ImageFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, TransformError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client: client,
            timeout: config.timeout(),
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransformError> {
        let timeout = self.timeout;
        let as_fetch_error = |err: reqwest::Error| {
            if err.is_timeout() {
                TransformError::Timeout(timeout)
            } else {
                TransformError::Fetch(err)
            }
        };
        let resp = self.client
            .get(url)
            .send()
            .await
            .map_err(as_fetch_error)?;
        if !resp.status().is_success() {
            return Err(TransformError::Status(resp.status()));
        }
        let body = resp.bytes()
            .await
            .map_err(as_fetch_error)?;
        Ok(body.to_vec())
    }

    pub async fn image_to_tensor(&self, url: &str) -> Result<Tensor, TransformError> {
        let bytes = self.fetch(url).await?;
        // decoding and resizing are cpu bound
        task::spawn_blocking(move || decode_to_tensor(&bytes)).await?
    }
}
