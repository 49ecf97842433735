//! Camera snapshots and the orientation fix-ups applied before upload.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use image::ImageFormat;
use printsync_protocol::WebcamTransforms;
use reqwest::Client;
use tokio::time::timeout;

use crate::error::AgentError;

#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Raw encoded image bytes (usually JPEG) from the camera.
    async fn capture(&self) -> Result<Vec<u8>, AgentError>;
}

pub struct HttpSnapshotSource {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpSnapshotSource {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, AgentError> {
        Ok(Self {
            client: Client::builder().timeout(request_timeout).build()?,
            url: url.into(),
            timeout: request_timeout,
        })
    }
}

#[async_trait]
impl FrameSource for HttpSnapshotSource {
    async fn capture(&self) -> Result<Vec<u8>, AgentError> {
        let response = timeout(self.timeout, self.client.get(&self.url).send())
            .await
            .map_err(|_| AgentError::Timeout("camera snapshot".into()))??;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Status {
                context: "camera snapshot".into(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Decode, flip/rotate as configured, and re-encode as PNG.
pub fn apply_transforms(raw: &[u8], transforms: WebcamTransforms) -> Result<Vec<u8>, AgentError> {
    let mut img = image::load_from_memory(raw)?;
    if transforms.flip_h {
        img = img.fliph();
    }
    if transforms.flip_v {
        img = img.flipv();
    }
    if transforms.rotate {
        // quarter turn counter-clockwise
        img = img.rotate270();
    }
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Run [`apply_transforms`] off the async executor.
pub async fn transform_frame(raw: Vec<u8>, transforms: WebcamTransforms) -> Result<Vec<u8>, AgentError> {
    tokio::task::spawn_blocking(move || apply_transforms(&raw, transforms))
        .await
        .map_err(|e| AgentError::Session(format!("frame transform task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};

    fn encode(img: RgbImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn marked() -> Vec<u8> {
        // 3x2 image with a single red pixel in the top-left corner
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        encode(img)
    }

    fn red_at(png: &[u8]) -> (u32, u32, (u32, u32)) {
        let img = image::load_from_memory(png).unwrap();
        let (w, h) = img.dimensions();
        for y in 0..h {
            for x in 0..w {
                if img.get_pixel(x, y)[0] == 255 {
                    return (w, h, (x, y));
                }
            }
        }
        panic!("marker pixel lost");
    }

    #[test]
    fn identity_keeps_geometry() {
        let out = apply_transforms(&marked(), WebcamTransforms::default()).unwrap();
        assert_eq!(red_at(&out), (3, 2, (0, 0)));
    }

    #[test]
    fn flips_move_the_marker() {
        let flip_h = WebcamTransforms {
            flip_h: true,
            ..Default::default()
        };
        assert_eq!(red_at(&apply_transforms(&marked(), flip_h).unwrap()), (3, 2, (2, 0)));

        let flip_v = WebcamTransforms {
            flip_v: true,
            ..Default::default()
        };
        assert_eq!(red_at(&apply_transforms(&marked(), flip_v).unwrap()), (3, 2, (0, 1)));
    }

    #[test]
    fn rotation_is_counter_clockwise() {
        let rotate = WebcamTransforms {
            rotate: true,
            ..Default::default()
        };
        // top-left ends up bottom-left after a counter-clockwise quarter turn
        assert_eq!(red_at(&apply_transforms(&marked(), rotate).unwrap()), (2, 3, (0, 2)));
    }

    #[test]
    fn garbage_input_is_an_error() {
        assert!(matches!(
            apply_transforms(b"not an image", WebcamTransforms::default()),
            Err(AgentError::Image(_))
        ));
    }
}
