use serde::{Deserialize, Serialize};

/// Pixel coordinates of the nozzle tip in the camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NozzleTip {
    #[serde(rename = "nozzle_tip_coords_x")]
    pub x: i64,
    #[serde(rename = "nozzle_tip_coords_y")]
    pub y: i64,
}

impl Default for NozzleTip {
    fn default() -> Self {
        Self { x: 10, y: 10 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebcamTransforms {
    pub flip_h: bool,
    pub flip_v: bool,
    /// Rotate the frame a quarter turn counter-clockwise.
    pub rotate: bool,
}
