//! Glue between the V4L2 camera and the detection loop's frame traits.

use image::RgbImage;
use rollcall_core::live::{FrameDevice, FrameSource, SourceError};
use rollcall_hw::{Camera, FrameStream};

pub struct Webcam(Camera);

impl Webcam {
    pub fn open(device: &str, width: u32, height: u32) -> Result<Self, SourceError> {
        Ok(Self(Camera::open(device, width, height)?))
    }
}

pub struct WebcamStream<'a>(FrameStream<'a>);

impl FrameDevice for Webcam {
    type Stream<'a> = WebcamStream<'a>;

    fn start(&self) -> Result<WebcamStream<'_>, SourceError> {
        Ok(WebcamStream(self.0.stream()?))
    }
}

impl FrameSource for WebcamStream<'_> {
    fn next_frame(&mut self) -> Result<RgbImage, SourceError> {
        Ok(self.0.next_frame()?.into_image())
    }
}
