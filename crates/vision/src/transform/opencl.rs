//! OpenCL-backed resize through OpenCV's transparent API.

use opencv::{
    core::{AccessFlag, Mat, Size, UMat, UMatUsageFlags},
    imgproc,
    prelude::*,
};
use video_ingest::Frame;

use crate::error::TransformError;

pub(crate) fn resize(frame: &Frame, width: u32, height: u32) -> Result<Frame, TransformError> {
    if !frame.format.is_packed_rgb() {
        return Err(TransformError::UnsupportedFormat {
            format: frame.format,
            backend: "opencl",
        });
    }
    let data = resize_umat(frame, width, height).map_err(|err| TransformError::Image(err.to_string()))?;
    Ok(Frame {
        data,
        width,
        height,
        timestamp_ms: frame.timestamp_ms,
        format: frame.format,
    })
}

fn resize_umat(frame: &Frame, width: u32, height: u32) -> opencv::Result<Vec<u8>> {
    let flat = Mat::from_slice(&frame.data)?;
    let src = flat.reshape(3, frame.height as i32)?;
    let src = src.get_umat(AccessFlag::ACCESS_READ, UMatUsageFlags::USAGE_DEFAULT)?;
    let mut dst = UMat::new_def();
    imgproc::resize(
        &src,
        &mut dst,
        Size::new(width as i32, height as i32),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;
    // Copy back into host memory before the UMat goes away.
    let mut host = Mat::default();
    dst.copy_to(&mut host)?;
    Ok(host.data_bytes()?.to_vec())
}
