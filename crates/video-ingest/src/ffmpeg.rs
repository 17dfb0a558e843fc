use std::{
    io::{ErrorKind, Read},
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::{Result, anyhow};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::debug;

use crate::types::{CaptureError, Frame, FrameFormat};

/// Frames buffered between the decoder thread and the consumer.
const READER_QUEUE_SIZE: usize = 4;

/// Where frames come from and how ffmpeg should hand them over.
#[derive(Clone, Debug)]
pub struct ReaderOptions {
    /// File path, `rtsp://` URL, `/dev/videoN` or a bare camera index.
    pub uri: String,
    /// ffmpeg decoder name (`h264_rkmpp`, `h264`, ...). `None` lets ffmpeg pick.
    pub decoder: Option<String>,
    /// Layout of the raw frames written to stdout.
    pub pixel_format: FrameFormat,
    /// Optional output size; the stream's native size is probed otherwise.
    pub size: Option<(u32, u32)>,
}

impl ReaderOptions {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            decoder: None,
            pixel_format: FrameFormat::Bgr8,
            size: None,
        }
    }

    pub fn with_decoder(mut self, decoder: Option<String>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_pixel_format(mut self, format: FrameFormat) -> Self {
        self.pixel_format = format;
        self
    }
}

/// Spawns an ffmpeg process decoding `options.uri` and yields raw frames from
/// a background thread. The channel closes at end of stream.
pub fn spawn_reader(options: &ReaderOptions) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let (is_v4l, ffmpeg_uri) = if let Some(index) = parse_device_index(&options.uri) {
        (true, format!("/dev/video{index}"))
    } else {
        (false, options.uri.clone())
    };

    let size = match options.size {
        Some(size) => size,
        None => probe_geometry(&ffmpeg_uri, is_v4l)?,
    };

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    if options.uri.starts_with("rtsp://") || options.uri.starts_with("rtsps://") {
        cmd.arg("-rtsp_transport")
            .arg("tcp")
            .arg("-fflags")
            .arg("nobuffer")
            .arg("-flags")
            .arg("low_delay");
    }

    if is_v4l {
        cmd.arg("-f").arg("video4linux2");
    } else if let Some(decoder) = options.decoder.as_deref() {
        cmd.arg("-c:v").arg(decoder);
    }

    cmd.arg("-i").arg(&ffmpeg_uri).arg("-an");

    if options.size.is_some() {
        cmd.arg("-vf").arg(format!("scale={}:{}", size.0, size.1));
    }

    cmd.arg("-pix_fmt")
        .arg(options.pixel_format.ffmpeg_pix_fmt())
        .arg("-f")
        .arg("rawvideo")
        .arg("-");

    debug!(
        uri = %ffmpeg_uri,
        width = size.0,
        height = size.1,
        decoder = options.decoder.as_deref().unwrap_or("auto"),
        pix_fmt = options.pixel_format.ffmpeg_pix_fmt(),
        "starting ffmpeg reader"
    );

    spawn_ffmpeg_reader(cmd, size, options.pixel_format)
}

/// Ask ffprobe for the first video stream's geometry.
pub fn probe_geometry(uri: &str, is_v4l: bool) -> Result<(u32, u32), CaptureError> {
    let mut cmd = Command::new("ffprobe");
    cmd.arg("-v").arg("error");
    if is_v4l {
        cmd.arg("-f").arg("video4linux2");
    }
    let output = cmd
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height")
        .arg("-of")
        .arg("csv=p=0:s=x")
        .arg(uri)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|err| CaptureError::Other(err.into()))?;

    if !output.status.success() {
        return Err(CaptureError::Open {
            uri: uri.to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_geometry(&stdout).ok_or_else(|| CaptureError::Probe {
        uri: uri.to_string(),
        reason: format!("unexpected ffprobe output {:?}", stdout.trim()),
    })
}

/// Parse ffprobe's `WIDTHxHEIGHT` line.
pub(crate) fn parse_geometry(text: &str) -> Option<(u32, u32)> {
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    let (w, h) = line.split_once('x')?;
    let w = w.trim().parse::<u32>().ok()?;
    let h = h.trim().trim_end_matches('x').parse::<u32>().ok()?;
    if w == 0 || h == 0 {
        return None;
    }
    Some((w, h))
}

/// Parse a `/dev/videoX` style URI or bare index and return the device index.
pub(crate) fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<u32>().ok();
        }
    }
    None
}

fn spawn_ffmpeg_reader(
    mut cmd: Command,
    size: (u32, u32),
    format: FrameFormat,
) -> Result<Receiver<Result<Frame, CaptureError>>> {
    let (tx, rx) = bounded(READER_QUEUE_SIZE);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|err| CaptureError::Other(err.into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    thread::Builder::new()
        .name("ffmpeg-reader".into())
        .spawn(move || {
            if let Err(err) = ffmpeg_loop(stdout, child, size, format, tx.clone()) {
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(rx)
}

fn ffmpeg_loop(
    mut stdout: impl Read,
    mut child: Child,
    size: (u32, u32),
    format: FrameFormat,
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes = format.frame_len(size.0, size.1);
    let mut result = Ok(());

    loop {
        let mut buffer = vec![0u8; frame_bytes];
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let frame = Frame {
                    data: buffer,
                    width: size.0,
                    height: size.1,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format,
                };
                if tx.send(Ok(frame)).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => {
                result = Err(CaptureError::Other(err.into()));
                break;
            }
        }
    }

    let _ = child.kill();
    let _ = child.wait();
    result
}
