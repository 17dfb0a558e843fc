//! Command-line surface of `npu-detect`.
//!
//! Flags are parsed with clap and converted once into an [`AppConfig`]; no
//! stage re-reads arguments afterwards.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, ValueEnum};
use video_ingest::{FrameFormat, ReaderOptions};
use vision::{Accel2d, DetectorConfig, MemoryMapping, TelemetryOptions};

/// Software decoder tried when the configured one produces no frames.
const FALLBACK_DECODER: &str = "h264";

#[derive(Debug, Parser)]
#[command(name = "npu-detect", version, about = "Ordered multi-core NPU object detection")]
pub struct Cli {
    #[command(flatten)]
    pub detect: DetectArgs,
}

/// Raw layout requested from the decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum IngestFormat {
    #[default]
    Bgr24,
    /// Decoder-native semi-planar output, converted before inference.
    Nv12,
}

impl From<IngestFormat> for FrameFormat {
    fn from(format: IngestFormat) -> Self {
        match format {
            IngestFormat::Bgr24 => FrameFormat::Bgr8,
            IngestFormat::Nv12 => FrameFormat::Nv12,
        }
    }
}

#[derive(Debug, Args)]
pub struct DetectArgs {
    /// RKNN model file.
    #[arg(short = 'm', long = "model", value_name = "PATH")]
    pub model: PathBuf,
    /// Video file, rtsp:// URL, /dev/videoN or camera index.
    #[arg(short = 'i', long = "input", value_name = "URI")]
    pub input: String,
    /// 2D backend used for colour conversion and resize.
    #[arg(short = 'a', long = "accel", value_enum, default_value_t = Accel2d::Rga)]
    pub accel: Accel2d,
    /// Buffer hand-off used by the RGA backend.
    #[arg(long = "mapping", value_enum, default_value_t = MemoryMapping::Direct)]
    pub mapping: MemoryMapping,
    /// Number of model replicas (one worker thread each).
    #[arg(short = 't', long = "threads", value_name = "N", default_value_t = 1)]
    pub threads: usize,
    /// Use OpenCL for software resizes.
    #[arg(short = 'c', long = "opencl", action = clap::ArgAction::SetTrue)]
    pub opencl: bool,
    /// ffmpeg decoder; `auto` lets ffmpeg choose.
    #[arg(short = 'd', long = "decoder", value_name = "NAME", default_value = "h264_rkmpp")]
    pub decoder: String,
    /// Raw frame layout requested from the decoder.
    #[arg(long = "pixel-format", value_enum, default_value_t = IngestFormat::Bgr24)]
    pub pixel_format: IngestFormat,
    /// Draw the measured FPS onto each frame.
    #[arg(short = 's', long = "screen-fps", action = clap::ArgAction::SetTrue)]
    pub screen_fps: bool,
    /// Log the measured FPS once per second.
    #[arg(short = 'p', long = "print-fps", action = clap::ArgAction::SetTrue)]
    pub print_fps: bool,
    /// Debug-level logging.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Detection confidence threshold.
    #[arg(long = "conf", value_name = "SCORE", default_value_t = DetectorConfig::DEFAULT_CONF_THRESHOLD)]
    pub conf: f32,
    /// IoU threshold for non-maximum suppression.
    #[arg(long = "nms", value_name = "IOU", default_value_t = DetectorConfig::DEFAULT_NMS_THRESHOLD)]
    pub nms: f32,
    /// Fail frames the 2D engine cannot handle instead of using software.
    #[arg(long = "no-fallback", action = clap::ArgAction::SetTrue)]
    pub no_fallback: bool,
    /// Preview server port.
    #[arg(long = "port", value_name = "PORT", default_value_t = 8080)]
    pub port: u16,
    /// Do not start the preview server.
    #[arg(long = "no-preview", action = clap::ArgAction::SetTrue)]
    pub no_preview: bool,
    /// JPEG quality of preview frames (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub reader: ReaderOptions,
    /// Decoder retried once if `reader.decoder` yields nothing.
    pub fallback_decoder: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DisplayOptions {
    pub screen_fps: bool,
    pub print_fps: bool,
    /// `None` disables the preview server.
    pub preview_port: Option<u16>,
    pub jpeg_quality: u8,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub detector: DetectorConfig,
    pub ingest: IngestOptions,
    pub display: DisplayOptions,
    pub telemetry: TelemetryOptions,
}

impl TryFrom<DetectArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: DetectArgs) -> Result<Self> {
        if !args.model.is_file() {
            bail!("model file {} does not exist", args.model.display());
        }
        if is_local_path(&args.input) && !Path::new(&args.input).exists() {
            bail!("input {} does not exist", args.input);
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let mut detector = DetectorConfig::new(args.model)
            .with_replicas(args.threads)
            .with_accel(args.accel, args.mapping);
        detector.opencl = args.opencl;
        detector.software_fallback = !args.no_fallback;
        detector.conf_threshold = args.conf;
        detector.nms_threshold = args.nms;
        detector.validate().context("invalid detector configuration")?;

        let decoder = match args.decoder.as_str() {
            "" | "auto" => None,
            name => Some(name.to_string()),
        };
        let fallback_decoder = match decoder.as_deref() {
            Some(FALLBACK_DECODER) | None => None,
            Some(_) => Some(FALLBACK_DECODER.to_string()),
        };
        let reader = ReaderOptions::new(args.input)
            .with_decoder(decoder)
            .with_pixel_format(args.pixel_format.into());

        Ok(Self {
            detector,
            ingest: IngestOptions {
                reader,
                fallback_decoder,
            },
            display: DisplayOptions {
                screen_fps: args.screen_fps,
                print_fps: args.print_fps,
                preview_port: (!args.no_preview).then_some(args.port),
                jpeg_quality: args.jpeg_quality,
            },
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                default_filter: Some(if args.verbose { "debug" } else { "info" }.to_string()),
            },
        })
    }
}

/// Streams and capture devices are not checked on disk.
fn is_local_path(input: &str) -> bool {
    !(input.contains("://")
        || input.starts_with("/dev/video")
        || (!input.is_empty() && input.chars().all(|c| c.is_ascii_digit())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(model: &Path, extra: &[&str]) -> Result<AppConfig> {
        let mut argv = vec![
            "npu-detect".to_string(),
            "-m".into(),
            model.display().to_string(),
            "-i".into(),
            "rtsp://camera/stream".into(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        let cli = Cli::try_parse_from(argv)?;
        AppConfig::try_from(cli.detect)
    }

    #[test]
    fn defaults_follow_the_board_setup() {
        let model = tempfile::NamedTempFile::new().unwrap();
        let config = parse(model.path(), &[]).unwrap();
        assert_eq!(config.detector.replicas, 1);
        assert_eq!(config.detector.accel, Accel2d::Rga);
        assert_eq!(config.detector.mapping, MemoryMapping::Direct);
        assert!(config.detector.software_fallback);
        assert_eq!(config.ingest.reader.decoder.as_deref(), Some("h264_rkmpp"));
        assert_eq!(config.ingest.fallback_decoder.as_deref(), Some("h264"));
        assert_eq!(config.ingest.reader.pixel_format, FrameFormat::Bgr8);
        assert_eq!(config.display.preview_port, Some(8080));
        assert_eq!(config.telemetry.default_filter.as_deref(), Some("info"));
    }

    #[test]
    fn flags_map_onto_config() {
        let model = tempfile::NamedTempFile::new().unwrap();
        let config = parse(
            model.path(),
            &[
                "-t", "3", "-a", "software", "--mapping", "imported", "-d", "auto",
                "--pixel-format", "nv12", "-s", "-p", "-v", "--no-fallback", "--no-preview",
                "--conf", "0.5",
            ],
        )
        .unwrap();
        assert_eq!(config.detector.replicas, 3);
        assert_eq!(config.detector.accel, Accel2d::Software);
        assert_eq!(config.detector.mapping, MemoryMapping::Imported);
        assert!(!config.detector.software_fallback);
        assert_eq!(config.detector.conf_threshold, 0.5);
        assert_eq!(config.ingest.reader.decoder, None);
        assert_eq!(config.ingest.fallback_decoder, None);
        assert_eq!(config.ingest.reader.pixel_format, FrameFormat::Nv12);
        assert!(config.display.screen_fps && config.display.print_fps);
        assert_eq!(config.display.preview_port, None);
        assert_eq!(config.telemetry.default_filter.as_deref(), Some("debug"));
    }

    #[test]
    fn bad_values_are_rejected() {
        let model = tempfile::NamedTempFile::new().unwrap();
        assert!(parse(model.path(), &["-t", "0"]).is_err());
        assert!(parse(model.path(), &["--nms", "1.5"]).is_err());
        assert!(parse(model.path(), &["--jpeg-quality", "0"]).is_err());
        assert!(parse(Path::new("/nonexistent/model.rknn"), &[]).is_err());
    }

    #[test]
    fn missing_local_input_is_rejected() {
        let model = tempfile::NamedTempFile::new().unwrap();
        let cli = Cli::try_parse_from([
            "npu-detect",
            "-m",
            model.path().to_str().unwrap(),
            "-i",
            "/nonexistent/clip.mp4",
        ])
        .unwrap();
        assert!(AppConfig::try_from(cli.detect).is_err());
    }

    #[test]
    fn streams_and_devices_skip_the_file_check() {
        assert!(!is_local_path("rtsp://10.0.0.2/live"));
        assert!(!is_local_path("/dev/video0"));
        assert!(!is_local_path("0"));
        assert!(is_local_path("clip.mp4"));
    }
}
