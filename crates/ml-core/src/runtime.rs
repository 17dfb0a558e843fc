use std::fmt;

use thiserror::Error;

/// NPU cores a context can be pinned to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NpuCore {
    Core0,
    Core1,
    Core2,
}

impl NpuCore {
    pub const ALL: [NpuCore; 3] = [NpuCore::Core0, NpuCore::Core1, NpuCore::Core2];

    /// Bit mask understood by the runtime's core selection call.
    pub fn mask(self) -> u32 {
        1 << self.index()
    }

    pub fn index(self) -> usize {
        match self {
            NpuCore::Core0 => 0,
            NpuCore::Core1 => 1,
            NpuCore::Core2 => 2,
        }
    }
}

impl fmt::Display for NpuCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "npu{}", self.index())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorFormat {
    Nchw,
    Nhwc,
    Other(i32),
}

impl TensorFormat {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => TensorFormat::Nchw,
            1 => TensorFormat::Nhwc,
            other => TensorFormat::Other(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorType {
    Float32,
    Float16,
    Int8,
    Uint8,
    Int16,
    Other(i32),
}

impl TensorType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => TensorType::Float32,
            1 => TensorType::Float16,
            2 => TensorType::Int8,
            3 => TensorType::Uint8,
            4 => TensorType::Int16,
            other => TensorType::Other(other),
        }
    }
}

/// Shape and quantisation of one model input or output.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorAttr {
    pub index: u32,
    pub name: String,
    pub dims: Vec<u32>,
    pub n_elems: u32,
    pub size: u32,
    pub format: TensorFormat,
    pub dtype: TensorType,
    pub zero_point: i32,
    pub scale: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IoLayout {
    pub inputs: Vec<TensorAttr>,
    pub outputs: Vec<TensorAttr>,
}

/// Geometry of the first input tensor, independent of its memory order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputShape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub format: TensorFormat,
}

impl InputShape {
    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IoLayout {
    pub fn input_shape(&self) -> Result<InputShape, RuntimeError> {
        let attr = self
            .inputs
            .first()
            .ok_or_else(|| RuntimeError::Layout("model has no inputs".into()))?;
        if attr.dims.len() != 4 {
            return Err(RuntimeError::Layout(format!(
                "input {:?} has {} dims, expected 4",
                attr.name,
                attr.dims.len()
            )));
        }
        let d = &attr.dims;
        let (channels, height, width) = match attr.format {
            TensorFormat::Nchw => (d[1], d[2], d[3]),
            TensorFormat::Nhwc => (d[3], d[1], d[2]),
            TensorFormat::Other(raw) => {
                return Err(RuntimeError::Layout(format!(
                    "input {:?} uses unsupported tensor format {raw}",
                    attr.name
                )));
            }
        };
        Ok(InputShape {
            width,
            height,
            channels,
            format: attr.format,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SdkVersion {
    pub api: String,
    pub driver: String,
}

impl fmt::Display for SdkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "api {} / driver {}", self.api, self.driver)
    }
}

/// Quantised output tensor copied out of the runtime.
#[derive(Clone, Debug, PartialEq)]
pub struct RawOutput {
    pub data: Vec<i8>,
    pub dims: Vec<u32>,
    pub zero_point: i32,
    pub scale: f32,
}

impl RawOutput {
    pub fn dequantize(&self, q: i8) -> f32 {
        (q as f32 - self.zero_point as f32) * self.scale
    }

    pub fn quantize(&self, value: f32) -> i8 {
        (value / self.scale + self.zero_point as f32)
            .round()
            .clamp(i8::MIN as f32, i8::MAX as f32) as i8
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to load {library}: {source}")]
    Load {
        library: String,
        #[source]
        source: libloading::Error,
    },
    #[error("{op} returned {code}")]
    Status { op: &'static str, code: i32 },
    #[error("unexpected tensor layout: {0}")]
    Layout(String),
    #[error("input holds {actual} bytes, model expects {expected}")]
    InputSize { expected: usize, actual: usize },
}

/// Entry point of an inference runtime: turns model bytes into a context.
pub trait InferenceRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// The runtime copies what it needs; `model` may be dropped afterwards.
    fn load_weights(&self, model: &[u8]) -> Result<Box<dyn RuntimeContext>, RuntimeError>;
}

/// One hardware execution context. Dropping it releases the context.
pub trait RuntimeContext: Send {
    /// New context sharing this context's decoded weights.
    fn duplicate(&self) -> Result<Box<dyn RuntimeContext>, RuntimeError>;

    fn set_core_affinity(&mut self, core: NpuCore) -> Result<(), RuntimeError>;

    fn sdk_version(&self) -> Result<SdkVersion, RuntimeError>;

    fn io_layout(&self) -> Result<IoLayout, RuntimeError>;

    /// Run one packed uint8 input through the model and copy the quantised
    /// outputs out.
    fn run_sync(&mut self, input: &[u8]) -> Result<Vec<RawOutput>, RuntimeError>;
}
