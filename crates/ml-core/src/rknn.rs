//! Rockchip NPU runtime bound from `librknnrt.so` at runtime.

use std::{
    ffi::{OsStr, c_char, c_int, c_void},
    mem, ptr,
    sync::Arc,
};

use libloading::Library;
use tracing::{debug, warn};

use crate::runtime::{
    InferenceRuntime, IoLayout, NpuCore, RawOutput, RuntimeContext, RuntimeError, SdkVersion,
    TensorAttr, TensorFormat, TensorType,
};

const LIBRKNNRT: &str = "librknnrt.so";

const RKNN_SUCC: c_int = 0;
const RKNN_MAX_DIMS: usize = 16;
const RKNN_MAX_NAME_LEN: usize = 256;

const RKNN_QUERY_IN_OUT_NUM: c_int = 0;
const RKNN_QUERY_INPUT_ATTR: c_int = 1;
const RKNN_QUERY_OUTPUT_ATTR: c_int = 2;
const RKNN_QUERY_SDK_VERSION: c_int = 5;

const RKNN_TENSOR_NHWC: c_int = 1;
const RKNN_TENSOR_UINT8: c_int = 3;

type RknnHandle = u64;

#[repr(C)]
#[derive(Default)]
struct RknnInOutNum {
    n_input: u32,
    n_output: u32,
}

#[allow(dead_code)]
#[repr(C)]
struct RknnTensorAttr {
    index: u32,
    n_dims: u32,
    dims: [u32; RKNN_MAX_DIMS],
    name: [c_char; RKNN_MAX_NAME_LEN],
    n_elems: u32,
    size: u32,
    fmt: c_int,
    dtype: c_int,
    qnt_type: c_int,
    fl: i8,
    zp: i32,
    scale: f32,
    w_stride: u32,
    size_with_stride: u32,
    pass_through: u8,
    h_stride: u32,
}

#[allow(dead_code)]
#[repr(C)]
struct RknnSdkVersion {
    api_version: [c_char; RKNN_MAX_NAME_LEN],
    drv_version: [c_char; RKNN_MAX_NAME_LEN],
}

#[allow(dead_code)]
#[repr(C)]
struct RknnInput {
    index: u32,
    buf: *mut c_void,
    size: u32,
    pass_through: u8,
    dtype: c_int,
    fmt: c_int,
}

#[allow(dead_code)]
#[repr(C)]
struct RknnOutput {
    want_float: u8,
    is_prealloc: u8,
    index: u32,
    buf: *mut c_void,
    size: u32,
}

type InitFn = unsafe extern "C" fn(*mut RknnHandle, *mut c_void, u32, u32, *mut c_void) -> c_int;
type DupContextFn = unsafe extern "C" fn(*mut RknnHandle, *mut RknnHandle) -> c_int;
type SetCoreMaskFn = unsafe extern "C" fn(RknnHandle, c_int) -> c_int;
type QueryFn = unsafe extern "C" fn(RknnHandle, c_int, *mut c_void, u32) -> c_int;
type InputsSetFn = unsafe extern "C" fn(RknnHandle, u32, *mut RknnInput) -> c_int;
type RunFn = unsafe extern "C" fn(RknnHandle, *mut c_void) -> c_int;
type OutputsGetFn = unsafe extern "C" fn(RknnHandle, u32, *mut RknnOutput, *mut c_void) -> c_int;
type OutputsReleaseFn = unsafe extern "C" fn(RknnHandle, u32, *mut RknnOutput) -> c_int;
type DestroyFn = unsafe extern "C" fn(RknnHandle) -> c_int;

struct RknnApi {
    init: InitFn,
    dup_context: DupContextFn,
    set_core_mask: SetCoreMaskFn,
    query: QueryFn,
    inputs_set: InputsSetFn,
    run: RunFn,
    outputs_get: OutputsGetFn,
    outputs_release: OutputsReleaseFn,
    destroy: DestroyFn,
    _library: Library,
}

// SAFETY: only immutable function pointers plus the library handle that keeps
// them mapped; per-context calls are serialised by the owning context.
unsafe impl Send for RknnApi {}
unsafe impl Sync for RknnApi {}

impl RknnApi {
    fn check(op: &'static str, code: c_int) -> Result<(), RuntimeError> {
        if code == RKNN_SUCC {
            Ok(())
        } else {
            Err(RuntimeError::Status { op, code })
        }
    }

    unsafe fn query<T>(&self, handle: RknnHandle, cmd: c_int, info: &mut T) -> Result<(), RuntimeError> {
        // SAFETY: `info` is a properly sized repr(C) struct for `cmd`.
        let code = unsafe {
            (self.query)(handle, cmd, (info as *mut T).cast(), mem::size_of::<T>() as u32)
        };
        Self::check("rknn_query", code)
    }
}

/// `librknnrt.so` loader; every context it creates keeps the library alive.
pub struct RknnRuntime {
    api: Arc<RknnApi>,
}

impl RknnRuntime {
    pub fn load() -> Result<Self, RuntimeError> {
        Self::load_from(LIBRKNNRT)
    }

    pub fn load_from(path: impl AsRef<OsStr>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let load_err = |source| RuntimeError::Load {
            library: path.to_string_lossy().into_owned(),
            source,
        };
        // SAFETY: opening the runtime has no preconditions beyond a valid path.
        let library = unsafe { Library::new(path) }.map_err(load_err)?;
        // SAFETY: signatures follow rknn_api.h.
        let api = unsafe {
            RknnApi {
                init: *library.get::<InitFn>(b"rknn_init\0").map_err(load_err)?,
                dup_context: *library
                    .get::<DupContextFn>(b"rknn_dup_context\0")
                    .map_err(load_err)?,
                set_core_mask: *library
                    .get::<SetCoreMaskFn>(b"rknn_set_core_mask\0")
                    .map_err(load_err)?,
                query: *library.get::<QueryFn>(b"rknn_query\0").map_err(load_err)?,
                inputs_set: *library
                    .get::<InputsSetFn>(b"rknn_inputs_set\0")
                    .map_err(load_err)?,
                run: *library.get::<RunFn>(b"rknn_run\0").map_err(load_err)?,
                outputs_get: *library
                    .get::<OutputsGetFn>(b"rknn_outputs_get\0")
                    .map_err(load_err)?,
                outputs_release: *library
                    .get::<OutputsReleaseFn>(b"rknn_outputs_release\0")
                    .map_err(load_err)?,
                destroy: *library.get::<DestroyFn>(b"rknn_destroy\0").map_err(load_err)?,
                _library: library,
            }
        };
        debug!(library = %path.to_string_lossy(), "loaded rknn runtime");
        Ok(Self { api: Arc::new(api) })
    }
}

impl InferenceRuntime for RknnRuntime {
    fn name(&self) -> &'static str {
        "rknn"
    }

    fn load_weights(&self, model: &[u8]) -> Result<Box<dyn RuntimeContext>, RuntimeError> {
        let size = u32::try_from(model.len()).map_err(|_| RuntimeError::InputSize {
            expected: u32::MAX as usize,
            actual: model.len(),
        })?;
        let mut handle: RknnHandle = 0;
        // SAFETY: rknn_init copies the model; the buffer is only read here.
        let code = unsafe {
            (self.api.init)(
                &mut handle,
                model.as_ptr().cast_mut().cast(),
                size,
                0,
                ptr::null_mut(),
            )
        };
        RknnApi::check("rknn_init", code)?;
        RknnContext::wrap(self.api.clone(), handle).map(|ctx| Box::new(ctx) as Box<dyn RuntimeContext>)
    }
}

struct RknnContext {
    api: Arc<RknnApi>,
    handle: RknnHandle,
    layout: IoLayout,
}

impl RknnContext {
    /// Takes ownership of `handle`; it is destroyed on drop even if the
    /// layout query fails.
    fn wrap(api: Arc<RknnApi>, handle: RknnHandle) -> Result<Self, RuntimeError> {
        let mut ctx = Self {
            api,
            handle,
            layout: IoLayout::default(),
        };
        ctx.layout = ctx.query_layout()?;
        Ok(ctx)
    }

    fn query_layout(&self) -> Result<IoLayout, RuntimeError> {
        let mut io = RknnInOutNum::default();
        // SAFETY: RknnInOutNum matches rknn_input_output_num.
        unsafe { self.api.query(self.handle, RKNN_QUERY_IN_OUT_NUM, &mut io)? };

        let inputs = (0..io.n_input)
            .map(|i| self.query_attr(RKNN_QUERY_INPUT_ATTR, i))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = (0..io.n_output)
            .map(|i| self.query_attr(RKNN_QUERY_OUTPUT_ATTR, i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IoLayout { inputs, outputs })
    }

    fn query_attr(&self, cmd: c_int, index: u32) -> Result<TensorAttr, RuntimeError> {
        // SAFETY: all-zero is a valid RknnTensorAttr.
        let mut raw: RknnTensorAttr = unsafe { mem::zeroed() };
        raw.index = index;
        // SAFETY: RknnTensorAttr matches rknn_tensor_attr.
        unsafe { self.api.query(self.handle, cmd, &mut raw)? };
        Ok(convert_attr(&raw))
    }
}

impl RuntimeContext for RknnContext {
    fn duplicate(&self) -> Result<Box<dyn RuntimeContext>, RuntimeError> {
        let mut src = self.handle;
        let mut dst: RknnHandle = 0;
        // SAFETY: both pointers reference live locals.
        let code = unsafe { (self.api.dup_context)(&mut src, &mut dst) };
        RknnApi::check("rknn_dup_context", code)?;
        RknnContext::wrap(self.api.clone(), dst).map(|ctx| Box::new(ctx) as Box<dyn RuntimeContext>)
    }

    fn set_core_affinity(&mut self, core: NpuCore) -> Result<(), RuntimeError> {
        // SAFETY: handle is live for the lifetime of self.
        let code = unsafe { (self.api.set_core_mask)(self.handle, core.mask() as c_int) };
        RknnApi::check("rknn_set_core_mask", code)
    }

    fn sdk_version(&self) -> Result<SdkVersion, RuntimeError> {
        // SAFETY: all-zero is a valid RknnSdkVersion.
        let mut raw: RknnSdkVersion = unsafe { mem::zeroed() };
        // SAFETY: RknnSdkVersion matches rknn_sdk_version.
        unsafe { self.api.query(self.handle, RKNN_QUERY_SDK_VERSION, &mut raw)? };
        Ok(SdkVersion {
            api: c_chars_to_string(&raw.api_version),
            driver: c_chars_to_string(&raw.drv_version),
        })
    }

    fn io_layout(&self) -> Result<IoLayout, RuntimeError> {
        Ok(self.layout.clone())
    }

    fn run_sync(&mut self, input: &[u8]) -> Result<Vec<RawOutput>, RuntimeError> {
        let expected = self.layout.input_shape()?.len();
        if input.len() != expected {
            return Err(RuntimeError::InputSize {
                expected,
                actual: input.len(),
            });
        }

        let mut tensor = RknnInput {
            index: 0,
            buf: input.as_ptr().cast_mut().cast(),
            size: input.len() as u32,
            pass_through: 0,
            dtype: RKNN_TENSOR_UINT8,
            fmt: RKNN_TENSOR_NHWC,
        };
        // SAFETY: `tensor.buf` stays borrowed until rknn_run returns.
        unsafe {
            RknnApi::check("rknn_inputs_set", (self.api.inputs_set)(self.handle, 1, &mut tensor))?;
            RknnApi::check("rknn_run", (self.api.run)(self.handle, ptr::null_mut()))?;
        }

        let count = self.layout.outputs.len();
        let mut raw: Vec<RknnOutput> = (0..count as u32)
            .map(|index| RknnOutput {
                want_float: 0,
                is_prealloc: 0,
                index,
                buf: ptr::null_mut(),
                size: 0,
            })
            .collect();
        // SAFETY: `raw` holds `count` entries.
        let code = unsafe {
            (self.api.outputs_get)(self.handle, count as u32, raw.as_mut_ptr(), ptr::null_mut())
        };
        RknnApi::check("rknn_outputs_get", code)?;

        let outputs = raw
            .iter()
            .zip(&self.layout.outputs)
            .map(|(out, attr)| {
                let data = if out.buf.is_null() {
                    Vec::new()
                } else {
                    // SAFETY: the runtime owns `size` bytes at `buf` until release.
                    unsafe { std::slice::from_raw_parts(out.buf.cast::<i8>(), out.size as usize) }
                        .to_vec()
                };
                RawOutput {
                    data,
                    dims: attr.dims.clone(),
                    zero_point: attr.zero_point,
                    scale: attr.scale,
                }
            })
            .collect();

        // SAFETY: releases exactly the buffers handed out above.
        let code = unsafe { (self.api.outputs_release)(self.handle, count as u32, raw.as_mut_ptr()) };
        if let Err(err) = RknnApi::check("rknn_outputs_release", code) {
            warn!("{err}");
        }
        Ok(outputs)
    }
}

impl Drop for RknnContext {
    fn drop(&mut self) {
        // SAFETY: the handle is owned by this context and destroyed once.
        let code = unsafe { (self.api.destroy)(self.handle) };
        if let Err(err) = RknnApi::check("rknn_destroy", code) {
            warn!(handle = self.handle, "failed to release NPU context: {err}");
        }
    }
}

fn convert_attr(raw: &RknnTensorAttr) -> TensorAttr {
    let n_dims = (raw.n_dims as usize).min(RKNN_MAX_DIMS);
    TensorAttr {
        index: raw.index,
        name: c_chars_to_string(&raw.name),
        dims: raw.dims[..n_dims].to_vec(),
        n_elems: raw.n_elems,
        size: raw.size,
        format: TensorFormat::from_raw(raw.fmt),
        dtype: TensorType::from_raw(raw.dtype),
        zero_point: raw.zp,
        scale: raw.scale,
    }
}

fn c_chars_to_string(chars: &[c_char]) -> String {
    let bytes: Vec<u8> = chars.iter().take_while(|c| **c != 0).map(|c| *c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_conversion_truncates_dims_and_name() {
        let mut raw: RknnTensorAttr = unsafe { mem::zeroed() };
        raw.index = 2;
        raw.n_dims = 4;
        raw.dims[..4].copy_from_slice(&[1, 255, 20, 20]);
        for (dst, src) in raw.name.iter_mut().zip(b"output2") {
            *dst = *src as c_char;
        }
        raw.fmt = 0;
        raw.dtype = 2;
        raw.zp = -128;
        raw.scale = 0.5;

        let attr = convert_attr(&raw);
        assert_eq!(attr.dims, vec![1, 255, 20, 20]);
        assert_eq!(attr.name, "output2");
        assert_eq!(attr.format, TensorFormat::Nchw);
        assert_eq!(attr.dtype, TensorType::Int8);
        assert_eq!((attr.zero_point, attr.scale), (-128, 0.5));
    }

    #[test]
    fn missing_library_is_a_load_error() {
        assert!(matches!(
            RknnRuntime::load_from("/nonexistent/librknnrt.so"),
            Err(RuntimeError::Load { .. })
        ));
    }
}
