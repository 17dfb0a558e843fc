//! Rockchip RGA backend. `librga.so` is opened at runtime so hosts without the
//! engine still start and fall back to software transforms.

use std::{
    ffi::{CStr, OsStr, c_char, c_int, c_void},
    ptr,
};

use libloading::Library;
use tracing::debug;

use crate::{AccelError, Accelerator, BufferHandle, PixelFormat, Result, Source, Surface, Target};

const LIBRGA: &str = "librga.so";

const IM_STATUS_SUCCESS: c_int = 1;
const IM_STATUS_NOERROR: c_int = 2;

const IM_SYNC: c_int = 1;
const INTER_LINEAR: c_int = 1;
const IM_COLOR_SPACE_DEFAULT: c_int = 0;

const RK_FORMAT_RGB_888: c_int = 0x2 << 8;
const RK_FORMAT_BGR_888: c_int = 0x7 << 8;
const RK_FORMAT_YCBCR_420_SP: c_int = 0xa << 8;
const RK_FORMAT_YCRCB_420_SP: c_int = 0xe << 8;

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy)]
struct ImNn {
    scale: [c_int; 3],
    offset: [c_int; 3],
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy)]
union ImPixelOps {
    color: c_int,
    nn: ImNn,
    rop_code: c_int,
}

/// Mirrors `rga_buffer_t` from `im2d_type.h`.
#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy)]
struct RgaBuffer {
    vir_addr: *mut c_void,
    phy_addr: *mut c_void,
    fd: c_int,
    width: c_int,
    height: c_int,
    wstride: c_int,
    hstride: c_int,
    format: c_int,
    color_space_mode: c_int,
    global_alpha: c_int,
    rd_mode: c_int,
    ops: ImPixelOps,
    handle: u32,
}

type WrapVirtualFn =
    unsafe extern "C" fn(*mut c_void, c_int, c_int, c_int, c_int, c_int) -> RgaBuffer;
type WrapHandleFn = unsafe extern "C" fn(u32, c_int, c_int, c_int, c_int, c_int) -> RgaBuffer;
type ImportVirtualFn = unsafe extern "C" fn(*mut c_void, c_int) -> u32;
type ReleaseFn = unsafe extern "C" fn(u32) -> c_int;
type ResizeFn = unsafe extern "C" fn(RgaBuffer, RgaBuffer, f64, f64, c_int, c_int) -> c_int;
type CvtColorFn = unsafe extern "C" fn(RgaBuffer, RgaBuffer, c_int, c_int, c_int, c_int) -> c_int;
type StrErrorFn = unsafe extern "C" fn(c_int) -> *const c_char;

struct RgaApi {
    wrap_virtual: WrapVirtualFn,
    wrap_handle: WrapHandleFn,
    import_virtual: ImportVirtualFn,
    release: ReleaseFn,
    resize: ResizeFn,
    cvtcolor: CvtColorFn,
    str_error: StrErrorFn,
}

/// im2d API bound from `librga.so`.
pub struct RgaAccelerator {
    api: RgaApi,
    // Keeps the function pointers in `api` valid; dropped last.
    _library: Library,
}

impl RgaAccelerator {
    pub fn load() -> Result<Self> {
        Self::load_from(LIBRGA)
    }

    pub fn load_from(path: impl AsRef<OsStr>) -> Result<Self> {
        let path = path.as_ref();
        let load_err = |source| AccelError::Load {
            library: path.to_string_lossy().into_owned(),
            source,
        };
        // SAFETY: librga has no global constructors with preconditions.
        let library = unsafe { Library::new(path) }.map_err(load_err)?;

        // SAFETY: the signatures match im2d.h; the pointers are only used
        // while `library` is alive.
        let api = unsafe {
            RgaApi {
                wrap_virtual: *library
                    .get::<WrapVirtualFn>(b"wrapbuffer_virtualaddr_t\0")
                    .map_err(load_err)?,
                wrap_handle: *library
                    .get::<WrapHandleFn>(b"wrapbuffer_handle_t\0")
                    .map_err(load_err)?,
                import_virtual: *library
                    .get::<ImportVirtualFn>(b"importbuffer_virtualaddr\0")
                    .map_err(load_err)?,
                release: *library
                    .get::<ReleaseFn>(b"releasebuffer_handle\0")
                    .map_err(load_err)?,
                resize: *library.get::<ResizeFn>(b"imresize_t\0").map_err(load_err)?,
                cvtcolor: *library
                    .get::<CvtColorFn>(b"imcvtcolor_t\0")
                    .map_err(load_err)?,
                str_error: *library
                    .get::<StrErrorFn>(b"imStrError_t\0")
                    .map_err(load_err)?,
            }
        };
        debug!(library = %path.to_string_lossy(), "loaded RGA");
        Ok(Self {
            api,
            _library: library,
        })
    }

    fn describe(&self, surface: Surface, addr: *mut c_void, handle: Option<BufferHandle>) -> RgaBuffer {
        let (w, h) = (surface.width as c_int, surface.height as c_int);
        let format = rk_format(surface.format);
        // SAFETY: the wrap helpers only fill a descriptor; no memory is touched.
        unsafe {
            match handle {
                Some(handle) => (self.api.wrap_handle)(handle.raw(), w, h, w, h, format),
                None => (self.api.wrap_virtual)(addr, w, h, w, h, format),
            }
        }
    }

    fn source_buffer(&self, src: &Source<'_>) -> Result<RgaBuffer> {
        Ok(match src {
            Source::Mapped { surface, data } => {
                surface.check(data.len())?;
                self.describe(*surface, data.as_ptr().cast_mut().cast(), None)
            }
            Source::Handle { surface, handle } => self.describe(*surface, ptr::null_mut(), Some(*handle)),
        })
    }

    fn target_buffer(&self, dst: &mut Target<'_>) -> Result<RgaBuffer> {
        Ok(match dst {
            Target::Mapped { surface, data } => {
                surface.check(data.len())?;
                self.describe(*surface, data.as_mut_ptr().cast(), None)
            }
            Target::Handle { surface, handle } => self.describe(*surface, ptr::null_mut(), Some(*handle)),
        })
    }

    fn check(&self, op: &'static str, status: c_int) -> Result<()> {
        if status == IM_STATUS_SUCCESS || status == IM_STATUS_NOERROR {
            return Ok(());
        }
        // SAFETY: imStrError_t returns a static NUL-terminated string.
        let message = unsafe {
            let text = (self.api.str_error)(status);
            if text.is_null() {
                String::from("unknown error")
            } else {
                CStr::from_ptr(text).to_string_lossy().into_owned()
            }
        };
        Err(AccelError::Status {
            op,
            status,
            message,
        })
    }
}

// SAFETY: the im2d entry points are thread-safe; the struct only holds
// function pointers and the library handle.
unsafe impl Send for RgaAccelerator {}
unsafe impl Sync for RgaAccelerator {}

impl Accelerator for RgaAccelerator {
    fn name(&self) -> &'static str {
        "rga"
    }

    fn resize(&self, src: Source<'_>, mut dst: Target<'_>) -> Result<()> {
        let (src_surface, dst_surface) = (src.surface(), dst.surface());
        if !src_surface.format.is_packed() || src_surface.format != dst_surface.format {
            return Err(AccelError::Unsupported(format!(
                "resize {:?} -> {:?}",
                src_surface.format, dst_surface.format
            )));
        }
        let src_buf = self.source_buffer(&src)?;
        let dst_buf = self.target_buffer(&mut dst)?;
        // SAFETY: both descriptors point at live memory sized for their surfaces.
        let status = unsafe { (self.api.resize)(src_buf, dst_buf, 0.0, 0.0, INTER_LINEAR, IM_SYNC) };
        self.check("imresize", status)
    }

    fn convert_color(&self, src: Source<'_>, mut dst: Target<'_>) -> Result<()> {
        let (src_surface, dst_surface) = (src.surface(), dst.surface());
        if (src_surface.width, src_surface.height) != (dst_surface.width, dst_surface.height) {
            return Err(AccelError::Unsupported(format!(
                "colour conversion cannot scale {}x{} -> {}x{}",
                src_surface.width, src_surface.height, dst_surface.width, dst_surface.height
            )));
        }
        let src_buf = self.source_buffer(&src)?;
        let dst_buf = self.target_buffer(&mut dst)?;
        // SAFETY: both descriptors point at live memory sized for their surfaces.
        let status = unsafe {
            (self.api.cvtcolor)(
                src_buf,
                dst_buf,
                rk_format(src_surface.format),
                rk_format(dst_surface.format),
                IM_COLOR_SPACE_DEFAULT,
                IM_SYNC,
            )
        };
        self.check("imcvtcolor", status)
    }

    unsafe fn import_virtual(&self, addr: *mut u8, len: usize) -> Result<BufferHandle> {
        let size = c_int::try_from(len).map_err(|_| AccelError::Import { len })?;
        // SAFETY: the caller guarantees the region outlives the handle.
        let raw = unsafe { (self.api.import_virtual)(addr.cast(), size) };
        BufferHandle::new(raw).ok_or(AccelError::Import { len })
    }

    fn release(&self, handle: BufferHandle) -> Result<()> {
        // SAFETY: `handle` came from importbuffer_virtualaddr on this library.
        let status = unsafe { (self.api.release)(handle.raw()) };
        self.check("releasebuffer_handle", status)
    }
}

fn rk_format(format: PixelFormat) -> c_int {
    match format {
        PixelFormat::Rgb888 => RK_FORMAT_RGB_888,
        PixelFormat::Bgr888 => RK_FORMAT_BGR_888,
        PixelFormat::Yuv420Sp => RK_FORMAT_YCBCR_420_SP,
        PixelFormat::Yuv420SpVu => RK_FORMAT_YCRCB_420_SP,
    }
}
