//! Contract for hardware 2D transform engines (resize and colour conversion).
//!
//! Buffers reach the engine in one of two ways: wrapped directly by virtual
//! address ([`Source::Mapped`] / [`Target::Mapped`]) or imported into the
//! engine first ([`ImportedSource`] / [`ImportedTarget`]). Imported handles
//! are released when the guard drops, so every exit path gives them back.

use std::marker::PhantomData;

use thiserror::Error;
use tracing::warn;

mod rga;

pub use rga::RgaAccelerator;

/// Convenient result alias for accelerator operations.
pub type Result<T> = std::result::Result<T, AccelError>;

/// Pixel layouts the 2D engine can address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb888,
    Bgr888,
    /// NV12.
    Yuv420Sp,
    /// NV21.
    Yuv420SpVu,
}

impl PixelFormat {
    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb888 | PixelFormat::Bgr888 => pixels * 3,
            PixelFormat::Yuv420Sp | PixelFormat::Yuv420SpVu => {
                pixels + 2 * (width as usize).div_ceil(2) * (height as usize).div_ceil(2)
            }
        }
    }

    /// Packed three-byte-per-pixel layouts.
    pub fn is_packed(self) -> bool {
        matches!(self, PixelFormat::Rgb888 | PixelFormat::Bgr888)
    }
}

/// Geometry and layout of one image buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Surface {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn len(&self) -> usize {
        self.format.buffer_len(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject buffers too small to hold this surface.
    pub fn check(&self, actual: usize) -> Result<()> {
        let expected = self.len();
        if actual < expected || expected == 0 {
            return Err(AccelError::BufferSize {
                surface: *self,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Opaque registration returned by [`Accelerator::import_virtual`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(u32);

impl BufferHandle {
    /// Zero is the engine's "import failed" value.
    pub fn new(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Read side of an accelerator operation.
#[derive(Debug)]
pub enum Source<'a> {
    Mapped { surface: Surface, data: &'a [u8] },
    Handle { surface: Surface, handle: BufferHandle },
}

impl Source<'_> {
    pub fn surface(&self) -> Surface {
        match self {
            Source::Mapped { surface, .. } | Source::Handle { surface, .. } => *surface,
        }
    }
}

/// Write side of an accelerator operation; written in place.
#[derive(Debug)]
pub enum Target<'a> {
    Mapped {
        surface: Surface,
        data: &'a mut [u8],
    },
    Handle {
        surface: Surface,
        handle: BufferHandle,
    },
}

impl Target<'_> {
    pub fn surface(&self) -> Surface {
        match self {
            Target::Mapped { surface, .. } | Target::Handle { surface, .. } => *surface,
        }
    }
}

#[derive(Debug, Error)]
pub enum AccelError {
    #[error("failed to load {library}: {source}")]
    Load {
        library: String,
        #[source]
        source: libloading::Error,
    },
    #[error("{op} failed: {message} (status {status})")]
    Status {
        op: &'static str,
        status: i32,
        message: String,
    },
    #[error("failed to import {len} byte buffer into the accelerator")]
    Import { len: usize },
    #[error("{surface:?} needs {expected} bytes but the buffer holds {actual}")]
    BufferSize {
        surface: Surface,
        expected: usize,
        actual: usize,
    },
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// A hardware 2D transform engine.
pub trait Accelerator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scale `src` to the size of `dst`. Both must share a packed layout.
    fn resize(&self, src: Source<'_>, dst: Target<'_>) -> Result<()>;

    /// Convert `src` into `dst`'s pixel layout. Sizes must match.
    fn convert_color(&self, src: Source<'_>, dst: Target<'_>) -> Result<()>;

    /// Register host memory with the engine.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay valid and unmoved until the returned
    /// handle is passed to [`Accelerator::release`].
    unsafe fn import_virtual(&self, addr: *mut u8, len: usize) -> Result<BufferHandle>;

    fn release(&self, handle: BufferHandle) -> Result<()>;
}

/// Handle that goes back to the engine on drop.
struct Registration<'a> {
    accel: &'a dyn Accelerator,
    handle: BufferHandle,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.accel.release(self.handle) {
            warn!(
                accelerator = self.accel.name(),
                handle = self.handle.raw(),
                "failed to release imported buffer: {err}"
            );
        }
    }
}

/// Source buffer imported into the engine for the lifetime of the borrow.
pub struct ImportedSource<'a> {
    registration: Registration<'a>,
    surface: Surface,
    _memory: PhantomData<&'a [u8]>,
}

impl<'a> ImportedSource<'a> {
    pub fn new(accel: &'a dyn Accelerator, surface: Surface, data: &'a [u8]) -> Result<Self> {
        surface.check(data.len())?;
        // SAFETY: `data` stays borrowed for 'a, which outlives the registration,
        // and the engine only reads through source handles.
        let handle = unsafe { accel.import_virtual(data.as_ptr().cast_mut(), data.len())? };
        Ok(Self {
            registration: Registration { accel, handle },
            surface,
            _memory: PhantomData,
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.registration.handle
    }

    pub fn as_source(&self) -> Source<'_> {
        Source::Handle {
            surface: self.surface,
            handle: self.registration.handle,
        }
    }
}

/// Destination buffer imported into the engine; holds the exclusive borrow so
/// nothing else touches the memory while the engine may write to it.
pub struct ImportedTarget<'a> {
    registration: Registration<'a>,
    surface: Surface,
    _memory: PhantomData<&'a mut [u8]>,
}

impl<'a> ImportedTarget<'a> {
    pub fn new(accel: &'a dyn Accelerator, surface: Surface, data: &'a mut [u8]) -> Result<Self> {
        surface.check(data.len())?;
        // SAFETY: the exclusive borrow of `data` lives for 'a, which outlives
        // the registration.
        let handle = unsafe { accel.import_virtual(data.as_mut_ptr(), data.len())? };
        Ok(Self {
            registration: Registration { accel, handle },
            surface,
            _memory: PhantomData,
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.registration.handle
    }

    pub fn as_target(&self) -> Target<'_> {
        Target::Handle {
            surface: self.surface,
            handle: self.registration.handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Ledger {
        next: u32,
        live: Vec<u32>,
        released: Vec<u32>,
    }

    #[derive(Default)]
    struct FakeEngine {
        ledger: Mutex<Ledger>,
        fail_import_after: Option<usize>,
    }

    impl Accelerator for FakeEngine {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn resize(&self, _src: Source<'_>, _dst: Target<'_>) -> Result<()> {
            Err(AccelError::Status {
                op: "resize",
                status: -1,
                message: "injected".into(),
            })
        }

        fn convert_color(&self, _src: Source<'_>, _dst: Target<'_>) -> Result<()> {
            Ok(())
        }

        unsafe fn import_virtual(&self, _addr: *mut u8, len: usize) -> Result<BufferHandle> {
            let mut ledger = self.ledger.lock().unwrap();
            if let Some(limit) = self.fail_import_after {
                if ledger.next as usize >= limit {
                    return Err(AccelError::Import { len });
                }
            }
            ledger.next += 1;
            let raw = ledger.next;
            ledger.live.push(raw);
            Ok(BufferHandle::new(raw).unwrap())
        }

        fn release(&self, handle: BufferHandle) -> Result<()> {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.live.retain(|h| *h != handle.raw());
            ledger.released.push(handle.raw());
            Ok(())
        }
    }

    #[test]
    fn surface_check_rejects_short_buffers() {
        let surface = Surface::new(4, 2, PixelFormat::Rgb888);
        assert!(surface.check(24).is_ok());
        assert!(matches!(
            surface.check(23),
            Err(AccelError::BufferSize {
                expected: 24,
                actual: 23,
                ..
            })
        ));
        assert_eq!(Surface::new(4, 2, PixelFormat::Yuv420Sp).len(), 12);
    }

    #[test]
    fn zero_is_not_a_handle() {
        assert!(BufferHandle::new(0).is_none());
        assert_eq!(BufferHandle::new(7).map(BufferHandle::raw), Some(7));
    }

    #[test]
    fn guards_release_once_even_when_the_operation_fails() {
        let engine = FakeEngine::default();
        let surface = Surface::new(2, 2, PixelFormat::Rgb888);
        let src = vec![0u8; 12];
        let mut dst = vec![0u8; 12];
        {
            let s = ImportedSource::new(&engine, surface, &src).unwrap();
            let d = ImportedTarget::new(&engine, surface, &mut dst).unwrap();
            assert!(engine.resize(s.as_source(), d.as_target()).is_err());
        }
        let ledger = engine.ledger.lock().unwrap();
        assert!(ledger.live.is_empty());
        assert_eq!(ledger.released.len(), 2);
    }

    #[test]
    fn source_is_released_when_target_import_fails() {
        let engine = FakeEngine {
            fail_import_after: Some(1),
            ..FakeEngine::default()
        };
        let surface = Surface::new(2, 2, PixelFormat::Bgr888);
        let src = vec![0u8; 12];
        let mut dst = vec![0u8; 12];
        let result = ImportedSource::new(&engine, surface, &src)
            .and_then(|s| ImportedTarget::new(&engine, surface, &mut dst).map(|d| (s, d)));
        assert!(matches!(result, Err(AccelError::Import { .. })));
        let ledger = engine.ledger.lock().unwrap();
        assert!(ledger.live.is_empty());
        assert_eq!(ledger.released, vec![1]);
    }
}
