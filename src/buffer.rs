use std::{ffi::c_void, fmt, ops::Deref, ptr};

use crate::types::FvmStatusCode;

/// Owned byte region. Move-only: whoever holds it frees it, once, on drop.
#[derive(Default, PartialEq, Eq)]
pub struct FvmBuffer {
    data: Box<[u8]>,
}

impl FvmBuffer {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn from_vec(data: Vec<u8>) -> Self {
        FvmBuffer {
            data: data.into_boxed_slice(),
        }
    }
    pub fn copy_from_slice(data: &[u8]) -> Self {
        FvmBuffer { data: data.into() }
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
    pub fn into_vec(self) -> Vec<u8> {
        self.data.into_vec()
    }

    /// Hands the allocation over to raw parts. An empty buffer yields a null
    /// pointer. The parts must come back through [`FvmBuffer::from_raw_parts`].
    pub fn into_raw_parts(self) -> (*mut u8, usize) {
        if self.data.is_empty() {
            return (ptr::null_mut(), 0);
        }
        let len = self.data.len();
        let data = Box::into_raw(self.data) as *mut u8;
        (data, len)
    }

    /// # Safety
    ///
    /// `data` and `len` must have been produced by [`FvmBuffer::into_raw_parts`]
    /// and not reclaimed before.
    pub unsafe fn from_raw_parts(data: *mut u8, len: usize) -> Self {
        if data.is_null() || len == 0 {
            return Self::new();
        }
        FvmBuffer {
            data: Box::from_raw(ptr::slice_from_raw_parts_mut(data, len)),
        }
    }
}

impl Deref for FvmBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}
impl From<Vec<u8>> for FvmBuffer {
    fn from(value: Vec<u8>) -> Self {
        Self::from_vec(value)
    }
}
impl From<&[u8]> for FvmBuffer {
    fn from(value: &[u8]) -> Self {
        Self::copy_from_slice(value)
    }
}
impl fmt::Debug for FvmBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FvmBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Outcome of one execution.
#[derive(Debug, PartialEq, Eq)]
pub struct FvmResult {
    pub status: FvmStatusCode,
    pub gas_left: i64,
    pub output: FvmBuffer,
}

impl Default for FvmResult {
    fn default() -> Self {
        Self::with_status(FvmStatusCode::Success, 0)
    }
}

impl FvmResult {
    pub fn new(status: FvmStatusCode, gas_left: i64, output: FvmBuffer) -> Self {
        FvmResult {
            status,
            gas_left,
            output,
        }
    }
    pub fn with_status(status: FvmStatusCode, gas_left: i64) -> Self {
        Self::new(status, gas_left, FvmBuffer::new())
    }
    pub fn success(gas_left: i64, output: FvmBuffer) -> Self {
        Self::new(FvmStatusCode::Success, gas_left, output)
    }
    pub fn rejected() -> Self {
        Self::with_status(FvmStatusCode::Rejected, 0)
    }
    pub fn internal_error() -> Self {
        Self::with_status(FvmStatusCode::InternalError, 0)
    }
    pub fn call_depth_exceeded() -> Self {
        Self::with_status(FvmStatusCode::CallDepthExceeded, 0)
    }
    pub fn malformed_input() -> Self {
        Self::with_status(FvmStatusCode::MalformedInput, 0)
    }
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Converts into the C view. The output allocation travels with the
    /// returned value and is freed by its release function.
    pub fn into_raw(self) -> FvmRawResult {
        let (data, len) = self.output.into_raw_parts();
        FvmRawResult {
            status_code: self.status.to_i(),
            gas_left: self.gas_left,
            output_data: data,
            output_size: len,
            release: (!data.is_null()).then_some(release_engine_output as FvmReleaseFn),
            reserved: ptr::null_mut(),
        }
    }
}

pub type FvmReleaseFn = unsafe extern "C" fn(result: *const FvmRawResult);

/// Result as it crosses the host boundary.
///
/// If `release` is set, the consumer calls it exactly once and never frees
/// `output_data` itself. If it is null, the consumer must not free the output.
#[repr(C)]
#[derive(Debug)]
pub struct FvmRawResult {
    pub status_code: i32,
    pub gas_left: i64,
    pub output_data: *const u8,
    pub output_size: usize,
    pub release: Option<FvmReleaseFn>,
    pub reserved: *mut c_void,
}

impl Default for FvmRawResult {
    fn default() -> Self {
        FvmRawResult {
            status_code: FvmStatusCode::Success.to_i(),
            gas_left: 0,
            output_data: ptr::null(),
            output_size: 0,
            release: None,
            reserved: ptr::null_mut(),
        }
    }
}

impl FvmRawResult {
    /// Calls the release function if one is still attached. Later calls are
    /// no-ops.
    ///
    /// # Safety
    ///
    /// `self` must be a result produced by whoever owns the release function,
    /// with its pointers untouched.
    pub unsafe fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release(self);
        }
        self.output_data = ptr::null();
        self.output_size = 0;
    }

    /// Copies the output into an owned result, then releases the raw one.
    ///
    /// # Safety
    ///
    /// `output_data` must be valid for `output_size` bytes (or null), and the
    /// release function, if any, must accept this result.
    pub unsafe fn into_result(mut self) -> FvmResult {
        let output = if self.output_data.is_null() || self.output_size == 0 {
            FvmBuffer::new()
        } else {
            FvmBuffer::copy_from_slice(std::slice::from_raw_parts(
                self.output_data,
                self.output_size,
            ))
        };
        let status = FvmStatusCode::from_i(self.status_code);
        let gas_left = self.gas_left;
        self.release();
        FvmResult::new(status, gas_left, output)
    }
}

unsafe extern "C" fn release_engine_output(result: *const FvmRawResult) {
    let Some(result) = result.as_ref() else {
        return;
    };
    drop(FvmBuffer::from_raw_parts(
        result.output_data as *mut u8,
        result.output_size,
    ));
}

/// Plain owned byte region handed to the host. Freed with `fvm_free_buffer`.
#[repr(C)]
#[derive(Debug)]
pub struct FvmByteBuffer {
    pub data: *mut u8,
    pub len: usize,
}

impl From<FvmBuffer> for FvmByteBuffer {
    fn from(value: FvmBuffer) -> Self {
        let (data, len) = value.into_raw_parts();
        FvmByteBuffer { data, len }
    }
}

impl FvmByteBuffer {
    /// # Safety
    ///
    /// The buffer must come from [`From<FvmBuffer>`] and must not be used
    /// afterwards.
    pub unsafe fn into_buffer(self) -> FvmBuffer {
        FvmBuffer::from_raw_parts(self.data, self.len)
    }
}
