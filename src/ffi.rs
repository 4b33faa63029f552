//! C entry points for native hosts and native compiler backends.
//!
//! A host registers its callback slots and compiler once through
//! [`fvm_create_instance`], then runs programs with [`fvm_execute`], passing
//! the call context in the wire layout described in [`crate::codec`].
//! Routines produced by a native compiler receive an opaque site pointer and
//! reach the host through the `fvm_site_*` functions. A site pointer is only
//! valid while the routine it was passed to is running.

use std::{
    ffi::{c_char, c_void, CStr, CString},
    panic::{catch_unwind, AssertUnwindSafe},
    ptr, slice,
};

use once_cell::sync::OnceCell;
use tracing::error;

use crate::{
    buffer::{FvmBuffer, FvmByteBuffer, FvmRawResult, FvmResult},
    codec::{self, FVM_CONTEXT_WIRE_VERSION},
    compiler::{FvmCompileRequest, FvmCompiler, FvmRoutine},
    dispatch::FVM_CALL_FAILURE,
    engine::{FvmEngine, FvmEngineConfig},
    host::{FvmCallbackTable, FvmRawTxContext},
    types::*,
    vm::FvmExecSite,
};

pub type FvmNativeEntry = unsafe extern "C" fn(site: *mut c_void) -> i32;

/// Compiler backend implemented in native code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FvmCompilerTable {
    pub obj: *mut c_void,
    /// Returns null when the program cannot be compiled. `code_id` is a
    /// NUL-terminated string.
    pub compile: Option<
        unsafe extern "C" fn(
            obj: *mut c_void,
            code: *const u8,
            code_size: usize,
            revision: i32,
            is_static: i32,
            code_id: *const c_char,
        ) -> Option<FvmNativeEntry>,
    >,
    pub code_memory_size: Option<unsafe extern "C" fn(obj: *mut c_void) -> u64>,
    pub reset: Option<unsafe extern "C" fn(obj: *mut c_void)>,
}

// The backend must tolerate calls from any thread; `reset` is never
// concurrent with `compile`.
unsafe impl Send for FvmCompilerTable {}
unsafe impl Sync for FvmCompilerTable {}

impl FvmCompiler for FvmCompilerTable {
    fn compile(&self, request: &FvmCompileRequest<'_>) -> Option<FvmRoutine> {
        let compile = self.compile?;
        let code_id = CString::new(request.code_id.as_str()).ok()?;
        let entry = unsafe {
            compile(
                self.obj,
                request.code.as_ptr(),
                request.code.len(),
                request.revision.to_i(),
                request.is_static as i32,
                code_id.as_ptr(),
            )
        }?;
        Some(FvmRoutine::new(move |site| {
            let site = site as *mut FvmExecSite<'_> as *mut c_void;
            FvmReturnCode::from_i(unsafe { entry(site) })
        }))
    }
    fn code_memory_size(&self) -> u64 {
        match self.code_memory_size {
            Some(f) => unsafe { f(self.obj) },
            None => 0,
        }
    }
    fn reset(&self) {
        if let Some(f) = self.reset {
            unsafe { f(self.obj) }
        }
    }
}

static INSTANCE: OnceCell<FvmEngine> = OnceCell::new();

unsafe fn bytes<'a>(data: *const u8, len: usize) -> &'a [u8] {
    if data.is_null() || len == 0 {
        &[]
    } else {
        slice::from_raw_parts(data, len)
    }
}

unsafe fn bytes_mut<'a>(data: *mut u8, len: usize) -> &'a mut [u8] {
    if data.is_null() || len == 0 {
        &mut []
    } else {
        slice::from_raw_parts_mut(data, len)
    }
}

unsafe fn engine<'a>(instance: *const c_void) -> Option<&'a FvmEngine> {
    (instance as *const FvmEngine).as_ref()
}

fn catch_boundary(f: impl FnOnce() -> FvmResult) -> FvmResult {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!("panic caught at the engine boundary");
        FvmResult::internal_error()
    })
}

/// Returns the process-wide engine, creating it on the first call with the
/// given tables and the options in `FASTVM_OPTIONS`. Later calls return the
/// same instance and ignore their arguments. Null on failure.
#[no_mangle]
pub extern "C" fn fvm_create_instance(
    callbacks: FvmCallbackTable,
    compiler: FvmCompilerTable,
) -> *const c_void {
    let engine = INSTANCE.get_or_try_init(|| {
        let config = FvmEngineConfig::from_env()?;
        FvmEngine::builder(compiler)
            .with_host(callbacks)
            .with_config(config)
            .build()
    });
    match engine {
        Ok(engine) => engine as *const FvmEngine as *const c_void,
        Err(e) => {
            error!("failed to create engine: {e}");
            ptr::null()
        }
    }
}

/// The singleton lives until process exit.
#[no_mangle]
pub extern "C" fn fvm_destroy(_instance: *const c_void) {}

#[no_mangle]
pub extern "C" fn fvm_context_wire_version() -> u32 {
    FVM_CONTEXT_WIRE_VERSION
}

/// # Safety
///
/// `name` and `value` must be null or NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn fvm_set_option(
    instance: *const c_void,
    name: *const c_char,
    value: *const c_char,
) -> bool {
    let Some(engine) = engine(instance) else {
        return false;
    };
    if name.is_null() || value.is_null() {
        return false;
    }
    let (Ok(name), Ok(value)) = (CStr::from_ptr(name).to_str(), CStr::from_ptr(value).to_str())
    else {
        return false;
    };
    engine.set_option(name, value)
}

unsafe fn execute_wire(
    instance: *const c_void,
    handle: *mut c_void,
    revision: i32,
    context: &[u8],
    code: &[u8],
) -> FvmResult {
    let Some(engine) = engine(instance) else {
        error!("execute called without an engine instance");
        return FvmResult::internal_error();
    };
    let Some(revision) = FvmRevision::try_from_i(revision) else {
        error!(revision, "unknown revision");
        return FvmResult::malformed_input();
    };
    let (msg, tx) = match codec::decode_context(context) {
        Ok(decoded) => decoded,
        Err(e) => {
            error!(context_size = context.len(), "malformed call context: {e}");
            return FvmResult::malformed_input();
        }
    };
    engine.execute(FvmHostHandle::from_ptr(handle), &tx, revision, &msg, code)
}

/// Runs `code` for the call context in `context`. The returned result must be
/// passed to [`fvm_release_result`] once.
///
/// # Safety
///
/// The buffers must be valid for their sizes for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn fvm_execute(
    instance: *const c_void,
    handle: *mut c_void,
    revision: i32,
    context: *const u8,
    context_size: usize,
    code: *const u8,
    code_size: usize,
) -> FvmRawResult {
    let (context, code) = (bytes(context, context_size), bytes(code, code_size));
    catch_boundary(|| execute_wire(instance, handle, revision, context, code)).into_raw()
}

/// Like [`fvm_execute`], but returns the result in its wire layout. Free it
/// with [`fvm_free_buffer`].
///
/// # Safety
///
/// Same as [`fvm_execute`].
#[no_mangle]
pub unsafe extern "C" fn fvm_execute_encoded(
    instance: *const c_void,
    handle: *mut c_void,
    revision: i32,
    context: *const u8,
    context_size: usize,
    code: *const u8,
    code_size: usize,
) -> FvmByteBuffer {
    let (context, code) = (bytes(context, context_size), bytes(code, code_size));
    let result = catch_boundary(|| execute_wire(instance, handle, revision, context, code));
    let encoded = codec::encode_result(&result)
        .or_else(|e| {
            error!("failed to encode result: {e}");
            codec::encode_result(&FvmResult::internal_error())
        })
        .unwrap_or_default();
    FvmBuffer::from_vec(encoded).into()
}

/// # Safety
///
/// `result` must be null or a result returned by this library.
#[no_mangle]
pub unsafe extern "C" fn fvm_release_result(result: *mut FvmRawResult) {
    if let Some(result) = result.as_mut() {
        result.release();
    }
}

/// # Safety
///
/// `buffer` must come from this library and not have been freed.
#[no_mangle]
pub unsafe extern "C" fn fvm_free_buffer(buffer: FvmByteBuffer) {
    drop(buffer.into_buffer());
}

/// Runs `f` on the site behind `site`. A panic inside the engine or host
/// yields `default` instead of unwinding into the native routine.
unsafe fn with_site<R>(site: *mut c_void, default: R, f: impl FnOnce(&mut FvmExecSite<'_>) -> R) -> R {
    match (site as *mut FvmExecSite<'_>).as_mut() {
        Some(site) => catch_unwind(AssertUnwindSafe(|| f(site))).unwrap_or_else(|_| {
            error!("panic caught in a site helper");
            default
        }),
        None => default,
    }
}

/// # Safety
///
/// Every `fvm_site_*` function requires the site pointer passed to the
/// running routine, and pointer arguments valid for their sizes.
#[no_mangle]
pub unsafe extern "C" fn fvm_site_gas_left(site: *mut c_void) -> i64 {
    with_site(site, 0, |site| site.gas_left())
}

#[no_mangle]
pub unsafe extern "C" fn fvm_site_set_gas_left(site: *mut c_void, gas: i64) {
    with_site(site, (), |site| site.set_gas_left(gas))
}

/// Writes the input size to `size` and returns the input bytes.
#[no_mangle]
pub unsafe extern "C" fn fvm_site_input(site: *mut c_void, size: *mut usize) -> *const u8 {
    let (data, len) = with_site(site, (ptr::null(), 0), |site| {
        let input = site.message().input;
        (input.as_ptr(), input.len())
    });
    if let Some(size) = size.as_mut() {
        *size = len;
    }
    data
}

#[no_mangle]
pub unsafe extern "C" fn fvm_site_set_output(site: *mut c_void, data: *const u8, size: usize) {
    with_site(site, (), |site| site.set_output(bytes(data, size)))
}

#[no_mangle]
pub unsafe extern "C" fn fvm_site_exists(site: *mut c_void, address: *const FvmAddress) -> i32 {
    let Some(address) = address.as_ref() else {
        return 0;
    };
    with_site(site, 0, |site| site.exists(address) as i32)
}

#[no_mangle]
pub unsafe extern "C" fn fvm_site_get_storage(
    site: *mut c_void,
    key: *const FvmWord,
    result: *mut FvmWord,
) {
    let (Some(key), Some(result)) = (key.as_ref(), result.as_mut()) else {
        return;
    };
    *result = with_site(site, FvmWord::ZERO, |site| site.get_storage(key));
}

#[no_mangle]
pub unsafe extern "C" fn fvm_site_set_storage(
    site: *mut c_void,
    key: *const FvmWord,
    value: *const FvmWord,
) {
    let (Some(key), Some(value)) = (key.as_ref(), value.as_ref()) else {
        return;
    };
    with_site(site, (), |site| site.set_storage(key, value))
}

#[no_mangle]
pub unsafe extern "C" fn fvm_site_get_balance(
    site: *mut c_void,
    address: *const FvmAddress,
    result: *mut FvmWord,
) {
    let (Some(address), Some(result)) = (address.as_ref(), result.as_mut()) else {
        return;
    };
    *result = with_site(site, FvmWord::ZERO, |site| site.get_balance(address));
}

/// The returned copy belongs to the caller; free it with [`fvm_free_buffer`].
#[no_mangle]
pub unsafe extern "C" fn fvm_site_get_code(
    site: *mut c_void,
    address: *const FvmAddress,
) -> FvmByteBuffer {
    let code = match address.as_ref() {
        Some(address) => with_site(site, FvmBuffer::new(), |site| site.get_code(address)),
        None => FvmBuffer::new(),
    };
    code.into()
}

#[no_mangle]
pub unsafe extern "C" fn fvm_site_self_destruct(site: *mut c_void, beneficiary: *const FvmAddress) {
    let Some(beneficiary) = beneficiary.as_ref() else {
        return;
    };
    with_site(site, (), |site| site.self_destruct(beneficiary))
}

/// Nested call. Returns the callee's gas left, with the sign bit set when it
/// did not succeed or the call could not be issued.
#[no_mangle]
pub unsafe extern "C" fn fvm_site_call(
    site: *mut c_void,
    kind: i32,
    gas: i64,
    address: *const FvmAddress,
    value: *const FvmWord,
    input: *const u8,
    input_size: usize,
    output: *mut u8,
    output_size: usize,
) -> i64 {
    let (Some(kind), Some(address)) = (FvmCallKind::try_from_i(kind), address.as_ref()) else {
        return FVM_CALL_FAILURE;
    };
    let value = value.as_ref().copied().unwrap_or_default();
    let input = bytes(input, input_size);
    let output = bytes_mut(output, output_size);
    with_site(site, FVM_CALL_FAILURE, |site| {
        site.call(kind, gas, address, &value, input, output)
    })
}

#[no_mangle]
pub unsafe extern "C" fn fvm_site_return_data_size(site: *mut c_void) -> usize {
    with_site(site, 0, |site| site.return_data_size())
}

/// Returns 0 when the requested range is out of bounds.
#[no_mangle]
pub unsafe extern "C" fn fvm_site_copy_return_data(
    site: *mut c_void,
    offset: usize,
    out: *mut u8,
    size: usize,
) -> i32 {
    let out = bytes_mut(out, size);
    with_site(site, false, |site| site.copy_return_data(offset, out)) as i32
}

#[no_mangle]
pub unsafe extern "C" fn fvm_site_get_tx_context(site: *mut c_void, result: *mut FvmRawTxContext) {
    let Some(result) = result.as_mut() else {
        return;
    };
    *result = with_site(site, FvmRawTxContext::default(), |site| {
        FvmRawTxContext::from(&site.tx_context())
    });
}

#[no_mangle]
pub unsafe extern "C" fn fvm_site_get_block_hash(site: *mut c_void, number: i64, result: *mut FvmHash) {
    let Some(result) = result.as_mut() else {
        return;
    };
    *result = with_site(site, FvmHash::ZERO, |site| site.get_block_hash(number));
}

#[no_mangle]
pub unsafe extern "C" fn fvm_site_log(
    site: *mut c_void,
    data: *const u8,
    data_size: usize,
    topics: *const FvmHash,
    topics_count: usize,
) {
    let data = bytes(data, data_size);
    let topics = if topics.is_null() || topics_count == 0 {
        &[][..]
    } else {
        slice::from_raw_parts(topics, topics_count)
    };
    with_site(site, (), |site| site.log(data, topics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::encode_context, types::FvmStatusCode};

    unsafe extern "C" fn echo_entry(site: *mut c_void) -> i32 {
        let mut size = 0;
        let input = fvm_site_input(site, &mut size);
        fvm_site_set_output(site, input, size);
        fvm_site_set_gas_left(site, fvm_site_gas_left(site) - 21);
        let mut slot = FvmWord::from_u128(5);
        fvm_site_get_storage(site, &FvmWord::ZERO, &mut slot);
        // No storage slot registered: the read yields zero.
        if slot != FvmWord::ZERO {
            return FvmReturnCode::Failure.to_i();
        }
        FvmReturnCode::Return.to_i()
    }

    unsafe extern "C" fn native_compile(
        _obj: *mut c_void,
        _code: *const u8,
        code_size: usize,
        _revision: i32,
        _is_static: i32,
        code_id: *const c_char,
    ) -> Option<FvmNativeEntry> {
        let id = CStr::from_ptr(code_id).to_str().ok()?;
        (code_size > 0 && id.len() == 65).then_some(echo_entry as FvmNativeEntry)
    }

    unsafe extern "C" fn forwarding_entry(site: *mut c_void) -> i32 {
        let target = FvmAddress([9; 32]);
        let mut out = [0u8; 4];
        let ret = fvm_site_call(
            site,
            FvmCallKind::Call.to_i(),
            50,
            &target,
            ptr::null(),
            ptr::null(),
            0,
            out.as_mut_ptr(),
            out.len(),
        );
        if ret == FVM_CALL_FAILURE {
            return FvmReturnCode::Revert.to_i();
        }
        FvmReturnCode::Return.to_i()
    }

    unsafe extern "C" fn forwarding_compile(
        _obj: *mut c_void,
        _code: *const u8,
        _code_size: usize,
        _revision: i32,
        _is_static: i32,
        _code_id: *const c_char,
    ) -> Option<FvmNativeEntry> {
        Some(forwarding_entry as FvmNativeEntry)
    }

    struct PanickingHost;
    impl crate::host::FvmHostCallback for PanickingHost {
        fn call(&self, _: FvmHostHandle, _: &crate::host::FvmCallRequest<'_>) -> FvmResult {
            panic!("host failed mid call");
        }
    }

    #[test]
    fn test_site_helper_contains_panics() -> anyhow::Result<()> {
        let engine = FvmEngine::builder(FvmCompilerTable {
            obj: ptr::null_mut(),
            compile: Some(forwarding_compile),
            code_memory_size: None,
            reset: None,
        })
        .with_host(PanickingHost)
        .build()?;
        let msg = FvmCallMessage::new(FvmAddress([3; 32]), FvmAddress([4; 32]), &[], 100);
        let result = engine.execute(
            FvmHostHandle(0),
            &FvmTxContext::default(),
            FvmRevision::Byzantium,
            &msg,
            &[0x01],
        );
        assert_eq!(result.status, FvmStatusCode::Revert);
        assert_eq!(result.gas_left, 100);
        assert_eq!(crate::callstack::depth(), 0);
        Ok(())
    }

    fn context(input: &[u8], gas: i64) -> anyhow::Result<Vec<u8>> {
        let msg = FvmCallMessage::new(FvmAddress([3; 32]), FvmAddress([4; 32]), input, gas);
        Ok(encode_context(&msg, &FvmTxContext::default())?)
    }

    #[test]
    fn test_native_round_trip() -> anyhow::Result<()> {
        let compiler = FvmCompilerTable {
            obj: ptr::null_mut(),
            compile: Some(native_compile),
            code_memory_size: None,
            reset: None,
        };
        let instance = fvm_create_instance(FvmCallbackTable::default(), compiler);
        assert!(!instance.is_null());
        assert_eq!(fvm_create_instance(FvmCallbackTable::default(), compiler), instance);

        let name = CString::new("hits-threshold")?;
        let zero = CString::new("0")?;
        let bogus = CString::new("x")?;
        unsafe {
            assert!(fvm_set_option(instance, name.as_ptr(), zero.as_ptr()));
            assert!(!fvm_set_option(instance, name.as_ptr(), bogus.as_ptr()));
        }

        let code = [0x60u8, 0x00];
        let ctx = context(b"ping", 100)?;
        let mut raw = unsafe {
            fvm_execute(
                instance,
                ptr::null_mut(),
                FvmRevision::Byzantium.to_i(),
                ctx.as_ptr(),
                ctx.len(),
                code.as_ptr(),
                code.len(),
            )
        };
        assert_eq!(raw.status_code, FvmStatusCode::Success.to_i());
        assert_eq!(raw.gas_left, 79);
        assert_eq!(unsafe { bytes(raw.output_data, raw.output_size) }, b"ping");
        unsafe { fvm_release_result(&mut raw) };
        assert!(raw.output_data.is_null());

        let encoded = unsafe {
            fvm_execute_encoded(
                instance,
                ptr::null_mut(),
                FvmRevision::Byzantium.to_i(),
                ctx.as_ptr(),
                ctx.len(),
                code.as_ptr(),
                code.len(),
            )
        };
        let wire = unsafe { encoded.into_buffer() };
        let result = codec::decode_result(&wire)?;
        assert_eq!(result.status, FvmStatusCode::Success);
        assert_eq!(result.output.as_slice(), b"ping");

        let truncated = unsafe {
            fvm_execute(
                instance,
                ptr::null_mut(),
                FvmRevision::Byzantium.to_i(),
                ctx.as_ptr(),
                ctx.len() - 1,
                code.as_ptr(),
                code.len(),
            )
        };
        assert_eq!(truncated.status_code, FvmStatusCode::MalformedInput.to_i());
        assert!(truncated.release.is_none());

        let bad_revision = unsafe {
            fvm_execute(instance, ptr::null_mut(), 99, ctx.as_ptr(), ctx.len(), code.as_ptr(), code.len())
        };
        assert_eq!(bad_revision.status_code, FvmStatusCode::MalformedInput.to_i());

        // Empty code is refused by the backend.
        let failed = unsafe {
            fvm_execute(
                instance,
                ptr::null_mut(),
                FvmRevision::Byzantium.to_i(),
                ctx.as_ptr(),
                ctx.len(),
                ptr::null(),
                0,
            )
        };
        assert_eq!(failed.status_code, FvmStatusCode::InternalError.to_i());
        assert_eq!(failed.gas_left, 0);
        assert_eq!(fvm_context_wire_version(), 1);
        Ok(())
    }
}
