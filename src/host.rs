use std::ffi::c_void;

use crate::{
    buffer::{FvmBuffer, FvmRawResult, FvmResult},
    types::*,
};

/// A nested call as handed to the host.
#[derive(Debug, Clone, Copy)]
pub struct FvmCallRequest<'a> {
    /// Address whose context the callee runs in. Differs from `msg.target`
    /// for CALLCODE and DELEGATECALL.
    pub recv_addr: FvmAddress,
    pub msg: FvmCallMessage<'a>,
}

/// State access capabilities provided by the embedding application.
///
/// Every method has a no-op default returning zero values, so partial hosts
/// (such as test harnesses) only implement what they need. Production hosts
/// should implement all of them.
pub trait FvmHostCallback: Send + Sync {
    fn exists(&self, handle: FvmHostHandle, address: &FvmAddress) -> bool {
        false
    }
    fn get_storage(&self, handle: FvmHostHandle, address: &FvmAddress, key: &FvmWord) -> FvmWord {
        FvmWord::ZERO
    }
    fn set_storage(
        &self,
        handle: FvmHostHandle,
        address: &FvmAddress,
        key: &FvmWord,
        value: &FvmWord,
    ) {
    }
    fn get_balance(&self, handle: FvmHostHandle, address: &FvmAddress) -> FvmWord {
        FvmWord::ZERO
    }
    fn get_code(&self, handle: FvmHostHandle, address: &FvmAddress) -> FvmBuffer {
        FvmBuffer::new()
    }
    fn self_destruct(&self, handle: FvmHostHandle, address: &FvmAddress, beneficiary: &FvmAddress) {}
    /// Runs a nested call. Hosts usually route this back into
    /// [`FvmEngine::execute`](crate::FvmEngine::execute).
    fn call(&self, handle: FvmHostHandle, request: &FvmCallRequest<'_>) -> FvmResult {
        FvmResult::default()
    }
    /// `None` keeps the context the execution was entered with.
    fn get_tx_context(&self, handle: FvmHostHandle) -> Option<FvmTxContext> {
        None
    }
    fn get_block_hash(&self, handle: FvmHostHandle, number: i64) -> FvmHash {
        FvmHash::ZERO
    }
    fn log(&self, handle: FvmHostHandle, address: &FvmAddress, data: &[u8], topics: &[FvmHash]) {}
}

pub struct EmptyCallback;
impl FvmHostCallback for EmptyCallback {}

/// Code returned by a native host. Only read for the duration of the slot call.
#[repr(C)]
#[derive(Debug)]
pub struct FvmCodeInfo {
    pub data: *const u8,
    pub size: usize,
}

#[repr(C)]
#[derive(Debug)]
pub struct FvmRawCallRequest {
    pub recv_addr: FvmAddress,
    pub target: FvmAddress,
    pub caller: FvmAddress,
    pub value: FvmWord,
    pub input_data: *const u8,
    pub input_size: usize,
    pub code_hash: FvmHash,
    pub gas: i64,
    pub depth: i32,
    pub kind: i32,
    pub flags: u32,
}

impl FvmRawCallRequest {
    fn new(request: &FvmCallRequest<'_>) -> Self {
        let msg = &request.msg;
        FvmRawCallRequest {
            recv_addr: request.recv_addr,
            target: msg.target,
            caller: msg.caller,
            value: msg.value,
            input_data: msg.input.as_ptr(),
            input_size: msg.input.len(),
            code_hash: msg.code_hash,
            gas: msg.gas,
            depth: msg.depth,
            kind: msg.kind.to_i(),
            flags: msg.flags.bits(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct FvmRawTxContext {
    pub gas_price: FvmWord,
    pub origin: FvmAddress,
    pub coinbase: FvmAddress,
    pub block_number: i64,
    pub block_timestamp: i64,
    pub block_gas_limit: i64,
    pub block_difficulty: FvmWord,
}

impl From<FvmRawTxContext> for FvmTxContext {
    fn from(raw: FvmRawTxContext) -> Self {
        FvmTxContext {
            gas_price: raw.gas_price,
            origin: raw.origin,
            coinbase: raw.coinbase,
            block_number: raw.block_number,
            block_timestamp: raw.block_timestamp,
            block_gas_limit: raw.block_gas_limit,
            block_difficulty: raw.block_difficulty,
        }
    }
}
impl From<&FvmTxContext> for FvmRawTxContext {
    fn from(tx: &FvmTxContext) -> Self {
        FvmRawTxContext {
            gas_price: tx.gas_price,
            origin: tx.origin,
            coinbase: tx.coinbase,
            block_number: tx.block_number,
            block_timestamp: tx.block_timestamp,
            block_gas_limit: tx.block_gas_limit,
            block_difficulty: tx.block_difficulty,
        }
    }
}

/// Callback slots registered by a native host. Each takes the host handle
/// first; results are written through out-pointers owned by the engine.
/// A null slot behaves like the matching [`FvmHostCallback`] default.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FvmCallbackTable {
    pub exists: Option<unsafe extern "C" fn(obj: *mut c_void, address: *const FvmAddress) -> i32>,
    pub get_storage: Option<
        unsafe extern "C" fn(
            obj: *mut c_void,
            address: *const FvmAddress,
            key: *const FvmWord,
            result: *mut FvmWord,
        ),
    >,
    pub set_storage: Option<
        unsafe extern "C" fn(
            obj: *mut c_void,
            address: *const FvmAddress,
            key: *const FvmWord,
            value: *const FvmWord,
        ),
    >,
    pub get_balance: Option<
        unsafe extern "C" fn(obj: *mut c_void, address: *const FvmAddress, result: *mut FvmWord),
    >,
    pub get_code: Option<
        unsafe extern "C" fn(obj: *mut c_void, address: *const FvmAddress, info: *mut FvmCodeInfo),
    >,
    pub self_destruct: Option<
        unsafe extern "C" fn(
            obj: *mut c_void,
            address: *const FvmAddress,
            beneficiary: *const FvmAddress,
        ),
    >,
    pub call: Option<
        unsafe extern "C" fn(
            obj: *mut c_void,
            request: *const FvmRawCallRequest,
            result: *mut FvmRawResult,
        ),
    >,
    /// Returns non-zero when `result` was filled.
    pub get_tx_context:
        Option<unsafe extern "C" fn(obj: *mut c_void, result: *mut FvmRawTxContext) -> i32>,
    pub get_block_hash:
        Option<unsafe extern "C" fn(obj: *mut c_void, number: i64, result: *mut FvmHash)>,
    pub log: Option<
        unsafe extern "C" fn(
            obj: *mut c_void,
            address: *const FvmAddress,
            data: *const u8,
            data_size: usize,
            topics: *const FvmHash,
            topics_count: usize,
        ),
    >,
}

// Safety of every call below: the host promises its slots accept the handle
// it passed to `execute` and only touch the pointers for the call's duration.
impl FvmHostCallback for FvmCallbackTable {
    fn exists(&self, handle: FvmHostHandle, address: &FvmAddress) -> bool {
        match self.exists {
            Some(f) => unsafe { f(handle.as_ptr(), address) != 0 },
            None => false,
        }
    }
    fn get_storage(&self, handle: FvmHostHandle, address: &FvmAddress, key: &FvmWord) -> FvmWord {
        let mut result = FvmWord::ZERO;
        if let Some(f) = self.get_storage {
            unsafe { f(handle.as_ptr(), address, key, &mut result) };
        }
        result
    }
    fn set_storage(
        &self,
        handle: FvmHostHandle,
        address: &FvmAddress,
        key: &FvmWord,
        value: &FvmWord,
    ) {
        if let Some(f) = self.set_storage {
            unsafe { f(handle.as_ptr(), address, key, value) };
        }
    }
    fn get_balance(&self, handle: FvmHostHandle, address: &FvmAddress) -> FvmWord {
        let mut result = FvmWord::ZERO;
        if let Some(f) = self.get_balance {
            unsafe { f(handle.as_ptr(), address, &mut result) };
        }
        result
    }
    fn get_code(&self, handle: FvmHostHandle, address: &FvmAddress) -> FvmBuffer {
        let Some(f) = self.get_code else {
            return FvmBuffer::new();
        };
        let mut info = FvmCodeInfo {
            data: std::ptr::null(),
            size: 0,
        };
        unsafe {
            f(handle.as_ptr(), address, &mut info);
            if info.data.is_null() || info.size == 0 {
                return FvmBuffer::new();
            }
            FvmBuffer::copy_from_slice(std::slice::from_raw_parts(info.data, info.size))
        }
    }
    fn self_destruct(&self, handle: FvmHostHandle, address: &FvmAddress, beneficiary: &FvmAddress) {
        if let Some(f) = self.self_destruct {
            unsafe { f(handle.as_ptr(), address, beneficiary) };
        }
    }
    fn call(&self, handle: FvmHostHandle, request: &FvmCallRequest<'_>) -> FvmResult {
        let Some(f) = self.call else {
            return FvmResult::default();
        };
        let raw_request = FvmRawCallRequest::new(request);
        let mut raw_result = FvmRawResult::default();
        unsafe {
            f(handle.as_ptr(), &raw_request, &mut raw_result);
            raw_result.into_result()
        }
    }
    fn get_tx_context(&self, handle: FvmHostHandle) -> Option<FvmTxContext> {
        let f = self.get_tx_context?;
        let mut result = FvmRawTxContext::default();
        let filled = unsafe { f(handle.as_ptr(), &mut result) };
        (filled != 0).then(|| result.into())
    }
    fn get_block_hash(&self, handle: FvmHostHandle, number: i64) -> FvmHash {
        let mut result = FvmHash::ZERO;
        if let Some(f) = self.get_block_hash {
            unsafe { f(handle.as_ptr(), number, &mut result) };
        }
        result
    }
    fn log(&self, handle: FvmHostHandle, address: &FvmAddress, data: &[u8], topics: &[FvmHash]) {
        if let Some(f) = self.log {
            unsafe {
                f(
                    handle.as_ptr(),
                    address,
                    data.as_ptr(),
                    data.len(),
                    topics.as_ptr(),
                    topics.len(),
                )
            };
        }
    }
}
