use crate::{
    buffer::{FvmBuffer, FvmResult},
    callstack,
    engine::FvmEngine,
    host::FvmHostCallback,
    types::*,
};

/// What a routine sees while it runs: its message, gas, output and the host
/// capabilities, all bound to the frame it was entered with.
pub struct FvmExecSite<'a> {
    engine: &'a FvmEngine,
    handle: FvmHostHandle,
    recv_addr: FvmAddress,
    msg: &'a FvmCallMessage<'a>,
    tx: &'a FvmTxContext,
    revision: FvmRevision,
    code: &'a [u8],
    gas: i64,
    output: Vec<u8>,
}

impl<'a> FvmExecSite<'a> {
    pub(crate) fn new(
        engine: &'a FvmEngine,
        frame: &callstack::FvmFrameGuard,
        msg: &'a FvmCallMessage<'a>,
        tx: &'a FvmTxContext,
        revision: FvmRevision,
        code: &'a [u8],
    ) -> Self {
        FvmExecSite {
            engine,
            handle: frame.handle(),
            recv_addr: frame.recv_addr(),
            msg,
            tx,
            revision,
            code,
            gas: msg.gas,
            output: Vec::new(),
        }
    }

    pub fn message(&self) -> &FvmCallMessage<'a> {
        self.msg
    }
    pub fn handle(&self) -> FvmHostHandle {
        self.handle
    }
    /// Address whose storage this frame operates on.
    pub fn recv_addr(&self) -> FvmAddress {
        self.recv_addr
    }
    pub fn code(&self) -> &[u8] {
        self.code
    }
    pub fn revision(&self) -> FvmRevision {
        self.revision
    }
    pub(crate) fn host(&self) -> &'a dyn FvmHostCallback {
        self.engine.host()
    }

    pub fn gas_left(&self) -> i64 {
        self.gas
    }
    pub fn set_gas_left(&mut self, gas: i64) {
        self.gas = gas;
    }
    /// Deducts `amount`; on exhaustion gas drops to zero and `false` is
    /// returned.
    pub fn consume_gas(&mut self, amount: i64) -> bool {
        match self.gas.checked_sub(amount) {
            Some(left) if left >= 0 => {
                self.gas = left;
                true
            }
            _ => {
                self.gas = 0;
                false
            }
        }
    }

    pub fn set_output(&mut self, data: &[u8]) {
        self.output.clear();
        self.output.extend_from_slice(data);
    }
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn tx_context(&self) -> FvmTxContext {
        self.host()
            .get_tx_context(self.handle)
            .unwrap_or_else(|| self.tx.clone())
    }

    pub fn exists(&self, address: &FvmAddress) -> bool {
        self.host().exists(self.handle, address)
    }
    pub fn get_storage(&self, key: &FvmWord) -> FvmWord {
        self.host().get_storage(self.handle, &self.recv_addr, key)
    }
    pub fn set_storage(&self, key: &FvmWord, value: &FvmWord) {
        self.host()
            .set_storage(self.handle, &self.recv_addr, key, value)
    }
    pub fn get_balance(&self, address: &FvmAddress) -> FvmWord {
        self.host().get_balance(self.handle, address)
    }
    /// Copy of the code deployed at `address`.
    pub fn get_code(&self, address: &FvmAddress) -> FvmBuffer {
        self.host().get_code(self.handle, address)
    }
    pub fn self_destruct(&self, beneficiary: &FvmAddress) {
        self.host()
            .self_destruct(self.handle, &self.recv_addr, beneficiary)
    }
    pub fn get_block_hash(&self, number: i64) -> FvmHash {
        self.host().get_block_hash(self.handle, number)
    }
    pub fn log(&self, data: &[u8], topics: &[FvmHash]) {
        self.host().log(self.handle, &self.recv_addr, data, topics)
    }

    pub fn return_data_size(&self) -> usize {
        callstack::with_return_data(|data| data.len())
    }
    /// Copies `out.len()` bytes of the last return data starting at `offset`.
    /// Fails without copying when the range is out of bounds.
    pub fn copy_return_data(&self, offset: usize, out: &mut [u8]) -> bool {
        callstack::with_return_data(|data| {
            let Some(src) = offset
                .checked_add(out.len())
                .and_then(|end| data.get(offset..end))
            else {
                return false;
            };
            out.copy_from_slice(src);
            true
        })
    }

    pub(crate) fn into_result(self, rc: FvmReturnCode) -> FvmResult {
        let output = FvmBuffer::from_vec(self.output);
        match rc {
            FvmReturnCode::Stop => FvmResult::success(self.gas, FvmBuffer::new()),
            FvmReturnCode::Return => FvmResult::success(self.gas, output),
            FvmReturnCode::Revert => FvmResult::new(FvmStatusCode::Revert, self.gas, output),
            FvmReturnCode::OutOfGas => FvmResult::with_status(FvmStatusCode::OutOfGas, 0),
            FvmReturnCode::Failure => FvmResult::with_status(FvmStatusCode::Failure, 0),
        }
    }
}
