use tracing::trace;

use crate::{callstack, host::FvmCallRequest, types::*, vm::FvmExecSite};

/// Set in the value returned by [`FvmExecSite::call`] when the callee did not
/// succeed. The remaining bits hold the callee's gas left.
pub const FVM_CALL_FAILURE: i64 = i64::MIN;

/// Builds the message for a nested call issued from `parent`.
pub fn nested_message<'i>(
    parent: &FvmCallMessage<'_>,
    kind: FvmCallKind,
    gas: i64,
    target: &FvmAddress,
    value: &FvmWord,
    input: &'i [u8],
) -> FvmCallMessage<'i> {
    let (caller, value) = match kind {
        FvmCallKind::DelegateCall => (parent.caller, parent.value),
        _ => (parent.target, *value),
    };
    let (kind, flags) = match kind {
        FvmCallKind::StaticCall => (FvmCallKind::Call, parent.flags | FvmCallFlags::STATIC),
        kind => (kind, parent.flags),
    };
    FvmCallMessage {
        target: *target,
        caller,
        value,
        input,
        code_hash: FvmHash::ZERO,
        gas,
        depth: parent.depth.saturating_add(1),
        kind,
        flags,
    }
}

/// CALLCODE and DELEGATECALL keep running in the current receive address.
pub fn receive_address(kind: FvmCallKind, target: &FvmAddress, current: &FvmAddress) -> FvmAddress {
    match kind {
        FvmCallKind::CallCode | FvmCallKind::DelegateCall => *current,
        _ => *target,
    }
}

impl FvmExecSite<'_> {
    /// Issues a nested call through the host and folds its result back.
    ///
    /// At most `output.len()` bytes of the callee output are copied into
    /// `output`; the full output becomes the new return data. Returns the
    /// callee's gas left, with [`FVM_CALL_FAILURE`] set unless it succeeded.
    pub fn call(
        &mut self,
        kind: FvmCallKind,
        gas: i64,
        address: &FvmAddress,
        value: &FvmWord,
        input: &[u8],
        output: &mut [u8],
    ) -> i64 {
        let msg = nested_message(self.message(), kind, gas, address, value, input);
        let recv_addr = receive_address(kind, address, &self.recv_addr());
        trace!(
            ?kind,
            target = %address,
            recv = %recv_addr,
            depth = msg.depth,
            gas,
            "dispatching nested call"
        );

        let result = {
            callstack::set_pending_recv(Some(recv_addr));
            let _clear_pending = scopeguard::guard((), |_| callstack::set_pending_recv(None));
            self.host()
                .call(self.handle(), &FvmCallRequest { recv_addr, msg })
        };

        let copied = output.len().min(result.output.len());
        output[..copied].copy_from_slice(&result.output[..copied]);
        if kind == FvmCallKind::Create && result.is_success() {
            // The output slot holds the new address, zero padded.
            let created = FvmAddress::from_slice_lossy(&result.output);
            let addr_len = output.len().min(FVM_ADDRESS_LEN);
            output[..addr_len].copy_from_slice(&created.0[..addr_len]);
        }

        let status = result.status;
        let mut ret = result.gas_left;
        callstack::set_return_data(result.output.into_vec());
        if !status.is_success() {
            ret |= FVM_CALL_FAILURE;
        }
        trace!(?status, gas_left = ret & !FVM_CALL_FAILURE, "nested call finished");
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent<'a>(input: &'a [u8]) -> FvmCallMessage<'a> {
        FvmCallMessage {
            target: FvmAddress([0xa1; 32]),
            caller: FvmAddress([0xc1; 32]),
            value: FvmWord::from_u128(77),
            input,
            code_hash: FvmHash([0x55; 32]),
            gas: 10_000,
            depth: 4,
            kind: FvmCallKind::Call,
            flags: FvmCallFlags::empty(),
        }
    }

    #[test]
    fn test_delegatecall_inherits_caller_and_value() -> anyhow::Result<()> {
        let parent = parent(b"");
        let target = FvmAddress([0xb2; 32]);
        let msg = nested_message(
            &parent,
            FvmCallKind::DelegateCall,
            500,
            &target,
            &FvmWord::from_u128(1),
            b"in",
        );
        assert_eq!(msg.caller, parent.caller);
        assert_eq!(msg.value, parent.value);
        assert_eq!(msg.target, target);
        assert_eq!(msg.kind, FvmCallKind::DelegateCall);
        assert_eq!(msg.depth, 5);
        assert_eq!(msg.gas, 500);
        assert_eq!(msg.input, b"in");
        assert!(msg.code_hash.is_zero());

        let msg = nested_message(&parent, FvmCallKind::Call, 500, &target, &FvmWord::from_u128(1), b"");
        assert_eq!(msg.caller, parent.target);
        assert_eq!(msg.value, FvmWord::from_u128(1));
        Ok(())
    }

    #[test]
    fn test_static_flag_is_sticky() -> anyhow::Result<()> {
        let parent = parent(b"");
        let target = FvmAddress([0xb2; 32]);
        let msg = nested_message(&parent, FvmCallKind::StaticCall, 1, &target, &FvmWord::ZERO, b"");
        assert_eq!(msg.kind, FvmCallKind::Call);
        assert!(msg.is_static());

        for kind in [FvmCallKind::Call, FvmCallKind::CallCode, FvmCallKind::Create] {
            let child = nested_message(&msg, kind, 1, &target, &FvmWord::ZERO, b"");
            assert!(child.is_static());
            assert_eq!(child.kind, kind);
        }
        Ok(())
    }

    #[test]
    fn test_depth_saturates() -> anyhow::Result<()> {
        let mut deep = parent(b"");
        deep.depth = i32::MAX;
        let msg = nested_message(&deep, FvmCallKind::Call, 1, &FvmAddress::ZERO, &FvmWord::ZERO, b"");
        assert_eq!(msg.depth, i32::MAX);
        Ok(())
    }

    #[test]
    fn test_receive_address() -> anyhow::Result<()> {
        let target = FvmAddress([1; 32]);
        let current = FvmAddress([2; 32]);
        assert_eq!(receive_address(FvmCallKind::Call, &target, &current), target);
        assert_eq!(receive_address(FvmCallKind::StaticCall, &target, &current), target);
        assert_eq!(receive_address(FvmCallKind::Create, &target, &current), target);
        assert_eq!(receive_address(FvmCallKind::CallCode, &target, &current), current);
        assert_eq!(receive_address(FvmCallKind::DelegateCall, &target, &current), current);
        Ok(())
    }
}
