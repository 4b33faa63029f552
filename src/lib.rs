pub mod buffer;
pub mod cache;
pub mod callstack;
pub mod codec;
pub mod compiler;
pub mod dispatch;
mod engine;
pub mod ffi;
pub mod host;
pub mod types;
mod vm;

pub use buffer::{FvmBuffer, FvmResult};
pub use cache::{FvmCodeCache, FvmCodeEntry, FvmCodeId};
pub use compiler::{FvmCompileRequest, FvmCompiler, FvmRoutine};
pub use dispatch::FVM_CALL_FAILURE;
pub use engine::{
    FvmEngine, FvmEngineBuilder, FvmEngineConfig, FvmEngineError, FvmEngineStats,
    FVM_OPTION_HITS_THRESHOLD, FVM_OPTION_MEMORY_LIMIT, FVM_OPTION_RESET_INTERVAL,
};
pub use host::{EmptyCallback, FvmCallRequest, FvmHostCallback};
pub use types::*;
pub use vm::FvmExecSite;

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstCompiler;
    impl FvmCompiler for ConstCompiler {
        fn compile(&self, request: &FvmCompileRequest<'_>) -> Option<FvmRoutine> {
            let size = request.code.len();
            Some(FvmRoutine::new(move |site| {
                site.set_output(&size.to_be_bytes());
                site.consume_gas(3);
                FvmReturnCode::Return
            }))
        }
    }

    #[test]
    fn basic_engine() -> anyhow::Result<()> {
        let engine = FvmEngine::new(ConstCompiler);
        let msg = FvmCallMessage::new(FvmAddress([1; 32]), FvmAddress([2; 32]), &[], 10);
        let result = engine.execute(
            FvmHostHandle(0),
            &FvmTxContext::default(),
            FvmRevision::Constantinople,
            &msg,
            &[0x00, 0x01, 0x02],
        );
        assert_eq!(result.status, FvmStatusCode::Success);
        assert_eq!(result.gas_left, 7);
        assert_eq!(result.output.as_slice(), &3usize.to_be_bytes());
        assert_eq!(engine.stats().compilations, 1);
        assert_eq!(callstack::depth(), 0);
        Ok(())
    }
}
