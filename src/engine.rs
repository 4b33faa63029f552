use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        PoisonError, RwLock,
    },
    time::Instant,
};

use safer_ffi::derive_ReprC;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::{
    buffer::FvmResult,
    cache::{FvmCodeCache, FvmCodeId},
    callstack::{self, FVM_DEFAULT_MAX_CALL_DEPTH},
    compiler::{FvmCompileRequest, FvmCompiler, FvmRoutine},
    host::{EmptyCallback, FvmHostCallback},
    types::*,
    vm::FvmExecSite,
};

/* Design notes:
 * - Compiled routines are handed out as `Arc`s, so a reset only drops the
 *   cache's references. Routines already picked up by running frames stay
 *   alive until those frames finish.
 * - The backend lock is taken shared by every compilation and exclusively by
 *   a reset. Lookups and execution never take it.
 * - Two threads may compile the same cold program at once. Both results are
 *   valid; the later insert replaces the earlier one.
 */

#[derive(thiserror::Error, Debug)]
#[error("{msg}")]
pub struct FvmEngineError {
    pub msg: String,
}
impl FvmEngineError {
    pub fn new(msg: String) -> Self {
        FvmEngineError { msg }
    }
}
impl From<anyhow::Error> for FvmEngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::new(value.to_string())
    }
}
impl From<String> for FvmEngineError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

pub const FVM_OPTION_HITS_THRESHOLD: &str = "hits-threshold";
pub const FVM_OPTION_MEMORY_LIMIT: &str = "memory-limit";
pub const FVM_OPTION_RESET_INTERVAL: &str = "reset-interval";

#[derive_ReprC]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct FvmEngineConfig {
    /// Lookups a program must accumulate before it gets compiled. Executions
    /// below the threshold are rejected. 0 compiles on first sight.
    pub hit_threshold: u64,
    /// Generated code size in bytes after which the backend is rebuilt. 0 means
    /// no limit.
    pub memory_limit: u64,
    /// Rebuild the backend every this many compilations. 0 disables it.
    pub reset_interval: u64,
    /// Maximum number of nested frames in one call tree.
    pub max_call_depth: u32,
}
impl Default for FvmEngineConfig {
    fn default() -> Self {
        FvmEngineConfig {
            hit_threshold: 0,
            memory_limit: 1000 * 1024 * 1024,
            reset_interval: 20000,
            max_call_depth: FVM_DEFAULT_MAX_CALL_DEPTH as u32,
        }
    }
}

impl FvmEngineConfig {
    /// Applies one named option. Returns `false` for unknown names or values
    /// that do not parse.
    pub fn set_option(&mut self, name: &str, value: &str) -> bool {
        let Ok(value) = value.trim().parse::<u64>() else {
            return false;
        };
        match name {
            FVM_OPTION_HITS_THRESHOLD => self.hit_threshold = value,
            FVM_OPTION_MEMORY_LIMIT => self.memory_limit = value,
            FVM_OPTION_RESET_INTERVAL => self.reset_interval = value,
            _ => return false,
        }
        true
    }

    /// Parses a whitespace separated `name=value` list on top of the defaults.
    pub fn from_options_str(options: &str) -> Result<Self, FvmEngineError> {
        let mut config = Self::default();
        for option in options.split_whitespace() {
            let (name, value) = option
                .split_once('=')
                .ok_or_else(|| FvmEngineError::new(format!("malformed option `{option}`")))?;
            if !config.set_option(name, value) {
                return Err(FvmEngineError::new(format!(
                    "invalid option `{name}` = `{value}`"
                )));
            }
        }
        Ok(config)
    }

    /// Reads options from the `FASTVM_OPTIONS` environment variable.
    pub fn from_env() -> Result<Self, FvmEngineError> {
        match std::env::var("FASTVM_OPTIONS") {
            Ok(options) => Self::from_options_str(&options),
            Err(_) => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FvmEngineStats {
    pub executions: u64,
    pub rejections: u64,
    pub compilations: u64,
    pub compile_failures: u64,
    pub resets: u64,
    pub depth_overflows: u64,
}

#[derive(Debug, Default)]
struct FvmEngineCounters {
    executions: AtomicU64,
    rejections: AtomicU64,
    compilations: AtomicU64,
    compile_failures: AtomicU64,
    resets: AtomicU64,
    depth_overflows: AtomicU64,
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

pub struct FvmEngineBuilder {
    compiler: Box<dyn FvmCompiler>,
    host: Box<dyn FvmHostCallback>,
    config: FvmEngineConfig,
}

impl FvmEngineBuilder {
    pub fn new(compiler: impl FvmCompiler + 'static) -> Self {
        FvmEngineBuilder {
            compiler: Box::new(compiler),
            host: Box::new(EmptyCallback),
            config: FvmEngineConfig::default(),
        }
    }
    pub fn with_host(mut self, host: impl FvmHostCallback + 'static) -> Self {
        self.host = Box::new(host);
        self
    }
    pub fn with_config(mut self, config: FvmEngineConfig) -> Self {
        self.config = config;
        self
    }
    pub fn get_config(&self) -> &FvmEngineConfig {
        &self.config
    }
    pub fn build(self) -> Result<FvmEngine, FvmEngineError> {
        if self.config.max_call_depth == 0 {
            return Err(FvmEngineError::new(
                "max_call_depth must be at least 1".to_owned(),
            ));
        }
        Ok(self.assemble())
    }

    fn assemble(self) -> FvmEngine {
        FvmEngine {
            host: self.host,
            compiler: self.compiler,
            cache: FvmCodeCache::new(),
            backend_lock: RwLock::new(()),
            hit_threshold: AtomicU64::new(self.config.hit_threshold),
            memory_limit: AtomicU64::new(self.config.memory_limit),
            reset_interval: AtomicU64::new(self.config.reset_interval),
            max_call_depth: self.config.max_call_depth as usize,
            compile_count: AtomicU64::new(0),
            counters: FvmEngineCounters::default(),
        }
    }
}

/// Shared execution engine. One instance serves any number of threads, each
/// running its own call tree.
pub struct FvmEngine {
    host: Box<dyn FvmHostCallback>,
    compiler: Box<dyn FvmCompiler>,
    cache: FvmCodeCache,
    backend_lock: RwLock<()>,
    hit_threshold: AtomicU64,
    memory_limit: AtomicU64,
    reset_interval: AtomicU64,
    max_call_depth: usize,
    compile_count: AtomicU64,
    counters: FvmEngineCounters,
}

impl FvmEngine {
    /// Engine with a default configuration and no host.
    pub fn new(compiler: impl FvmCompiler + 'static) -> Self {
        FvmEngineBuilder::new(compiler).assemble()
    }

    pub fn builder(compiler: impl FvmCompiler + 'static) -> FvmEngineBuilder {
        FvmEngineBuilder::new(compiler)
    }

    pub fn get_version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn host(&self) -> &dyn FvmHostCallback {
        &*self.host
    }

    pub fn cache(&self) -> &FvmCodeCache {
        &self.cache
    }

    pub fn get_config(&self) -> FvmEngineConfig {
        FvmEngineConfig {
            hit_threshold: self.hit_threshold.load(Ordering::Relaxed),
            memory_limit: self.memory_limit.load(Ordering::Relaxed),
            reset_interval: self.reset_interval.load(Ordering::Relaxed),
            max_call_depth: self.max_call_depth as u32,
        }
    }

    pub fn stats(&self) -> FvmEngineStats {
        let c = &self.counters;
        FvmEngineStats {
            executions: c.executions.load(Ordering::Relaxed),
            rejections: c.rejections.load(Ordering::Relaxed),
            compilations: c.compilations.load(Ordering::Relaxed),
            compile_failures: c.compile_failures.load(Ordering::Relaxed),
            resets: c.resets.load(Ordering::Relaxed),
            depth_overflows: c.depth_overflows.load(Ordering::Relaxed),
        }
    }

    /// Changes a runtime option. The call depth limit is fixed at build time.
    pub fn set_option(&self, name: &str, value: &str) -> bool {
        let slot = match name {
            FVM_OPTION_HITS_THRESHOLD => &self.hit_threshold,
            FVM_OPTION_MEMORY_LIMIT => &self.memory_limit,
            FVM_OPTION_RESET_INTERVAL => &self.reset_interval,
            _ => {
                warn!(name, "unknown engine option");
                return false;
            }
        };
        let Ok(parsed) = value.trim().parse::<u64>() else {
            warn!(name, value, "invalid engine option value");
            return false;
        };
        slot.store(parsed, Ordering::Relaxed);
        debug!(name, value = parsed, "engine option updated");
        true
    }

    /// Executes `code` for `msg`, compiling it first if it is hot enough.
    ///
    /// `handle` is passed back to the host on every callback made while this
    /// frame is active. Hosts handling a nested call re-enter here on the same
    /// thread.
    pub fn execute(
        &self,
        handle: FvmHostHandle,
        tx: &FvmTxContext,
        revision: FvmRevision,
        msg: &FvmCallMessage<'_>,
        code: &[u8],
    ) -> FvmResult {
        bump(&self.counters.executions);
        if msg.depth == 0 {
            self.check_memory_size();
        }

        let frame = match callstack::enter(handle, &msg.target, self.max_call_depth) {
            Ok(frame) => frame,
            Err(e) => {
                bump(&self.counters.depth_overflows);
                warn!(depth = msg.depth, target = %msg.target, "{e}");
                return FvmResult::call_depth_exceeded();
            }
        };

        let code_hash = if msg.code_hash.is_zero() {
            FvmHash::keccak256(code)
        } else {
            msg.code_hash
        };
        let code_id = FvmCodeId::new(&code_hash, revision, msg.flags);

        let entry = self.cache.lookup(&code_id);
        let routine = match entry.routine {
            Some(routine) => routine,
            None => {
                let threshold = self.hit_threshold.load(Ordering::Relaxed);
                if entry.hits <= threshold {
                    bump(&self.counters.rejections);
                    trace!(%code_id, hits = entry.hits, threshold, "program not hot yet");
                    return FvmResult::rejected();
                }
                let Some(routine) = self.compile(&code_id, revision, msg.is_static(), code) else {
                    bump(&self.counters.compile_failures);
                    error!(%code_id, code_size = code.len(), "compilation produced no routine");
                    return FvmResult::internal_error();
                };
                routine
            }
        };

        let mut site = FvmExecSite::new(self, &frame, msg, tx, revision, code);
        let rc = routine.invoke(&mut site);
        trace!(%code_id, ?rc, gas_left = site.gas_left(), depth = msg.depth, "routine finished");
        site.into_result(rc)
    }

    fn compile(
        &self,
        code_id: &FvmCodeId,
        revision: FvmRevision,
        is_static: bool,
        code: &[u8],
    ) -> Option<FvmRoutine> {
        let count = bump(&self.compile_count);
        let interval = self.reset_interval.load(Ordering::Relaxed);
        if interval != 0 && count % interval == 0 {
            info!(compilations = count, "periodic backend reset");
            self.reset_engine();
        }

        let _backend = self
            .backend_lock
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let start = Instant::now();
        let routine = self.compiler.compile(&FvmCompileRequest {
            code,
            revision,
            is_static,
            code_id,
        });
        if let Some(routine) = &routine {
            // Must stay under the backend guard: a reset may not run between
            // compiling and recording.
            self.cache.insert(code_id, routine.clone());
            bump(&self.counters.compilations);
            debug!(%code_id, code_size = code.len(), elapsed = ?start.elapsed(), "compiled program");
        }
        routine
    }

    /// Clears the code cache and rebuilds the compiler backend. Waits for
    /// in-flight compilations; running routines are unaffected.
    pub fn reset_engine(&self) {
        let _backend = self
            .backend_lock
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let dropped = self.cache.len();
        self.cache.clear();
        self.compiler.reset();
        bump(&self.counters.resets);
        info!(dropped, "engine reset");
    }

    /// Resets the engine when generated code outgrows the memory limit.
    pub fn check_memory_size(&self) {
        let limit = self.memory_limit.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }
        let used = self.compiler.code_memory_size();
        if used > limit {
            info!(used, limit, "code memory limit exceeded");
            self.reset_engine();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullCompiler;
    impl FvmCompiler for NullCompiler {
        fn compile(&self, _: &FvmCompileRequest<'_>) -> Option<FvmRoutine> {
            None
        }
    }

    #[test]
    fn test_config_options() -> anyhow::Result<()> {
        let config = FvmEngineConfig::from_options_str("hits-threshold=3  reset-interval=0")?;
        assert_eq!(config.hit_threshold, 3);
        assert_eq!(config.reset_interval, 0);
        assert_eq!(config.memory_limit, FvmEngineConfig::default().memory_limit);

        assert!(FvmEngineConfig::from_options_str("hits-threshold").is_err());
        assert!(FvmEngineConfig::from_options_str("unknown=1").is_err());
        assert!(FvmEngineConfig::from_options_str("memory-limit=lots").is_err());
        Ok(())
    }

    #[test]
    fn test_set_option() -> anyhow::Result<()> {
        let engine = FvmEngine::new(NullCompiler);
        assert!(engine.set_option("hits-threshold", "12"));
        assert!(!engine.set_option("hits-threshold", "-1"));
        assert!(!engine.set_option("jit", "1"));
        assert_eq!(engine.get_config().hit_threshold, 12);
        assert!(engine.set_option("memory-limit", "4096"));
        assert_eq!(engine.get_config().memory_limit, 4096);
        Ok(())
    }

    #[test]
    fn test_builder_rejects_zero_depth() -> anyhow::Result<()> {
        let config = FvmEngineConfig {
            max_call_depth: 0,
            ..Default::default()
        };
        let err = FvmEngine::builder(NullCompiler)
            .with_config(config)
            .build()
            .err()
            .ok_or_else(|| anyhow::anyhow!("zero depth accepted"))?;
        assert!(err.msg.contains("max_call_depth"));
        Ok(())
    }
}
