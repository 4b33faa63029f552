//! Per-thread call tree bookkeeping.
//!
//! Each thread runs at most one call tree at a time: the host enters the
//! engine, routines call back into the host, and the host re-enters the
//! engine for nested calls, all on the same stack. Frames, the pending
//! receive address and the last return data therefore live in thread-local
//! storage, so independent call trees on different threads never observe
//! each other.

use std::{cell::RefCell, marker::PhantomData};

use crate::types::{FvmAddress, FvmHostHandle};

pub const FVM_DEFAULT_MAX_CALL_DEPTH: usize = 1024;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FvmCallStackError {
    #[error("call stack overflow: capacity {capacity} reached")]
    Overflow { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FvmCallFrame {
    pub handle: FvmHostHandle,
    pub recv_addr: FvmAddress,
}

#[derive(Debug, Default)]
struct FvmCallTree {
    frames: Vec<FvmCallFrame>,
    /// Receive address chosen by the dispatcher for the frame about to be
    /// entered.
    pending_recv: Option<FvmAddress>,
    return_data: Vec<u8>,
}

thread_local! {
    static CALL_TREE: RefCell<FvmCallTree> = RefCell::new(FvmCallTree::default());
}

/// Leaves the frame on drop. Not `Send`: it must die on the thread that
/// entered.
#[derive(Debug)]
pub struct FvmFrameGuard {
    frame: FvmCallFrame,
    _not_send: PhantomData<*const ()>,
}

impl FvmFrameGuard {
    pub fn handle(&self) -> FvmHostHandle {
        self.frame.handle
    }
    pub fn recv_addr(&self) -> FvmAddress {
        self.frame.recv_addr
    }
}

impl Drop for FvmFrameGuard {
    fn drop(&mut self) {
        leave();
    }
}

/// Pushes a frame for `handle`. The receive address is the pending one set by
/// the dispatcher, or `target` for a fresh top-level entry.
pub fn enter(
    handle: FvmHostHandle,
    target: &FvmAddress,
    capacity: usize,
) -> Result<FvmFrameGuard, FvmCallStackError> {
    CALL_TREE.with(|tree| {
        let mut tree = tree.borrow_mut();
        if tree.frames.len() >= capacity {
            return Err(FvmCallStackError::Overflow { capacity });
        }
        let recv_addr = tree.pending_recv.take().unwrap_or(*target);
        let frame = FvmCallFrame { handle, recv_addr };
        tree.frames.push(frame);
        Ok(FvmFrameGuard {
            frame,
            _not_send: PhantomData,
        })
    })
}

fn leave() {
    CALL_TREE.with(|tree| {
        let mut tree = tree.borrow_mut();
        tree.frames.pop();
        if tree.frames.is_empty() {
            tree.pending_recv = None;
            tree.return_data = Vec::new();
        }
    })
}

pub fn current_handle() -> Option<FvmHostHandle> {
    CALL_TREE.with(|tree| tree.borrow().frames.last().map(|f| f.handle))
}

pub fn current_recv_addr() -> Option<FvmAddress> {
    CALL_TREE.with(|tree| tree.borrow().frames.last().map(|f| f.recv_addr))
}

/// Number of active frames on this thread.
pub fn depth() -> usize {
    CALL_TREE.with(|tree| tree.borrow().frames.len())
}

pub(crate) fn set_pending_recv(recv_addr: Option<FvmAddress>) {
    CALL_TREE.with(|tree| tree.borrow_mut().pending_recv = recv_addr)
}

pub(crate) fn set_return_data(data: Vec<u8>) {
    CALL_TREE.with(|tree| tree.borrow_mut().return_data = data)
}

/// Runs `f` on the output of the most recent nested call. `f` must not
/// re-enter the engine.
pub fn with_return_data<R>(f: impl FnOnce(&[u8]) -> R) -> R {
    CALL_TREE.with(|tree| f(&tree.borrow().return_data))
}
