use std::{ffi::c_void, fmt};

use safer_ffi::derive_ReprC;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

pub const FVM_ADDRESS_LEN: usize = 32;
pub const FVM_WORD_LEN: usize = 16;
pub const FVM_HASH_LEN: usize = 32;

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

/// Account identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FvmAddress(pub [u8; FVM_ADDRESS_LEN]);

impl FvmAddress {
    pub const ZERO: Self = Self([0; FVM_ADDRESS_LEN]);

    pub fn as_bytes(&self) -> &[u8; FVM_ADDRESS_LEN] {
        &self.0
    }
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
    /// Builds an address from at most 32 bytes, zero-filling the tail.
    pub fn from_slice_lossy(bytes: &[u8]) -> Self {
        let mut addr = [0; FVM_ADDRESS_LEN];
        let len = bytes.len().min(FVM_ADDRESS_LEN);
        addr[..len].copy_from_slice(&bytes[..len]);
        Self(addr)
    }
}
impl fmt::Display for FvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// 128-bit word, stored big-endian.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FvmWord(pub [u8; FVM_WORD_LEN]);

impl FvmWord {
    pub const ZERO: Self = Self([0; FVM_WORD_LEN]);

    pub fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }
    pub fn to_u128(self) -> u128 {
        u128::from_be_bytes(self.0)
    }
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}
impl From<u128> for FvmWord {
    fn from(value: u128) -> Self {
        Self::from_u128(value)
    }
}
impl fmt::Display for FvmWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FvmHash(pub [u8; FVM_HASH_LEN]);

impl FvmHash {
    pub const ZERO: Self = Self([0; FVM_HASH_LEN]);

    pub fn keccak256(data: &[u8]) -> Self {
        Self(Keccak256::digest(data).into())
    }
    /// An all-zero hash stands for "not computed yet".
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}
impl fmt::Display for FvmHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Rule-set revision of the virtual machine. Letters are part of the code
/// identity and must never be reassigned.
#[derive_ReprC]
#[derive(
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(i32)]
pub enum FvmRevision {
    Frontier = 0,
    Homestead = 1,
    TangerineWhistle = 2,
    SpuriousDragon = 3,
    Byzantium = 4,
    Aion = 5,
    Constantinople = 6,
    AionV1 = 7,
}
impl FvmRevision {
    pub fn try_from_i(value: i32) -> Option<Self> {
        num_traits::FromPrimitive::from_i32(value)
    }
    pub fn to_i(self) -> i32 {
        self as i32
    }
    pub fn letter(self) -> char {
        use FvmRevision::*;
        match self {
            Frontier => 'F',
            Homestead => 'H',
            TangerineWhistle => 'T',
            SpuriousDragon => 'S',
            Byzantium => 'B',
            Aion => 'A',
            Constantinople => 'C',
            AionV1 => 'D',
        }
    }
}

#[derive_ReprC]
#[derive(
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(i32)]
pub enum FvmCallKind {
    Call = 0,
    DelegateCall = 1,
    CallCode = 2,
    Create = 3,
    StaticCall = 4,
}
impl FvmCallKind {
    pub fn try_from_i(value: i32) -> Option<Self> {
        num_traits::FromPrimitive::from_i32(value)
    }
    pub fn to_i(self) -> i32 {
        self as i32
    }
}

bitflags::bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FvmCallFlags: u32 {
        const STATIC = 0b0000_0001;

        const _ = !0;
    }
}

#[derive_ReprC]
#[derive(
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(i32)]
pub enum FvmStatusCode {
    Success = 0,
    Failure = 1,
    OutOfGas = 2,
    Revert = 7,
    /// The program is not hot enough to be compiled yet.
    Rejected = -1,
    InternalError = -2,
    CallDepthExceeded = -3,
    MalformedInput = -4,
}
impl FvmStatusCode {
    pub fn try_from_i(value: i32) -> Option<Self> {
        num_traits::FromPrimitive::from_i32(value)
    }
    pub fn from_i(value: i32) -> Self {
        Self::try_from_i(value).unwrap_or(Self::Failure)
    }
    pub fn to_i(self) -> i32 {
        self as i32
    }
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// How a compiled routine finished.
#[derive_ReprC]
#[derive(num_derive::FromPrimitive, num_derive::ToPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FvmReturnCode {
    Stop = 0,
    Return = 1,
    Revert = 2,
    OutOfGas = 3,
    Failure = 4,
}
impl FvmReturnCode {
    pub fn from_i(value: i32) -> Self {
        num_traits::FromPrimitive::from_i32(value).unwrap_or(Self::Failure)
    }
    pub fn to_i(self) -> i32 {
        self as i32
    }
}

/// Opaque per-execution token handed back to the host on every callback.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct FvmHostHandle(pub usize);

impl FvmHostHandle {
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr as usize)
    }
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FvmCallMessage<'a> {
    pub target: FvmAddress,
    pub caller: FvmAddress,
    pub value: FvmWord,
    pub input: &'a [u8],
    pub code_hash: FvmHash,
    pub gas: i64,
    pub depth: i32,
    pub kind: FvmCallKind,
    pub flags: FvmCallFlags,
}

impl<'a> FvmCallMessage<'a> {
    /// A depth-0 CALL to `target` with no value and an unknown code hash.
    pub fn new(target: FvmAddress, caller: FvmAddress, input: &'a [u8], gas: i64) -> Self {
        FvmCallMessage {
            target,
            caller,
            value: FvmWord::ZERO,
            input,
            code_hash: FvmHash::ZERO,
            gas,
            depth: 0,
            kind: FvmCallKind::Call,
            flags: FvmCallFlags::empty(),
        }
    }
    pub fn is_static(&self) -> bool {
        self.flags.contains(FvmCallFlags::STATIC)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FvmTxContext {
    pub gas_price: FvmWord,
    pub origin: FvmAddress,
    pub coinbase: FvmAddress,
    pub block_number: i64,
    pub block_timestamp: i64,
    pub block_gas_limit: i64,
    pub block_difficulty: FvmWord,
}
