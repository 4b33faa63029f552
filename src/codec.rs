//! Flat binary layouts exchanged with the host.
//!
//! Call context (all integers little-endian, no tags):
//!
//! ```text
//! target 32 | origin 32 | caller 32 | gas_price 16 | gas i64 | value 16
//! input_size i32 | input ... | depth i32 | kind i32 | flags u32
//! coinbase 32 | block_number i64 | timestamp i64 | block_gas_limit i64 | difficulty 16
//! ```
//!
//! Result: `status i32 | gas_left i64 | output_size i32 | output ...`.

use std::io::{Cursor, Read, Write};

use binrw::{binrw, BinReaderExt, BinWriterExt};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::{
    buffer::{FvmBuffer, FvmResult},
    types::*,
};

/// Bumped whenever the context layout changes.
pub const FVM_CONTEXT_WIRE_VERSION: u32 = 1;

/// Bytes before the variable-length input, including the size field.
pub const FVM_CONTEXT_HEAD_LEN: usize =
    FVM_ADDRESS_LEN * 3 + FVM_WORD_LEN + 8 + FVM_WORD_LEN + 4;
/// Bytes after the variable-length input.
pub const FVM_CONTEXT_TAIL_LEN: usize = 4 + 4 + 4 + FVM_ADDRESS_LEN + 8 + 8 + 8 + FVM_WORD_LEN;

const FVM_RESULT_HEAD_LEN: usize = 4 + 8 + 4;

#[derive(thiserror::Error, Debug)]
pub enum FvmCodecError {
    #[error("buffer truncated: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    #[error("negative payload size {0}")]
    NegativeSize(i32),
    #[error("payload of {0} bytes does not fit the wire format")]
    PayloadTooLarge(usize),
    #[error("unknown call kind {0}")]
    UnknownCallKind(i32),
    #[error("unknown status code {0}")]
    UnknownStatusCode(i32),
    #[error("{0} trailing bytes after context")]
    TrailingBytes(usize),
    #[error("binary layout error: {0}")]
    Layout(#[from] binrw::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn read_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], FvmCodecError> {
    let mut out = [0; N];
    buf.read_exact(&mut out)?;
    Ok(out)
}

fn ensure_len(buf: &[u8], needed: usize) -> Result<(), FvmCodecError> {
    if buf.len() < needed {
        return Err(FvmCodecError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Decodes a call context. The message input borrows from `buf`.
pub fn decode_context(buf: &[u8]) -> Result<(FvmCallMessage<'_>, FvmTxContext), FvmCodecError> {
    ensure_len(buf, FVM_CONTEXT_HEAD_LEN + FVM_CONTEXT_TAIL_LEN)?;

    let mut rest = buf;
    let target = FvmAddress(read_array(&mut rest)?);
    let origin = FvmAddress(read_array(&mut rest)?);
    let caller = FvmAddress(read_array(&mut rest)?);
    let gas_price = FvmWord(read_array(&mut rest)?);
    let gas = rest.read_i64::<LE>()?;
    let value = FvmWord(read_array(&mut rest)?);

    let input_size = rest.read_i32::<LE>()?;
    let input_len =
        usize::try_from(input_size).map_err(|_| FvmCodecError::NegativeSize(input_size))?;
    ensure_len(rest, input_len + FVM_CONTEXT_TAIL_LEN).map_err(|_| FvmCodecError::Truncated {
        needed: FVM_CONTEXT_HEAD_LEN + input_len + FVM_CONTEXT_TAIL_LEN,
        available: buf.len(),
    })?;
    let (input, mut rest) = rest.split_at(input_len);

    let depth = rest.read_i32::<LE>()?;
    let raw_kind = rest.read_i32::<LE>()?;
    let kind = FvmCallKind::try_from_i(raw_kind).ok_or(FvmCodecError::UnknownCallKind(raw_kind))?;
    let flags = FvmCallFlags::from_bits_retain(rest.read_u32::<LE>()?);

    let tx = FvmTxContext {
        gas_price,
        origin,
        coinbase: FvmAddress(read_array(&mut rest)?),
        block_number: rest.read_i64::<LE>()?,
        block_timestamp: rest.read_i64::<LE>()?,
        block_gas_limit: rest.read_i64::<LE>()?,
        block_difficulty: FvmWord(read_array(&mut rest)?),
    };
    if !rest.is_empty() {
        return Err(FvmCodecError::TrailingBytes(rest.len()));
    }

    let msg = FvmCallMessage {
        target,
        caller,
        value,
        input,
        code_hash: FvmHash::ZERO,
        gas,
        depth,
        kind,
        flags,
    };
    Ok((msg, tx))
}

/// Inverse of [`decode_context`]. The message code hash is not part of the
/// layout and is dropped.
pub fn encode_context(msg: &FvmCallMessage<'_>, tx: &FvmTxContext) -> Result<Vec<u8>, FvmCodecError> {
    let input_size = i32::try_from(msg.input.len())
        .map_err(|_| FvmCodecError::PayloadTooLarge(msg.input.len()))?;

    let mut out =
        Vec::with_capacity(FVM_CONTEXT_HEAD_LEN + msg.input.len() + FVM_CONTEXT_TAIL_LEN);
    out.write_all(&msg.target.0)?;
    out.write_all(&tx.origin.0)?;
    out.write_all(&msg.caller.0)?;
    out.write_all(&tx.gas_price.0)?;
    out.write_i64::<LE>(msg.gas)?;
    out.write_all(&msg.value.0)?;
    out.write_i32::<LE>(input_size)?;
    out.write_all(msg.input)?;
    out.write_i32::<LE>(msg.depth)?;
    out.write_i32::<LE>(msg.kind.to_i())?;
    out.write_u32::<LE>(msg.flags.bits())?;
    out.write_all(&tx.coinbase.0)?;
    out.write_i64::<LE>(tx.block_number)?;
    out.write_i64::<LE>(tx.block_timestamp)?;
    out.write_i64::<LE>(tx.block_gas_limit)?;
    out.write_all(&tx.block_difficulty.0)?;
    Ok(out)
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
struct FvmWireResult {
    status: i32,
    gas_left: i64,
    #[br(temp)]
    #[bw(try_calc = output.len().try_into())]
    output_size: i32,
    #[br(count = output_size)]
    output: Vec<u8>,
}

pub fn encode_result(result: &FvmResult) -> Result<Vec<u8>, FvmCodecError> {
    if i32::try_from(result.output.len()).is_err() {
        return Err(FvmCodecError::PayloadTooLarge(result.output.len()));
    }
    let wire = FvmWireResult {
        status: result.status.to_i(),
        gas_left: result.gas_left,
        output: result.output.to_vec(),
    };
    let mut cursor = Cursor::new(Vec::with_capacity(FVM_RESULT_HEAD_LEN + wire.output.len()));
    cursor.write_le(&wire)?;
    Ok(cursor.into_inner())
}

pub fn decode_result(buf: &[u8]) -> Result<FvmResult, FvmCodecError> {
    ensure_len(buf, FVM_RESULT_HEAD_LEN)?;
    // Check the declared size before binrw allocates for it.
    let mut size_field = &buf[12..16];
    let output_size = size_field.read_i32::<LE>()?;
    let output_len =
        usize::try_from(output_size).map_err(|_| FvmCodecError::NegativeSize(output_size))?;
    ensure_len(buf, FVM_RESULT_HEAD_LEN + output_len)?;
    if buf.len() > FVM_RESULT_HEAD_LEN + output_len {
        return Err(FvmCodecError::TrailingBytes(
            buf.len() - FVM_RESULT_HEAD_LEN - output_len,
        ));
    }

    let wire: FvmWireResult = Cursor::new(buf).read_le()?;
    let status = FvmStatusCode::try_from_i(wire.status)
        .ok_or(FvmCodecError::UnknownStatusCode(wire.status))?;
    Ok(FvmResult::new(status, wire.gas_left, FvmBuffer::from_vec(wire.output)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context(input: &[u8]) -> (FvmCallMessage<'_>, FvmTxContext) {
        let msg = FvmCallMessage {
            target: FvmAddress([0x11; 32]),
            caller: FvmAddress([0x33; 32]),
            value: FvmWord::from_u128(1_000),
            input,
            code_hash: FvmHash::ZERO,
            gas: 90_000,
            depth: 3,
            kind: FvmCallKind::CallCode,
            flags: FvmCallFlags::STATIC,
        };
        let tx = FvmTxContext {
            gas_price: FvmWord::from_u128(7),
            origin: FvmAddress([0x22; 32]),
            coinbase: FvmAddress([0x44; 32]),
            block_number: 123_456,
            block_timestamp: 1_700_000_000,
            block_gas_limit: 8_000_000,
            block_difficulty: FvmWord::from_u128(0xdead_beef),
        };
        (msg, tx)
    }

    #[test]
    fn test_context_layout() -> anyhow::Result<()> {
        assert_eq!(FVM_CONTEXT_HEAD_LEN, 140);
        assert_eq!(FVM_CONTEXT_TAIL_LEN, 84);

        let (msg, tx) = sample_context(b"abc");
        let bytes = encode_context(&msg, &tx)?;
        assert_eq!(bytes.len(), FVM_CONTEXT_HEAD_LEN + 3 + FVM_CONTEXT_TAIL_LEN);
        assert_eq!(&bytes[0..32], &[0x11; 32]);
        assert_eq!(&bytes[32..64], &[0x22; 32]);
        assert_eq!(&bytes[112..120], &90_000i64.to_le_bytes());
        assert_eq!(&bytes[136..140], &3i32.to_le_bytes());
        assert_eq!(&bytes[140..143], b"abc");
        // kind
        assert_eq!(&bytes[147..151], &2i32.to_le_bytes());
        Ok(())
    }

    #[test]
    fn test_context_round_trip() -> anyhow::Result<()> {
        let long_input = [0xab; 300];
        for input in [&b""[..], &b"\x00\x01\x02\x03"[..], &long_input[..]] {
            let (msg, tx) = sample_context(input);
            let bytes = encode_context(&msg, &tx)?;
            let (decoded_msg, decoded_tx) = decode_context(&bytes)?;
            assert_eq!(decoded_msg, msg);
            assert_eq!(decoded_tx, tx);
            assert_eq!(encode_context(&decoded_msg, &decoded_tx)?, bytes);
        }
        Ok(())
    }

    #[test]
    fn test_context_rejects_malformed() -> anyhow::Result<()> {
        let (msg, tx) = sample_context(b"payload");
        let bytes = encode_context(&msg, &tx)?;

        assert!(matches!(
            decode_context(&bytes[..bytes.len() - 1]),
            Err(FvmCodecError::Truncated { .. })
        ));
        assert!(matches!(decode_context(&[]), Err(FvmCodecError::Truncated { .. })));

        let mut oversized = bytes.clone();
        oversized[136..140].copy_from_slice(&i32::MAX.to_le_bytes());
        assert!(matches!(
            decode_context(&oversized),
            Err(FvmCodecError::Truncated { .. })
        ));

        let mut negative = bytes.clone();
        negative[136..140].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            decode_context(&negative),
            Err(FvmCodecError::NegativeSize(-1))
        ));

        let mut bad_kind = bytes.clone();
        bad_kind[151..155].copy_from_slice(&9i32.to_le_bytes());
        assert!(matches!(
            decode_context(&bad_kind),
            Err(FvmCodecError::UnknownCallKind(9))
        ));

        let mut trailing = bytes;
        trailing.push(0);
        assert!(matches!(
            decode_context(&trailing),
            Err(FvmCodecError::TrailingBytes(1))
        ));
        Ok(())
    }

    #[test]
    fn test_result_round_trip() -> anyhow::Result<()> {
        let result = FvmResult::new(FvmStatusCode::Revert, 1234, b"reason".to_vec().into());
        let bytes = encode_result(&result)?;
        assert_eq!(bytes.len(), 16 + 6);
        assert_eq!(&bytes[0..4], &7i32.to_le_bytes());
        assert_eq!(&bytes[4..12], &1234i64.to_le_bytes());
        assert_eq!(&bytes[12..16], &6i32.to_le_bytes());

        let decoded = decode_result(&bytes)?;
        assert_eq!(decoded, result);
        assert_eq!(encode_result(&decoded)?, bytes);

        let empty = encode_result(&FvmResult::rejected())?;
        assert_eq!(empty.len(), 16);
        assert_eq!(decode_result(&empty)?.status, FvmStatusCode::Rejected);
        Ok(())
    }

    #[test]
    fn test_result_rejects_malformed() -> anyhow::Result<()> {
        let mut bytes = encode_result(&FvmResult::success(1, b"xy".to_vec().into()))?;
        assert!(matches!(
            decode_result(&bytes[..17]),
            Err(FvmCodecError::Truncated { .. })
        ));
        bytes[0..4].copy_from_slice(&99i32.to_le_bytes());
        assert!(matches!(
            decode_result(&bytes),
            Err(FvmCodecError::UnknownStatusCode(99))
        ));
        Ok(())
    }
}
