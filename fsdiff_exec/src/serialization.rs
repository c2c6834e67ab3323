//! Packed exec encoding of a program.
//!
//! The supervisor writes one little-endian instruction stream into the
//! input arena: one syscall-id word per call, closed by an EOF marker.
//! Argument encoding is owned by the external program database and rides
//! on the same stream.

use bytes::BufMut;
use fsdiff_core::prog::Prog;
use iota::iota;
use thiserror::Error;

iota! {
    pub const EXEC_INSTR_EOF: u64 = (u64::MAX) ^ (iota);
}

pub const EXEC_MAX_COMMANDS: usize = 1000;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("buffer too small to serialize the prog, provided size: {provided} bytes")]
    BufferTooSmall { provided: usize },
    #[error("too many calls in prog: {0}")]
    TooManyCalls(usize),
}

/// Serializes `p` into `buf`, returning the number of bytes written.
pub fn serialize(p: &Prog, buf: &mut [u8]) -> Result<usize, SerializeError> {
    if p.len() > EXEC_MAX_COMMANDS {
        return Err(SerializeError::TooManyCalls(p.len()));
    }
    let total = buf.len();
    let need = (p.len() + 1) * std::mem::size_of::<u64>();
    if need > total {
        return Err(SerializeError::BufferTooSmall { provided: total });
    }
    let mut cursor = &mut buf[..];
    for call in p.calls() {
        cursor.put_u64_le(call.meta().id());
    }
    cursor.put_u64_le(EXEC_INSTR_EOF);
    Ok(need)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsdiff_core::prog::{Call, Syscall};
    use std::sync::Arc;

    fn prog_of(calls: &[(&str, u64)]) -> Prog {
        Prog::new(
            calls
                .iter()
                .map(|(n, id)| Call::new(Arc::new(Syscall::new(*id, *n))))
                .collect(),
        )
    }

    #[test]
    fn writes_ids_and_eof() {
        let p = prog_of(&[("open", 2), ("close", 3)]);
        let mut buf = [0u8; 64];
        let n = serialize(&p, &mut buf).unwrap();
        assert_eq!(n, 24);
        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), 2);
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), 3);
        assert_eq!(
            u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            EXEC_INSTR_EOF
        );
    }

    #[test]
    fn empty_prog_is_just_eof() {
        let p = Prog::default();
        let mut buf = [0u8; 16];
        assert_eq!(serialize(&p, &mut buf).unwrap(), 8);
    }

    #[test]
    fn rejects_too_small_buffer() {
        let p = prog_of(&[("open", 2)]);
        let mut buf = [0u8; 8];
        assert!(matches!(
            serialize(&p, &mut buf),
            Err(SerializeError::BufferTooSmall { provided: 8 })
        ));
    }
}
