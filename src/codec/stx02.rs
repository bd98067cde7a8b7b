//! STX02 `02` framing: `02 len cmd payload... xor`, where `len` is the total
//! frame length (including the trailing XOR byte) and `xor` is the XOR of
//! every preceding byte.

use super::{xor_all, CodecError, Validated};

pub const SOF: u8 = 0x02;
/// Smallest legal total frame length: SOF, len, cmd, xor.
pub const MIN_LEN: usize = 4;
pub const MAX_LEN: usize = 64;
const OVERHEAD: usize = 4; // SOF, len, cmd, xor

/// Build an STX02 frame into `out`. Returns the number of bytes written, or
/// `0` if the resulting frame would fall outside `[MIN_LEN, MAX_LEN]` or
/// `out` is too small.
pub fn build_frame(cmd: u8, payload: &[u8], out: &mut [u8]) -> usize {
    let total = payload.len() + OVERHEAD;
    if total < MIN_LEN || total > MAX_LEN || out.len() < total {
        return 0;
    }

    out[0] = SOF;
    out[1] = total as u8;
    out[2] = cmd;
    out[3..3 + payload.len()].copy_from_slice(payload);
    out[total - 1] = xor_all(&out[..total - 1]);

    total
}

/// Validate a received STX02 frame of total length `len`.
pub fn validate_frame(bytes: &[u8], len: usize) -> Result<Validated<'_>, CodecError> {
    if len < MIN_LEN {
        return Err(CodecError::TooShort);
    }
    if len > MAX_LEN {
        return Err(CodecError::LengthOutOfRange);
    }
    if bytes.len() < len {
        return Err(CodecError::TooShort);
    }
    if bytes[0] != SOF {
        return Err(CodecError::BadHeader);
    }
    if bytes[1] as usize != len {
        return Err(CodecError::LengthOutOfRange);
    }

    let expected = xor_all(&bytes[..len - 1]);
    if bytes[len - 1] != expected {
        return Err(CodecError::Checksum);
    }

    Ok(Validated {
        opcode: bytes[2],
        payload: &bytes[3..len - 1],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut buf = [0u8; 32];
        let payload = [1, 2, 3, 4, 5];
        let n = build_frame(0x01, &payload, &mut buf);
        assert_eq!(n, payload.len() + OVERHEAD);
        let v = validate_frame(&buf, n).unwrap();
        assert_eq!(v.opcode, 0x01);
        assert_eq!(v.payload, &payload);
    }

    #[test]
    fn rejects_too_short_and_too_long() {
        let mut buf = [0u8; 70];
        assert_eq!(build_frame(0x01, &[], &mut buf[..3]), 0); // len field itself won't fit in MIN_LEN-3
        assert_eq!(build_frame(0x01, &[0u8; 61], &mut buf), 0); // total 65 > MAX_LEN
    }

    #[test]
    fn checksum_mismatch() {
        let mut buf = [0u8; 32];
        let n = build_frame(0x01, &[9, 9], &mut buf);
        buf[3] ^= 1;
        assert_eq!(validate_frame(&buf, n), Err(CodecError::Checksum));
    }
}
