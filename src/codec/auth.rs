//! AUTH framing: `SOF payload... xor CR`, `SOF ∈ {0x46, 0x53}`, `CR = 0x0D`,
//! `xor` is the XOR of `[1 .. len-3]` inclusive (the payload bytes).
//!
//! `0x0D` is also the frame terminator, so a payload whose XOR happens to
//! equal `0x0D` would be ambiguous on the wire. `build_frame` refuses to
//! produce such a frame; callers that need to guarantee a frame gets sent
//! (the link manager's periodic AUTH encoder) carry a spare nonce byte in
//! the payload they vary until `build_frame` succeeds.

use super::{xor_all, CodecError, Validated};

pub const SOF_A: u8 = 0x46;
pub const SOF_B: u8 = 0x53;
const TERMINATOR: u8 = 0x0D;
const OVERHEAD: usize = 3; // SOF, xor, CR

/// Build an AUTH frame. Returns `0` (refusing to build) if the payload's XOR
/// would collide with the frame terminator, if `out` is too small, or if
/// `sof` isn't one of the two legal start bytes.
pub fn build_frame(sof: u8, payload: &[u8], out: &mut [u8]) -> usize {
    if sof != SOF_A && sof != SOF_B {
        return 0;
    }
    let total = payload.len() + OVERHEAD;
    if out.len() < total {
        return 0;
    }

    let xor = xor_all(payload);
    if xor == TERMINATOR {
        return 0;
    }

    out[0] = sof;
    out[1..1 + payload.len()].copy_from_slice(payload);
    out[total - 2] = xor;
    out[total - 1] = TERMINATOR;

    total
}

/// Validate a received AUTH frame of total length `len`.
pub fn validate_frame(bytes: &[u8], len: usize) -> Result<Validated<'_>, CodecError> {
    if len < OVERHEAD {
        return Err(CodecError::TooShort);
    }
    if bytes.len() < len {
        return Err(CodecError::TooShort);
    }
    if bytes[0] != SOF_A && bytes[0] != SOF_B {
        return Err(CodecError::BadHeader);
    }
    if bytes[len - 1] != TERMINATOR {
        return Err(CodecError::BadHeader);
    }

    let payload = &bytes[1..len - 2];
    let expected = xor_all(payload);
    if bytes[len - 2] != expected {
        return Err(CodecError::Checksum);
    }

    Ok(Validated {
        opcode: bytes[0],
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut buf = [0u8; 16];
        let n = build_frame(SOF_A, &[0x01, 0x02], &mut buf);
        assert!(n > 0);
        let v = validate_frame(&buf, n).unwrap();
        assert_eq!(v.opcode, SOF_A);
        assert_eq!(v.payload, &[0x01, 0x02]);
    }

    #[test]
    fn xor_never_collides_with_terminator() {
        // A payload engineered to XOR to exactly the terminator byte.
        let mut buf = [0u8; 16];
        let n = build_frame(SOF_A, &[TERMINATOR], &mut buf);
        assert_eq!(n, 0);
    }

    #[test]
    fn rejects_bad_sof() {
        let mut buf = [0u8; 16];
        assert_eq!(build_frame(0x00, &[1, 2], &mut buf), 0);
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut buf = [0u8; 16];
        let n = build_frame(SOF_B, &[1, 2], &mut buf);
        buf[n - 1] = 0x00;
        assert_eq!(validate_frame(&buf, n), Err(CodecError::BadHeader));
    }
}
