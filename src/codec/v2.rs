//! V2 fixed-size framing: 3-5 byte frames with no start-of-frame marker.
//! The final byte equals `data[n-3] + data[n-2]` (mod 256), or that sum plus
//! an empirical bias of 32 (mod 256). The bias is accepted on receive for a
//! variant controller; this encoder always produces the unbiased form.

use super::{CodecError, Validated};

pub const MIN_LEN: usize = 3;
pub const MAX_LEN: usize = 5;
/// Empirical checksum bias accepted from some controller variants.
/// See spec Open Questions: a future variant may need to extend this set.
pub const BIAS: u8 = 32;

/// Build a V2 frame from a 2-4 byte payload. Returns `0` if `payload` isn't
/// in `[2, 4]` bytes or `out` is too small.
pub fn build_frame(payload: &[u8], out: &mut [u8]) -> usize {
    if payload.len() < MIN_LEN - 1 || payload.len() > MAX_LEN - 1 {
        return 0;
    }
    let total = payload.len() + 1;
    if out.len() < total {
        return 0;
    }

    out[..payload.len()].copy_from_slice(payload);
    let a = payload[payload.len() - 2];
    let b = payload[payload.len() - 1];
    out[total - 1] = a.wrapping_add(b);

    total
}

/// Validate a received V2 frame of total length `len`, accepting either
/// checksum relation.
pub fn validate_frame(bytes: &[u8], len: usize) -> Result<Validated<'_>, CodecError> {
    if len < MIN_LEN || len > MAX_LEN {
        return Err(CodecError::LengthOutOfRange);
    }
    if bytes.len() < len {
        return Err(CodecError::TooShort);
    }

    let a = bytes[len - 3];
    let b = bytes[len - 2];
    let last = bytes[len - 1];
    let plain = a.wrapping_add(b);

    if last != plain && last != plain.wrapping_add(BIAS) {
        return Err(CodecError::Checksum);
    }

    Ok(Validated {
        // V2 has no opcode byte; callers discriminate by message content/length.
        opcode: 0,
        payload: &bytes[..len - 1],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_lengths() {
        let candidates: [&[u8]; 3] = [&[1, 2], &[1, 2, 3], &[1, 2, 3, 4]];
        for payload in candidates {
            let mut buf = [0u8; 8];
            let n = build_frame(payload, &mut buf);
            assert_eq!(n, payload.len() + 1);
            assert!(validate_frame(&buf, n).is_ok());
        }
    }

    #[test]
    fn accepts_biased_checksum() {
        let mut buf = [10u8, 20, 0];
        buf[2] = 10u8.wrapping_add(20).wrapping_add(BIAS);
        assert!(validate_frame(&buf, 3).is_ok());
    }

    #[test]
    fn rejects_bad_length() {
        let buf = [1u8, 2];
        assert_eq!(
            validate_frame(&buf, 2),
            Err(CodecError::LengthOutOfRange)
        );
    }

    #[test]
    fn rejects_wrong_checksum() {
        let buf = [1u8, 2, 99];
        assert_eq!(validate_frame(&buf, 3), Err(CodecError::Checksum));
    }
}
