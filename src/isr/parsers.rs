//! The four per-protocol byte-level state machines, run concurrently on the
//! same incoming byte stream because the wire format is not self-identifying.
//! Each implements [`FrameParser`] so the dispatcher in `isr::mod` can hold a
//! fixed array of them instead of hand-rolling four parallel `match`
//! statements.

use crate::codec::{auth, shengyi, stx02, v2, CodecError};

/// Outcome of feeding one byte to a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedResult {
    /// No frame completed (and no error) yet.
    Pending,
    /// A frame of `len` bytes sits in `FrameParser::buffer()[..len]`.
    /// `aux16` is 0 for every protocol except a V2 deterministic capture,
    /// where it carries the armed message id back to the caller.
    Frame { len: usize, opcode: u8, aux16: u16 },
    /// A transient parse error; the parser has already reset itself.
    Error(CodecError),
}

pub trait FrameParser {
    fn feed_byte(&mut self, byte: u8) -> FeedResult;
    /// The most recently captured frame's bytes. Valid only immediately
    /// after a `FeedResult::Frame` return, before the next `feed_byte` call.
    fn buffer(&self) -> &[u8];
    fn reset(&mut self);
}

// ---------------------------------------------------------------- Shengyi

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShengyiState {
    WaitStart,
    WaitSecond,
    WaitOpcode,
    WaitLen,
    ReadPayload,
}

const SHENGYI_BUF_LEN: usize = shengyi::MAX_PAYLOAD + 8;

pub struct ShengyiParser {
    state: ShengyiState,
    buf: [u8; SHENGYI_BUF_LEN],
    idx: usize,
    total: usize,
}

impl Default for ShengyiParser {
    fn default() -> Self {
        Self {
            state: ShengyiState::WaitStart,
            buf: [0; SHENGYI_BUF_LEN],
            idx: 0,
            total: 0,
        }
    }
}

impl FrameParser for ShengyiParser {
    fn feed_byte(&mut self, byte: u8) -> FeedResult {
        use ShengyiState::*;
        match self.state {
            WaitStart => {
                if byte == shengyi::SOF {
                    self.buf[0] = byte;
                    self.idx = 1;
                    self.state = WaitSecond;
                }
                FeedResult::Pending
            }
            WaitSecond => {
                self.buf[1] = byte;
                self.idx = 2;
                self.state = WaitOpcode;
                FeedResult::Pending
            }
            WaitOpcode => {
                self.buf[2] = byte;
                self.idx = 3;
                self.state = WaitLen;
                FeedResult::Pending
            }
            WaitLen => {
                let payload_len = byte as usize;
                if payload_len > shengyi::MAX_PAYLOAD {
                    self.reset();
                    return FeedResult::Error(CodecError::LengthOutOfRange);
                }
                self.buf[3] = byte;
                self.idx = 4;
                self.total = payload_len + 8;
                self.state = ReadPayload;
                FeedResult::Pending
            }
            ReadPayload => {
                if self.idx >= self.buf.len() {
                    self.reset();
                    return FeedResult::Error(CodecError::Overflow);
                }
                self.buf[self.idx] = byte;
                self.idx += 1;
                if self.idx != self.total {
                    return FeedResult::Pending;
                }
                let total = self.total;
                let result = match shengyi::validate_frame(&self.buf, total) {
                    Ok(v) => FeedResult::Frame {
                        len: total,
                        opcode: v.opcode,
                        aux16: 0,
                    },
                    Err(e) => FeedResult::Error(e),
                };
                self.state = WaitStart;
                self.idx = 0;
                result
            }
        }
    }

    fn buffer(&self) -> &[u8] {
        &self.buf[..self.total.max(self.idx)]
    }

    fn reset(&mut self) {
        self.state = ShengyiState::WaitStart;
        self.idx = 0;
    }
}

// ----------------------------------------------------------------- STX02

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stx02State {
    WaitSof,
    WaitLen,
    Read,
}

pub struct Stx02Parser {
    state: Stx02State,
    buf: [u8; stx02::MAX_LEN],
    idx: usize,
    total: usize,
}

impl Default for Stx02Parser {
    fn default() -> Self {
        Self {
            state: Stx02State::WaitSof,
            buf: [0; stx02::MAX_LEN],
            idx: 0,
            total: 0,
        }
    }
}

impl FrameParser for Stx02Parser {
    fn feed_byte(&mut self, byte: u8) -> FeedResult {
        use Stx02State::*;
        match self.state {
            WaitSof => {
                if byte == stx02::SOF {
                    self.buf[0] = byte;
                    self.idx = 1;
                    self.state = WaitLen;
                }
                FeedResult::Pending
            }
            WaitLen => {
                let total = byte as usize;
                if total < stx02::MIN_LEN || total > stx02::MAX_LEN {
                    self.reset();
                    return FeedResult::Error(CodecError::LengthOutOfRange);
                }
                self.buf[1] = byte;
                self.idx = 2;
                self.total = total;
                self.state = Read;
                FeedResult::Pending
            }
            Read => {
                if self.idx >= self.buf.len() {
                    self.reset();
                    return FeedResult::Error(CodecError::Overflow);
                }
                self.buf[self.idx] = byte;
                self.idx += 1;
                if self.idx != self.total {
                    return FeedResult::Pending;
                }
                let total = self.total;
                let result = match stx02::validate_frame(&self.buf, total) {
                    Ok(v) => FeedResult::Frame {
                        len: total,
                        opcode: v.opcode,
                        aux16: 0,
                    },
                    Err(e) => FeedResult::Error(e),
                };
                self.state = WaitSof;
                self.idx = 0;
                result
            }
        }
    }

    fn buffer(&self) -> &[u8] {
        &self.buf[..self.total.max(self.idx)]
    }

    fn reset(&mut self) {
        self.state = Stx02State::WaitSof;
        self.idx = 0;
    }
}

// ------------------------------------------------------------------- AUTH

/// AUTH frames carry no length field; this is the largest frame this parser
/// will accept before giving up and reporting an overflow.
const AUTH_BUF_LEN: usize = 16;

pub struct AuthParser {
    active: bool,
    buf: [u8; AUTH_BUF_LEN],
    idx: usize,
    /// Length of the last completed capture; `buffer()` reports this after
    /// `feed_byte` resets `idx` back to 0 for the next frame.
    last_total: usize,
}

impl Default for AuthParser {
    fn default() -> Self {
        Self {
            active: false,
            buf: [0; AUTH_BUF_LEN],
            idx: 0,
            last_total: 0,
        }
    }
}

impl FrameParser for AuthParser {
    fn feed_byte(&mut self, byte: u8) -> FeedResult {
        if !self.active {
            if byte == auth::SOF_A || byte == auth::SOF_B {
                self.active = true;
                self.buf[0] = byte;
                self.idx = 1;
            }
            return FeedResult::Pending;
        }

        if self.idx >= self.buf.len() {
            self.reset();
            return FeedResult::Error(CodecError::Overflow);
        }

        self.buf[self.idx] = byte;
        self.idx += 1;

        if byte != 0x0D {
            return FeedResult::Pending;
        }

        let total = self.idx;
        let result = match auth::validate_frame(&self.buf, total) {
            Ok(v) => FeedResult::Frame {
                len: total,
                opcode: v.opcode,
                aux16: 0,
            },
            Err(e) => FeedResult::Error(e),
        };
        self.active = false;
        self.last_total = total;
        self.idx = 0;
        result
    }

    fn buffer(&self) -> &[u8] {
        &self.buf[..self.last_total]
    }

    fn reset(&mut self) {
        self.active = false;
        self.idx = 0;
    }
}

// --------------------------------------------------------------------- V2

struct ArmedCapture {
    buf: [u8; v2::MAX_LEN],
    idx: usize,
    total_len: usize,
    msg_id: u16,
}

pub struct V2Parser {
    window: [u8; v2::MAX_LEN],
    filled: usize,
    armed: Option<ArmedCapture>,
    captured: [u8; v2::MAX_LEN],
    captured_len: usize,
}

impl Default for V2Parser {
    fn default() -> Self {
        Self {
            window: [0; v2::MAX_LEN],
            filled: 0,
            armed: None,
            captured: [0; v2::MAX_LEN],
            captured_len: 0,
        }
    }
}

impl V2Parser {
    /// Arm deterministic capture: the next `total_len` bytes are captured
    /// as one frame without sliding-window guessing. Wins over a
    /// simultaneously-matching guess, per spec.
    pub fn arm_deterministic(&mut self, msg_id: u16, total_len: usize) {
        let total_len = total_len.clamp(v2::MIN_LEN, v2::MAX_LEN);
        self.armed = Some(ArmedCapture {
            buf: [0; v2::MAX_LEN],
            idx: 0,
            total_len,
            msg_id,
        });
    }
}

impl FrameParser for V2Parser {
    fn feed_byte(&mut self, byte: u8) -> FeedResult {
        if let Some(armed) = &mut self.armed {
            armed.buf[armed.idx] = byte;
            armed.idx += 1;
            if armed.idx != armed.total_len {
                return FeedResult::Pending;
            }
            let total_len = armed.total_len;
            let msg_id = armed.msg_id;
            let result = match v2::validate_frame(&armed.buf, total_len) {
                Ok(v) => {
                    self.captured[..total_len].copy_from_slice(&armed.buf[..total_len]);
                    self.captured_len = total_len;
                    FeedResult::Frame {
                        len: total_len,
                        opcode: v.opcode,
                        aux16: msg_id,
                    }
                }
                Err(e) => FeedResult::Error(e),
            };
            self.armed = None;
            return result;
        }

        // Sliding window of the last `v2::MAX_LEN` bytes.
        for i in 0..v2::MAX_LEN - 1 {
            self.window[i] = self.window[i + 1];
        }
        self.window[v2::MAX_LEN - 1] = byte;
        if self.filled < v2::MAX_LEN {
            self.filled += 1;
        }

        for len in v2::MIN_LEN..=v2::MAX_LEN {
            if self.filled < len {
                continue;
            }
            let slice = &self.window[v2::MAX_LEN - len..];
            if let Ok(v) = v2::validate_frame(slice, len) {
                self.captured[..len].copy_from_slice(slice);
                self.captured_len = len;
                return FeedResult::Frame {
                    len,
                    opcode: v.opcode,
                    aux16: 0,
                };
            }
        }

        FeedResult::Pending
    }

    fn buffer(&self) -> &[u8] {
        &self.captured[..self.captured_len]
    }

    fn reset(&mut self) {
        self.filled = 0;
        self.armed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{auth::SOF_A, shengyi};

    fn feed_all(parser: &mut dyn FrameParser, bytes: &[u8]) -> FeedResult {
        let mut last = FeedResult::Pending;
        for &b in bytes {
            last = parser.feed_byte(b);
        }
        last
    }

    #[test]
    fn shengyi_parser_captures_valid_frame() {
        let mut buf = [0u8; 32];
        let n = shengyi::build_frame(0x52, &[1, 2], &mut buf);
        let mut p = ShengyiParser::default();
        let r = feed_all(&mut p, &buf[..n]);
        assert_eq!(
            r,
            FeedResult::Frame {
                len: n,
                opcode: 0x52,
                aux16: 0
            }
        );
    }

    #[test]
    fn shengyi_parser_rejects_overlong_len_byte() {
        let mut p = ShengyiParser::default();
        assert_eq!(p.feed_byte(shengyi::SOF), FeedResult::Pending);
        assert_eq!(p.feed_byte(shengyi::SECOND_BYTE), FeedResult::Pending);
        assert_eq!(p.feed_byte(0x52), FeedResult::Pending);
        assert_eq!(
            p.feed_byte(200),
            FeedResult::Error(CodecError::LengthOutOfRange)
        );
    }

    #[test]
    fn stx02_parser_captures_valid_frame() {
        let mut buf = [0u8; 32];
        let n = stx02::build_frame(0x01, &[1, 2, 3], &mut buf);
        let mut p = Stx02Parser::default();
        let r = feed_all(&mut p, &buf[..n]);
        assert_eq!(
            r,
            FeedResult::Frame {
                len: n,
                opcode: 0x01,
                aux16: 0
            }
        );
    }

    #[test]
    fn auth_parser_captures_valid_frame() {
        let mut buf = [0u8; 16];
        let n = auth::build_frame(SOF_A, &[0x11, 0x22], &mut buf);
        let mut p = AuthParser::default();
        let r = feed_all(&mut p, &buf[..n]);
        assert_eq!(
            r,
            FeedResult::Frame {
                len: n,
                opcode: SOF_A,
                aux16: 0
            }
        );
    }

    #[test]
    fn v2_parser_sliding_window_finds_frame() {
        let mut buf = [0u8; 8];
        let n = v2::build_frame(&[10, 20], &mut buf);
        let mut p = V2Parser::default();
        // Prime the window with noise, then feed the real frame.
        p.feed_byte(0xAA);
        p.feed_byte(0xBB);
        let r = feed_all(&mut p, &buf[..n]);
        assert_eq!(
            r,
            FeedResult::Frame {
                len: n,
                opcode: 0,
                aux16: 0
            }
        );
    }

    #[test]
    fn v2_parser_deterministic_capture_wins_and_tags_aux16() {
        let mut buf = [0u8; 8];
        let n = v2::build_frame(&[0x11, 0x90, 0x01], &mut buf);
        let mut p = V2Parser::default();
        p.arm_deterministic(0x1190, n);
        let r = feed_all(&mut p, &buf[..n]);
        assert_eq!(
            r,
            FeedResult::Frame {
                len: n,
                opcode: 0,
                aux16: 0x1190
            }
        );
    }
}
