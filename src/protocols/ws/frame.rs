//! WebSocket frame model and wire encoding.

use crate::buffer::ByteBuf;
use crate::protocols::Encode;

/// Frame opcode nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Opcode> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// One WebSocket frame. `masked` controls encoding only; decoded frames
/// arrive with the payload already unmasked.
pub struct WsFrame {
    pub opcode: Opcode,
    pub fin: bool,
    pub rsv: u8,
    pub masked: bool,
    pub payload: ByteBuf,
}

impl WsFrame {
    pub fn new(opcode: Opcode) -> WsFrame {
        WsFrame {
            opcode,
            fin: true,
            rsv: 0,
            masked: false,
            payload: ByteBuf::new(),
        }
    }

    pub fn text(text: &str) -> WsFrame {
        let frame = WsFrame::new(Opcode::Text);
        frame.payload.write_bytes(text.as_bytes());
        frame
    }

    pub fn binary(data: &[u8]) -> WsFrame {
        let frame = WsFrame::new(Opcode::Binary);
        frame.payload.write_bytes(data);
        frame
    }

    pub fn close() -> WsFrame {
        WsFrame::new(Opcode::Close)
    }

    pub fn ping(data: &[u8]) -> WsFrame {
        let frame = WsFrame::new(Opcode::Ping);
        frame.payload.write_bytes(data);
        frame
    }

    pub fn pong(data: &[u8]) -> WsFrame {
        let frame = WsFrame::new(Opcode::Pong);
        frame.payload.write_bytes(data);
        frame
    }

    pub fn payload_text(&self) -> String {
        self.payload.to_string_lossy()
    }
}

impl std::fmt::Debug for WsFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsFrame")
            .field("opcode", &self.opcode)
            .field("fin", &self.fin)
            .field("rsv", &self.rsv)
            .field("masked", &self.masked)
            .field("payload_len", &self.payload.readable_bytes())
            .finish()
    }
}

impl Encode for WsFrame {
    /// Serialize, consuming the payload. Masked frames get a random
    /// masking key.
    fn encode(&self, buf: &ByteBuf) {
        let first = (if self.fin { 0x80 } else { 0 }) | ((self.rsv & 0x07) << 4) | self.opcode.as_u8();
        buf.write_u8(first);

        let length = self.payload.readable_bytes();
        let mask_bit = if self.masked { 0x80 } else { 0x00 };
        if length < 126 {
            buf.write_u8(mask_bit | length as u8);
        } else if length <= u16::MAX as usize {
            buf.write_u8(mask_bit | 126);
            buf.write_u16(length as u16);
        } else {
            buf.write_u8(mask_bit | 127);
            buf.write_u64(length as u64);
        }

        if self.masked {
            let mask: [u8; 4] = rand::random();
            buf.write_bytes(&mask);
            let mut data = self.payload.to_vec();
            self.payload.skip_bytes(data.len());
            for (i, byte) in data.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
            buf.write_bytes(&data);
        } else {
            buf.write_from(&self.payload, None);
        }
    }
}
