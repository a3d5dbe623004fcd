//! Incremental WebSocket frame decoding.

use crate::buffer::ByteBuf;
use crate::config::WsOptions;
use crate::error::SessionError;
use crate::protocols::ws::frame::{Opcode, WsFrame};
use crate::protocols::{Decoder, Message, MessageSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    First,
    Second,
    Size16,
    Size64,
    MaskingKey,
    Payload,
}

/// Streaming frame decoder: delivers one `Message::Frame` per wire frame,
/// payload unmasked, fragmentation untouched.
pub struct WsFrameDecoder {
    expect_masked: bool,
    max_payload: usize,
    state: State,
    fin: bool,
    rsv: u8,
    opcode: Opcode,
    masked: bool,
    remaining: usize,
    mask: [u8; 4],
    mask_offset: usize,
    payload: ByteBuf,
}

impl WsFrameDecoder {
    /// `expect_masked` is true on servers: client frames must be masked,
    /// server frames must not be.
    pub fn new(options: &WsOptions, expect_masked: bool) -> WsFrameDecoder {
        WsFrameDecoder {
            expect_masked,
            max_payload: options.max_payload_size,
            state: State::First,
            fin: false,
            rsv: 0,
            opcode: Opcode::Continuation,
            masked: false,
            remaining: 0,
            mask: [0; 4],
            mask_offset: 0,
            payload: ByteBuf::new(),
        }
    }

    fn accept_length(&mut self, length: usize) -> Result<(), SessionError> {
        if length > self.max_payload {
            return Err(SessionError::WebSocketMessage(format!(
                "frame payload of {} bytes exceeds {} byte limit",
                length, self.max_payload
            )));
        }
        self.remaining = length;
        self.state = if self.masked {
            State::MaskingKey
        } else {
            State::Payload
        };
        Ok(())
    }

    fn finish_frame(&mut self) -> WsFrame {
        self.state = State::First;
        self.mask_offset = 0;
        WsFrame {
            opcode: self.opcode,
            fin: self.fin,
            rsv: self.rsv,
            masked: self.masked,
            payload: std::mem::replace(&mut self.payload, ByteBuf::new()),
        }
    }
}

impl Decoder for WsFrameDecoder {
    fn reset(&mut self) {
        self.state = State::First;
        self.remaining = 0;
        self.mask_offset = 0;
        self.payload = ByteBuf::new();
    }

    fn decode(
        &mut self,
        buf: &ByteBuf,
        sink: &mut MessageSink<'_>,
        _peer_closed: bool,
    ) -> Result<bool, SessionError> {
        loop {
            match self.state {
                State::First => {
                    let first = match buf.read_u8() {
                        Some(byte) => byte,
                        None => return Ok(true),
                    };
                    self.fin = first & 0x80 != 0;
                    self.rsv = (first >> 4) & 0x07;
                    self.opcode = Opcode::from_u8(first & 0x0F).ok_or_else(|| {
                        SessionError::WebSocketMessage(format!(
                            "invalid opcode {:#x}",
                            first & 0x0F
                        ))
                    })?;
                    self.state = State::Second;
                }

                State::Second => {
                    let second = match buf.read_u8() {
                        Some(byte) => byte,
                        None => return Ok(true),
                    };
                    self.masked = second & 0x80 != 0;
                    if self.masked != self.expect_masked {
                        return Err(SessionError::WebSocketMessage(
                            if self.expect_masked {
                                "unmasked frame from client".to_string()
                            } else {
                                "masked frame from server".to_string()
                            },
                        ));
                    }
                    match second & 0x7F {
                        126 => self.state = State::Size16,
                        127 => self.state = State::Size64,
                        length => self.accept_length(length as usize)?,
                    }
                }

                State::Size16 => {
                    let length = match buf.read_u16() {
                        Some(length) => length,
                        None => return Ok(true),
                    };
                    self.accept_length(length as usize)?;
                }

                State::Size64 => {
                    let length = match buf.read_u64() {
                        Some(length) => length,
                        None => return Ok(true),
                    };
                    if length > usize::MAX as u64 {
                        return Err(SessionError::WebSocketMessage(
                            "frame length out of range".to_string(),
                        ));
                    }
                    self.accept_length(length as usize)?;
                }

                State::MaskingKey => {
                    let key = match buf.read_u32() {
                        Some(key) => key,
                        None => return Ok(true),
                    };
                    self.mask = key.to_be_bytes();
                    self.mask_offset = 0;
                    self.state = State::Payload;
                }

                State::Payload => {
                    let take = buf.readable_bytes().min(self.remaining);
                    if take > 0 {
                        let mut data = vec![0u8; take];
                        buf.read_bytes(&mut data);
                        if self.masked {
                            for byte in data.iter_mut() {
                                *byte ^= self.mask[self.mask_offset % 4];
                                self.mask_offset += 1;
                            }
                        }
                        self.payload.write_bytes(&data);
                        self.remaining -= take;
                    }
                    if self.remaining > 0 {
                        return Ok(true);
                    }
                    let frame = self.finish_frame();
                    if !sink(Message::Frame(frame)) {
                        return Ok(false);
                    }
                }
            }
        }
    }
}

/// Reassembles fragmented messages and delivers whole frames.
///
/// Control frames pass straight through. Data fragments accumulate per
/// starting opcode until the final fragment arrives.
pub struct WsFullFrameDecoder {
    inner: WsFrameDecoder,
    slots: [Option<WsFrame>; 16],
    open: Option<usize>,
    max_payload: usize,
}

impl WsFullFrameDecoder {
    pub fn new(options: &WsOptions, expect_masked: bool) -> WsFullFrameDecoder {
        WsFullFrameDecoder {
            inner: WsFrameDecoder::new(options, expect_masked),
            slots: core::array::from_fn(|_| None),
            open: None,
            max_payload: options.max_payload_size,
        }
    }
}

impl Decoder for WsFullFrameDecoder {
    fn reset(&mut self) {
        self.inner.reset();
        self.slots = core::array::from_fn(|_| None);
        self.open = None;
    }

    fn decode(
        &mut self,
        buf: &ByteBuf,
        sink: &mut MessageSink<'_>,
        peer_closed: bool,
    ) -> Result<bool, SessionError> {
        let slots = &mut self.slots;
        let open = &mut self.open;
        let max_payload = self.max_payload;
        let mut failure: Option<SessionError> = None;

        let result = self.inner.decode(
            buf,
            &mut |message: Message| {
                let frame = match message {
                    Message::Frame(frame) => frame,
                    other => return sink(other),
                };
                if frame.opcode.is_control() {
                    return sink(Message::Frame(frame));
                }

                let index = if frame.opcode == Opcode::Continuation {
                    match *open {
                        Some(index) => index,
                        None => {
                            failure = Some(SessionError::WebSocketMessage(
                                "continuation frame without a message".to_string(),
                            ));
                            return false;
                        }
                    }
                } else {
                    frame.opcode.as_u8() as usize
                };

                match slots[index].take() {
                    None => {
                        if frame.fin {
                            return sink(Message::Frame(frame));
                        }
                        *open = Some(index);
                        slots[index] = Some(frame);
                        true
                    }
                    Some(mut pending) => {
                        if frame.opcode != Opcode::Continuation {
                            failure = Some(SessionError::WebSocketMessage(
                                "new message before final fragment".to_string(),
                            ));
                            return false;
                        }
                        pending.payload.write_from(&frame.payload, None);
                        if pending.payload.readable_bytes() > max_payload {
                            *open = None;
                            failure = Some(SessionError::WebSocketMessage(format!(
                                "reassembled message exceeds {} byte limit",
                                max_payload
                            )));
                            return false;
                        }
                        if frame.fin {
                            *open = None;
                            pending.fin = true;
                            return sink(Message::Frame(pending));
                        }
                        slots[index] = Some(pending);
                        true
                    }
                }
            },
            peer_closed,
        );

        match failure {
            Some(error) => Err(error),
            None => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn options() -> WsOptions {
        WsOptions::default()
    }

    fn collect(
        decoder: &mut dyn Decoder,
        buf: &ByteBuf,
    ) -> Result<Vec<WsFrame>, SessionError> {
        let frames = RefCell::new(Vec::new());
        decoder.decode(
            buf,
            &mut |message| {
                if let Message::Frame(frame) = message {
                    frames.borrow_mut().push(frame);
                }
                true
            },
            false,
        )?;
        Ok(frames.into_inner())
    }

    #[test]
    fn test_unmasked_text_frame() {
        let mut decoder = WsFrameDecoder::new(&options(), false);
        let buf = ByteBuf::from_slice(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);
        let frames = collect(&mut decoder, &buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Text);
        assert!(frames[0].fin);
        assert_eq!(frames[0].payload_text(), "hello");
    }

    #[test]
    fn test_masked_frame_is_unmasked() {
        let mut decoder = WsFrameDecoder::new(&options(), true);
        let mask = [0x11, 0x22, 0x33, 0x44];
        let mut wire = vec![0x82, 0x80 | 4];
        wire.extend_from_slice(&mask);
        for (i, byte) in b"data".iter().enumerate() {
            wire.push(byte ^ mask[i % 4]);
        }
        let buf = ByteBuf::from_slice(&wire);
        let frames = collect(&mut decoder, &buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Binary);
        assert_eq!(frames[0].payload.to_vec(), b"data");
    }

    #[test]
    fn test_header_split_across_feeds() {
        let mut decoder = WsFrameDecoder::new(&options(), false);
        let buf = ByteBuf::from_slice(&[0x81]);
        assert!(collect(&mut decoder, &buf).unwrap().is_empty());

        buf.write_bytes(&[0x02, b'h']);
        assert!(collect(&mut decoder, &buf).unwrap().is_empty());

        buf.write_bytes(&[b'i']);
        let frames = collect(&mut decoder, &buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload_text(), "hi");
    }

    #[test]
    fn test_mask_expectation_mismatch() {
        let mut decoder = WsFrameDecoder::new(&options(), true);
        let buf = ByteBuf::from_slice(&[0x81, 0x02, b'h', b'i']);
        let err = collect(&mut decoder, &buf).unwrap_err();
        assert!(matches!(err, SessionError::WebSocketMessage(_)));
    }

    #[test]
    fn test_payload_over_limit() {
        let mut small = options();
        small.max_payload_size = 8;
        let mut decoder = WsFrameDecoder::new(&small, false);
        let buf = ByteBuf::from_slice(&[0x82, 126, 0x01, 0x00]);
        let err = collect(&mut decoder, &buf).unwrap_err();
        assert!(matches!(err, SessionError::WebSocketMessage(_)));
    }

    #[test]
    fn test_full_decoder_reassembles_fragments() {
        let mut decoder = WsFullFrameDecoder::new(&options(), false);
        let buf = ByteBuf::from_slice(&[
            0x01, 0x03, b'h', b'e', b'l', // text, fin clear
            0x89, 0x00, // interleaved ping
            0x80, 0x02, b'l', b'o', // final continuation
        ]);
        let frames = collect(&mut decoder, &buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode, Opcode::Ping);
        assert_eq!(frames[1].opcode, Opcode::Text);
        assert!(frames[1].fin);
        assert_eq!(frames[1].payload_text(), "hello");
    }

    #[test]
    fn test_unexpected_continuation() {
        let mut decoder = WsFullFrameDecoder::new(&options(), false);
        let buf = ByteBuf::from_slice(&[0x80, 0x02, b'h', b'i']);
        let err = collect(&mut decoder, &buf).unwrap_err();
        assert!(matches!(err, SessionError::WebSocketMessage(_)));
    }
}
