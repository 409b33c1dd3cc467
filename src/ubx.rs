//! U-Blox (UBX) decoder adapter.
//!
//! Framing and packet validation are delegated to [ublox::Parser].
//! Only the packets this application consumes are interpreted,
//! everything else is surfaced as [Message::Other].

mod message;

pub use message::{
    InfLevel, Message, MessageKind, MgaAck, MgaAno, NavDop, NavPvt, NavSat, SatInfo,
};

use std::{
    collections::VecDeque,
    io::{ErrorKind, Read},
};

use thiserror::Error;

use ublox::{Parser, ParserError, proto23::Proto23};

/// UBX sync characters
const SYNC_CHAR_1: u8 = 0xb5;
const SYNC_CHAR_2: u8 = 0x62;

/// UBX-MGA-ANO is not modelled by [ublox] and is handled as raw payload.
pub const CLASS_MGA: u8 = 0x13;
pub const ID_MGA_ANO: u8 = 0x20;

#[derive(Debug, Error)]
pub enum Error {
    /// Input stream exhausted: terminal, but not a failure
    #[error("end of stream")]
    EndOfStream,

    /// No data available yet (serial timeout)
    #[error("no data available")]
    Idle,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ubx parsing error: {0}")]
    Parser(#[from] ParserError),

    #[error("malformed {class:02x}-{id:02x} payload ({len} bytes)")]
    Payload { class: u8, id: u8, len: usize },

    #[error("payload too large to encode ({0} bytes)")]
    FrameTooLarge(usize),
}

impl Error {
    /// Per-frame errors after which decoding may safely resume.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Parser(_) | Self::Payload { .. })
    }
}

/// Wraps `payload` into a UBX frame (sync, header, payload, checksum).
/// [ublox] only builds the packets it models, MGA-ANO is re-emitted through this.
pub fn encode(class: u8, id: u8, payload: &[u8]) -> Result<Vec<u8>, Error> {
    let len = payload.len();
    if len > u16::MAX as usize {
        return Err(Error::FrameTooLarge(len));
    }

    let mut bytes = Vec::with_capacity(len + 8);
    bytes.extend_from_slice(&[SYNC_CHAR_1, SYNC_CHAR_2, class, id]);
    bytes.extend_from_slice(&(len as u16).to_le_bytes());
    bytes.extend_from_slice(payload);

    // 8-bit Fletcher, from class byte to end of payload
    let (ck_a, ck_b) = bytes[2..]
        .iter()
        .fold((0_u8, 0_u8), |(ck_a, ck_b), byte| {
            let ck_a = ck_a.wrapping_add(*byte);
            (ck_a, ck_b.wrapping_add(ck_a))
        });

    bytes.push(ck_a);
    bytes.push(ck_b);
    Ok(bytes)
}

/// Streaming [Decoder] turning any [Read]able into typed [Message]s.
/// The [Parser] buffer is owned, so partial frames survive between reads.
pub struct Decoder<R: Read> {
    reader: R,
    parser: Parser<Vec<u8>, Proto23>,
    chunk: Vec<u8>,
    pending: VecDeque<Result<Message, Error>>,
    eos: bool,
}

impl<R: Read> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            eos: false,
            chunk: vec![0; 8192],
            pending: VecDeque::with_capacity(16),
            parser: Parser::<_, Proto23>::new(Vec::with_capacity(8192)),
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Pulls the next [Message].
    ///
    /// ## Returns
    /// - [Error::EndOfStream] once the input is exhausted
    /// - [Error::Idle] when the interface timed out without data
    /// - recoverable errors (see [Error::is_recoverable]) for corrupt frames,
    ///   decoding may continue after those
    /// - [Error::Io] on any other read failure; no buffered byte is lost,
    ///   so the caller may retry
    pub fn decode(&mut self) -> Result<Message, Error> {
        loop {
            if let Some(next) = self.pending.pop_front() {
                return next;
            }

            if self.eos {
                return Err(Error::EndOfStream);
            }

            let size = self.fill()?;
            self.consume(size);
        }
    }

    fn fill(&mut self) -> Result<usize, Error> {
        match self.reader.read(&mut self.chunk) {
            Ok(0) => {
                self.eos = true;
                Ok(0)
            },
            Ok(size) => Ok(size),
            Err(e) => match e.kind() {
                ErrorKind::TimedOut | ErrorKind::WouldBlock => Err(Error::Idle),
                ErrorKind::Interrupted => Ok(0),
                _ => Err(Error::Io(e)),
            },
        }
    }

    fn consume(&mut self, size: usize) {
        let mut it = self.parser.consume_ubx(&self.chunk[..size]);

        loop {
            match it.next() {
                Some(Ok(packet)) => {
                    self.pending.push_back(Message::from_packet(packet));
                },
                Some(Err(e)) => {
                    self.pending.push_back(Err(Error::Parser(e)));
                },
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{CLASS_MGA, Decoder, Error, ID_MGA_ANO, encode};
    use crate::ubx::{InfLevel, Message, MgaAno};
    use std::io::Cursor;

    #[test]
    fn test_frame_encoding() {
        // UBX-CFG-MSG poll for NAV-PVT, as documented by U-Blox
        assert_eq!(
            encode(0x06, 0x01, &[0x01, 0x07]).unwrap(),
            vec![0xb5, 0x62, 0x06, 0x01, 0x02, 0x00, 0x01, 0x07, 0x11, 0x3a]
        );
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut stream = b"$GPTXT,01*00\r\n".to_vec();
        stream.extend(encode(0x0a, 0x04, &[]).unwrap());

        let mut decoder = Decoder::new(Cursor::new(stream));

        match decoder.decode() {
            Ok(Message::Other { class, id }) => assert_eq!((class, id), (0x0a, 0x04)),
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(matches!(decoder.decode(), Err(Error::EndOfStream)));
    }

    #[test]
    fn test_checksum_error_is_recoverable() {
        let mut corrupt = encode(0x0a, 0x04, &[0x01]).unwrap();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;

        let mut stream = corrupt;
        stream.extend(encode(0x0a, 0x05, &[]).unwrap());

        let mut decoder = Decoder::new(Cursor::new(stream));

        let err = decoder.decode().unwrap_err();
        assert!(err.is_recoverable(), "{}", err);

        match decoder.decode() {
            Ok(Message::Other { class, id }) => assert_eq!((class, id), (0x0a, 0x05)),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame_ends_stream() {
        let bytes = encode(0x0a, 0x04, &[0; 16]).unwrap();
        let mut decoder = Decoder::new(Cursor::new(bytes[..10].to_vec()));
        assert!(matches!(decoder.decode(), Err(Error::EndOfStream)));
    }

    #[test]
    fn test_frame_split_across_reads() {
        // one byte per read: partial frames are kept by the parser
        struct Trickle(Vec<u8>, usize);

        impl std::io::Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.1 >= self.0.len() {
                    return Ok(0);
                }
                buf[0] = self.0[self.1];
                self.1 += 1;
                Ok(1)
            }
        }

        let mut stream = encode(0x04, 0x02, b"antenna ok").unwrap();
        stream.extend(MgaAno::new(0, 3, 24, 6, 1).encode().unwrap());

        let mut decoder = Decoder::new(Trickle(stream, 0));

        assert_eq!(
            decoder.decode().unwrap(),
            Message::Inf {
                level: InfLevel::Notice,
                text: "antenna ok".to_string(),
            }
        );

        assert_eq!(
            decoder.decode().unwrap(),
            Message::MgaAno(MgaAno::new(0, 3, 24, 6, 1))
        );
        assert!(matches!(decoder.decode(), Err(Error::EndOfStream)));
    }

    #[test]
    fn test_io_error_keeps_buffered_bytes() {
        // a frame cut by a transport error, completed by the next read
        struct Flaky {
            chunks: Vec<std::io::Result<Vec<u8>>>,
        }

        impl std::io::Read for Flaky {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.chunks.is_empty() {
                    return Ok(0);
                }
                let chunk = self.chunks.remove(0)?;
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
        }

        let frame = encode(CLASS_MGA, ID_MGA_ANO, &[0; MgaAno::LEN]).unwrap();

        let mut decoder = Decoder::new(Flaky {
            chunks: vec![
                Ok(frame[..20].to_vec()),
                Err(std::io::Error::other("transient line error")),
                Ok(frame[20..].to_vec()),
            ],
        });

        assert!(matches!(decoder.decode(), Err(Error::Io(_))));
        assert!(matches!(decoder.decode(), Ok(Message::MgaAno(_))));
    }
}
