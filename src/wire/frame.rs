//! Length-delimited framing over byte streams.
//!
//! Every message is a 32-bit big-endian length prefix followed by the
//! protobuf-encoded [`Envelope`] body. Reads tolerate socket read timeouts
//! mid-frame: partial progress is kept, so a slow sender never desyncs the
//! stream.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{BusResult, TransportError, WireError};
use crate::wire::Envelope;

/// Maximum frame body size. Anything larger is treated as stream
/// corruption and ends the connection.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Writes one framed envelope.
pub fn write_envelope<W: Write>(w: &mut W, envelope: &Envelope) -> BusResult<()> {
    let body = envelope.encode();
    if body.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_BYTES,
        }
        .into());
    }
    w.write_all(&(body.len() as u32).to_be_bytes())
        .map_err(TransportError::Io)?;
    w.write_all(&body).map_err(TransportError::Io)?;
    w.flush().map_err(TransportError::Io)?;
    Ok(())
}

/// Reads one framed envelope, blocking until complete. Socket read
/// timeouts surface as transport errors; request-reply callers close the
/// connection on them.
pub fn read_envelope<R: Read>(r: &mut R) -> BusResult<Envelope> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).map_err(TransportError::Io)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        }
        .into());
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).map_err(TransportError::Io)?;
    Envelope::decode(&body)
}

/// Reads one framed envelope from a stream with a read timeout configured.
///
/// Returns `Ok(None)` when `stop` became true while the stream was idle
/// (no byte of the next frame consumed yet). Once a frame has started, the
/// read runs to completion so the stream stays aligned; if the remainder
/// never arrives while stopping, the read gives up with a timeout error.
pub fn read_envelope_or_stop<R: Read>(
    r: &mut R,
    stop: &AtomicBool,
) -> BusResult<Option<Envelope>> {
    let mut len_buf = [0u8; 4];
    if !read_full(r, &mut len_buf, stop, true)? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        }
        .into());
    }

    let mut body = vec![0u8; len];
    read_full(r, &mut body, stop, false)?;
    Envelope::decode(&body).map(Some)
}

/// Fills `buf` completely, retrying timeout wakeups. With `interruptible`,
/// returns false if `stop` is observed before the first byte.
fn read_full<R: Read>(
    r: &mut R,
    buf: &mut [u8],
    stop: &AtomicBool,
    interruptible: bool,
) -> BusResult<bool> {
    let mut filled = 0;
    let mut stopping_retries = 0u32;
    while filled < buf.len() {
        if interruptible && filled == 0 && stop.load(Ordering::Relaxed) {
            return Ok(false);
        }
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(TransportError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ))
                .into())
            }
            Ok(n) => filled += n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if stop.load(Ordering::Relaxed) {
                    if interruptible && filled == 0 {
                        return Ok(false);
                    }
                    stopping_retries += 1;
                    if stopping_retries >= 4 {
                        return Err(TransportError::Io(e).into());
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::Io(e).into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::event::{Event, EventBody};
    use crate::wire::Payload;

    fn sample() -> Envelope {
        Envelope::new(Payload::Event(Event::new(EventBody::Purchase {
            user_id: "u".into(),
            product_id: "p".into(),
            category: "Books".into(),
            price: 12.5,
            quantity: 1,
            warehouse_id: "w".into(),
        })))
    }

    #[test]
    fn frames_round_trip() {
        let env = sample();
        let mut buf = Vec::new();
        write_envelope(&mut buf, &env).unwrap();
        let decoded = read_envelope(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn consecutive_frames_stay_aligned() {
        let a = sample();
        let b = sample();
        let mut buf = Vec::new();
        write_envelope(&mut buf, &a).unwrap();
        write_envelope(&mut buf, &b).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_envelope(&mut cursor).unwrap(), a);
        assert_eq!(read_envelope(&mut cursor).unwrap(), b);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(4 * 1024 * 1024u32).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        let err = read_envelope(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::BusError::Wire(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        let env = sample();
        let mut buf = Vec::new();
        write_envelope(&mut buf, &env).unwrap();
        buf.truncate(buf.len() - 3);
        let err = read_envelope(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, crate::error::BusError::Transport(_)));
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&[0xFF; 8]);
        let err = read_envelope(&mut Cursor::new(buf)).unwrap_err();
        assert!(err.is_wire());
    }

    #[test]
    fn stop_flag_aborts_an_idle_read() {
        struct Idle;
        impl std::io::Read for Idle {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::WouldBlock, "idle"))
            }
        }
        let stop = AtomicBool::new(true);
        let got = read_envelope_or_stop(&mut Idle, &stop).unwrap();
        assert!(got.is_none());
    }
}
