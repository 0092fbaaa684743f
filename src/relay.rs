//! Per-session byte movement and command-channel line interpretation.
//!
//! The server's event loop resolves each ready handle to a session and calls
//! into here. Data channels are relayed with no protocol interpretation;
//! command channels are interpreted line by line so `PORT`/`PASV`
//! negotiations can be intercepted and rewritten.

use std::net::SocketAddrV4;

use log::*;

use crate::command;
use crate::endpoint::ReadOutcome;
use crate::error::Result;
use crate::session::{Session, Side};

/// One complete line taken off a command-channel buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ControlLine {
    /// relay unmodified
    Plain(Vec<u8>),
    /// client `PORT` with the advertised data address
    Port(Vec<u8>, SocketAddrV4),
    /// client `PASV`; relay unmodified, then intercept the 227 reply
    Pasv(Vec<u8>),
    /// server `227` reply with the advertised data address
    PasvReply(Vec<u8>, SocketAddrV4),
    /// chunk of a line longer than the buffer; relay unmodified to avoid
    /// deadlocking the control channel, and keep relaying unclassified
    /// until the line's terminator arrives
    Overflow(Vec<u8>),
}

impl ControlLine {
    pub fn bytes(&self) -> &[u8] {
        match self {
            ControlLine::Plain(b)
            | ControlLine::Port(b, _)
            | ControlLine::Pasv(b)
            | ControlLine::PasvReply(b, _)
            | ControlLine::Overflow(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ControlLine::Plain(b)
            | ControlLine::Port(b, _)
            | ControlLine::Pasv(b)
            | ControlLine::PasvReply(b, _)
            | ControlLine::Overflow(b) => b,
        }
    }
}

/// Take the next complete line from `side`'s buffer, or `None` when the
/// buffer holds only a partial command (the parser never guesses on
/// incomplete lines).
pub fn next_control_line(session: &mut Session, side: Side) -> Option<ControlLine> {
    let id = session.id;
    if session.in_overflow(side) {
        // the tail of an oversized line is not a fresh command
        let (chunk, done) = {
            let ep = session.endpoint_mut(side);
            match command::complete_line(ep.buffer()) {
                Some(len) => {
                    let chunk = ep.buffer()[..len].to_vec();
                    ep.consume(len);
                    (chunk, true)
                }
                None if !ep.buffer().is_empty() => {
                    let chunk = ep.buffer().to_vec();
                    ep.consume(chunk.len());
                    (chunk, false)
                }
                None => return None,
            }
        };
        if done {
            session.set_in_overflow(side, false);
        }
        return Some(ControlLine::Overflow(chunk));
    }
    let (line, overflow) = {
        let ep = session.endpoint_mut(side);
        match command::complete_line(ep.buffer()) {
            Some(len) => {
                let line = ep.buffer()[..len].to_vec();
                ep.consume(len);
                (line, false)
            }
            None if ep.buffer_is_full() && !ep.buffer().is_empty() => {
                let all = ep.buffer().to_vec();
                ep.consume(all.len());
                (all, true)
            }
            None => return None,
        }
    };
    if overflow {
        session.set_in_overflow(side, true);
        warn!(
            "relay: {}: command line exceeds buffer, relaying unmodified",
            id
        );
        return Some(ControlLine::Overflow(line));
    }
    Some(classify(session, side, line))
}

fn classify(session: &mut Session, side: Side, line: Vec<u8>) -> ControlLine {
    match side {
        Side::Client => {
            if command::is_port_command(&line) {
                match command::parse_port_command(&line) {
                    Ok(addr) => ControlLine::Port(line, addr),
                    Err(err) => {
                        warn!("relay: {}: {}, forwarding unmodified", session.id, err);
                        ControlLine::Plain(line)
                    }
                }
            } else if command::is_pasv_command(&line) {
                session.set_awaiting_pasv_reply(true);
                ControlLine::Pasv(line)
            } else {
                ControlLine::Plain(line)
            }
        }
        Side::Server => {
            if !session.awaiting_pasv_reply() || !line.starts_with(b"227") {
                return ControlLine::Plain(line);
            }
            session.set_awaiting_pasv_reply(false);
            match command::parse_pasv_reply(&line) {
                Some(addr) => ControlLine::PasvReply(line, addr),
                None => {
                    warn!(
                        "relay: {}: malformed 227 reply, forwarding unmodified",
                        session.id
                    );
                    ControlLine::Plain(line)
                }
            }
        }
    }
}

/// Outcome of one data-channel pump step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    Continue,
    /// orderly EOF on `side`; the session is done
    PeerClosed(Side),
}

/// One relay step for a data session: at most one buffer drain and one
/// flush for the ready handle. Bytes are read from one endpoint's buffer
/// and written to the other's socket, with no interpretation.
pub fn pump(
    session: &mut Session,
    side: Side,
    readable: bool,
    writable: bool,
) -> Result<PumpOutcome> {
    let (src, dst) = session.pair_mut(side);

    if writable {
        // bytes destined to this socket wait in the paired endpoint's buffer
        src.flush_pending()?;
        let pending = dst.buffer().len();
        dst.write_from_buffer(src, pending)?;
    }

    if readable {
        match src.read_into_buffer()? {
            ReadOutcome::Closed => {
                // deliver what both sides still buffer before the session dies
                if !dst.is_listening() {
                    let tail = src.buffer().len();
                    src.write_from_buffer(dst, tail)?;
                }
                let reverse = dst.buffer().len();
                dst.write_from_buffer(src, reverse).ok();
                return Ok(PumpOutcome::PeerClosed(side));
            }
            ReadOutcome::Bytes(_) | ReadOutcome::WouldBlock => {}
        }
        // until the listener is swapped for the accepted connection, bytes
        // wait in the buffer
        if !dst.is_listening() {
            let buffered = src.buffer().len();
            src.write_from_buffer(dst, buffered)?;
        }
    }

    Ok(PumpOutcome::Continue)
}
