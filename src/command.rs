//! FTP command-channel text processing.
//!
//! Pure functions over byte buffers: no I/O, no state. The relay engine
//! feeds complete lines only; anything operating on a raw buffer reports
//! "need more bytes" with `None` instead of guessing.

use std::net::SocketAddrV4;

use crate::error::{Error, Result};

/// Advance past leading space/tab characters.
pub fn skip_leading_whitespace(buf: &[u8]) -> &[u8] {
    let n = buf
        .iter()
        .take_while(|b| **b == b' ' || **b == b'\t')
        .count();
    &buf[n..]
}

/// Length of the first complete line in `buf`, terminator included.
///
/// Lines are recognized on `\n`; a preceding `\r` is part of the line.
/// `None` means the buffer holds only a partial command so far.
pub fn complete_line(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|b| *b == b'\n').map(|pos| pos + 1)
}

/// Strip the trailing `\r\n` (or bare `\n`) from a line.
fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Split a line into its leading verb token and the rest.
fn verb(line: &[u8]) -> (&[u8], &[u8]) {
    let line = skip_leading_whitespace(trim_line(line));
    let n = line
        .iter()
        .take_while(|b| b.is_ascii_alphabetic())
        .count();
    (&line[..n], &line[n..])
}

fn is_verb(line: &[u8], expected: &[u8], wants_args: bool) -> bool {
    let (v, rest) = verb(line);
    if !v.eq_ignore_ascii_case(expected) {
        return false;
    }
    // whole-token match only: `XPORT ...` has a different verb, and
    // `PORTX ...` must not be taken for `PORT`
    match rest.first() {
        Some(b' ') | Some(b'\t') => true,
        None => !wants_args,
        Some(_) => false,
    }
}

/// Whether the line is a `PORT` command (case-insensitive, whole token).
pub fn is_port_command(line: &[u8]) -> bool {
    is_verb(line, b"PORT", true)
}

/// Whether the line is a `PASV` command.
pub fn is_pasv_command(line: &[u8]) -> bool {
    is_verb(line, b"PASV", false)
}

/// Parse the FTP address encoding `h1,h2,h3,h4,p1,p2` into an address.
///
/// Each component must be a decimal in `0..=255`; the port is
/// `p1 * 256 + p2`.
pub fn extract_address(args: &[u8]) -> Result<SocketAddrV4> {
    let args = trim_line(skip_leading_whitespace(args));
    let mut parts = [0u8; 6];
    let mut count = 0;
    for piece in args.split(|b| *b == b',') {
        if count == 6 {
            return Err(Error::malformed_address(args));
        }
        parts[count] = parse_octet(piece).ok_or_else(|| Error::malformed_address(args))?;
        count += 1;
    }
    if count != 6 {
        return Err(Error::malformed_address(args));
    }
    let ip = std::net::Ipv4Addr::new(parts[0], parts[1], parts[2], parts[3]);
    let port = u16::from(parts[4]) * 256 + u16::from(parts[5]);
    Ok(SocketAddrV4::new(ip, port))
}

fn parse_octet(piece: &[u8]) -> Option<u8> {
    if piece.is_empty() || piece.len() > 3 || !piece.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut value: u16 = 0;
    for b in piece {
        value = value * 10 + u16::from(b - b'0');
    }
    u8::try_from(value).ok()
}

/// Address/port of a complete `PORT` line.
pub fn parse_port_command(line: &[u8]) -> Result<SocketAddrV4> {
    let (_, rest) = verb(line);
    extract_address(rest)
}

/// Render `addr` as a `PORT` command line, CR LF terminated.
pub fn generate_port_command(addr: SocketAddrV4) -> String {
    let [h1, h2, h3, h4] = addr.ip().octets();
    let port = addr.port();
    format!(
        "PORT {},{},{},{},{},{}\r\n",
        h1,
        h2,
        h3,
        h4,
        port >> 8,
        port & 0xff
    )
}

/// Address advertised by a server's `227 Entering Passive Mode (...)` reply,
/// or `None` when the line is not a 227 reply (including malformed ones,
/// which the caller relays unmodified).
pub fn parse_pasv_reply(line: &[u8]) -> Option<SocketAddrV4> {
    let line = trim_line(line);
    if !line.starts_with(b"227") {
        return None;
    }
    let open = line.iter().position(|b| *b == b'(')?;
    let close = line[open..].iter().position(|b| *b == b')')? + open;
    extract_address(&line[open + 1..close]).ok()
}

/// Render `addr` as a `227` passive-mode reply, CR LF terminated.
pub fn generate_pasv_reply(addr: SocketAddrV4) -> String {
    let [h1, h2, h3, h4] = addr.ip().octets();
    let port = addr.port();
    format!(
        "227 Entering Passive Mode ({},{},{},{},{},{}).\r\n",
        h1,
        h2,
        h3,
        h4,
        port >> 8,
        port & 0xff
    )
}
