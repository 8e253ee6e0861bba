//! Re-framing of the first TLS record into many small synthetic records.
//!
//! DPI boxes that look for the SNI in a single record see only a piece of the
//! ClientHello, while the real server reassembles the record layer before it
//! parses the handshake.

use rand::Rng;

pub const TLS_RECORD_HEADER_LEN: usize = 5;
pub const TLS_HANDSHAKE_TYPE: u8 = 0x16;
const TLS_VERSION_MAJOR: u8 = 3;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Splits `payload` (a record body, header already stripped) into records
/// of random length, each with a random minor version.
pub fn fragment(payload: &[u8]) -> Vec<u8> {
    fragment_with(&mut rand::thread_rng(), payload)
}

pub fn fragment_with<R: Rng>(rng: &mut R, mut payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() * 2);

    while !payload.is_empty() {
        // u16 length field
        let max = payload.len().min(u16::MAX as usize);
        let chunk = rng.gen_range(1..=max);

        out.push(TLS_HANDSHAKE_TYPE);
        out.push(TLS_VERSION_MAJOR);
        out.push(rng.gen_range(0..255u8));
        out.extend_from_slice(&(chunk as u16).to_be_bytes());
        out.extend_from_slice(&payload[..chunk]);

        payload = &payload[chunk..];
    }

    out
}

/// True when `buf` starts with a handshake record whose first message is a
/// ClientHello.
pub fn is_client_hello(buf: &[u8]) -> bool {
    buf.len() > TLS_RECORD_HEADER_LEN
        && buf[0] == TLS_HANDSHAKE_TYPE
        && buf[TLS_RECORD_HEADER_LEN] == HANDSHAKE_CLIENT_HELLO
}
