//! SOCKS4a setup string for the local Tor proxy (§6), grounded on
//! `original_source/source/cccommon/src/socks.cpp`'s `Socks::ConnectString`
//! and `Socks::SendString`.

use crate::error::{Error, Result};
use rand::Rng;

/// `04 01 01 BB 00 00 00 01`: SOCKS version 4, CONNECT command, port 443
/// (`0x01BB`), and the bogus `0.0.0.1` destination IP that signals SOCKS4a
/// (a real IP would tell the proxy to skip the hostname field entirely).
const HEADER: [u8; 8] = [0x04, 0x01, 0x01, 0xBB, 0x00, 0x00, 0x00, 0x01];

const USER_ID_LEN: usize = 20;
const REPLY_LEN: usize = 8;
const STATUS_OK: u8 = 0x5A;

/// Onion hostnames read from `$APPDATA/.../tor/hostnames/*/hostname` are
/// bounded to 88 bytes before the trailing NUL (§6's filesystem-layout
/// contract); enforced here too since a setup string for an oversize host
/// would otherwise silently truncate at the proxy.
const MAX_HOST_LEN: usize = 88;

/// Builds the setup string sent to the local Tor proxy to establish an
/// outgoing connection to `host` (a bare `.onion` address, no scheme, no
/// trailing dot). `user_id` substitutes 20 random ASCII letters when `None`,
/// matching the original's fallback when the caller has no proxy
/// credential to offer.
pub fn connect_string(host: &str, user_id: Option<&str>) -> Result<Vec<u8>> {
    if host.len() > MAX_HOST_LEN {
        return Err(Error::HostnameTooLong);
    }

    let mut out = Vec::with_capacity(HEADER.len() + USER_ID_LEN + host.len() + 8);
    out.extend_from_slice(&HEADER);

    match user_id {
        Some(id) => out.extend_from_slice(id.as_bytes()),
        None => out.extend_from_slice(random_user_id().as_bytes()),
    }
    out.push(0);

    out.extend_from_slice(host.as_bytes());
    out.extend_from_slice(b".onion");
    out.push(0);

    Ok(out)
}

fn random_user_id() -> String {
    let mut rng = rand::thread_rng();
    (0..USER_ID_LEN).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// Validates an 8-byte SOCKS4a reply. Byte 1 is the status; `0x5A` is
/// success, anything else (including the distinct `0x5B`..`0x5D` failure
/// codes the original logs individually) is surfaced as a rejection.
pub fn check_reply(reply: &[u8]) -> Result<()> {
    if reply.len() < REPLY_LEN {
        return Err(Error::SocksReplyTruncated);
    }
    if reply[1] != STATUS_OK {
        return Err(Error::SocksRejected(reply[1]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_string_layout_matches_header_and_fields() {
        let msg = connect_string("abcdefghij234567", Some("alice")).unwrap();
        assert_eq!(&msg[0..8], &HEADER);
        let rest = &msg[8..];
        let nul = rest.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&rest[..nul], b"alice");
        let host_part = &rest[nul + 1..];
        assert!(host_part.ends_with(b"234567.onion\0"));
    }

    #[test]
    fn random_user_id_used_when_none_given() {
        let msg = connect_string("host", None).unwrap();
        let rest = &msg[8..];
        let nul = rest.iter().position(|&b| b == 0).unwrap();
        assert_eq!(nul, USER_ID_LEN);
        assert!(rest[..nul].iter().all(|b| b.is_ascii_lowercase()));
    }

    #[test]
    fn oversize_host_is_rejected() {
        let host = "a".repeat(MAX_HOST_LEN + 1);
        assert_eq!(connect_string(&host, None), Err(Error::HostnameTooLong));
    }

    #[test]
    fn reply_status_ok_accepted_others_rejected() {
        let mut reply = [0u8; 8];
        reply[1] = 0x5A;
        assert!(check_reply(&reply).is_ok());

        reply[1] = 0x5B;
        assert_eq!(check_reply(&reply), Err(Error::SocksRejected(0x5B)));
    }

    #[test]
    fn truncated_reply_is_rejected() {
        assert_eq!(check_reply(&[0x00, 0x5A]), Err(Error::SocksReplyTruncated));
    }
}
