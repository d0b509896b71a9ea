//! Cluster redirection parsing.
//!
//! A backend in cluster mode answers a mis-routed key with
//! `-MOVED <slot> <host:port>`. The proxy treats that as data, not as a
//! failure: with retry enabled the request is reissued once against the
//! address carried in the reply. Pattern detection uses an Aho-Corasick
//! finder over the raw message bytes with `btoi` slot parsing.

use aho_corasick::AhoCorasick;
use lazy_static::lazy_static;

const BYTE_SPACE: u8 = b' ';
const PATTERNS: &[&str] = &["MOVED"];

lazy_static! {
    static ref FINDER: AhoCorasick =
        AhoCorasick::new(PATTERNS).expect("static redirect patterns compile");
}

/// A parsed `MOVED` redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub slot: u16,
    pub addr: String,
}

/// Parse `MOVED <slot> <addr>` out of an error message. The pattern must
/// open the message: anything else is an ordinary error to forward.
pub fn parse_moved(msg: &str) -> Option<Redirection> {
    let data = msg.as_bytes();

    let mat = FINDER.find(data)?;
    if mat.start() != 0 {
        return None;
    }

    let end = mat.end();
    if end >= data.len() || data[end] != BYTE_SPACE {
        return None;
    }

    let rest = &data[end + 1..];
    let gap = rest.iter().position(|&b| b == BYTE_SPACE)?;

    let slot = btoi::btoi::<u16>(&rest[..gap]).ok()?;
    let addr = std::str::from_utf8(&rest[gap + 1..]).ok()?;
    let addr = addr.trim_end_matches(['\r', '\n']);

    if addr.is_empty() {
        return None;
    }

    Some(Redirection {
        slot,
        addr: addr.to_string(),
    })
}

/// The target address of a `MOVED` reply, if `msg` is one.
pub fn moved_target(msg: &str) -> Option<String> {
    parse_moved(msg).map(|r| r.addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_moved_replies() {
        let redirect = parse_moved("MOVED 3999 127.0.0.1:6381").unwrap();
        assert_eq!(redirect.slot, 3999);
        assert_eq!(redirect.addr, "127.0.0.1:6381");
    }

    #[test]
    fn strips_line_endings() {
        let redirect = parse_moved("MOVED 1 10.0.0.2:7002\r\n").unwrap();
        assert_eq!(redirect.addr, "10.0.0.2:7002");
    }

    #[test]
    fn slot_boundaries() {
        assert_eq!(parse_moved("MOVED 0 a:1").unwrap().slot, 0);
        assert_eq!(parse_moved("MOVED 16383 a:1").unwrap().slot, 16383);
    }

    #[test]
    fn ordinary_errors_are_not_redirections() {
        assert!(parse_moved("ERR unknown command").is_none());
        assert!(parse_moved("EXECABORT Transaction discarded").is_none());
        // The pattern must open the message.
        assert!(parse_moved("ERR MOVED 1 a:1").is_none());
    }

    #[test]
    fn malformed_redirections_are_rejected() {
        assert!(parse_moved("MOVED").is_none());
        assert!(parse_moved("MOVED3999 a:1").is_none());
        assert!(parse_moved("MOVED 3999").is_none());
        assert!(parse_moved("MOVED abc a:1").is_none());
        assert!(parse_moved("MOVED 1 ").is_none());
    }

    #[test]
    fn target_extraction() {
        assert_eq!(
            moved_target("MOVED 1 127.0.0.1:6381"),
            Some("127.0.0.1:6381".to_string())
        );
        assert_eq!(moved_target("ERR nope"), None);
    }
}
