//! The keyboard-enhancement escape protocol.
//!
//! A vendor CSI family lets hosted applications request richer key-event
//! reporting: `ESC [ > flags u` pushes an enhancement level, `ESC [ < n u`
//! pops, and `ESC [ ? u` queries. The embedding renderer cannot display
//! these, so the output side strips and decodes them ([`filter`]) while the
//! input side re-encodes qualifying key presses into the same family when
//! enhancement is active ([`encoder`]).

mod encoder;
mod filter;

mod proptest;

pub use encoder::{encode_key, Key, KeyEvent, Modifiers};
pub use filter::{FilterCommand, KeyProtocolFilter};

/// Build the reply to a level query: `ESC [ ? {level} u`, written back to
/// the application out of band.
pub fn query_reply(level: u32) -> Vec<u8> {
    format!("\x1b[?{}u", level).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_reply_shape() {
        assert_eq!(query_reply(0), b"\x1b[?0u");
        assert_eq!(query_reply(13), b"\x1b[?13u");
    }
}
