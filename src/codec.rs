//! Payload transform seam between a smux frame's payload and the bytes
//! actually queued for the KCP session. spec.md §9 leaves room for a
//! non-identity codec (encryption, compression) as a deployment switch
//! without touching the framing layer; that switch is this trait. Only
//! [`Identity`] is wired in here, matching the "not implemented, out of
//! scope" Open Question resolution recorded in DESIGN.md — the trait exists
//! so a future codec only has to implement it, not restructure the session.

use bytes::Bytes;

pub trait Codec: Send + Sync {
    fn encode(&self, payload: Bytes) -> Bytes;
    fn decode(&self, payload: Bytes) -> Bytes;
}

/// The only codec this crate ships: passes bytes through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Codec for Identity {
    fn encode(&self, payload: Bytes) -> Bytes {
        payload
    }

    fn decode(&self, payload: Bytes) -> Bytes {
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_passes_bytes_through_unchanged() {
        let codec = Identity;
        let data = Bytes::from_static(b"unchanged");
        assert_eq!(codec.encode(data.clone()), data);
        assert_eq!(codec.decode(data.clone()), data);
    }
}
