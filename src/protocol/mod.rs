mod codec;
mod message;

pub use message::TrackerMessage;

pub(crate) use codec::{recv_frame, send_frame};

/// Reset-channel wire symbols. Identical on every peer.
///
/// `OOB_RESET` tags the control-stream announcement that a reset has begun
/// (followed by the sender's pre-reset byte total); `RESET_MARK` is the
/// in-band delimiter on the data stream; `RESET_ACK` closes the handshake.
pub(crate) const OOB_RESET: u8 = 0xF1;
pub(crate) const RESET_MARK: u8 = 0xF2;
pub(crate) const RESET_ACK: u8 = 0xF3;

/// First byte of every peer-link hello frame.
pub(crate) const LINK_MAGIC: u8 = 0x7C;

/// Stream kind carried in the hello frame: payloads and message passing.
pub(crate) const STREAM_KIND_DATA: u8 = 0;
/// Stream kind carried in the hello frame: reset announcements and acks.
pub(crate) const STREAM_KIND_CTRL: u8 = 1;

/// Hello frame sent by the connecting side of every link stream:
/// `[LINK_MAGIC][epoch: u32 LE][rank: u32 LE][kind]`.
pub(crate) const LINK_HELLO_BYTES: usize = 10;

pub(crate) fn encode_link_hello(epoch: u32, rank: u32, kind: u8) -> [u8; LINK_HELLO_BYTES] {
    let mut frame = [0u8; LINK_HELLO_BYTES];
    frame[0] = LINK_MAGIC;
    frame[1..5].copy_from_slice(&epoch.to_le_bytes());
    frame[5..9].copy_from_slice(&rank.to_le_bytes());
    frame[9] = kind;
    frame
}

/// Returns `(epoch, rank, kind)`, or `None` if the magic byte is wrong.
pub(crate) fn decode_link_hello(frame: &[u8; LINK_HELLO_BYTES]) -> Option<(u32, u32, u8)> {
    if frame[0] != LINK_MAGIC {
        return None;
    }
    let epoch = u32::from_le_bytes(frame[1..5].try_into().unwrap());
    let rank = u32::from_le_bytes(frame[5..9].try_into().unwrap());
    Some((epoch, rank, frame[9]))
}
