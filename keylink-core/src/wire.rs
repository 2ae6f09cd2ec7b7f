//! Framing: length-prefix (4 bytes LE) + one encoded packet.

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Wrap one encoded packet into a frame: 4 bytes LE length + packet bytes.
pub fn encode_frame(packet: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    if packet.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge(packet.len()));
    }
    let len = packet.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + packet.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(packet);
    Ok(out)
}

/// Error wrapping a packet into a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
}

/// Parse a frame header. Returns the packet length that follows it.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the packet bytes and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes or too large).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
}
