//! Message id encoding. A message's numeric id carries its priority class in
//!  its high bits, making ids unique across classes and turning the wire
//!  encoding into a prefix code: the number of leading 0xFF bytes tells the
//!  decoder how wide the id is.
//!
//! ```ascii
//! High:   xx          (1 byte,  raw id 0x01..=0xFE)
//! Medium: FF xx       (2 bytes, raw id | 0xFF00)
//! Low:    FF FF xx xx (4 bytes, raw id | 0xFFFF0000)
//! Fixed:  FF FF FF xx (4 bytes, full id given in the template)
//! ```

use anyhow::{bail, Context};

/// The reserved Fixed id of the dedicated acknowledgement packet. Acking
///  must keep working even when the template catalog is unavailable, so this
///  one id is a hard constant rather than a catalog lookup.
pub const PACKET_ACK: u32 = 0xFFFF_FFFB;

/// Priority class of a packet type. Determines the wire width of the
///  message id and, on the sending side, its relative urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    Medium,
    High,
    Fixed,
    /// Sentinel for template entries with an unrecognized priority keyword.
    ///  Such entries stay in the catalog but cannot be encoded.
    Error,
}

impl Priority {
    /// The class a combined id belongs to, derived from its range.
    pub fn of(id: u32) -> Priority {
        if id == 0 {
            Priority::Error
        }
        else if id < 0xFF00 {
            Priority::High
        }
        else if id < 0xFFFF_0000 {
            Priority::Medium
        }
        else if id < 0xFFFF_FF00 {
            Priority::Low
        }
        else {
            Priority::Fixed
        }
    }

    /// Number of bytes the id occupies on the wire.
    pub fn wire_width(&self) -> usize {
        match self {
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low | Priority::Fixed => 4,
            Priority::Error => 0,
        }
    }

    /// Combine a template's raw id with the class bit pattern, making it
    ///  unique across priority classes. Fixed ids are written in full in the
    ///  template, High ids are used as-is.
    pub fn combine(&self, raw: u32) -> u32 {
        match self {
            Priority::High | Priority::Fixed | Priority::Error => raw,
            Priority::Medium => raw | 0xFF00,
            Priority::Low => raw | 0xFFFF_0000,
        }
    }
}

/// Big-endian wire encoding of a combined id. Returns the encoded bytes and
///  their count; the count is the class's `wire_width`.
pub fn encode(id: u32) -> anyhow::Result<([u8; 4], usize)> {
    let mut bytes = [0u8; 4];
    match Priority::of(id) {
        Priority::High => {
            // a 0xFF leading byte would masquerade as a wider class
            if id > 0xFE {
                bail!("high-priority id {:#x} does not fit its one-byte wire encoding", id);
            }
            bytes[0] = id as u8;
            Ok((bytes, 1))
        }
        Priority::Medium => {
            bytes[..2].copy_from_slice(&(id as u16).to_be_bytes());
            Ok((bytes, 2))
        }
        Priority::Low | Priority::Fixed => {
            bytes.copy_from_slice(&id.to_be_bytes());
            Ok((bytes, 4))
        }
        Priority::Error => bail!("message id {:#x} belongs to no priority class", id),
    }
}

/// Decode the id at the start of `data`. Returns the combined id, its
///  priority class, and the number of bytes consumed.
pub fn decode(data: &[u8]) -> anyhow::Result<(u32, Priority, usize)> {
    let b0 = *data.first().context("empty message id")?;
    if b0 != 0xFF {
        return Ok((b0 as u32, Priority::High, 1));
    }

    let b1 = *data.get(1).context("truncated message id")?;
    if b1 != 0xFF {
        return Ok((u16::from_be_bytes([b0, b1]) as u32, Priority::Medium, 2));
    }

    let quad: [u8; 4] = data.get(..4)
        .context("truncated message id")?
        .try_into()
        .expect("slice of length 4");
    let id = u32::from_be_bytes(quad);

    if id & 0xFFFF_FF00 == 0xFFFF_FF00 {
        Ok((id, Priority::Fixed, 4))
    }
    else {
        Ok((id, Priority::Low, 4))
    }
}
