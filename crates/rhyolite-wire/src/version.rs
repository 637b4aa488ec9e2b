//! Protocol version negotiation.
//!
//! Both sides exchange the inclusive range of protocol versions they speak
//! and settle on the highest version in the intersection.

use crate::error::{WireError, WireResult};

/// Oldest protocol version this build can still speak.
pub const PROTOCOL_VERSION_MIN: u16 = 3;

/// Newest protocol version this build speaks.
pub const PROTOCOL_VERSION_MAX: u16 = 5;

/// Picks the highest version supported by both sides.
pub fn negotiate_version(theirs_min: u16, theirs_max: u16) -> WireResult<u16> {
    let low = PROTOCOL_VERSION_MIN.max(theirs_min);
    let high = PROTOCOL_VERSION_MAX.min(theirs_max);
    if low > high {
        return Err(WireError::VersionMismatch {
            ours_min: PROTOCOL_VERSION_MIN,
            ours_max: PROTOCOL_VERSION_MAX,
            theirs_min,
            theirs_max,
        });
    }
    Ok(high)
}
