//! Format-independent packets and DCC time broadcasts.
//!
//! Model time, date and system time pack their fields into payload bytes
//! following RCN-211:
//!
//! | Packet | Byte 0 | Byte 1 | Byte 2 |
//! |--------|--------|--------|--------|
//! | Time | `00MMMMMM` | `WWWHHHHH` | `U0FFFFFF` |
//! | Date | `010DDDDD` | `MMMMYYYY` | `YYYYYYYY` |
//! | System time | `MMMMMMMM` | `MMMMMMMM` | |

use crate::format::DecoderFormat;
use crate::packet::{Command, Packet, Payload};

/// Highest acceleration factor of the model clock.
pub const MAX_TIME_FACTOR: u8 = 63;
/// Highest year representable in the date packet.
pub const MAX_YEAR: u16 = 4095;

const FMT: DecoderFormat = DecoderFormat::Dcc28;

/// Idle padding.
pub fn idle(repeat: u8) -> Packet {
    Packet::new(Command::Idle, FMT, 0).with_repeat(repeat.max(1))
}

/// Decoder reset broadcast.
pub fn reset(repeat: u8) -> Packet {
    Packet::new(Command::Reset, FMT, 0).with_repeat(repeat.max(1))
}

/// Model time.
///
/// `weekday` is 0..=6 (Monday first) or 7 when unused. `update` marks the
/// first packet after the clock was set.
pub fn model_time(weekday: u8, hour: u8, minute: u8, factor: u8, update: bool) -> Option<Packet> {
    if weekday > 7 || hour > 23 || minute > 59 || factor > MAX_TIME_FACTOR {
        return None;
    }
    let bytes = [
        minute,
        weekday << 5 | hour,
        (if update { 0x80 } else { 0 }) | factor,
    ];
    Some(Packet::new(Command::DccModelTime, FMT, 0).with_value(Payload::from_bytes(&bytes)))
}

/// Model date.
pub fn model_date(day: u8, month: u8, year: u16) -> Option<Packet> {
    if !(1..=31).contains(&day) || !(1..=12).contains(&month) || year > MAX_YEAR {
        return None;
    }
    let bytes = [0x40 | day, month << 4 | (year >> 8) as u8, year as u8];
    Some(Packet::new(Command::DccModelDate, FMT, 0).with_value(Payload::from_bytes(&bytes)))
}

/// System time: free-running millisecond counter (low 16 bits).
pub fn sys_time(ms: u64) -> Packet {
    let t = ms as u16;
    Packet::new(Command::DccSysTime, FMT, 0).with_value(Payload::from_bytes(&t.to_be_bytes()))
}
