//! Accessory packets: magnet coils, keep-alive NOPs, signal aspects.

use crate::config::FormatConfig;
use crate::format::{DecoderFormat, MAX_DCC_ACCESSORY, MAX_DCC_EXTACC, MAX_MM_TURNOUT};
use crate::packet::{Command, Packet, Payload};

/// Broadcast address used for basic accessory NOPs.
pub const ACC_BROADCAST: u16 = 2047;
/// Broadcast address used for extended accessory NOPs.
pub const EXTACC_BROADCAST: u16 = 2047;

/// Magnet on or off for one accessory output.
///
/// `dir` selects the coil (0 or 1). Bus accessories return `None`; they are
/// not switched over the track.
pub fn magnet(
    cfg: &FormatConfig,
    fmt: DecoderFormat,
    adr: u16,
    dir: u8,
    on: bool,
) -> Option<Packet> {
    let max = match fmt {
        DecoderFormat::AccMm => MAX_MM_TURNOUT,
        DecoderFormat::AccDcc => MAX_DCC_ACCESSORY,
        _ => return None,
    };
    if adr == 0 || adr > max || dir > 1 {
        return None;
    }
    let cmd = if on { Command::MagnetOn } else { Command::MagnetOff };
    Some(
        Packet::new(cmd, fmt, adr)
            .with_param(u32::from(dir))
            .with_repeat(cfg.acc_repeat),
    )
}

/// Basic accessory NOP broadcast (RailCom keep-alive).
pub fn acc_nop() -> Packet {
    Packet::new(Command::DccAccNop, DecoderFormat::AccDcc, ACC_BROADCAST)
}

/// Extended accessory NOP broadcast.
pub fn ext_acc_nop() -> Packet {
    Packet::new(Command::DccExtAccNop, DecoderFormat::AccDcc, EXTACC_BROADCAST)
}

/// Extended accessory aspect for signal decoders.
pub fn ext_acc_aspect(cfg: &FormatConfig, adr: u16, aspect: u8) -> Option<Packet> {
    if adr == 0 || adr > MAX_DCC_EXTACC {
        return None;
    }
    Some(
        Packet::new(Command::DccExtAccAspect, DecoderFormat::AccDcc, adr)
            .with_value(Payload::Word(u32::from(aspect)))
            .with_repeat(cfg.acc_repeat),
    )
}
