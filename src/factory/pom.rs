//! Programming-on-main packets.
//!
//! Standard POM addresses CVs 0..=1023 with one byte or one bit per packet.
//! xPOM reaches 24-bit CV addresses and moves up to four bytes. Short-form
//! POM writes one of the RCN-214 short-form registers.

use crate::config::FormatConfig;
use crate::format::{DecoderFormat, MAX_DCC_ACCESSORY, MAX_DCC_ADR, MAX_DCC_EXTACC};
use crate::packet::{Command, CvAddr, Packet, Payload, ReplyHandler};

/// Highest CV for standard POM.
pub const MAX_POM_CV: u32 = 1023;
/// Highest CV for xPOM.
pub const MAX_XPOM_CV: u32 = 0xFF_FFFF;
/// Short-form register identifiers.
pub const SHORT_FORM_IDS: core::ops::RangeInclusive<u32> = 2..=5;

/// Packet format used for mobile decoders.
pub const POM_LOCO_FORMAT: DecoderFormat = DecoderFormat::Dcc28;

/// Decoder type addressed by a POM command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PomTarget {
    /// Multifunction (loco) decoder.
    Loco,
    /// Basic accessory decoder.
    Accessory,
    /// Extended accessory decoder.
    ExtAccessory,
}

impl PomTarget {
    /// Highest address for the target type.
    pub const fn max_address(&self) -> u16 {
        match self {
            PomTarget::Loco => MAX_DCC_ADR,
            PomTarget::Accessory => MAX_DCC_ACCESSORY,
            PomTarget::ExtAccessory => MAX_DCC_EXTACC,
        }
    }

    fn format(&self) -> DecoderFormat {
        match self {
            PomTarget::Loco => POM_LOCO_FORMAT,
            PomTarget::Accessory | PomTarget::ExtAccessory => DecoderFormat::AccDcc,
        }
    }

    fn commands(&self) -> Option<[Command; 3]> {
        match self {
            PomTarget::Loco => Some([
                Command::DccPomRead,
                Command::DccPomWrite,
                Command::DccPomWriteBit,
            ]),
            PomTarget::Accessory => Some([
                Command::DccPomAccRead,
                Command::DccPomAccWrite,
                Command::DccPomAccWriteBit,
            ]),
            PomTarget::ExtAccessory => None,
        }
    }

    /// True if `adr` lies in the target's address range.
    pub fn address_ok(&self, adr: u16) -> bool {
        (1..=self.max_address()).contains(&adr)
    }
}

fn pom(
    cfg: &FormatConfig,
    target: PomTarget,
    which: usize,
    adr: u16,
    cv: u32,
    value: Payload,
    reply: Option<ReplyHandler>,
) -> Option<Packet> {
    if !target.address_ok(adr) || cv > MAX_POM_CV {
        return None;
    }
    let cmd = target.commands()?[which];
    Some(
        Packet::new(cmd, target.format(), adr)
            .with_cv(CvAddr::linear(cv))
            .with_value(value)
            .with_repeat(cfg.dcc_pom_repeat)
            .with_reply(reply),
    )
}

/// POM byte read.
pub fn read(
    cfg: &FormatConfig,
    target: PomTarget,
    adr: u16,
    cv: u32,
    reply: Option<ReplyHandler>,
) -> Option<Packet> {
    pom(cfg, target, 0, adr, cv, Payload::None, reply)
}

/// POM byte write.
pub fn write(
    cfg: &FormatConfig,
    target: PomTarget,
    adr: u16,
    cv: u32,
    val: u8,
    reply: Option<ReplyHandler>,
) -> Option<Packet> {
    pom(cfg, target, 1, adr, cv, Payload::Word(u32::from(val)), reply)
}

/// POM bit write.
pub fn write_bit(
    cfg: &FormatConfig,
    target: PomTarget,
    adr: u16,
    cv: u32,
    bit: u8,
    val: bool,
    reply: Option<ReplyHandler>,
) -> Option<Packet> {
    if bit > 7 {
        return None;
    }
    pom(cfg, target, 2, adr, cv, Payload::Bit { pos: bit, val }, reply)
}

fn xpom(
    cfg: &FormatConfig,
    cmd: Command,
    adr: u16,
    cv: u32,
    value: Payload,
    reply: Option<ReplyHandler>,
) -> Option<Packet> {
    if !PomTarget::Loco.address_ok(adr) || cv > MAX_XPOM_CV {
        return None;
    }
    Some(
        Packet::new(cmd, POM_LOCO_FORMAT, adr)
            .with_cv(CvAddr::linear(cv))
            .with_value(value)
            .with_repeat(cfg.dcc_pom_repeat)
            .with_reply(reply),
    )
}

/// xPOM read of four consecutive CVs.
pub fn xpom_read(
    cfg: &FormatConfig,
    adr: u16,
    cv: u32,
    reply: Option<ReplyHandler>,
) -> Option<Packet> {
    xpom(cfg, Command::DccXpomRead, adr, cv, Payload::None, reply)
}

/// xPOM write of 1..=4 consecutive bytes.
pub fn xpom_write(
    cfg: &FormatConfig,
    adr: u16,
    cv: u32,
    bytes: &[u8],
    reply: Option<ReplyHandler>,
) -> Option<Packet> {
    if bytes.is_empty() || bytes.len() > 4 {
        return None;
    }
    xpom(cfg, Command::DccXpomWrite, adr, cv, Payload::from_bytes(bytes), reply)
}

/// xPOM bit write.
pub fn xpom_write_bit(
    cfg: &FormatConfig,
    adr: u16,
    cv: u32,
    bit: u8,
    val: bool,
    reply: Option<ReplyHandler>,
) -> Option<Packet> {
    if bit > 7 {
        return None;
    }
    xpom(cfg, Command::DccXpomWriteBit, adr, cv, Payload::Bit { pos: bit, val }, reply)
}

/// Payload length of a short-form register.
pub const fn short_form_len(id: u32) -> Option<usize> {
    match id {
        2 | 3 => Some(1),
        4 | 5 => Some(2),
        _ => None,
    }
}

/// Short-form POM write. The register id travels in `param`.
pub fn short_write(cfg: &FormatConfig, adr: u16, id: u32, bytes: &[u8]) -> Option<Packet> {
    if !PomTarget::Loco.address_ok(adr) || short_form_len(id)? != bytes.len() {
        return None;
    }
    Some(
        Packet::new(Command::DccPomShortWrite, POM_LOCO_FORMAT, adr)
            .with_param(id)
            .with_value(Payload::from_bytes(bytes))
            .with_repeat(cfg.dcc_pom_repeat),
    )
}
