//! m3 packets used by the programming-track sequencer.

use crate::config::FormatConfig;
use crate::format::{DecoderFormat, MAX_M3_ADR};
use crate::packet::{Command, CvAddr, Packet, Payload, ReplyHandler};

/// Highest m3 CV number.
pub const MAX_M3_CV: u16 = 1023;
/// Highest m3 CV sub-index.
pub const MAX_M3_SUB: u8 = 63;

/// Beacon packet (broadcast). Beacon in `value`, announce counter in `param`.
pub fn beacon(beacon: u32, announce: u16, repeat: u8) -> Packet {
    Packet::new(Command::M3Beacon, DecoderFormat::M3x126, 0)
        .with_value(Payload::Word(beacon))
        .with_param(u32::from(announce))
        .with_repeat(repeat.max(1))
}

/// One step of the binary UID search: `len` leading bits of `uid`.
pub fn search(cfg: &FormatConfig, uid: u32, len: u8) -> Option<Packet> {
    if len > 32 {
        return None;
    }
    Some(
        Packet::new(Command::M3Search, DecoderFormat::M3x126, 0)
            .with_value(Payload::Word(uid))
            .with_param(u32::from(len))
            .with_repeat(cfg.m3_repeat),
    )
}

/// Assign SID `adr` to the decoder with `uid`.
pub fn new_addr(cfg: &FormatConfig, uid: u32, adr: u16) -> Option<Packet> {
    if adr == 0 || adr > MAX_M3_ADR {
        return None;
    }
    Some(
        Packet::new(Command::M3NewAddr, DecoderFormat::M3x126, adr)
            .with_value(Payload::Word(uid))
            .with_repeat(cfg.m3_repeat),
    )
}

fn cv_ok(adr: u16, cva: CvAddr) -> bool {
    (1..=MAX_M3_ADR).contains(&adr) && cva.cv <= u32::from(MAX_M3_CV) && cva.sub <= MAX_M3_SUB
}

/// CV read of 1, 2, 4 or 8 bytes. The byte count travels in `param`.
pub fn cv_read(
    cfg: &FormatConfig,
    adr: u16,
    cva: CvAddr,
    bytes: u8,
    reply: Option<ReplyHandler>,
) -> Option<Packet> {
    if !cv_ok(adr, cva) || !matches!(bytes, 1 | 2 | 4 | 8) {
        return None;
    }
    Some(
        Packet::new(Command::M3CvRead, DecoderFormat::M3x126, adr)
            .with_cv(cva)
            .with_param(u32::from(bytes))
            .with_repeat(cfg.m3_repeat)
            .with_reply(reply),
    )
}

/// CV write of one byte.
pub fn cv_write(
    adr: u16,
    cva: CvAddr,
    val: u8,
    repeat: u8,
    reply: Option<ReplyHandler>,
) -> Option<Packet> {
    if !cv_ok(adr, cva) {
        return None;
    }
    Some(
        Packet::new(Command::M3CvWrite, DecoderFormat::M3x126, adr)
            .with_cv(cva)
            .with_value(Payload::Word(u32::from(val)))
            .with_repeat(repeat.max(1))
            .with_reply(reply),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_fields() {
        let p = beacon(0x1234_5678, 42, 10);
        assert_eq!(p.value, Payload::Word(0x1234_5678));
        assert_eq!(p.param, 42);
        assert_eq!(p.repeat, 10);
        assert_eq!(beacon(1, 1, 0).repeat, 1);
    }

    #[test]
    fn new_addr_range() {
        let cfg = FormatConfig::default();
        let p = new_addr(&cfg, 0xCAFE, 16383).unwrap();
        assert_eq!(p.adr, 16383);
        assert!(new_addr(&cfg, 0xCAFE, 0).is_none());
        assert!(new_addr(&cfg, 0xCAFE, 16384).is_none());
    }

    #[test]
    fn cv_read_byte_counts() {
        let cfg = FormatConfig::default();
        for n in [1, 2, 4, 8] {
            assert!(cv_read(&cfg, 5, CvAddr::m3(1, 0), n, None).is_some());
        }
        assert!(cv_read(&cfg, 5, CvAddr::m3(1, 0), 3, None).is_none());
        assert!(cv_read(&cfg, 5, CvAddr::m3(1024, 0), 1, None).is_none());
        assert!(cv_read(&cfg, 5, CvAddr::m3(1, 64), 1, None).is_none());
    }

    #[test]
    fn cv_write_repeat() {
        let p = cv_write(5, CvAddr::m3(2, 3), 9, 6, None).unwrap();
        assert_eq!(p.repeat, 6);
        assert_eq!(p.cva.sub, 3);
    }

    #[test]
    fn search_len() {
        let cfg = FormatConfig::default();
        assert!(search(&cfg, 0, 32).is_some());
        assert!(search(&cfg, 0, 33).is_none());
    }
}
