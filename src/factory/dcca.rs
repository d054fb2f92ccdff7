//! DCC-A automatic logon packets (RCN-218). Always a single repetition.

use crate::format::{DecoderFormat, MAX_DCC_ADR};
use crate::packet::{Command, Packet, Payload, ReplyHandler};

/// Highest 12-bit manufacturer id.
pub const MAX_MANUFACTURER: u16 = 0x0FFF;

/// Logon group selector of LOGON_ENABLE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LogonGroup {
    /// All decoders.
    All = 0,
    /// Loco decoders only.
    Loco = 1,
    /// Accessory decoders only.
    Accessory = 2,
    /// Decoders that have not yet logged on.
    Now = 3,
}

const FMT: DecoderFormat = DecoderFormat::Dcc126;

/// LOGON_ENABLE with command-station id and session id.
pub fn logon_enable(group: LogonGroup, cid: u16, session: u8, reply: Option<ReplyHandler>) -> Packet {
    Packet::new(Command::DccaLogonEnable, FMT, 0)
        .with_param(group as u32)
        .with_value(Payload::from_bytes(&[(cid >> 8) as u8, cid as u8, session]))
        .with_reply(reply)
}

/// SELECT a decoder by manufacturer and unique id, with a sub-command.
pub fn select(mfr: u16, uid: u32, subcmd: u8, reply: Option<ReplyHandler>) -> Option<Packet> {
    if mfr > MAX_MANUFACTURER {
        return None;
    }
    Some(
        Packet::new(Command::DccaSelect, FMT, 0)
            .with_param(u32::from(mfr) | u32::from(subcmd) << 16)
            .with_value(Payload::Word(uid))
            .with_reply(reply),
    )
}

/// LOGON_ASSIGN a new address to a decoder.
pub fn logon_assign(mfr: u16, uid: u32, adr: u16, reply: Option<ReplyHandler>) -> Option<Packet> {
    if mfr > MAX_MANUFACTURER || adr == 0 || adr > MAX_DCC_ADR {
        return None;
    }
    Some(
        Packet::new(Command::DccaLogonAssign, FMT, adr)
            .with_param(u32::from(mfr))
            .with_value(Payload::Word(uid))
            .with_reply(reply),
    )
}

/// GET_DATA continuation for a running data-space read.
pub fn get_data(reply: Option<ReplyHandler>) -> Packet {
    Packet::new(Command::DccaGetData, FMT, 0).with_reply(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logon_enable_packs_cid() {
        let p = logon_enable(LogonGroup::Now, 0xABCD, 7, None);
        assert_eq!(p.param, 3);
        assert_eq!(p.value.bytes(), &[0xAB, 0xCD, 7]);
        assert_eq!(p.repeat, 1);
    }

    #[test]
    fn select_packs_mfr_and_subcmd() {
        let p = select(0x0D, 0x1122_3344, 0xFF, None).unwrap();
        assert_eq!(p.param, 0x00FF_000D);
        assert_eq!(p.value, Payload::Word(0x1122_3344));
        assert!(select(0x1000, 0, 0, None).is_none());
    }

    #[test]
    fn assign_range() {
        assert!(logon_assign(0x0D, 1, 10239, None).is_some());
        assert!(logon_assign(0x0D, 1, 0, None).is_none());
        assert!(logon_assign(0x0D, 1, 10240, None).is_none());
    }

    #[test]
    fn get_data_single_repeat() {
        assert_eq!(get_data(None).repeat, 1);
    }
}
