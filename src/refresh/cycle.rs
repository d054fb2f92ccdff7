//! Per-format refresh schedules.
//!
//! Each visit of a live entry produces one packet. The entry's `age`
//! selects the position in its format's cycle:
//!
//! | Format | Cycle |
//! |--------|-------|
//! | MM1 | speed |
//! | MM2 | speed, F1, F2, F3, F4 |
//! | DCC 14/28/126 | speed, then one group per claimed function range |
//! | DCC SDF | combined speed+functions |
//! | m3 | combined speed+F0..F15 |

use crate::config::FormatConfig;
use crate::factory::loco;
use crate::format::DecoderFormat;
use crate::packet::{Command, Packet};

use super::LiveLoco;

/// Length of the MM2 cycle.
pub const MM2_CYCLE: u32 = 5;

/// Refresh packets are sent once per visit.
pub const REFRESH_REPEAT: u8 = 1;

/// DCC refresh groups with the lowest function index that enables them.
const DCC_REFRESH_GROUPS: [(Command, u8); 5] = [
    (Command::DccFuncF0F4, 1),
    (Command::DccFuncF5F8, 5),
    (Command::DccFuncF9F12, 9),
    (Command::DccFuncF13F20, 13),
    (Command::DccFuncF21F28, 21),
];

/// Number of refresh steps for a format with `maxfunc` functions.
pub fn cycle_len(fmt: DecoderFormat, maxfunc: u8) -> u32 {
    match fmt {
        DecoderFormat::Mm2x14 | DecoderFormat::Mm2x27a | DecoderFormat::Mm2x27b => MM2_CYCLE,
        DecoderFormat::Dcc14 | DecoderFormat::Dcc28 | DecoderFormat::Dcc126 => {
            1 + DCC_REFRESH_GROUPS
                .iter()
                .filter(|(_, first)| *first <= maxfunc)
                .count() as u32
        }
        _ => 1,
    }
}

/// Refresh packet for `loco` at cycle position `step`.
pub fn refresh_packet(cfg: &FormatConfig, loco: &LiveLoco, step: u32) -> Option<Packet> {
    let fmt = loco.desc.fmt;
    let adr = loco.desc.adr;
    let step = step % cycle_len(fmt, loco.desc.maxfunc);

    let pkt = match (fmt, step) {
        (_, 0) => loco::speed(cfg, fmt, adr, loco.speed, loco.funcs),
        (DecoderFormat::Mm2x14 | DecoderFormat::Mm2x27a | DecoderFormat::Mm2x27b, k) => {
            loco::mm_function(cfg, fmt, adr, loco.speed, k as u8, loco.funcs)
        }
        (DecoderFormat::Dcc14 | DecoderFormat::Dcc28 | DecoderFormat::Dcc126, k) => {
            let (cmd, _) = DCC_REFRESH_GROUPS[(k - 1) as usize];
            loco::dcc_func_group(cfg, fmt, adr, cmd, loco.funcs)
        }
        _ => loco::speed(cfg, fmt, adr, loco.speed, loco.funcs),
    };
    pkt.map(|p| p.with_repeat(REFRESH_REPEAT))
}
