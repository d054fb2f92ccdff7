//! Loco packets: speed, functions, emergency stop, binary state.

use crate::config::FormatConfig;
use crate::factory::MIN_SAFETY_REPEAT;
use crate::format::{DecoderFormat, MAX_DCC_ADR, MAX_FUNCS};
use crate::packet::{Command, Packet, Payload, SPEED_FORWARD};

/// Repeat count of the Motorola direction-change packet.
pub const MM_REVERSE_REPEAT: u8 = 10;

/// Highest DCC binary state number (long form).
pub const MAX_BINSTATE: u16 = 32767;

/// Highest binary state number that fits the short form.
pub const MAX_BINSTATE_SHORT: u16 = 127;

/// DCC function groups as `(command, first, last)`.
pub const DCC_GROUPS: [(Command, u8, u8); 10] = [
    (Command::DccFuncF0F4, 0, 4),
    (Command::DccFuncF5F8, 5, 8),
    (Command::DccFuncF9F12, 9, 12),
    (Command::DccFuncF13F20, 13, 20),
    (Command::DccFuncF21F28, 21, 28),
    (Command::DccFuncF29F36, 29, 36),
    (Command::DccFuncF37F44, 37, 44),
    (Command::DccFuncF45F52, 45, 52),
    (Command::DccFuncF53F60, 53, 60),
    (Command::DccFuncF61F68, 61, 68),
];

/// Highest function index reachable through a DCC group.
pub const MAX_DCC_FUNC: u8 = 68;

/// Highest m3 function carried by the F0..F15 group packet.
pub const M3_GROUP_LAST: u8 = 15;

/// Highest function carried by the DCC speed-direction-function packet.
pub const SDF_LAST: u8 = 31;

/// DCC group that transports function `f`.
pub fn dcc_group(f: u8) -> Option<(Command, u8, u8)> {
    DCC_GROUPS
        .iter()
        .copied()
        .find(|&(_, first, last)| (first..=last).contains(&f))
}

/// Bits `first..=last` restricted to the first function word (F0..F31).
pub const fn word_mask(first: u8, last: u8) -> u32 {
    if first > 31 {
        return 0;
    }
    let last = if last > 31 { 31 } else { last };
    let width = last - first + 1;
    let bits = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
    bits << first
}

/// State of function `f` in a function snapshot.
pub fn func_bit(funcs: &[u32; 4], f: u8) -> bool {
    let f = usize::from(f);
    f < MAX_FUNCS && funcs[f / 32] & (1 << (f % 32)) != 0
}

fn loco_ok(fmt: DecoderFormat, adr: u16) -> bool {
    fmt.is_loco() && (1..=fmt.max_address()).contains(&adr)
}

fn base(cfg: &FormatConfig, cmd: Command, fmt: DecoderFormat, adr: u16, funcs: [u32; 4]) -> Packet {
    Packet::new(cmd, fmt, adr)
        .with_funcs(funcs)
        .with_repeat(cfg.repeat_for(fmt))
}

// ============================================================================
// Speed
// ============================================================================

/// Speed packet for any loco format.
///
/// MM2(27a) uses its own command code. DCC SDF and m3 decoders get their
/// combined speed+function packets.
pub fn speed(
    cfg: &FormatConfig,
    fmt: DecoderFormat,
    adr: u16,
    speed: u8,
    funcs: [u32; 4],
) -> Option<Packet> {
    if !loco_ok(fmt, adr) {
        return None;
    }
    let cmd = match fmt {
        DecoderFormat::Mm2x27a => Command::Mm27aSpeed,
        DecoderFormat::DccSdf => Command::DccSdf,
        DecoderFormat::M3x126 => Command::M3SpeedFunc,
        _ => Command::SetSpeed,
    };
    Some(base(cfg, cmd, fmt, adr, funcs).with_value(Payload::Word(u32::from(speed))))
}

/// Emergency stop keeping the direction of `speed`.
pub fn emergency_stop(
    cfg: &FormatConfig,
    fmt: DecoderFormat,
    adr: u16,
    speed: u8,
    funcs: [u32; 4],
) -> Option<Packet> {
    if !loco_ok(fmt, adr) {
        return None;
    }
    let repeat = cfg.repeat_for(fmt).max(MIN_SAFETY_REPEAT);
    Some(
        base(cfg, Command::EmergencyStop, fmt, adr, funcs)
            .with_value(Payload::Word(u32::from(speed & SPEED_FORWARD)))
            .with_repeat(repeat),
    )
}

/// Motorola direction-change packet.
pub fn mm_reverse(cfg: &FormatConfig, fmt: DecoderFormat, adr: u16, speed: u8) -> Option<Packet> {
    if !fmt.is_mm() || !loco_ok(fmt, adr) {
        return None;
    }
    Some(
        base(cfg, Command::MmReverse, fmt, adr, [0; 4])
            .with_value(Payload::Word(u32::from(speed)))
            .with_repeat(MM_REVERSE_REPEAT),
    )
}

// ============================================================================
// Functions
// ============================================================================

/// Packet that transmits function `f` for the decoder format.
///
/// Returns `None` when the format has no way of transporting `f`.
pub fn function(
    cfg: &FormatConfig,
    fmt: DecoderFormat,
    adr: u16,
    speed: u8,
    f: u8,
    funcs: [u32; 4],
) -> Option<Packet> {
    if !loco_ok(fmt, adr) || usize::from(f) >= MAX_FUNCS {
        return None;
    }
    match fmt {
        DecoderFormat::Mm1x14 => match f {
            0 => self::speed(cfg, fmt, adr, speed, funcs),
            1..=4 => Some(base(cfg, Command::MmFuncGroup, fmt, adr, funcs)),
            _ => None,
        },
        DecoderFormat::Mm2x14 | DecoderFormat::Mm2x27a | DecoderFormat::Mm2x27b => match f {
            0 => self::speed(cfg, fmt, adr, speed, funcs),
            1..=4 => mm_function(cfg, fmt, adr, speed, f, funcs),
            _ => None,
        },
        DecoderFormat::Dcc14 if f == 0 => self::speed(cfg, fmt, adr, speed, funcs),
        DecoderFormat::DccSdf if f <= SDF_LAST => self::speed(cfg, fmt, adr, speed, funcs),
        DecoderFormat::Dcc14 | DecoderFormat::Dcc28 | DecoderFormat::Dcc126 | DecoderFormat::DccSdf => {
            let (cmd, _, _) = dcc_group(f)?;
            Some(base(cfg, cmd, fmt, adr, funcs))
        }
        DecoderFormat::M3x126 if f <= M3_GROUP_LAST => {
            Some(base(cfg, Command::M3Func, fmt, adr, funcs))
        }
        DecoderFormat::M3x126 => m3_single(cfg, adr, f, funcs),
        _ => None,
    }
}

/// MM2 individual function packet (F1..F4), carrying the current speed.
pub fn mm_function(
    cfg: &FormatConfig,
    fmt: DecoderFormat,
    adr: u16,
    speed: u8,
    f: u8,
    funcs: [u32; 4],
) -> Option<Packet> {
    let cmd = match f {
        1 => Command::MmF1,
        2 => Command::MmF2,
        3 => Command::MmF3,
        4 => Command::MmF4,
        _ => return None,
    };
    if !fmt.is_mm() || fmt == DecoderFormat::Mm1x14 || !loco_ok(fmt, adr) {
        return None;
    }
    Some(base(cfg, cmd, fmt, adr, funcs).with_value(Payload::Word(u32::from(speed))))
}

/// DCC function group packet.
pub fn dcc_func_group(
    cfg: &FormatConfig,
    fmt: DecoderFormat,
    adr: u16,
    cmd: Command,
    funcs: [u32; 4],
) -> Option<Packet> {
    if !fmt.is_dcc() || !loco_ok(fmt, adr) || !DCC_GROUPS.iter().any(|g| g.0 == cmd) {
        return None;
    }
    Some(base(cfg, cmd, fmt, adr, funcs))
}

/// m3 F0..F15 group packet.
pub fn m3_func_group(cfg: &FormatConfig, adr: u16, funcs: [u32; 4]) -> Option<Packet> {
    let fmt = DecoderFormat::M3x126;
    loco_ok(fmt, adr).then(|| base(cfg, Command::M3Func, fmt, adr, funcs))
}

/// m3 single-function packet; the function index travels in `param`.
pub fn m3_single(cfg: &FormatConfig, adr: u16, f: u8, funcs: [u32; 4]) -> Option<Packet> {
    let fmt = DecoderFormat::M3x126;
    if !loco_ok(fmt, adr) || usize::from(f) >= MAX_FUNCS {
        return None;
    }
    Some(
        base(cfg, Command::M3SingleFunc, fmt, adr, funcs)
            .with_param(u32::from(f))
            .with_value(Payload::Word(u32::from(func_bit(&funcs, f)))),
    )
}

// ============================================================================
// Binary state
// ============================================================================

/// DCC binary-state packet.
///
/// States up to 127 use the short form, higher ones the long form.
pub fn binstate(
    cfg: &FormatConfig,
    fmt: DecoderFormat,
    adr: u16,
    state: u16,
    on: bool,
) -> Option<Packet> {
    if !fmt.is_dcc() || !(1..=MAX_DCC_ADR).contains(&adr) || state > MAX_BINSTATE {
        return None;
    }
    let cmd = if state <= MAX_BINSTATE_SHORT {
        Command::DccBinStateShort
    } else {
        Command::DccBinStateLong
    };
    Some(
        Packet::new(cmd, fmt, adr)
            .with_param(u32::from(state))
            .with_value(Payload::Word(u32::from(on)))
            .with_repeat(cfg.dcc_repeat.max(MIN_SAFETY_REPEAT)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FormatConfig {
        FormatConfig::default()
            .with_mm_repeat(3)
            .with_dcc_repeat(2)
            .with_m3_repeat(4)
    }

    #[test]
    fn speed_command_per_format() {
        let c = cfg();
        let cases = [
            (DecoderFormat::Mm2x14, Command::SetSpeed, 3),
            (DecoderFormat::Mm2x27a, Command::Mm27aSpeed, 3),
            (DecoderFormat::Dcc28, Command::SetSpeed, 2),
            (DecoderFormat::DccSdf, Command::DccSdf, 2),
            (DecoderFormat::M3x126, Command::M3SpeedFunc, 4),
        ];
        for (fmt, cmd, repeat) in cases {
            let p = speed(&c, fmt, 5, 0x88, [0; 4]).unwrap();
            assert_eq!(p.cmd, cmd, "{fmt}");
            assert_eq!(p.repeat, repeat, "{fmt}");
            assert_eq!(p.speed(), Some(0x88));
        }
    }

    #[test]
    fn speed_rejects_bad_addresses() {
        let c = cfg();
        assert!(speed(&c, DecoderFormat::Mm2x14, 256, 0, [0; 4]).is_none());
        assert!(speed(&c, DecoderFormat::Dcc28, 10240, 0, [0; 4]).is_none());
        assert!(speed(&c, DecoderFormat::AccDcc, 5, 0, [0; 4]).is_none());
        assert!(speed(&c, DecoderFormat::Dcc28, 10239, 0, [0; 4]).is_some());
    }

    #[test]
    fn emergency_stop_keeps_direction_and_forces_repeat() {
        let p = emergency_stop(&cfg(), DecoderFormat::Dcc28, 10, 0x90, [0; 4]).unwrap();
        assert_eq!(p.cmd, Command::EmergencyStop);
        assert_eq!(p.value, Payload::Word(0x80));
        assert_eq!(p.repeat, 5);

        let high = FormatConfig::default().with_dcc_repeat(8);
        let p = emergency_stop(&high, DecoderFormat::Dcc28, 10, 0x10, [0; 4]).unwrap();
        assert_eq!(p.value, Payload::Word(0));
        assert_eq!(p.repeat, 8);
    }

    #[test]
    fn mm_reverse_only_for_motorola() {
        let p = mm_reverse(&cfg(), DecoderFormat::Mm2x14, 24, 0x85).unwrap();
        assert_eq!(p.repeat, MM_REVERSE_REPEAT);
        assert!(mm_reverse(&cfg(), DecoderFormat::Dcc28, 24, 0x85).is_none());
    }

    #[test]
    fn mm1_functions() {
        let c = cfg();
        let f0 = function(&c, DecoderFormat::Mm1x14, 8, 0x83, 0, [1, 0, 0, 0]).unwrap();
        assert_eq!(f0.cmd, Command::SetSpeed);
        let f3 = function(&c, DecoderFormat::Mm1x14, 8, 0x83, 3, [8, 0, 0, 0]).unwrap();
        assert_eq!(f3.cmd, Command::MmFuncGroup);
        assert!(function(&c, DecoderFormat::Mm1x14, 8, 0x83, 5, [0; 4]).is_none());
    }

    #[test]
    fn mm2_functions_carry_speed() {
        let p = function(&cfg(), DecoderFormat::Mm2x14, 8, 0x85, 2, [4, 0, 0, 0]).unwrap();
        assert_eq!(p.cmd, Command::MmF2);
        assert_eq!(p.speed(), Some(0x85));
    }

    #[test]
    fn dcc_functions_by_group() {
        let c = cfg();
        let cases = [
            (0, Command::DccFuncF0F4),
            (4, Command::DccFuncF0F4),
            (5, Command::DccFuncF5F8),
            (12, Command::DccFuncF9F12),
            (20, Command::DccFuncF13F20),
            (28, Command::DccFuncF21F28),
            (31, Command::DccFuncF29F36),
            (68, Command::DccFuncF61F68),
        ];
        for (f, cmd) in cases {
            let p = function(&c, DecoderFormat::Dcc28, 3, 0x80, f, [0; 4]).unwrap();
            assert_eq!(p.cmd, cmd, "F{f}");
        }
        assert!(function(&c, DecoderFormat::Dcc28, 3, 0x80, 69, [0; 4]).is_none());
    }

    #[test]
    fn dcc14_f0_in_speed_packet() {
        let p = function(&cfg(), DecoderFormat::Dcc14, 3, 0x80, 0, [1, 0, 0, 0]).unwrap();
        assert_eq!(p.cmd, Command::SetSpeed);
        assert_eq!(p.funcs[0], 1);
    }

    #[test]
    fn sdf_low_functions_combined() {
        let c = cfg();
        assert_eq!(
            function(&c, DecoderFormat::DccSdf, 3, 0x80, 17, [0; 4]).unwrap().cmd,
            Command::DccSdf
        );
        assert_eq!(
            function(&c, DecoderFormat::DccSdf, 3, 0x80, 40, [0; 4]).unwrap().cmd,
            Command::DccFuncF37F44
        );
    }

    #[test]
    fn m3_functions() {
        let c = cfg();
        let g = function(&c, DecoderFormat::M3x126, 9, 0x80, 15, [0; 4]).unwrap();
        assert_eq!(g.cmd, Command::M3Func);

        let funcs = [1 << 20, 0, 0, 0];
        let s = function(&c, DecoderFormat::M3x126, 9, 0x80, 20, funcs).unwrap();
        assert_eq!(s.cmd, Command::M3SingleFunc);
        assert_eq!(s.param, 20);
        assert_eq!(s.value, Payload::Word(1));
    }

    #[test]
    fn binstate_forms() {
        let c = cfg();
        let short = binstate(&c, DecoderFormat::Dcc28, 3, 100, true).unwrap();
        assert_eq!(short.cmd, Command::DccBinStateShort);
        assert_eq!(short.repeat, 5);

        let long = binstate(&c, DecoderFormat::Dcc28, 3, 128, false).unwrap();
        assert_eq!(long.cmd, Command::DccBinStateLong);
        assert_eq!(long.value, Payload::Word(0));

        assert!(binstate(&c, DecoderFormat::Dcc28, 3, 32768, true).is_none());
        assert!(binstate(&c, DecoderFormat::Mm2x14, 3, 1, true).is_none());
    }

    #[test]
    fn word_masks() {
        assert_eq!(word_mask(0, 4), 0x1F);
        assert_eq!(word_mask(5, 8), 0x1E0);
        assert_eq!(word_mask(29, 36), 0xE000_0000);
        assert_eq!(word_mask(0, 31), u32::MAX);
        assert_eq!(word_mask(37, 44), 0);
    }

    #[test]
    fn func_bit_lookup() {
        let funcs = [0b10, 0, 1, 0];
        assert!(func_bit(&funcs, 1));
        assert!(!func_bit(&funcs, 0));
        assert!(func_bit(&funcs, 64));
        assert!(!func_bit(&funcs, 200));
    }
}
