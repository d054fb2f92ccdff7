//! Decoder formats and address limits.
//!
//! A [`DecoderFormat`] identifies the bitstream dialect a decoder understands
//! together with its speed-step resolution. Loco formats are grouped into the
//! Motorola (MM), NMRA DCC and m3/mfx families; accessory formats describe
//! how a turnout is switched.
//!
//! ```rust
//! use rs_cmdstation::DecoderFormat;
//!
//! assert!(DecoderFormat::Mm2x27a.is_mm());
//! assert_eq!(DecoderFormat::Dcc28.speed_steps(), 28);
//! assert!(DecoderFormat::AccBidib.is_turnout());
//! ```

/// Highest loco address accepted by the core (14-bit DCC long address space).
pub const MAX_LOCO_ADR: u16 = 10239;
/// Highest DCC multifunction address.
pub const MAX_DCC_ADR: u16 = 10239;
/// Highest Motorola address.
pub const MAX_MM_ADR: u16 = 255;
/// Highest m3 SID.
pub const MAX_M3_ADR: u16 = 16383;
/// Highest DCC basic accessory output address.
pub const MAX_DCC_ACCESSORY: u16 = 2048;
/// Highest DCC extended accessory address.
pub const MAX_DCC_EXTACC: u16 = 2044;
/// Highest Motorola accessory output address.
pub const MAX_MM_TURNOUT: u16 = 1024;
/// Number of function bits tracked per loco.
pub const MAX_FUNCS: usize = 128;

/// Bitstream dialect and speed-step count of a decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum DecoderFormat {
    /// Motorola I, 14 steps, F0 only.
    Mm1x14 = 0,
    /// Motorola II, 14 steps.
    #[default]
    Mm2x14 = 1,
    /// Motorola II, 27 steps realised with half-step pairs.
    Mm2x27a = 2,
    /// Motorola II, 27 steps (decoder-native variant).
    Mm2x27b = 3,
    /// DCC, 14 speed steps (F0 in the speed instruction).
    Dcc14 = 4,
    /// DCC, 28 speed steps.
    Dcc28 = 5,
    /// DCC, 126 speed steps (advanced operations).
    Dcc126 = 6,
    /// DCC speed-direction-function combined instruction.
    DccSdf = 7,
    /// m3 / mfx, 126 speed steps.
    M3x126 = 8,
    /// Motorola magnet accessory.
    AccMm = 16,
    /// DCC basic accessory.
    AccDcc = 17,
    /// Accessory reached over the BiDiB bus.
    AccBidib = 18,
}

impl DecoderFormat {
    /// True for the Motorola loco family.
    pub const fn is_mm(&self) -> bool {
        matches!(self, Self::Mm1x14 | Self::Mm2x14 | Self::Mm2x27a | Self::Mm2x27b)
    }

    /// True for the DCC loco family.
    pub const fn is_dcc(&self) -> bool {
        matches!(self, Self::Dcc14 | Self::Dcc28 | Self::Dcc126 | Self::DccSdf)
    }

    /// True for m3 / mfx.
    pub const fn is_m3(&self) -> bool {
        matches!(self, Self::M3x126)
    }

    /// True for accessory formats.
    pub const fn is_turnout(&self) -> bool {
        matches!(self, Self::AccMm | Self::AccDcc | Self::AccBidib)
    }

    /// True for loco formats.
    pub const fn is_loco(&self) -> bool {
        !self.is_turnout()
    }

    /// True if the accessory is switched over a bus instead of the track.
    pub const fn is_bus_accessory(&self) -> bool {
        matches!(self, Self::AccBidib)
    }

    /// Number of speed steps the format supports (0 for accessories).
    pub const fn speed_steps(&self) -> u8 {
        match self {
            Self::Mm1x14 | Self::Mm2x14 | Self::Dcc14 => 14,
            Self::Mm2x27a | Self::Mm2x27b => 27,
            Self::Dcc28 => 28,
            Self::Dcc126 | Self::DccSdf | Self::M3x126 => 126,
            Self::AccMm | Self::AccDcc | Self::AccBidib => 0,
        }
    }

    /// Highest loco address for this format.
    pub const fn max_address(&self) -> u16 {
        if self.is_mm() {
            MAX_MM_ADR
        } else if self.is_m3() {
            MAX_M3_ADR
        } else if self.is_dcc() {
            MAX_DCC_ADR
        } else {
            match self {
                Self::AccMm => MAX_MM_TURNOUT,
                _ => MAX_DCC_ACCESSORY,
            }
        }
    }

    /// Short lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mm1x14 => "mm1-14",
            Self::Mm2x14 => "mm2-14",
            Self::Mm2x27a => "mm2-27a",
            Self::Mm2x27b => "mm2-27b",
            Self::Dcc14 => "dcc-14",
            Self::Dcc28 => "dcc-28",
            Self::Dcc126 => "dcc-126",
            Self::DccSdf => "dcc-sdf",
            Self::M3x126 => "m3-126",
            Self::AccMm => "acc-mm",
            Self::AccDcc => "acc-dcc",
            Self::AccBidib => "acc-bidib",
        }
    }

    /// Parse the name produced by [`as_str`](Self::as_str) (case-insensitive).
    pub fn from_text(s: &str) -> Option<Self> {
        const ALL: [DecoderFormat; 12] = [
            DecoderFormat::Mm1x14,
            DecoderFormat::Mm2x14,
            DecoderFormat::Mm2x27a,
            DecoderFormat::Mm2x27b,
            DecoderFormat::Dcc14,
            DecoderFormat::Dcc28,
            DecoderFormat::Dcc126,
            DecoderFormat::DccSdf,
            DecoderFormat::M3x126,
            DecoderFormat::AccMm,
            DecoderFormat::AccDcc,
            DecoderFormat::AccBidib,
        ];
        let s = s.trim();
        ALL.into_iter().find(|f| f.as_str().eq_ignore_ascii_case(s))
    }
}

impl core::fmt::Display for DecoderFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Four-output group of a classic accessory decoder (`(adr - 1) / 4`).
pub const fn turnout_group(adr: u16) -> u16 {
    adr.saturating_sub(1) / 4
}
