//! Track packets: the unit of work handed to the signal generator.
//!
//! A [`Packet`] is a self-contained description of one on-track command.
//! It records *what* must be sent (command code, format, address, payload,
//! function snapshot) and *how often* (`repeat`). Bit timing is the signal
//! generator's business.
//!
//! # Command Codes
//!
//! [`Command`] is `#[repr(u8)]` with fixed discriminants. The numeric values
//! are the contract with the signal generator and must not be renumbered.
//!
//! # Ownership
//!
//! Packets are built by the factories in [`crate::factory`], moved into the
//! [`SignalQueue`](crate::SignalQueue), then handed out by value. A packet is
//! owned by exactly one party at a time.
//!
//! # Replies
//!
//! Packets that expect a decoder answer (POM reads, m3 CV access, DCC-A)
//! carry a [`ReplyHandler`]. The generator calls it once per reply; the
//! handler returns [`ReplyAction::Keep`] to stay registered for further
//! replies of a multi-reply exchange or [`ReplyAction::Release`] when done.

use std::sync::Arc;

use crate::format::DecoderFormat;

// ============================================================================
// Speed byte
// ============================================================================

/// Direction bit of the 8-bit speed byte (set = forward).
pub const SPEED_FORWARD: u8 = 0x80;
/// Step mask of the 8-bit speed byte.
pub const SPEED_STEP_MASK: u8 = 0x7F;

/// Extract the speed step (0 = stop).
#[inline]
pub const fn speed_step(speed: u8) -> u8 {
    speed & SPEED_STEP_MASK
}

/// True if the speed byte encodes forward travel.
#[inline]
pub const fn is_forward(speed: u8) -> bool {
    speed & SPEED_FORWARD != 0
}

/// Build a speed byte from direction and step.
#[inline]
pub const fn make_speed(forward: bool, step: u8) -> u8 {
    (step & SPEED_STEP_MASK) | if forward { SPEED_FORWARD } else { 0 }
}

// ============================================================================
// Command codes
// ============================================================================

/// What a packet does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Command {
    /// Format-independent idle padding.
    Idle = 0,
    /// Decoder reset.
    Reset = 1,
    /// Speed and direction.
    SetSpeed = 2,
    /// MM2 27-step speed (half-step capable variant).
    Mm27aSpeed = 3,
    /// Motorola direction change.
    MmReverse = 4,
    /// Emergency stop, direction preserved.
    EmergencyStop = 5,
    /// MM1 F1..F4 as a function-decoder group.
    MmFuncGroup = 6,
    /// MM2 F1 with current speed.
    MmF1 = 7,
    /// MM2 F2 with current speed.
    MmF2 = 8,
    /// MM2 F3 with current speed.
    MmF3 = 9,
    /// MM2 F4 with current speed.
    MmF4 = 10,
    /// DCC F0..F4 (F1..F4 for 14-step).
    DccFuncF0F4 = 11,
    /// DCC F5..F8.
    DccFuncF5F8 = 12,
    /// DCC F9..F12.
    DccFuncF9F12 = 13,
    /// DCC F13..F20.
    DccFuncF13F20 = 14,
    /// DCC F21..F28.
    DccFuncF21F28 = 15,
    /// DCC F29..F36.
    DccFuncF29F36 = 16,
    /// DCC F37..F44.
    DccFuncF37F44 = 17,
    /// DCC F45..F52.
    DccFuncF45F52 = 18,
    /// DCC F53..F60.
    DccFuncF53F60 = 19,
    /// DCC F61..F68.
    DccFuncF61F68 = 20,
    /// DCC speed-direction-function combined.
    DccSdf = 21,
    /// DCC binary state, long form.
    DccBinStateLong = 22,
    /// DCC binary state, short form.
    DccBinStateShort = 23,
    /// m3 speed plus F0..F15.
    M3SpeedFunc = 24,
    /// m3 F0..F15 group.
    M3Func = 25,
    /// m3 single function (index in `param`).
    M3SingleFunc = 26,
    /// m3 beacon (beacon in `value`, announce counter in `param`).
    M3Beacon = 27,
    /// m3 UID search step.
    M3Search = 28,
    /// m3 assign SID to UID.
    M3NewAddr = 29,
    /// m3 CV read.
    M3CvRead = 30,
    /// m3 CV write.
    M3CvWrite = 31,
    /// Accessory coil on.
    MagnetOn = 32,
    /// Accessory coil off.
    MagnetOff = 33,
    /// DCC basic accessory NOP.
    DccAccNop = 34,
    /// DCC extended accessory NOP.
    DccExtAccNop = 35,
    /// DCC extended accessory aspect.
    DccExtAccAspect = 36,
    /// DCC POM byte read (mobile).
    DccPomRead = 40,
    /// DCC POM byte write (mobile).
    DccPomWrite = 41,
    /// DCC POM bit write (mobile).
    DccPomWriteBit = 42,
    /// DCC POM byte read (accessory).
    DccPomAccRead = 43,
    /// DCC POM byte write (accessory).
    DccPomAccWrite = 44,
    /// DCC POM bit write (accessory).
    DccPomAccWriteBit = 45,
    /// DCC xPOM read (four bytes back).
    DccXpomRead = 46,
    /// DCC xPOM write of 1..4 bytes.
    DccXpomWrite = 47,
    /// DCC xPOM bit write.
    DccXpomWriteBit = 48,
    /// DCC short-form POM write.
    DccPomShortWrite = 49,
    /// DCC-A LOGON_ENABLE.
    DccaLogonEnable = 50,
    /// DCC-A SELECT.
    DccaSelect = 51,
    /// DCC-A LOGON_ASSIGN.
    DccaLogonAssign = 52,
    /// DCC-A GET_DATA (continuation).
    DccaGetData = 53,
    /// DCC model time broadcast.
    DccModelTime = 56,
    /// DCC model date broadcast.
    DccModelDate = 57,
    /// DCC system time broadcast.
    DccSysTime = 58,
}

impl Command {
    /// Numeric wire code.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// True for commands that carry the loco speed byte in `value`.
    pub const fn carries_speed(self) -> bool {
        matches!(
            self,
            Self::SetSpeed
                | Self::Mm27aSpeed
                | Self::EmergencyStop
                | Self::MmF1
                | Self::MmF2
                | Self::MmF3
                | Self::MmF4
                | Self::DccSdf
                | Self::M3SpeedFunc
        )
    }

    /// Commands that mark a direction change for a decoder.
    ///
    /// Replacement-on-match never moves a packet across one of these.
    pub const fn is_direction_barrier(self) -> bool {
        matches!(self, Self::EmergencyStop | Self::MmReverse)
    }
}

// ============================================================================
// Payload
// ============================================================================

/// CV address: linear for DCC, `{cv, sub}` for m3.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CvAddr {
    /// CV number (DCC: up to 24 bit, m3: 10 bit).
    pub cv: u32,
    /// Sub-index (m3 only).
    pub sub: u8,
}

impl CvAddr {
    /// Linear DCC CV.
    pub const fn linear(cv: u32) -> Self {
        Self { cv, sub: 0 }
    }

    /// m3 CV with sub-index.
    pub const fn m3(cv: u16, sub: u8) -> Self {
        Self { cv: cv as u32, sub }
    }
}

/// Payload carried in a packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Payload {
    /// No payload.
    #[default]
    None,
    /// 32-bit word (speed byte, CV value, UID, beacon...).
    Word(u32),
    /// Up to four payload bytes.
    Bytes {
        /// Byte values, first `len` valid.
        data: [u8; 4],
        /// Number of valid bytes (1..=4).
        len: u8,
    },
    /// Bit position and value for bit-wise CV writes.
    Bit {
        /// Bit position 0..=7.
        pos: u8,
        /// New bit value.
        val: bool,
    },
}

impl Payload {
    /// Build a byte payload from a slice (at most 4 bytes kept).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [0u8; 4];
        let len = bytes.len().min(4);
        data[..len].copy_from_slice(&bytes[..len]);
        Self::Bytes {
            data,
            len: len as u8,
        }
    }

    /// The word value, or 0 for non-word payloads.
    pub const fn word(&self) -> u32 {
        match self {
            Self::Word(w) => *w,
            _ => 0,
        }
    }

    /// Valid bytes of a byte payload.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Bytes { data, len } => &data[..*len as usize],
            _ => &[],
        }
    }
}

// ============================================================================
// Replies
// ============================================================================

/// Outcome reported by the generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyKind {
    /// Decoder answered.
    Answer,
    /// Exchange finished without an answer.
    NoAnswer,
}

/// Kind of decoder that answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderType {
    /// DCC multifunction decoder.
    Loco,
    /// DCC basic accessory decoder.
    Accessory,
    /// DCC extended accessory decoder.
    ExtAccessory,
    /// m3 decoder.
    M3,
    /// DCC-A enumeration answer.
    DccA,
}

/// A decoder response delivered by the signal generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderReply {
    /// Answer or no-answer.
    pub kind: ReplyKind,
    /// Decoder address.
    pub adr: u16,
    /// Decoder type.
    pub dtype: DecoderType,
    /// Number of valid bytes in `data`.
    pub len: u8,
    /// Reply data.
    pub data: [u8; 8],
    /// Parameter echo (CV number, block...).
    pub param: u32,
}

impl DecoderReply {
    /// A reply carrying data.
    pub fn answer(adr: u16, dtype: DecoderType, data: &[u8], param: u32) -> Self {
        let mut buf = [0u8; 8];
        let len = data.len().min(8);
        buf[..len].copy_from_slice(&data[..len]);
        Self {
            kind: ReplyKind::Answer,
            adr,
            dtype,
            len: len as u8,
            data: buf,
            param,
        }
    }

    /// A no-answer notification.
    pub fn no_answer(adr: u16, dtype: DecoderType, param: u32) -> Self {
        Self {
            kind: ReplyKind::NoAnswer,
            adr,
            dtype,
            len: 0,
            data: [0; 8],
            param,
        }
    }

    /// Valid reply bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// What the generator should do with the exchange after a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyAction {
    /// Keep the exchange registered for further replies.
    Keep,
    /// Release the exchange.
    Release,
}

/// Object-safe reply callback.
pub trait ReplyCallback: Send + Sync {
    /// Handle one decoder reply.
    fn on_reply(&self, reply: &DecoderReply) -> ReplyAction;
}

impl<F> ReplyCallback for F
where
    F: Fn(&DecoderReply) -> ReplyAction + Send + Sync,
{
    fn on_reply(&self, reply: &DecoderReply) -> ReplyAction {
        self(reply)
    }
}

/// Shared, type-erased reply handler attached to a packet.
///
/// The opaque caller token of a classic callback API is simply whatever the
/// closure captures.
///
/// ```rust
/// use rs_cmdstation::packet::{DecoderReply, DecoderType, ReplyAction, ReplyHandler};
///
/// let handler = ReplyHandler::new(|r: &DecoderReply| {
///     if r.data().is_empty() { ReplyAction::Keep } else { ReplyAction::Release }
/// });
/// let reply = DecoderReply::answer(3, DecoderType::Loco, &[42], 1);
/// assert_eq!(handler.call(&reply), ReplyAction::Release);
/// ```
#[derive(Clone)]
pub struct ReplyHandler {
    inner: Arc<dyn ReplyCallback>,
}

impl ReplyHandler {
    /// Wrap a callback.
    pub fn new<C: ReplyCallback + 'static>(callback: C) -> Self {
        Self {
            inner: Arc::new(callback),
        }
    }

    /// Invoke the callback.
    pub fn call(&self, reply: &DecoderReply) -> ReplyAction {
        self.inner.on_reply(reply)
    }
}

impl core::fmt::Debug for ReplyHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReplyHandler").finish_non_exhaustive()
    }
}

// ============================================================================
// Packet
// ============================================================================

/// One on-track command.
#[derive(Clone, Debug)]
pub struct Packet {
    /// Command code.
    pub cmd: Command,
    /// Decoder format for this packet.
    pub fmt: DecoderFormat,
    /// Decoder or accessory address.
    pub adr: u16,
    /// CV address for programming commands.
    pub cva: CvAddr,
    /// Auxiliary parameter (bit index, block number, CID, function index...).
    pub param: u32,
    /// Payload.
    pub value: Payload,
    /// Function bit snapshot taken when the packet was built.
    pub funcs: [u32; 4],
    /// How many times the generator emits this packet.
    pub repeat: u8,
    /// Optional reply handler.
    pub reply: Option<ReplyHandler>,
}

impl Packet {
    /// A bare packet with no payload and a single repetition.
    pub fn new(cmd: Command, fmt: DecoderFormat, adr: u16) -> Self {
        Self {
            cmd,
            fmt,
            adr,
            cva: CvAddr::default(),
            param: 0,
            value: Payload::None,
            funcs: [0; 4],
            repeat: 1,
            reply: None,
        }
    }

    /// Set the repeat count.
    pub fn with_repeat(mut self, repeat: u8) -> Self {
        self.repeat = repeat;
        self
    }

    /// Set the payload.
    pub fn with_value(mut self, value: Payload) -> Self {
        self.value = value;
        self
    }

    /// Set the auxiliary parameter.
    pub fn with_param(mut self, param: u32) -> Self {
        self.param = param;
        self
    }

    /// Set the CV address.
    pub fn with_cv(mut self, cva: CvAddr) -> Self {
        self.cva = cva;
        self
    }

    /// Attach a function snapshot.
    pub fn with_funcs(mut self, funcs: [u32; 4]) -> Self {
        self.funcs = funcs;
        self
    }

    /// Attach a reply handler.
    pub fn with_reply(mut self, reply: Option<ReplyHandler>) -> Self {
        self.reply = reply;
        self
    }

    /// Speed byte for speed-bearing commands.
    pub fn speed(&self) -> Option<u8> {
        self.cmd
            .carries_speed()
            .then(|| (self.value.word() & 0xFF) as u8)
    }

    /// True if `other` targets the same decoder with the same command.
    pub fn matches(&self, other: &Packet) -> bool {
        self.adr == other.adr && self.fmt == other.fmt && self.cmd == other.cmd
    }

    /// Deliver a reply to the attached handler.
    ///
    /// Returns [`ReplyAction::Release`] when no handler is attached.
    pub fn deliver_reply(&self, reply: &DecoderReply) -> ReplyAction {
        match &self.reply {
            Some(h) => h.call(reply),
            None => ReplyAction::Release,
        }
    }
}
