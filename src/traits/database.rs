//! Persistent loco and accessory descriptors.
//!
//! The loco database and the configuration store are external
//! collaborators. The core reads descriptors from them and writes back
//! format, function-count and accessory state changes.

use crate::config::{ShortString, StoreCause};
use crate::error::Result;
use crate::format::DecoderFormat;

/// Persistent description of a loco decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocoDescriptor {
    /// Decoder address.
    pub adr: u16,
    /// Decoder format.
    pub fmt: DecoderFormat,
    /// Highest function index the decoder supports.
    pub maxfunc: u8,
    /// Display name.
    pub name: ShortString,
    /// m3 decoder UID.
    pub uid: Option<u32>,
}

impl LocoDescriptor {
    /// A descriptor with default function count and no name.
    pub fn new(adr: u16, fmt: DecoderFormat) -> Self {
        Self {
            adr,
            fmt,
            maxfunc: if fmt.is_mm() { 4 } else { 28 },
            name: ShortString::new(),
            uid: None,
        }
    }

    /// Set the function count.
    pub fn with_maxfunc(mut self, maxfunc: u8) -> Self {
        self.maxfunc = maxfunc;
        self
    }

    /// Set the m3 UID.
    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }
}

/// Persistent description and last state of an accessory.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TurnoutDescriptor {
    /// Accessory address.
    pub adr: u16,
    /// Accessory format.
    pub fmt: DecoderFormat,
    /// Coil energised.
    pub on: bool,
    /// Last commanded direction (0 = straight / red, 1 = thrown / green).
    pub dir: u8,
}

impl TurnoutDescriptor {
    /// A de-energised accessory in direction 0.
    pub fn new(adr: u16, fmt: DecoderFormat) -> Self {
        Self {
            adr,
            fmt,
            on: false,
            dir: 0,
        }
    }
}

/// Loco and accessory database.
pub trait LocoDatabase: Send + Sync {
    /// Look up a loco, creating a default descriptor when `create` is set.
    fn get_loco(&self, adr: u16, create: bool) -> Option<LocoDescriptor>;

    /// Descriptor at position `index` in address order.
    fn lookup_loco_sorted(&self, index: usize) -> Option<LocoDescriptor>;

    /// Next known address after `adr` in address order.
    fn index_sorted_next(&self, adr: u16) -> Option<u16>;

    /// Previous known address before `adr` in address order.
    fn index_sorted_prev(&self, adr: u16) -> Option<u16>;

    /// Visit every loco in address order until the visitor returns `false`.
    fn iterate_loco(&self, visit: &mut dyn FnMut(&LocoDescriptor) -> bool);

    /// Change the decoder format.
    fn set_loco_fmt(&self, adr: u16, fmt: DecoderFormat) -> Result<()>;

    /// Change the function count.
    fn set_loco_maxfunc(&self, adr: u16, maxfunc: u8) -> Result<()>;

    /// Change the display name.
    fn set_loco_name(&self, adr: u16, name: &str) -> Result<()>;

    /// Forget a loco. Returns `true` if it existed.
    fn remove_loco(&self, adr: u16) -> bool;

    /// Look up an accessory, creating a default descriptor when `create` is set.
    fn get_turnout(&self, adr: u16, create: bool) -> Option<TurnoutDescriptor>;

    /// Change the accessory format.
    fn set_turnout_fmt(&self, adr: u16, fmt: DecoderFormat) -> Result<()>;

    /// Record the energised state and direction of an accessory.
    fn set_turnout_state(&self, adr: u16, on: bool, dir: u8);

    /// All known loco addresses in ascending order.
    fn loco_addresses(&self) -> Vec<u16> {
        let mut out = Vec::new();
        self.iterate_loco(&mut |d| {
            out.push(d.adr);
            true
        });
        out
    }
}

/// Persistence hook for configuration changes.
pub trait ConfigStore: Send + Sync {
    /// Persist the configuration section affected by `cause`.
    fn trigger_store(&self, cause: StoreCause);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loco_defaults_by_family() {
        assert_eq!(LocoDescriptor::new(3, DecoderFormat::Mm2x14).maxfunc, 4);
        assert_eq!(LocoDescriptor::new(3, DecoderFormat::Dcc28).maxfunc, 28);
    }

    #[test]
    fn loco_builder() {
        let d = LocoDescriptor::new(5, DecoderFormat::M3x126)
            .with_maxfunc(31)
            .with_uid(0xDEAD_BEEF);
        assert_eq!(d.maxfunc, 31);
        assert_eq!(d.uid, Some(0xDEAD_BEEF));
    }

    #[test]
    fn turnout_starts_off() {
        let t = TurnoutDescriptor::new(12, DecoderFormat::AccDcc);
        assert!(!t.on);
        assert_eq!(t.dir, 0);
    }
}
