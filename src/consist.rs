//! Consist (multiple-unit) records.
//!
//! A consist is a fixed-capacity list of signed addresses. A negative entry
//! runs reversed relative to the consist head. Each address belongs to at
//! most one consist.
//!
//! This module only keeps the records. The refresh engine turns them into
//! rings of live entries when a member is in use.
//!
//! ```rust
//! use rs_cmdstation::consist::ConsistManager;
//!
//! let mut consists = ConsistManager::new();
//! consists.couple(10, -11).unwrap();
//! consists.couple(11, 12).unwrap();
//!
//! let c = consists.find(12).unwrap();
//! assert_eq!(c.members(), &[10, -11, -12]);
//! assert_eq!(c.is_reversed(12), Some(true));
//! ```

use crate::error::{CoreError, Result};
use crate::format::MAX_LOCO_ADR;

/// Maximum number of locos in one consist.
pub const MAX_CONSISTLENGTH: usize = 8;

/// Signed member list.
pub type Members = heapless::Vec<i16, MAX_CONSISTLENGTH>;

/// One consist record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Consist {
    members: Members,
}

impl Consist {
    /// Signed members, head first.
    pub fn members(&self) -> &[i16] {
        &self.members
    }

    /// Member addresses without direction.
    pub fn addresses(&self) -> impl Iterator<Item = u16> + '_ {
        self.members.iter().map(|m| m.unsigned_abs())
    }

    /// True if `adr` is a member.
    pub fn contains(&self, adr: u16) -> bool {
        self.addresses().any(|a| a == adr)
    }

    /// Whether `adr` runs reversed, or `None` if it is not a member.
    pub fn is_reversed(&self, adr: u16) -> Option<bool> {
        self.members
            .iter()
            .find(|m| m.unsigned_abs() == adr)
            .map(|m| *m < 0)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if the consist has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn push(&mut self, adr: u16, reversed: bool) -> Result<()> {
        self.members
            .push(signed(adr, reversed))
            .map_err(|_| CoreError::NoMemory)
    }
}

fn signed(adr: u16, reversed: bool) -> i16 {
    // Addresses are bounded by MAX_LOCO_ADR and always fit.
    let a = adr as i16;
    if reversed {
        -a
    } else {
        a
    }
}

/// All consist records.
#[derive(Clone, Debug, Default)]
pub struct ConsistManager {
    consists: Vec<Consist>,
}

impl ConsistManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of(&self, adr: u16) -> Option<usize> {
        self.consists.iter().position(|c| c.contains(adr))
    }

    /// Consist containing `adr`.
    pub fn find(&self, adr: u16) -> Option<&Consist> {
        self.consists.iter().find(|c| c.contains(adr))
    }

    /// Dissolve the consist containing `adr`.
    pub fn remove(&mut self, adr: u16) -> Option<Consist> {
        let i = self.index_of(adr)?;
        Some(self.consists.remove(i))
    }

    /// Couple `b` to `a`.
    ///
    /// Signs give the relative orientation: `couple(10, -11)` runs 11
    /// reversed relative to 10. If both already belong to different
    /// consists, the consist of `b` is merged into that of `a`, flipping its
    /// members where the relative orientation requires it.
    pub fn couple(&mut self, a: i16, b: i16) -> Result<Consist> {
        let (ua, ub) = (a.unsigned_abs(), b.unsigned_abs());
        for adr in [ua, ub] {
            if adr == 0 || adr > MAX_LOCO_ADR {
                return Err(CoreError::Address(u32::from(adr)));
            }
        }
        if ua == ub {
            return Err(CoreError::Address(u32::from(ub)));
        }
        let rel = (a < 0) != (b < 0);

        match (self.index_of(ua), self.index_of(ub)) {
            (None, None) => {
                let mut c = Consist::default();
                c.push(ua, false)?;
                c.push(ub, rel)?;
                self.consists.push(c.clone());
                Ok(c)
            }
            (Some(i), None) => {
                let ra = self.consists[i].is_reversed(ua).unwrap_or(false);
                self.consists[i].push(ub, ra ^ rel)?;
                Ok(self.consists[i].clone())
            }
            (None, Some(j)) => {
                let rb = self.consists[j].is_reversed(ub).unwrap_or(false);
                self.consists[j].push(ua, rb ^ rel)?;
                Ok(self.consists[j].clone())
            }
            (Some(i), Some(j)) if i == j => Ok(self.consists[i].clone()),
            (Some(i), Some(j)) => {
                if self.consists[i].len() + self.consists[j].len() > MAX_CONSISTLENGTH {
                    return Err(CoreError::NoMemory);
                }
                let ra = self.consists[i].is_reversed(ua).unwrap_or(false);
                let rb = self.consists[j].is_reversed(ub).unwrap_or(false);
                let flip = ra ^ rb ^ rel;
                let other = self.consists.remove(j);
                let i = if j < i { i - 1 } else { i };
                for m in other.members() {
                    self.consists[i].push(m.unsigned_abs(), (*m < 0) ^ flip)?;
                }
                Ok(self.consists[i].clone())
            }
        }
    }

    /// Take one loco out of its consist.
    ///
    /// A consist left with a single member is dissolved. Returns `true` if
    /// the loco was a member.
    pub fn remove_loco(&mut self, adr: u16) -> bool {
        let Some(i) = self.index_of(adr) else {
            return false;
        };
        self.consists[i].members.retain(|m| m.unsigned_abs() != adr);
        if self.consists[i].len() < 2 {
            self.consists.remove(i);
        }
        true
    }

    /// All consists.
    pub fn list(&self) -> &[Consist] {
        &self.consists
    }

    /// Number of consists.
    pub fn len(&self) -> usize {
        self.consists.len()
    }

    /// True if there are no consists.
    pub fn is_empty(&self) -> bool {
        self.consists.is_empty()
    }
}
