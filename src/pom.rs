//! Programming-on-main facade.
//!
//! Validates the request, builds the packet through [`factory::pom`] and
//! enqueues it without replacement. Decoder answers come back through the
//! packet's reply handler, never through the return value.
//!
//! A dropped packet (queue lock timeout) is a soft failure: the call still
//! returns `Ok`.
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_cmdstation::pom::{Pom, BOOSTER_CV};
//! use rs_cmdstation::{Config, CoreError, SignalQueue};
//!
//! let queue = Arc::new(SignalQueue::new());
//! let pom = Pom::new(Arc::clone(&queue), Config::default().shared());
//!
//! pom.booster_conf(62, 0).unwrap();
//! let pkts = queue.drain();
//! assert_eq!(pkts.len(), 2);
//! assert!(pkts.iter().all(|p| p.cva.cv == BOOSTER_CV));
//!
//! assert_eq!(pom.booster_conf(62, 62), Err(CoreError::BoosterKey(62)));
//! assert_eq!(CoreError::BoosterKey(62).code(), -2);
//! ```
//!
//! [`factory::pom`]: crate::factory::pom

use std::sync::Arc;

use tracing::debug;

use crate::config::{FormatConfig, SharedConfig};
use crate::error::{CoreError, Result};
use crate::factory::pom::{self, PomTarget, MAX_POM_CV, MAX_XPOM_CV};
use crate::format::MAX_DCC_ADR;
use crate::packet::{Packet, ReplyHandler};
use crate::queue::SignalQueue;

/// CV that carries the booster vendor key and parameter.
pub const BOOSTER_CV: u32 = 7;

/// Address no real decoder is expected to use.
pub const BOOSTER_ADR: u16 = MAX_DCC_ADR;

/// Repeat count of the vendor-key packet.
pub const BOOSTER_KEY_REPEAT: u8 = 16;

/// Repeat count of the parameter packet.
pub const BOOSTER_PARAM_REPEAT: u8 = 20;

/// POM entry points.
#[derive(Debug, Clone)]
pub struct Pom {
    queue: Arc<SignalQueue>,
    config: SharedConfig,
}

impl Pom {
    /// Create the facade.
    pub fn new(queue: Arc<SignalQueue>, config: SharedConfig) -> Self {
        Self { queue, config }
    }

    fn formats(&self) -> FormatConfig {
        self.config.read().formats.clone()
    }

    fn check_target(target: PomTarget, adr: u16) -> Result<()> {
        if !target.address_ok(adr) {
            return Err(CoreError::Address(u32::from(adr)));
        }
        if target == PomTarget::ExtAccessory {
            return Err(CoreError::NotImplemented);
        }
        Ok(())
    }

    fn check_cv(cv: u32, max: u32) -> Result<()> {
        if cv > max {
            return Err(CoreError::Cv(cv));
        }
        Ok(())
    }

    fn check_bit(bit: u8) -> Result<()> {
        if bit > 7 {
            return Err(CoreError::Bit(bit));
        }
        Ok(())
    }

    fn send(&self, pkt: Option<Packet>) -> Result<()> {
        let pkt = pkt.ok_or(CoreError::NoMemory)?;
        debug!(target: "pom", cmd = ?pkt.cmd, adr = pkt.adr, cv = pkt.cva.cv, "pom queued");
        self.queue.enqueue(pkt, false);
        Ok(())
    }

    /// Read one CV byte.
    pub fn read(&self, target: PomTarget, adr: u16, cv: u32, reply: Option<ReplyHandler>) -> Result<()> {
        Self::check_target(target, adr)?;
        Self::check_cv(cv, MAX_POM_CV)?;
        self.send(pom::read(&self.formats(), target, adr, cv, reply))
    }

    /// Write one CV byte.
    pub fn write(
        &self,
        target: PomTarget,
        adr: u16,
        cv: u32,
        val: u32,
        reply: Option<ReplyHandler>,
    ) -> Result<()> {
        Self::check_target(target, adr)?;
        Self::check_cv(cv, MAX_POM_CV)?;
        let val = u8::try_from(val).map_err(|_| CoreError::Value(val))?;
        self.send(pom::write(&self.formats(), target, adr, cv, val, reply))
    }

    /// Write one CV bit.
    pub fn write_bit(
        &self,
        target: PomTarget,
        adr: u16,
        cv: u32,
        bit: u8,
        val: bool,
        reply: Option<ReplyHandler>,
    ) -> Result<()> {
        Self::check_target(target, adr)?;
        Self::check_cv(cv, MAX_POM_CV)?;
        Self::check_bit(bit)?;
        self.send(pom::write_bit(&self.formats(), target, adr, cv, bit, val, reply))
    }

    /// xPOM read (mobile decoders only).
    pub fn xpom_read(&self, adr: u16, cv: u32, reply: Option<ReplyHandler>) -> Result<()> {
        Self::check_target(PomTarget::Loco, adr)?;
        Self::check_cv(cv, MAX_XPOM_CV)?;
        self.send(pom::xpom_read(&self.formats(), adr, cv, reply))
    }

    /// xPOM write of 1..=4 bytes.
    pub fn xpom_write(&self, adr: u16, cv: u32, bytes: &[u8], reply: Option<ReplyHandler>) -> Result<()> {
        Self::check_target(PomTarget::Loco, adr)?;
        Self::check_cv(cv, MAX_XPOM_CV)?;
        if bytes.is_empty() || bytes.len() > 4 {
            return Err(CoreError::Value(bytes.len() as u32));
        }
        self.send(pom::xpom_write(&self.formats(), adr, cv, bytes, reply))
    }

    /// xPOM bit write.
    pub fn xpom_write_bit(
        &self,
        adr: u16,
        cv: u32,
        bit: u8,
        val: bool,
        reply: Option<ReplyHandler>,
    ) -> Result<()> {
        Self::check_target(PomTarget::Loco, adr)?;
        Self::check_cv(cv, MAX_XPOM_CV)?;
        Self::check_bit(bit)?;
        self.send(pom::xpom_write_bit(&self.formats(), adr, cv, bit, val, reply))
    }

    /// Short-form write of register `id` (2..=5).
    pub fn short_write(&self, adr: u16, id: u32, bytes: &[u8]) -> Result<()> {
        Self::check_target(PomTarget::Loco, adr)?;
        let len = pom::short_form_len(id).ok_or(CoreError::Cv(id))?;
        if bytes.len() != len {
            return Err(CoreError::Value(bytes.len() as u32));
        }
        self.send(pom::short_write(&self.formats(), adr, id, bytes))
    }

    /// Booster configuration: vendor key then parameter, both to CV 7.
    ///
    /// Key and parameter must differ. No answer is expected.
    pub fn booster_conf(&self, vid: u8, param: u8) -> Result<()> {
        if vid == param {
            return Err(CoreError::BoosterKey(vid));
        }
        let cfg = self.formats();
        let key = pom::write(&cfg, PomTarget::Loco, BOOSTER_ADR, BOOSTER_CV, vid, None)
            .ok_or(CoreError::NoMemory)?
            .with_repeat(BOOSTER_KEY_REPEAT);
        let value = pom::write(&cfg, PomTarget::Loco, BOOSTER_ADR, BOOSTER_CV, param, None)
            .ok_or(CoreError::NoMemory)?
            .with_repeat(BOOSTER_PARAM_REPEAT);
        debug!(target: "pom", vid, param, "booster configuration");
        self.queue.enqueue_batch([key, value], false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::packet::{Command, Payload};

    fn facade() -> (Pom, Arc<SignalQueue>) {
        let queue = Arc::new(SignalQueue::new());
        (Pom::new(Arc::clone(&queue), Config::default().shared()), queue)
    }

    #[test]
    fn loco_write_queued() {
        let (pom, q) = facade();
        pom.write(PomTarget::Loco, 3, 29, 6, None).unwrap();
        let p = q.pop(None).unwrap();
        assert_eq!(p.cmd, Command::DccPomWrite);
        assert_eq!(p.cva.cv, 29);
        assert_eq!(p.value, Payload::Word(6));
        assert_eq!(p.repeat, 5);
    }

    #[test]
    fn accessory_read_uses_accessory_command() {
        let (pom, q) = facade();
        pom.read(PomTarget::Accessory, 2048, 1, None).unwrap();
        assert_eq!(q.pop(None).unwrap().cmd, Command::DccPomAccRead);
    }

    #[test]
    fn validation_order_and_codes() {
        let (pom, q) = facade();
        let e = pom.write(PomTarget::Loco, 0, 5000, 300, None).unwrap_err();
        assert_eq!(e.code(), -1);
        let e = pom.write(PomTarget::Loco, 3, 5000, 300, None).unwrap_err();
        assert_eq!(e, CoreError::Cv(5000));
        let e = pom.write(PomTarget::Loco, 3, 1, 300, None).unwrap_err();
        assert_eq!(e, CoreError::Value(300));
        let e = pom.write_bit(PomTarget::Loco, 3, 1, 8, true, None).unwrap_err();
        assert_eq!(e, CoreError::Bit(8));
        assert!(q.is_empty());
    }

    #[test]
    fn ext_accessory_not_implemented() {
        let (pom, _) = facade();
        assert_eq!(
            pom.read(PomTarget::ExtAccessory, 10, 1, None),
            Err(CoreError::NotImplemented)
        );
        assert_eq!(
            pom.read(PomTarget::ExtAccessory, 2045, 1, None),
            Err(CoreError::Address(2045))
        );
    }

    #[test]
    fn xpom_ranges() {
        let (pom, q) = facade();
        pom.xpom_write(3, 0xFF_FFFF, &[1, 2, 3, 4], None).unwrap();
        assert_eq!(pom.xpom_read(3, 0x100_0000, None), Err(CoreError::Cv(0x100_0000)));
        assert_eq!(pom.xpom_write(3, 1, &[], None), Err(CoreError::Value(0)));
        assert_eq!(pom.xpom_write(3, 1, &[0; 5], None), Err(CoreError::Value(5)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn short_form_ids() {
        let (pom, q) = facade();
        pom.short_write(3, 2, &[7]).unwrap();
        pom.short_write(3, 5, &[1, 2]).unwrap();
        assert_eq!(pom.short_write(3, 1, &[1]), Err(CoreError::Cv(1)));
        assert_eq!(pom.short_write(3, 6, &[1]), Err(CoreError::Cv(6)));
        assert_eq!(pom.short_write(3, 4, &[1]), Err(CoreError::Value(1)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn booster_sequence() {
        let (pom, q) = facade();
        pom.booster_conf(62, 0).unwrap();
        let pkts = q.drain();
        let got: Vec<(Command, u16, u32, Payload, u8)> = pkts
            .iter()
            .map(|p| (p.cmd, p.adr, p.cva.cv, p.value, p.repeat))
            .collect();
        assert_eq!(
            got,
            vec![
                (Command::DccPomWrite, 10239, 7, Payload::Word(62), 16),
                (Command::DccPomWrite, 10239, 7, Payload::Word(0), 20),
            ]
        );

        assert_eq!(pom.booster_conf(62, 62), Err(CoreError::BoosterKey(62)));
        assert!(q.is_empty());
    }
}
