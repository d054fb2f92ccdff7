//! Edge case and boundary condition tests for the command core

use std::sync::Arc;

use rs_cmdstation::config::FormatConfig;
use rs_cmdstation::consist::MAX_CONSISTLENGTH;
use rs_cmdstation::factory::{accessory, loco, pom::PomTarget};
use rs_cmdstation::format::{MAX_DCC_ADR, MAX_MM_ADR};
use rs_cmdstation::hal::{MockClock, MockConfigStore, MockLocoDb};
use rs_cmdstation::{
    Command, Config, CoreError, DecoderFormat, EventBus, LocoDatabase, LocoDescriptor, Pom,
    RefreshEngine, SignalQueue,
};

fn engine() -> (RefreshEngine, Arc<SignalQueue>, Arc<MockLocoDb>) {
    let queue = Arc::new(SignalQueue::new());
    let db = Arc::new(MockLocoDb::new(DecoderFormat::Dcc28));
    let engine = RefreshEngine::new(
        Arc::clone(&queue),
        Arc::clone(&db) as Arc<dyn LocoDatabase>,
        Arc::new(EventBus::new()),
        Config::default().shared(),
        Arc::new(MockConfigStore::new()),
        Arc::new(MockClock::new()),
    );
    (engine, queue, db)
}

// ============================================================================
// Address Boundaries
// ============================================================================

#[test]
fn loco_address_zero_rejected() {
    let (e, q, _) = engine();
    assert_eq!(e.set_speed(0, 0x90), Err(CoreError::Address(0)));
    assert!(q.is_empty());
}

#[test]
fn dcc_address_upper_bound() {
    let (e, q, _) = engine();
    e.set_speed(MAX_DCC_ADR, 0x90).unwrap();
    assert_eq!(q.len(), 1);
    assert_eq!(
        e.set_speed(MAX_DCC_ADR + 1, 0x90),
        Err(CoreError::Address(u32::from(MAX_DCC_ADR) + 1))
    );
}

#[test]
fn motorola_address_above_255_rejected() {
    let (e, q, db) = engine();
    db.insert(LocoDescriptor::new(MAX_MM_ADR, DecoderFormat::Mm2x14));
    db.insert(LocoDescriptor::new(MAX_MM_ADR + 1, DecoderFormat::Mm2x14));
    e.set_speed(MAX_MM_ADR, 0x85).unwrap();
    assert!(e.set_speed(MAX_MM_ADR + 1, 0x85).is_err());
    assert_eq!(q.len(), 1);
    assert_eq!(e.live_addresses().unwrap(), vec![MAX_MM_ADR]);
}

#[test]
fn format_change_rejects_address_out_of_family() {
    let (e, _, _) = engine();
    e.loco_state(300).unwrap();
    assert_eq!(
        e.set_format(300, DecoderFormat::Mm2x14),
        Err(CoreError::Address(300))
    );
    assert_eq!(
        e.set_format(300, DecoderFormat::AccDcc),
        Err(CoreError::Value(DecoderFormat::AccDcc as u32))
    );
}

// ============================================================================
// Speed Boundaries
// ============================================================================

#[test]
fn speed_step_clamped_to_format() {
    let (e, q, db) = engine();
    db.insert(LocoDescriptor::new(4, DecoderFormat::Dcc14));
    e.set_speed(4, 0xFF).unwrap();
    assert_eq!(e.loco_state(4).unwrap().speed, 0x80 | 14);
    // DCC(14) speed packets are followed by an idle packet
    let cmds: Vec<Command> = q.drain().iter().map(|p| p.cmd).collect();
    assert_eq!(cmds, vec![Command::SetSpeed, Command::Idle]);
}

#[test]
fn reversal_from_standstill_has_no_emergency_stop() {
    let (e, q, _) = engine();
    e.set_speed(3, 0x80).unwrap();
    e.set_speed(3, 0x05).unwrap();
    let cmds: Vec<Command> = q.drain().iter().map(|p| p.cmd).collect();
    assert_eq!(cmds, vec![Command::SetSpeed]);
}

#[test]
fn repeated_speed_replaces_queued_packet() {
    let (e, q, _) = engine();
    for step in 1..=10 {
        e.set_speed(3, 0x80 | step).unwrap();
    }
    let q = q.drain();
    assert_eq!(q.len(), 1);
    assert_eq!(q[0].speed(), Some(0x80 | 10));
}

#[test]
fn replacement_never_crosses_direction_barrier() {
    let (e, q, _) = engine();
    e.set_speed(3, 0x90).unwrap();
    e.set_speed(3, 0x10).unwrap();
    e.set_speed(3, 0x12).unwrap();
    let q = q.drain();
    let cmds: Vec<Command> = q.iter().map(|p| p.cmd).collect();
    assert_eq!(cmds, vec![Command::SetSpeed, Command::EmergencyStop, Command::SetSpeed]);
    assert_eq!(q[0].speed(), Some(0x90));
    assert_eq!(q[2].speed(), Some(0x12));
}

#[test]
fn motorola_reversal_adds_reverse_packet() {
    let (e, q, db) = engine();
    db.insert(LocoDescriptor::new(24, DecoderFormat::Mm2x14));
    e.set_speed(24, 0x85).unwrap();
    e.set_speed(24, 0x05).unwrap();
    let cmds: Vec<Command> = q.drain().iter().map(|p| p.cmd).collect();
    assert_eq!(
        cmds,
        vec![
            Command::SetSpeed,
            Command::EmergencyStop,
            Command::MmReverse,
            Command::SetSpeed,
        ]
    );
}

// ============================================================================
// Functions
// ============================================================================

#[test]
fn function_index_limit() {
    let (e, _, _) = engine();
    assert_eq!(e.set_function(3, 128, true), Err(CoreError::Value(128)));
    e.set_function(3, 127, true).unwrap();
    assert_eq!(e.loco_state(3).unwrap().funcs[3], 1 << 31);
}

#[test]
fn high_function_beyond_maxfunc_keeps_state_only() {
    let (e, q, _) = engine();
    e.set_function(3, 40, true).unwrap();
    assert!(q.is_empty());
    assert_eq!(e.loco_state(3).unwrap().funcs[1], 1 << 8);
}

#[test]
fn binary_state_needs_dcc() {
    let (e, q, db) = engine();
    db.insert(LocoDescriptor::new(8, DecoderFormat::Mm2x14));
    assert_eq!(e.binstate(8, 5, true), Err(CoreError::NotImplemented));
    e.binstate(3, 5, true).unwrap();
    assert_eq!(q.pop(None).unwrap().cmd, Command::DccBinStateShort);
    e.binstate(3, 200, true).unwrap();
    assert_eq!(q.pop(None).unwrap().cmd, Command::DccBinStateLong);
}

// ============================================================================
// Consists
// ============================================================================

#[test]
fn consist_length_capped() {
    let (e, _, _) = engine();
    for adr in 2..=MAX_CONSISTLENGTH as i16 {
        e.consist_couple(1, adr).unwrap();
    }
    assert_eq!(
        e.consist_couple(1, MAX_CONSISTLENGTH as i16 + 1),
        Err(CoreError::NoMemory)
    );
    assert_eq!(e.consist_list().unwrap()[0].len(), MAX_CONSISTLENGTH);
}

#[test]
fn consist_self_coupling_rejected() {
    let (e, _, _) = engine();
    assert_eq!(e.consist_couple(5, -5), Err(CoreError::Address(5)));
    assert!(e.consist_list().unwrap().is_empty());
}

#[test]
fn removing_member_leaves_remaining_ring_intact() {
    let (e, q, _) = engine();
    e.consist_couple(1, 2).unwrap();
    e.consist_couple(1, -3).unwrap();
    e.set_speed(1, 0x85).unwrap();
    q.flush();

    e.remove(2).unwrap();
    e.set_speed(1, 0x86).unwrap();
    let adrs: Vec<u16> = q.drain().iter().map(|p| p.adr).collect();
    assert_eq!(adrs, vec![1, 3]);
}

#[test]
fn dissolved_consist_drives_single_loco() {
    let (e, q, _) = engine();
    e.consist_couple(1, 2).unwrap();
    e.set_speed(1, 0x85).unwrap();
    q.flush();
    assert!(e.consist_remove(2).unwrap());
    assert!(!e.loco_state(2).unwrap().in_consist);
    e.set_speed(1, 0x86).unwrap();
    assert_eq!(q.len(), 1);
}

// ============================================================================
// Factories and POM
// ============================================================================

#[test]
fn accessory_address_limits() {
    let cfg = FormatConfig::default();
    assert!(accessory::magnet(&cfg, DecoderFormat::AccDcc, 0, 0, true).is_none());
    assert!(accessory::magnet(&cfg, DecoderFormat::AccDcc, 2048, 1, true).is_some());
    assert!(accessory::magnet(&cfg, DecoderFormat::AccDcc, 2049, 1, true).is_none());
    assert!(accessory::magnet(&cfg, DecoderFormat::AccDcc, 1, 2, true).is_none());
}

#[test]
fn loco_factory_rejects_accessory_format() {
    let cfg = FormatConfig::default();
    assert!(loco::speed(&cfg, DecoderFormat::AccDcc, 3, 0x80, [0; 4]).is_none());
}

#[test]
fn pom_errors_do_not_touch_queue() {
    let queue = Arc::new(SignalQueue::new());
    let pom = Pom::new(Arc::clone(&queue), Config::default().shared());
    assert_eq!(
        pom.write(PomTarget::Loco, MAX_DCC_ADR + 1, 1, 1, None).unwrap_err().code(),
        -1
    );
    assert_eq!(pom.write(PomTarget::Loco, 3, 1, 256, None).unwrap_err().code(), -3);
    assert_eq!(pom.write_bit(PomTarget::Loco, 3, 1, 9, true, None).unwrap_err().code(), -4);
    assert!(queue.is_empty());
}
