//! Desktop simulator for the command station core.
//!
//! Wires a [`CommandStation`] to the mock collaborators, plays a handful of
//! loco, turnout, POM and m3 sequences and logs the resulting packet stream.
//!
//! # Usage
//!
//! ```sh
//! RUST_LOG=debug cargo run --bin station_sim --features sim
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use rs_cmdstation::hal::{
    MockAccessoryBus, MockConfigStore, MockLocoDb, MockSignalGenerator, TokioClock, TokioDelay,
};
use rs_cmdstation::traits::{LocoDescriptor, SignalGenerator};
use rs_cmdstation::{
    Collaborators, CommandStation, Config, DecoderFormat, M3Programmer, Mode, Packet, SignalQueue,
};

fn dump(label: &str, pkts: &[Packet]) {
    info!("--- {label}: {} packet(s)", pkts.len());
    for p in pkts {
        info!(
            cmd = ?p.cmd,
            fmt = p.fmt.as_str(),
            adr = p.adr,
            value = ?p.value,
            repeat = p.repeat,
            "packet"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("=================================");
    info!("  rs-cmdstation simulator");
    info!("=================================");

    let config = Config::default();
    let db = Arc::new(MockLocoDb::new(config.default_loco_format()));
    db.insert(LocoDescriptor::new(5, DecoderFormat::Mm2x27a));
    db.insert(LocoDescriptor::new(7, DecoderFormat::Dcc28).with_maxfunc(21));

    let generator = Arc::new(MockSignalGenerator::new());
    let station = CommandStation::new(
        config,
        Collaborators {
            generator: Arc::clone(&generator) as Arc<dyn SignalGenerator>,
            db,
            store: Arc::new(MockConfigStore::new()),
            bus: Arc::new(MockAccessoryBus::new()),
            clock: Arc::new(TokioClock::new()),
        },
    );
    station.set_mode(Mode::Go);
    let engine = station.refresh();
    let queue = station.queue();

    engine.set_speed(10, 0x90).context("loco 10 forward")?;
    engine.set_speed(10, 0x10).context("loco 10 reverse")?;
    dump("direction reversal", &queue.drain());

    engine.set_speed(5, 0x88).context("loco 5 half step")?;
    dump("MM2 27a half step", &queue.drain());

    engine
        .set_func_masked(7, 0x001F_FFFF, 0x001F_FFFF)
        .context("loco 7 functions")?;
    dump("DCC function groups", &queue.drain());

    station.pom().booster_conf(62, 0).context("booster key")?;
    dump("booster configuration", &queue.drain());

    engine.consist_couple(20, -21).context("couple 20/21")?;
    engine.set_speed(20, 0x90).context("consist speed")?;
    dump("consist with reversed member", &queue.drain());

    let refresh: Vec<Packet> = (0..6).filter_map(|_| station.next_packet(true)).collect();
    dump("refresh cycle", &refresh);

    let turnouts = station.spawn_turnouts();
    turnouts.switch(1, 0, true, 0).await.context("turnout 1")?;
    turnouts.switch(3, 1, true, 0).await.context("turnout 3")?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    dump("turnouts 1 and 3 (same group)", &queue.drain());
    turnouts.switch(1, 0, false, 0).await.context("release 1")?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    dump("after releasing 1", &queue.drain());

    let prog_queue = Arc::new(SignalQueue::new());
    let prog_generator = Arc::new(MockSignalGenerator::new().with_queue(Arc::clone(&prog_queue)));
    prog_generator.set_mode(Mode::Go);
    prog_generator.set_search_result(Some(0x7F00_1234));
    let prog = M3Programmer::new(
        Arc::clone(&prog_generator) as Arc<dyn SignalGenerator>,
        prog_queue,
        station.config().clone(),
        TokioDelay,
    );
    let uid = prog.read_uid(true).await.context("m3 uid search")?;
    info!(uid = format_args!("{uid:08X}"), "m3 decoder found");
    prog.set_address(uid, 12).await.context("m3 address")?;
    dump("m3 programming track", &prog_generator.sent());

    Ok(())
}
