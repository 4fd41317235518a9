#[macro_use]
extern crate log;

use std::path::Path;

use thiserror::Error;

use polled_cdrom::cdrom::ring::SECTOR_SIZE;
use polled_cdrom::cdrom::sim::{SimDisc, SimDrive};
use polled_cdrom::{logger, ConfigError, Engine, EngineError, ReadError};

type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("read didn't complete within {0} ticks")]
    Stalled(u32),
}

/// Size of the simulated disc, in blocks
const DISC_BLOCKS: u32 = 20_000;

fn parse_arg(args: &[String], i: usize, default: u32) -> Result<u32> {
    match args.get(i) {
        Some(a) => a
            .parse()
            .map_err(|_| Error::BadArgument(format!("{} is not a block number", a))),
        None => Ok(default),
    }
}

fn main() -> Result<()> {
    let level = std::env::var("POLLED_CDROM_LOG")
        .ok()
        .and_then(|l| logger::parse_level(&l))
        .unwrap_or(log::LevelFilter::Info);

    if logger::init(level).is_err() {
        eprintln!("Couldn't install the logger");
    }

    let args: Vec<String> = std::env::args().collect();

    let config = match args.get(1) {
        Some(path) => polled_cdrom::load_config_from(Path::new(path))?,
        None => polled_cdrom::EngineConfig::default(),
    };

    let start = parse_arg(&args, 2, 16)?;
    let count = parse_arg(&args, 3, 64)?;

    let mut drive = SimDrive::new(Some(SimDisc::mixed(DISC_BLOCKS, 3, 0x5a)), true);
    // Make things a bit more interesting
    drive.set_data_latency(2);
    drive.inject_read_error(start + count / 2, 2);

    let mut engine = Engine::attach(drive, config)?;

    let toc = engine.toc()?;

    info!(
        "Disc: tracks {}-{}, lead-out {}",
        toc.first_track, toc.last_track, toc.lead_out
    );
    for t in &toc.entries {
        info!(
            "  Track {:2} {} {}",
            t.track,
            t.start,
            if t.is_data() { "data" } else { "audio" }
        );
    }

    let len = count as usize * SECTOR_SIZE;
    let base = u64::from(start) * SECTOR_SIZE as u64;
    let mut buf = vec![0; len];
    let mut pos = 0;

    engine.post_demand(start, count);

    // Ten seconds worth of ticks
    let max_ticks = engine.config().tick_hz * 10;

    for tick in 0..max_ticks {
        engine.tick();

        pos += engine.drain(&mut buf[pos..], base + pos as u64, len - pos);

        if let Some(r) = engine.take_completion() {
            r?;

            let disc = engine.port().disc();
            let ok = match disc {
                Some(d) => (0..count).all(|n| {
                    let o = n as usize * SECTOR_SIZE;
                    buf[o..o + SECTOR_SIZE] == d.sector(start + n)[..]
                }),
                None => false,
            };

            info!(
                "Read {} bytes from block {} in {} ticks at {:?} speed, data {}",
                pos,
                start,
                tick + 1,
                engine.speed_mode(),
                if ok { "matches" } else { "MISMATCH" }
            );

            return Ok(());
        }
    }

    error!("Giving up after {} ticks, state {:?}", max_ticks, engine.state());

    Err(Error::Stalled(max_ticks))
}
