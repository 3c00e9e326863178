use clap::{Parser, Subcommand};
use spmc_exchange::{Exchange, ExchangeError, Samples, mono_time_ns};
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(not(unix))]
compile_error!("The bench driver only supports Unix-like operating systems.");

/// Versioned payload published through the exchange. `check` is derived
/// from `version` so readers can detect a torn observation.
#[derive(Clone, Copy, Debug, Default)]
struct Update {
    version: u64,
    published_ns: u64,
    check: u64,
}

fn checksum(version: u64) -> u64 {
    version.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[derive(Parser, Debug)]
#[command(version, about = "Latency and stress driver for the SPMC latest-value exchange", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs one pinned writer and several pinned readers, reporting
    /// publish-to-observe latency percentiles per reader.
    Broadcast {
        /// Number of reader threads (also the exchange capacity).
        #[arg(short = 'r', long = "readers", default_value_t = 3)]
        readers: usize,

        /// Number of versions to publish.
        #[arg(short = 'n', long = "publishes", default_value_t = 100_000)]
        publishes: u64,

        /// Minimum period between publishes in nanoseconds; 0 disables
        /// throttling.
        #[arg(short = 'p', long = "period", default_value_t = 1_000)]
        period: u64,
    },

    /// Runs a continuous writer against churning readers that register,
    /// observe, grow the exchange and drop, then verifies the final state.
    Stress {
        /// Number of churning reader threads.
        #[arg(short = 'r', long = "readers", default_value_t = 4)]
        readers: usize,

        /// Number of versions to publish.
        #[arg(short = 'n', long = "publishes", default_value_t = 1_000_000)]
        publishes: u64,
    },
}

fn main() -> Result<(), ExchangeError> {
    match Args::parse().command {
        Commands::Broadcast {
            readers,
            publishes,
            period,
        } => broadcast(readers, publishes, period),
        Commands::Stress { readers, publishes } => stress(readers, publishes),
    }
}

/// Busy-waits until the monotonic clock reaches `deadline_ns`.
#[inline(always)]
fn delay(deadline_ns: u64) {
    while mono_time_ns() < deadline_ns {}
}

fn broadcast(readers: usize, publishes: u64, period: u64) -> Result<(), ExchangeError> {
    let exchange = Exchange::new(readers, Update::default())?;

    let cores = core_affinity::get_core_ids().unwrap_or_default();
    assert!(
        cores.len() >= 2,
        "at least 2 CPU cores are required (found {})",
        cores.len()
    );

    println!(
        "readers: {}, publishes: {}, period: {} ns, slots: {}",
        readers,
        publishes,
        period,
        readers + 2
    );

    let start = Barrier::new(readers + 1);

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..readers)
            .map(|i| {
                let core = cores[(1 + i) % cores.len()];
                let exchange = &exchange;
                let start = &start;
                scope.spawn(move || {
                    core_affinity::set_for_current(core);
                    let mut reader = exchange.read();
                    assert!(reader.is_valid());
                    start.wait();

                    let mut samples = Samples::with_capacity(publishes as usize);
                    let mut observed = 0u64;
                    let mut last_version = 0u64;
                    loop {
                        if !reader.has_update() {
                            core::hint::spin_loop();
                            continue;
                        }
                        reader.pull_update();
                        let update = *reader.get().expect("an update was pulled");
                        let now = mono_time_ns();

                        assert_eq!(
                            update.check,
                            checksum(update.version),
                            "torn observation of version {}",
                            update.version
                        );
                        assert!(update.version > last_version);
                        last_version = update.version;
                        observed += 1;
                        samples.record(now - update.published_ns);

                        if update.version == publishes {
                            break;
                        }
                    }
                    (samples, observed)
                })
            })
            .collect();

        let core = cores[0];
        let exchange = &exchange;
        let start = &start;
        let writer_handle = scope.spawn(move || {
            core_affinity::set_for_current(core);
            let mut writer = exchange.write().expect("no other writer exists");
            start.wait();

            for version in 1..=publishes {
                let ts = mono_time_ns();
                writer.publish_value(Update {
                    version,
                    published_ns: ts,
                    check: checksum(version),
                });
                if period != 0 {
                    delay(ts + period);
                }
            }
        });

        writer_handle.join().unwrap();
        let mut merged = Samples::with_capacity(0);
        for (i, handle) in handles.into_iter().enumerate() {
            let (mut samples, observed) = handle.join().unwrap();
            samples.report_csv(&format!("reader-{i}"));
            println!(
                "reader-{}: observed {} of {} versions (skipped {})",
                i,
                observed,
                publishes,
                publishes - observed
            );
            merged.merge(samples);
        }
        merged.report_csv("all-readers");
    });

    Ok(())
}

fn stress(readers: usize, publishes: u64) -> Result<(), ExchangeError> {
    // Capacity 1: every reader thread beyond the first is admitted through
    // growth, exercising the resize path under full traffic.
    let exchange = Exchange::new(1, Update::default())?;
    let stop = AtomicBool::new(false);

    println!("readers: {readers}, publishes: {publishes}");

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..readers)
            .map(|i| {
                let exchange = &exchange;
                let stop = &stop;
                scope.spawn(move || {
                    let mut registrations = 0u64;
                    let mut observations = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        let mut reader = exchange.read_or_grow();
                        registrations += 1;

                        // Hold the handle for a varying number of pulls so
                        // registrations, latches and releases interleave
                        // differently across threads.
                        for _ in 0..(registrations + i as u64) % 64 {
                            if reader.has_update() {
                                reader.pull_update();
                                let update = *reader.get().expect("an update was pulled");
                                assert_eq!(update.check, checksum(update.version));
                                observations += 1;
                            } else {
                                core::hint::spin_loop();
                            }
                        }
                    }
                    (registrations, observations)
                })
            })
            .collect();

        let writer_handle = scope.spawn(|| {
            let mut writer = exchange.write().expect("no other writer exists");
            for version in 1..=publishes {
                writer.publish_value(Update {
                    version,
                    published_ns: mono_time_ns(),
                    check: checksum(version),
                });
            }
            stop.store(true, Ordering::Relaxed);
        });

        // Exclusive access must be refused while the writer is running.
        let mut busy = 0u64;
        while !stop.load(Ordering::Relaxed) {
            match exchange.reset() {
                Err(err) => {
                    assert_eq!(err, ExchangeError::Busy);
                    busy += 1;
                }
                // Only possible once the writer finished between the stop
                // check and the call.
                Ok(()) => assert!(stop.load(Ordering::Relaxed)),
            }
            std::thread::yield_now();
        }

        writer_handle.join().unwrap();
        for (i, handle) in handles.into_iter().enumerate() {
            let (registrations, observations) = handle.join().unwrap();
            println!("reader-{i}: {registrations} registrations, {observations} observations");
        }
        println!("exclusive access refused {busy} times while busy");
    });

    // All handles are gone: bulk operations succeed and see every slot.
    let mut slots = 0;
    exchange.map(|_| slots += 1)?;
    exchange.reset()?;
    println!(
        "final capacity: {} readers, {} slot visits",
        exchange.max_readers(),
        slots
    );

    Ok(())
}
