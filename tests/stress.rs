//! Threaded black-box tests: torn-value detection, freshness, registration
//! bounds under contention, growth under traffic and randomized churn.

use rand::Rng;
use spmc_exchange::{Exchange, ExchangeError};
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Payload with a derived field so any torn observation is detectable.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Version {
    value: u64,
    check: u64,
}

impl Version {
    fn new(value: u64) -> Self {
        Self {
            value,
            check: scramble(value),
        }
    }

    fn verify(&self) {
        assert_eq!(
            self.check,
            scramble(self.value),
            "torn observation of version {}",
            self.value
        );
    }
}

fn scramble(value: u64) -> u64 {
    value.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[test]
fn concurrent_readers_observe_fresh_untorn_values() {
    const READERS: usize = 3;
    const PUBLISHES: u64 = 20_000;

    let exchange = Exchange::new(READERS, Version::default()).unwrap();
    let start = Barrier::new(READERS + 1);

    std::thread::scope(|scope| {
        for _ in 0..READERS {
            let exchange = &exchange;
            let start = &start;
            scope.spawn(move || {
                let mut reader = exchange.read();
                assert!(reader.is_valid());
                start.wait();

                let mut last = 0u64;
                loop {
                    if !reader.has_update() {
                        core::hint::spin_loop();
                        continue;
                    }
                    reader.pull_update();
                    let version = *reader.get().expect("an update was pulled");
                    version.verify();
                    assert!(
                        version.value > last,
                        "observed version {} after {}",
                        version.value,
                        last
                    );
                    last = version.value;
                    if version.value == PUBLISHES {
                        break;
                    }
                }
            });
        }

        let exchange = &exchange;
        let start = &start;
        scope.spawn(move || {
            let mut writer = exchange.write().expect("sole writer");
            start.wait();
            for value in 1..=PUBLISHES {
                writer.publish_value(Version::new(value));
            }
        });
    });
}

#[test]
fn only_one_writer_admitted_under_contention() {
    const THREADS: usize = 8;

    let exchange = Exchange::new(1, 0u8).unwrap();
    let admitted = AtomicUsize::new(0);
    let start = Barrier::new(THREADS);
    let hold = Barrier::new(THREADS);

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            let exchange = &exchange;
            let (start, hold, admitted) = (&start, &hold, &admitted);
            scope.spawn(move || {
                start.wait();
                let writer = exchange.write();
                if writer.is_some() {
                    admitted.fetch_add(1, Ordering::Relaxed);
                }
                // Keep the token held until everyone has tried.
                hold.wait();
            });
        }
    });

    assert_eq!(admitted.load(Ordering::Relaxed), 1);
    assert!(exchange.write().is_some());
}

#[test]
fn reader_admission_is_bounded_under_contention() {
    const THREADS: usize = 8;
    const MAX_READERS: usize = 4;

    let exchange = Exchange::new(MAX_READERS, 0u8).unwrap();
    let admitted = AtomicUsize::new(0);
    let start = Barrier::new(THREADS);
    let hold = Barrier::new(THREADS);

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            let exchange = &exchange;
            let (start, hold, admitted) = (&start, &hold, &admitted);
            scope.spawn(move || {
                start.wait();
                let reader = exchange.read();
                if reader.is_valid() {
                    admitted.fetch_add(1, Ordering::Relaxed);
                }
                hold.wait();
            });
        }
    });

    assert_eq!(admitted.load(Ordering::Relaxed), MAX_READERS);
}

#[test]
fn growth_admits_racing_readers_that_all_observe() {
    const READERS: usize = 6;

    // Capacity 1: five of the six admissions go through the growth path.
    let exchange = Exchange::new(1, Version::default()).unwrap();
    let admitted = Barrier::new(READERS + 1);

    std::thread::scope(|scope| {
        for _ in 0..READERS {
            let exchange = &exchange;
            let admitted = &admitted;
            scope.spawn(move || {
                let mut reader = exchange.read_or_grow();
                assert!(reader.is_valid());
                admitted.wait();

                while !reader.has_update() {
                    core::hint::spin_loop();
                }
                reader.pull_update();
                let version = *reader.get().expect("an update was pulled");
                version.verify();
                assert_eq!(version.value, 7);
            });
        }

        let exchange = &exchange;
        let admitted = &admitted;
        scope.spawn(move || {
            admitted.wait();
            let mut writer = exchange.write().expect("sole writer");
            writer.publish_value(Version::new(7));
        });
    });

    assert!(exchange.max_readers() >= READERS);
}

#[test]
fn randomized_churn_keeps_state_consistent() {
    const CHURNERS: usize = 4;
    const PUBLISHES: u64 = 50_000;

    let exchange = Exchange::new(2, Version::default()).unwrap();
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..CHURNERS {
            let exchange = &exchange;
            let stop = &stop;
            scope.spawn(move || {
                let mut rng = rand::thread_rng();
                while !stop.load(Ordering::Relaxed) {
                    let mut reader = exchange.read_or_grow();
                    let mut last = 0u64;
                    for _ in 0..rng.gen_range(0..32) {
                        if reader.has_update() {
                            reader.pull_update();
                            let version = *reader.get().expect("an update was pulled");
                            version.verify();
                            assert!(version.value >= last);
                            last = version.value;
                        } else {
                            std::thread::yield_now();
                        }
                    }
                }
            });
        }

        let exchange = &exchange;
        let stop = &stop;
        scope.spawn(move || {
            let mut writer = exchange.write().expect("sole writer");
            for value in 1..=PUBLISHES {
                writer.publish_value(Version::new(value));
            }
            stop.store(true, Ordering::Relaxed);
        });

        // Bulk operations must be refused while the writer is registered.
        while !stop.load(Ordering::Relaxed) {
            match exchange.reset() {
                Err(err) => assert_eq!(err, ExchangeError::Busy),
                // Only reachable once the writer finished between the stop
                // check and the call.
                Ok(()) => assert!(stop.load(Ordering::Relaxed)),
            }
            std::thread::yield_now();
        }
    });

    // Every handle is gone: bulk operations succeed, every slot (plus the
    // growth template) is visited, and no slot holds a torn value.
    let mut visits = 0;
    exchange
        .map(|version| {
            version.verify();
            visits += 1;
        })
        .unwrap();
    assert_eq!(visits, exchange.max_readers() + 2 + 1);

    exchange.reset().unwrap();
    let reader = exchange.read();
    assert!(reader.is_valid());
    assert!(!reader.can_read());
}
