//! Compare how quickly each strategy fragments a bank.
//!
//! Every strategy gets the same seeded stream of random allocations, with a
//! random earlier allocation released after most of them. The score is the
//! number of allocations attempted before the first one fails: higher means
//! the strategy left the free space in larger pieces.

use bank_allocator::{Algorithm, BankConfig, DeviceAddr, Strategy};

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, SeedableRng};

// 1.5 MiB, the size of a Wormhole L1 bank
const BANK_SIZE: DeviceAddr = 3 * 512 * 1024;
const MAX_ALLOCATION: DeviceAddr = 16 * 1024;
const SEED: u64 = 42;
// Chance of releasing an earlier allocation after each new one
const DEALLOCATE_CHANCE: f64 = 0.7;

fn attempts_until_full(allocator: &mut dyn Algorithm, max_allocation: DeviceAddr, seed: u64) -> usize {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let sizes = Uniform::new_inclusive(1, max_allocation);
    let mut allocations: Vec<Option<DeviceAddr>> = Vec::new();

    for attempt in 0.. {
        let size = sizes.sample(&mut rng);
        match allocator.allocate(size) {
            Some(addr) => allocations.push(Some(addr)),
            None => {
                log::info!("Allocation {} of {} bytes failed", attempt, size);
                return attempt;
            }
        }

        if rng.gen_bool(DEALLOCATE_CHANCE) {
            let index = rng.gen_range(0, allocations.len());
            if let Some(addr) = allocations[index].take() {
                allocator.deallocate(addr);
            }
        }
    }
    unreachable!()
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [MAX_ALLOCATION] [SEED]", args[0]);
        return;
    }
    let max_allocation: DeviceAddr = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MAX_ALLOCATION);
    let seed: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(SEED);

    env_logger::init();
    println!("Benchmarking fragmentation (allocation attempts until full)\n\nParameters:");
    println!("    {} byte bank", BANK_SIZE);
    println!("    1-{} byte allocations", max_allocation);
    println!("    seed {}\n", seed);

    for &strategy in Strategy::ALL.iter() {
        let mut allocator = strategy.build(BankConfig::new(BANK_SIZE, 0, 16, 16));
        let attempts = attempts_until_full(&mut *allocator, max_allocation, seed);

        let stats = allocator.statistics();
        println!("{:?}: {}", strategy, attempts);
        println!(
            "    {} bytes free at the end, largest block {}",
            stats.total_free_bytes, stats.largest_free_block_bytes
        );
        assert!(allocator.validity().is_valid());
    }
}
