#![no_main]

use libfuzzer_sys::fuzz_target;
use tally::transaction::Transaction;

fuzz_target!(|data: &[u8]| {
    // Public key and signature sizes are checked during decoding; hashing a
    // decoded transaction must also be panic-free.
    if let Ok(tx) = tally::deserialize::<Transaction>(data) {
        let _ = tx.compute_hash();
    }
});
