#![no_main]

use libfuzzer_sys::fuzz_target;
use tally::consensus::block::Block;

fuzz_target!(|data: &[u8]| {
    // A block nests transactions, a committee snapshot and an optional
    // certificate of approvals.
    if let Ok(block) = tally::deserialize::<Block>(data) {
        let _ = block.header.compute_hash();
        let _ = block.compute_transaction_root();
    }
});
