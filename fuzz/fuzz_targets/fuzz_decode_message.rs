#![no_main]

use libfuzzer_sys::fuzz_target;
use tally::network::protocol::decode_message;

fuzz_target!(|data: &[u8]| {
    // Length-prefixed frame into a gossip message. Must return None, never panic.
    let _ = decode_message(data);
});
