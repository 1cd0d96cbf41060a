#![no_main]

use hooktrace::replay::parse_line;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Recorded traces come from other processes; parsing must never panic
    if let Ok(input) = std::str::from_utf8(data) {
        let _ = parse_line(input);
    }
});
