//! Fuzz target for revision marker parsing.
//!
//! Anything that parses must carry a generation of at least 1 and reparse to
//! the same marker from its display form.

#![no_main]

use docsync::Revision;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(rev) = s.parse::<Revision>() {
        assert!(rev.generation() >= 1);
        let reparsed: Revision = rev.to_string().parse().unwrap();
        assert_eq!(reparsed, rev);
    }
});
