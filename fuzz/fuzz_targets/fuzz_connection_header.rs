#![no_main]

use libfuzzer_sys::fuzz_target;
use protohub::filters::header::{parse_properties, serialize_properties};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(map) = parse_properties(text) {
        // A map that parsed must re-serialize to something that parses
        // back to the same map — the wire format's round-trip invariant.
        let reserialized = serialize_properties(&map);
        let reparsed = parse_properties(&reserialized).expect("serialized properties must re-parse");
        assert_eq!(map, reparsed);
    }
});
