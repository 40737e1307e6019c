#![no_main]
use libfuzzer_sys::fuzz_target;
use scanner_core::commands::{Bounds, CommandParams, CommandTable};

fuzz_target!(|data: &str| {
    let (name, args) = data.split_once(' ').unwrap_or((data, ""));
    let table = CommandTable::new(["cartographer"]);
    let _ = table.resolve(name);
    if let Ok(p) = CommandParams::parse(name, args) {
        let _ = p.float("SPEED", 5.0, Bounds::none().above(0.0));
        let _ = p.int("SAMPLES", 3, Bounds::none().min(1));
        let _ = p.flag("ADAPTIVE", false);
        let _ = p.get("FILENAME");
    }
});
