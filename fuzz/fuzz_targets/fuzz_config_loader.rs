#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse and validation errors are fine; panics are not.
    if let Ok(cfg) = toml::from_str::<scanner_config::Config>(data) {
        let _ = cfg.validate();
        let _ = cfg.touch_location();
        let _ = cfg.z_hop();
    }
});
