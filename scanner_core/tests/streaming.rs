//! Stream reference counting and the CSV capture.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{SCAN_CFG, config, console_has, sim_for};
use scanner_config::{STREAM_HEADERS, load_stream_csv};
use scanner_core::Scanner;
use scanner_traits::McuCommand;
use serde_json::Value;

fn stream_toggles(sent: &[McuCommand]) -> Vec<u8> {
    sent.iter()
        .filter_map(|c| match c {
            McuCommand::Stream { en } => Some(*en),
            _ => None,
        })
        .collect()
}

#[test]
fn nested_users_share_one_stream() {
    let cfg = config(SCAN_CFG);
    let sim = sim_for(&cfg, |_| {});
    let mut sc = common::scanner(&cfg, &sim);

    let batches: Rc<RefCell<Vec<Value>>> = Rc::default();
    let sink = Rc::clone(&batches);
    let id = sc
        .start_dump(Box::new(move |v| sink.borrow_mut().push(v)))
        .expect("dump starts");
    assert!(sim.is_streaming());

    sc.run_line("CARTOGRAPHER_QUERY").expect("query runs");
    assert!(console_has(&sim, "no model"));
    assert!(sim.is_streaming());

    sc.stop_dump(id).expect("dump stops");
    assert!(!sim.is_streaming());
    assert_eq!(stream_toggles(&sim.sent()), vec![1, 0]);

    // Whatever was buffered is flushed when the session ends.
    let batches = batches.borrow();
    assert!(!batches.is_empty());
    let rows = batches[0]["params"].as_array().expect("params array");
    assert_eq!(rows[0].as_array().map(Vec::len), Some(6));
}

#[test]
fn stream_command_captures_samples_to_csv() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(SCAN_CFG);
    let sim = sim_for(&cfg, |_| {});
    let mut sc = Scanner::builder()
        .with_config(&cfg)
        .with_host(&sim)
        .with_clock(Box::new(sim.clock()))
        .with_seed(7)
        .with_stream_dir(dir.path())
        .try_build()
        .expect("scanner builds");

    sc.run_line("CARTOGRAPHER_STREAM FILENAME=capture.csv")
        .expect("stream on");
    assert!(console_has(&sim, "Scanner Streaming enabled"));
    sc.run_line("CARTOGRAPHER_QUERY").expect("query runs");
    sc.run_line("CARTOGRAPHER_QUERY").expect("query runs");
    sc.run_line("CARTOGRAPHER_STREAM").expect("stream off");
    assert!(console_has(&sim, "Scanner Streaming disabled"));
    assert!(!sim.is_streaming());

    let path = dir.path().join("capture.csv");
    let text = std::fs::read_to_string(&path).expect("capture written");
    assert_eq!(text.lines().next(), Some(STREAM_HEADERS.join(",").as_str()));

    let rows = load_stream_csv(&path).expect("capture parses");
    assert!(rows.len() >= 2);
    assert!(rows.windows(2).all(|w| w[0].time <= w[1].time));
}

#[test]
fn stream_without_a_filename_is_an_error() {
    let cfg = config(SCAN_CFG);
    let sim = sim_for(&cfg, |_| {});
    let mut sc = common::scanner(&cfg, &sim);

    assert!(sc.run_line("CARTOGRAPHER_STREAM").is_err());
    assert!(!sim.is_streaming());
    assert!(stream_toggles(&sim.sent()).is_empty());
}
