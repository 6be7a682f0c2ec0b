//! Full run orchestration against the simulated TLU: pulser test runs and
//! Ctrl-C style shutdown, checked through the produced table file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tlu_daq::config::{InputChannel, OutputChannel, RunConfig};
use tlu_daq::device::{Tlu, TriggerRecord};
use tlu_daq::run::{run, RunArgs, RunPaths};
use tlu_daq::sim::SimTransport;
use tlu_daq::sink::TableReader;

fn sim_tlu() -> (Arc<SimTransport>, Arc<Tlu>) {
    let sim = Arc::new(SimTransport::new());
    let tlu = Arc::new(Tlu::new(sim.clone()).unwrap());
    tlu.init().unwrap();
    (sim, tlu)
}

#[test]
fn pulser_test_run_writes_every_trigger() {
    let (_sim, tlu) = sim_tlu();
    let dir = tempfile::tempdir().unwrap();
    let data_file = dir.path().join("test_run.tlu");

    let args = RunArgs {
        config: RunConfig {
            output_enable: vec![OutputChannel::Ch(0)],
            test: Some(200),
            count: 100,
            timeout: 20,
            threshold: 10,
            ..RunConfig::default()
        },
        data_file: data_file.clone(),
        monitor_addr: None,
        scan_time: None,
    };
    let stop = Arc::new(AtomicBool::new(false));
    run(tlu.clone(), &args, stop).unwrap();

    let table = TableReader::open(&data_file).unwrap();
    assert_eq!(table.raw_data.len(), 100);
    for (i, record) in table.raw_data.iter().enumerate() {
        assert_eq!(record.trigger_id(), i as u32);
        assert!(record.time_stamp() > 0);
    }
    // the run leaves the trigger outputs disarmed
    let master = tlu.block("tlu_master");
    assert_eq!(master.get("EN_INPUT").unwrap(), 0);
    assert_eq!(master.get("EN_OUTPUT").unwrap(), 0);

    // invocation arguments and the register snapshot travel with the data
    assert_eq!(table.attributes["kwargs"]["threshold"], 10);
    assert_eq!(table.attributes["config"]["THRESHOLD"], 10);
    assert_eq!(table.attributes["config"]["TIMEOUT"], 20);
}

#[test]
fn beam_run_stops_on_the_ctrl_c_flag() {
    let (sim, tlu) = sim_tlu();
    let dir = tempfile::tempdir().unwrap();
    let data_file = dir.path().join("beam.tlu");

    let args = RunArgs {
        config: RunConfig {
            input_enable: vec![InputChannel(0), InputChannel(1)],
            output_enable: vec![OutputChannel::Ch(0)],
            ..RunConfig::default()
        },
        data_file: data_file.clone(),
        monitor_addr: None,
        scan_time: None,
    };
    let stop = Arc::new(AtomicBool::new(false));

    let feeder = {
        let sim = sim.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            sim.push_records(
                &(0..30).map(|i| TriggerRecord::new([0; 4], 1 + i as u64, i)).collect::<Vec<_>>(),
            );
            thread::sleep(Duration::from_millis(300));
            stop.store(true, Ordering::SeqCst);
        })
    };

    run(tlu.clone(), &args, stop).unwrap();
    feeder.join().unwrap();

    // inputs were armed during the run and disarmed on the way out
    assert_eq!(tlu.block("tlu_master").get("EN_INPUT").unwrap(), 0);

    let table = TableReader::open(&data_file).unwrap();
    assert_eq!(table.raw_data.len(), 30);
    assert_eq!(table.meta_data.len(), 1);
    let row = &table.meta_data[0];
    assert_eq!(row.index_stop() - row.index_start(), row.data_length());
    assert_eq!(row.data_length(), 30);
}

#[test]
fn scan_time_budget_ends_the_run() {
    let (_sim, tlu) = sim_tlu();
    let dir = tempfile::tempdir().unwrap();

    let args = RunArgs {
        config: RunConfig {
            output_enable: vec![OutputChannel::Lemo(0)],
            ..RunConfig::default()
        },
        data_file: dir.path().join("scan.tlu"),
        monitor_addr: None,
        scan_time: Some(Duration::from_millis(400)),
    };
    let stop = Arc::new(AtomicBool::new(false));

    let started = std::time::Instant::now();
    run(tlu, &args, stop).unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(400), "run ended before the budget");
    assert!(elapsed < Duration::from_secs(10), "run did not respect the scan time");
}

#[test]
fn run_paths_derive_names_from_the_run_stamp() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("out");

    let paths = RunPaths::derive(&folder, None, None).unwrap();
    assert!(folder.is_dir());
    assert!(paths.run_name.starts_with("tlu_"));
    assert_eq!(paths.data_file, folder.join(format!("{}.tlu", paths.run_name)));
    assert_eq!(paths.log_file, folder.join(format!("{}.log", paths.run_name)));

    let explicit = RunPaths::derive(
        &folder,
        Some(dir.path().join("my.log")),
        Some(dir.path().join("my.tlu")),
    )
    .unwrap();
    assert_eq!(explicit.data_file, dir.path().join("my.tlu"));
    assert_eq!(explicit.log_file, dir.path().join("my.log"));
}
