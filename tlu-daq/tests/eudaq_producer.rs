//! Producer state machine and replay tests against the scripted run control
//! and the simulated TLU.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tlu_daq::config::RunConfig;
use tlu_daq::device::{Tlu, TriggerRecord};
use tlu_daq::eudaq::{replay, ControlFlags, EudaqProducer, MockRunControl};
use tlu_daq::readout::DataChunk;
use tlu_daq::sim::SimTransport;
use tlu_daq::sink::{TableFile, TableReader};

fn fixture_file(dir: &tempfile::TempDir, chunk_sizes: &[u32]) -> std::path::PathBuf {
    let path = dir.path().join("capture.tlu");
    let mut file = TableFile::create(&path).unwrap();
    let mut next_id = 1u32;
    let mut t = 100.0;
    for (i, &size) in chunk_sizes.iter().enumerate() {
        let data: Vec<TriggerRecord> =
            (0..size).map(|k| TriggerRecord::new([0; 4], 50 + (next_id + k) as u64, next_id + k)).collect();
        next_id += size;
        let chunk = DataChunk {
            data,
            timestamp_start: t,
            timestamp_stop: t + 0.01,
            error: 0,
            skipped_triggers: 2 * i as u64,
        };
        t += 0.01;
        file.append_chunk(&chunk).unwrap();
    }
    path
}

#[test]
fn replay_reemits_the_captured_event_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let sizes = [10u32, 5, 25];
    let path = fixture_file(&dir, &sizes);

    let mut script = vec![ControlFlags::configuring(), ControlFlags::starting()];
    script.extend(std::iter::repeat(ControlFlags::NONE).take(sizes.len()));
    script.push(ControlFlags::stopping());
    let mut rc = MockRunControl::new(script);

    replay(&mut rc, &path, Some(0.0), Duration::from_millis(1)).unwrap();

    assert_eq!(rc.confirmations, vec!["configured", "started", "stopped"]);
    let total: u32 = sizes.iter().sum();
    assert_eq!(rc.events.len(), total as usize);

    // event counter runs 0..n, trigger ids replay verbatim
    let mut boundaries = Vec::new();
    let mut offset = 0;
    for size in sizes {
        offset += size as usize;
        boundaries.push(offset - 1);
    }
    for (i, (event, extra)) in rc.events.iter().enumerate() {
        assert_eq!(event.event_counter, i as u64);
        assert_eq!(event.trigger_id, i as u32 + 1);
        // exactly the chunk tails carry the extended info
        assert_eq!(extra.is_some(), boundaries.contains(&i), "event {}", i);
    }
    // particles of the last tail: trigger id 40 + 4 skipped
    let (particles, tx_state) = rc.events.last().unwrap().1.as_ref().unwrap();
    assert_eq!(particles, "44");
    assert_eq!(tx_state, " -, -, -, -, -, -");
}

#[test]
fn replay_honours_a_stop_request_mid_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture_file(&dir, &[10, 10, 10, 10]);

    // stop after the first readout is replayed
    let script = vec![
        ControlFlags::configuring(),
        ControlFlags::starting(),
        ControlFlags::NONE,
        ControlFlags::stopping(),
    ];
    let mut rc = MockRunControl::new(script);
    replay(&mut rc, &path, None, Duration::from_millis(1)).unwrap();

    assert_eq!(rc.events.len(), 10);
    assert_eq!(rc.confirmations.last(), Some(&"stopped"));
}

#[test]
fn producer_runs_a_full_configure_start_stop_cycle() {
    let sim = Arc::new(SimTransport::new());
    let tlu = Arc::new(Tlu::new(sim.clone()).unwrap());
    let dir = tempfile::tempdir().unwrap();

    let mut script = vec![ControlFlags::configuring(), ControlFlags::starting()];
    // run phase: give the readout time to move data, then stop and linger
    script.extend(std::iter::repeat(ControlFlags::NONE).take(12));
    script.push(ControlFlags::stopping());
    script.extend(std::iter::repeat(ControlFlags::NONE).take(8));
    // queue empties afterwards -> terminating -> teardown
    let mut rc = MockRunControl::new(script);
    rc.set_param("AndMask", "0x1");
    rc.set_param("DutMask", "0x3");
    rc.set_run_number(7);

    let base = RunConfig { timeout: 20, ..RunConfig::default() };
    let mut producer = EudaqProducer::new(rc, tlu.clone(), base)
        .with_data_file(dir.path().join("eudaq.tlu"))
        .with_poll_interval(Duration::from_millis(50));

    // feed triggers while the run phase is active
    let feeder = {
        let sim = sim.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(250));
            let records: Vec<TriggerRecord> =
                (1..=50).map(|i| TriggerRecord::new([0; 4], 10 + i as u64, i)).collect();
            sim.push_records(&records);
        })
    };

    producer.run().unwrap();
    feeder.join().unwrap();

    let rc = producer.into_run_control();
    assert_eq!(rc.confirmations, vec!["configured", "started", "stopped"]);
    assert_eq!(rc.events.len(), 50);
    assert!(rc.events.last().unwrap().1.is_some());

    // configuration reached the device and teardown disarmed it
    let master = tlu.block("tlu_master");
    assert_eq!(master.get("EN_INPUT").unwrap(), 0);
    assert_eq!(master.get("EN_OUTPUT").unwrap(), 0);
    assert_eq!(master.get("TIMEOUT").unwrap(), 20);

    // the per-run table file captured the same records
    let table = TableReader::open(dir.path().join("eudaq_run7.tlu")).unwrap();
    assert_eq!(table.raw_data.len(), 50);
    assert_eq!(table.raw_data[0].trigger_id(), 1);
}

#[test]
fn producer_tears_down_on_terminate_without_a_run() {
    let sim = Arc::new(SimTransport::new());
    let tlu = Arc::new(Tlu::new(sim).unwrap());

    let script = vec![ControlFlags::configuring(), ControlFlags::terminating()];
    let mut rc = MockRunControl::new(script);
    rc.set_param("DutMask", "0x1");

    let mut producer = EudaqProducer::new(rc, tlu.clone(), RunConfig::default())
        .with_poll_interval(Duration::from_millis(1));
    producer.run().unwrap();

    let rc = producer.into_run_control();
    assert_eq!(rc.confirmations, vec!["configured"]);
    assert!(rc.events.is_empty());
    assert_eq!(tlu.block("tlu_master").get("EN_INPUT").unwrap(), 0);
}
