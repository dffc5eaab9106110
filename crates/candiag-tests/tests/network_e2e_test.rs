//! End-to-end tests for network observation
//!
//! A session listens on a virtual bus while a traffic endpoint plays the
//! other nodes. Covers signal decoding, frame logging, trace loading of the
//! logged file and bus faults.
//!
//! Run with: cargo test -p candiag-tests --test network_e2e_test

use std::time::Duration;

use candiag_core::trace::load_trace;
use candiag_core::{ConnectionState, NetworkEvent, ReplayOptions, ChannelDescriptor, LOG_HEADER};
use candiag_signals::SignalValue;
use candiag_tests::{signal_database, wait_until, Bench};
use pretty_assertions::assert_eq;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_signals_decoded_into_cache_and_events() {
    let bench = Bench::new("net-decode");
    let mut events = bench.session.subscribe();
    bench.connect().await;

    bench.send(0x100, &[40]);
    bench.send(0x200, &[0x40, 0x1F, 130]);
    bench.send(0x555, &[1, 2, 3]);

    let session = bench.session.clone();
    assert!(wait_until(WAIT, || session.stats().frames_received == 3).await);

    let speed = session.signals().get("Speed").expect("Speed decoded");
    assert_eq!(speed.value, SignalValue::Physical(20.0));
    assert_eq!(speed.unit.as_deref(), Some("km/h"));
    assert_eq!(
        session.signals().get("Rpm").unwrap().value,
        SignalValue::Physical(2000.0)
    );
    assert_eq!(
        session.signals().get("CoolantTemp").unwrap().value,
        SignalValue::Physical(90.0)
    );

    let stats = session.stats();
    assert_eq!(stats.frames_decoded, 2);
    assert_eq!(stats.unknown_ids, 1);

    // The first frame produces a frame event followed by its signal
    let mut first_signal = None;
    while first_signal.is_none() {
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            NetworkEvent::Signal { message, signal } => first_signal = Some((message, signal)),
            NetworkEvent::Frame { .. } => {}
            NetworkEvent::ConnectionClosed { .. } => panic!("closed early"),
        }
    }
    let (message, signal) = first_signal.unwrap();
    assert_eq!(message, "VehicleSpeed");
    assert_eq!(signal.name, "Speed");

    bench.teardown().await;
}

#[tokio::test]
async fn test_disconnect_emits_single_close_and_clears_cache() {
    let bench = Bench::new("net-close");
    let mut events = bench.session.subscribe();
    bench.connect().await;
    bench.send(0x100, &[10]);
    let session = bench.session.clone();
    assert!(wait_until(WAIT, || session.signals().len() == 1).await);

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Offline);
    assert!(session.signals().is_empty());

    let mut closes = 0;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        if let NetworkEvent::ConnectionClosed { fault } = event {
            assert!(fault.is_none());
            closes += 1;
        }
    }
    assert_eq!(closes, 1);

    bench.teardown().await;
}

#[tokio::test]
async fn test_logged_frames_load_back_as_trace() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.csv");

    let bench = Bench::new("net-log");
    bench.connect().await;
    let session = bench.session.clone();
    session.start_logging(Some(path.clone())).unwrap();

    for speed in [10u8, 20, 30, 40] {
        bench.send(0x100, &[speed]);
    }
    bench.send(0x7FF, &[]);
    assert!(wait_until(WAIT, || session.logging().messages == 5).await);

    assert_eq!(session.stop_logging().await.unwrap(), 5);
    assert!(!session.logging().running);

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], LOG_HEADER);
    assert!(lines[1].ends_with(",100,1,0A,false,false,false"));

    let db = signal_database();
    let summary = load_trace(&path, Some(&db), |_| {}).unwrap();
    assert_eq!(summary.message_count, 5);
    assert_eq!(summary.malformed_count, 0);
    assert_eq!(summary.decoded_count, 4);
    let speeds: Vec<f64> = summary.series["Speed"]
        .values
        .iter()
        .map(SignalValue::as_f64)
        .collect();
    assert_eq!(speeds, vec![5.0, 10.0, 15.0, 20.0]);

    bench.teardown().await;
}

#[tokio::test]
async fn test_trace_with_malformed_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.csv");
    std::fs::write(
        &path,
        "Timestamp, ID_Hex, DLC, Data_Hex, IsExtended, IsRemote, IsError\n\
         0.000100,100,1,28,false,false,false\n\
         0.000200,200\n\
         0.000300,ZZZ,1,00,false,false,false\n\
         0.000400,200,3,401F82,false,false,false\n\
         0.000500,100,1,3C,false,false,false\n",
    )
    .unwrap();

    let db = signal_database();
    let summary = load_trace(&path, Some(&db), |_| {}).unwrap();
    assert_eq!(summary.message_count, 3);
    assert_eq!(summary.malformed_count, 2);

    let latest = summary.latest_values();
    assert_eq!(latest["Speed"].value, SignalValue::Physical(30.0));
    assert_eq!(latest["Rpm"].value, SignalValue::Physical(2000.0));
    assert_eq!(latest["CoolantTemp"].value, SignalValue::Physical(90.0));
}

#[tokio::test]
async fn test_replay_channel_feeds_listener() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay.csv");
    std::fs::write(
        &path,
        "0.000,100,1,14,false,false,false\n0.010,100,1,50,false,false,false\n",
    )
    .unwrap();

    let bench = Bench::with_config("net-replay", |config| {
        config.channel = ChannelDescriptor::replay(ReplayOptions::new(&path).with_speed(0.0));
    });
    bench.connect().await;

    let session = bench.session.clone();
    assert!(wait_until(WAIT, || session.stats().frames_received == 2).await);
    assert_eq!(
        session.signals().get("Speed").unwrap().value,
        SignalValue::Physical(40.0)
    );
    // The replay idles at end of file instead of closing
    assert_eq!(session.state(), ConnectionState::Online);

    bench.teardown().await;
}

#[tokio::test]
async fn test_bus_fault_closes_with_fault() {
    let bench = Bench::new("net-fault");
    let mut events = bench.session.subscribe();
    bench.connect().await;

    bench.bus.inject_fault("bus off");
    let fault = loop {
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            NetworkEvent::ConnectionClosed { fault } => break fault,
            _ => continue,
        }
    };
    assert_eq!(fault.as_deref().map(|f| f.contains("bus off")), Some(true));
    assert_eq!(bench.session.state(), ConnectionState::Error);

    bench.teardown().await;
}
