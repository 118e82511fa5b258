mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use g2kit_driver::{DriverError, DriverEvent, EventFilter, G2Core, G2CoreOptions};
use support::{wait_until, ScriptedDevice};

#[tokio::test]
async fn open_runs_the_setup_handshake_in_order() {
    let device = ScriptedDevice::new(true);
    let (control, written) = device.make_channel("mock-control", true);

    let session = G2Core::new();
    session
        .open_channels(control, None, &G2CoreOptions::default())
        .await
        .unwrap();

    assert!(session.is_open());
    assert!(session.setup_done());

    let writes = written.all();
    // Status poke, alarm/queue clear, then verbosity, strictly in order.
    let poke = writes.iter().position(|w| w.contains("\"sr\":null")).unwrap();
    let clear = writes.iter().position(|w| w.contains("\"clr\":null")).unwrap();
    let verbosity = writes.iter().position(|w| w.contains("\"jv\":4")).unwrap();
    assert!(poke < clear && clear < verbosity, "setup order was {writes:?}");
}

#[tokio::test]
async fn second_open_is_an_error_not_a_replace() {
    let device = ScriptedDevice::new(true);
    let (control, _) = device.make_channel("mock-control", true);

    let session = G2Core::new();
    session
        .open_channels(control, None, &G2CoreOptions::default())
        .await
        .unwrap();

    let (again, _) = device.make_channel("mock-control-2", true);
    let err = session
        .open_channels(again, None, &G2CoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::AlreadyOpen));
    assert!(session.is_open());
}

#[tokio::test]
async fn close_is_idempotent_and_emits_once() {
    let device = ScriptedDevice::new(true);
    let (control, _) = device.make_channel("mock-control", true);

    let session = G2Core::new();
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    session.subscribe(EventFilter::All, move |event| {
        if matches!(event, DriverEvent::Close) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    session
        .open_channels(control, None, &G2CoreOptions::default())
        .await
        .unwrap();
    session.close();
    session.close();
    session.close();

    assert!(!session.is_open());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    // Writing after close reports the session as not open.
    assert!(matches!(session.write("G0 X1"), Err(DriverError::NotOpen)));
}

#[tokio::test]
async fn set_resolves_with_the_device_echo() {
    let device = ScriptedDevice::new(true);
    let (control, _) = device.make_channel("mock-control", true);

    let session = G2Core::new();
    session
        .open_channels(control, None, &G2CoreOptions::default())
        .await
        .unwrap();

    let echo = session.set("sv", json!(1)).await.unwrap();
    assert_eq!(echo, json!(1));

    let queried = session.get("qv").await.unwrap();
    assert_eq!(queried, Value::Null);
}

#[tokio::test]
async fn set_many_applies_in_order_and_survives_failures() {
    let device = ScriptedDevice::new(true);
    let (control, written) = device.make_channel("mock-control", true);

    let session = G2Core::new();
    session
        .open_channels(control, None, &G2CoreOptions::default())
        .await
        .unwrap();

    session
        .set_many(vec![
            ("sv".to_string(), json!(1)),
            ("si".to_string(), json!(250)),
            ("qv".to_string(), json!(2)),
        ])
        .await
        .unwrap();

    let writes = written.all();
    let sv = writes.iter().position(|w| w.contains("\"sv\":1")).unwrap();
    let si = writes.iter().position(|w| w.contains("\"si\":250")).unwrap();
    let qv = writes.iter().position(|w| w.contains("\"qv\":2")).unwrap();
    assert!(sv < si && si < qv, "settings order was {writes:?}");
}

#[tokio::test]
async fn dual_channel_session_routes_bulk_gcode_to_data() {
    let device = ScriptedDevice::new(true);
    let (control, control_written) = device.make_channel("mock-control", true);
    let (data, data_written) = device.make_channel("mock-data", false);

    let session = G2Core::new();
    session
        .open_channels(control, Some(data), &G2CoreOptions::default())
        .await
        .unwrap();

    session.write("N1 G0 X1").unwrap();
    session.write(json!({"sr": null})).unwrap();
    session.write("{clr:n}").unwrap();

    wait_until("bulk line on data channel", || {
        data_written.contains("N1 G0 X1")
    })
    .await;
    // Queue clears ride the data channel, in-band with queued motion.
    wait_until("queue clear on data channel", || {
        data_written.contains("{clr:n}")
    })
    .await;
    assert!(control_written.contains("\"sr\":null"));
    assert!(!control_written.contains("N1 G0 X1"));
}

#[tokio::test]
async fn dont_setup_skips_the_handshake_but_still_waits_for_banner() {
    let device = ScriptedDevice::new(false);
    // Preload a status push; the first inbound report is the banner.
    device.push_line("{\"sr\":{\"stat\":1}}");
    let (control, written) = device.make_channel("mock-control", true);

    let session = G2Core::new();
    let options = G2CoreOptions {
        dont_setup: true,
        ..Default::default()
    };
    session.open_channels(control, None, &options).await.unwrap();

    assert!(session.setup_done());
    assert!(written.all().is_empty(), "no handshake traffic expected");
    assert_eq!(session.status().get("stat"), Some(&json!(1)));
}

#[tokio::test]
async fn status_transitions_track_the_hold_flag() {
    let device = ScriptedDevice::new(true);
    let (control, _) = device.make_channel("mock-control", true);

    let session = G2Core::new();
    session
        .open_channels(control, None, &G2CoreOptions::default())
        .await
        .unwrap();
    assert!(!session.in_hold());

    // Running, then a feed-hold.
    device.push_line("{\"sr\":{\"stat\":5}}");
    device.push_line("{\"sr\":{\"stat\":6}}");
    wait_until("hold flag set", || session.in_hold()).await;

    // Resuming clears it.
    device.push_line("{\"sr\":{\"stat\":5}}");
    wait_until("hold flag cleared", || !session.in_hold()).await;
}

#[tokio::test]
async fn device_errors_surface_as_error_events() {
    let device = ScriptedDevice::new(true);
    let (control, _) = device.make_channel("mock-control", true);

    let session = G2Core::new();
    let mut rx = session.receiver();
    session
        .open_channels(control, None, &G2CoreOptions::default())
        .await
        .unwrap();

    device.push_line("{\"r\":{\"n\":9},\"f\":[1,202,10]}");

    loop {
        match rx.recv().await.unwrap() {
            DriverEvent::Error(DriverError::Device { status, line, .. }) => {
                assert_eq!(status, 202);
                assert_eq!(line, Some(9));
                break;
            }
            _ => continue,
        }
    }
}
