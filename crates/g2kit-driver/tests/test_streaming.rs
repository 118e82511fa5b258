mod support;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use g2kit_driver::{DriverError, DriverEvent, G2Core, G2CoreOptions};
use support::{wait_until, ScriptedDevice};

async fn ready_session(device: &ScriptedDevice) -> (Arc<G2Core>, support::PortRecord) {
    let (control, _) = device.make_channel("mock-control", true);
    let (data, data_written) = device.make_channel("mock-data", false);
    let session = Arc::new(G2Core::new());
    session
        .open_channels(control, Some(data), &G2CoreOptions::default())
        .await
        .unwrap();
    (session, data_written)
}

#[tokio::test]
async fn two_line_file_completes_without_error_on_program_end() {
    let device = ScriptedDevice::new(true);
    let (session, data_written) = ready_session(&device).await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "G0 X1").unwrap();
    writeln!(file, "G0 X2").unwrap();
    file.flush().unwrap();

    let mut rx = session.receiver();
    let sender = session.clone();
    let path = file.path().to_path_buf();
    let send = tokio::spawn(async move { sender.send_file(path).await });

    // Wait until the sender reports the buffer drained, then let the
    // machine report program end.
    loop {
        match rx.recv().await.unwrap() {
            DriverEvent::DoneSending { forced: false } => break,
            _ => continue,
        }
    }
    assert!(data_written.contains("N1 G0 X1"));
    assert!(data_written.contains("N2 G0 X2"));

    device.push_line("{\"sr\":{\"stat\":4}}");
    send.await.unwrap().unwrap();
}

#[tokio::test]
async fn large_file_is_streamed_through_needlines_topups() {
    let device = ScriptedDevice::new(true);
    let (session, data_written) = ready_session(&device).await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 1..=300 {
        writeln!(file, "G1 X{i} F1000").unwrap();
    }
    file.flush().unwrap();

    let mut rx = session.receiver();
    let sender = session.clone();
    let path = file.path().to_path_buf();
    let send = tokio::spawn(async move { sender.send_file(path).await });

    loop {
        match rx.recv().await.unwrap() {
            DriverEvent::DoneSending { forced: false } => break,
            _ => continue,
        }
    }
    // Renumbering is monotonic from 1 across chunk boundaries.
    assert!(data_written.contains("N1 G1 X1 "));
    assert!(data_written.contains("N300 G1 X300 "));
    assert_eq!(data_written.len(), 300);

    device.push_line("{\"sr\":{\"stat\":4}}");
    send.await.unwrap().unwrap();
}

#[tokio::test]
async fn hold_after_stop_keeps_the_send_alive_until_program_end() {
    let device = ScriptedDevice::new(true);
    let (session, _) = ready_session(&device).await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "G0 X1").unwrap();
    file.flush().unwrap();

    let mut rx = session.receiver();
    let sender = session.clone();
    let path = file.path().to_path_buf();
    let send = tokio::spawn(async move { sender.send_file(path).await });

    loop {
        match rx.recv().await.unwrap() {
            DriverEvent::DoneSending { forced: false } => break,
            _ => continue,
        }
    }

    // The machine stops, then enters feed-hold: the hold invalidates the
    // stop already observed.
    device.push_line("{\"sr\":{\"stat\":3}}");
    device.push_line("{\"sr\":{\"stat\":6}}");
    wait_until("hold observed", || session.in_hold()).await;

    // A further drain reports done again, but the machine is held, so
    // the send must stay open.
    device.push_line("{\"r\":{},\"f\":[1,0,2]}");
    loop {
        match rx.recv().await.unwrap() {
            DriverEvent::DoneSending { forced: false } => break,
            _ => continue,
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!send.is_finished(), "send completed while the machine was held");

    // Resume, then program end: now the send completes cleanly.
    device.push_line("{\"sr\":{\"stat\":5}}");
    device.push_line("{\"sr\":{\"stat\":4}}");
    send.await.unwrap().unwrap();
}

#[tokio::test]
async fn alarm_terminates_a_send_with_an_error() {
    let device = ScriptedDevice::new(true);
    let (session, data_written) = ready_session(&device).await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "G0 X1").unwrap();
    file.flush().unwrap();

    let sender = session.clone();
    let path = file.path().to_path_buf();
    let send = tokio::spawn(async move { sender.send_file(path).await });

    wait_until("line transmitted", || data_written.contains("N1 G0 X1")).await;
    device.push_line("{\"sr\":{\"stat\":2}}");

    let err = send.await.unwrap().unwrap_err();
    assert!(matches!(err, DriverError::Alarm { .. }));
}

#[tokio::test]
async fn flush_during_a_send_cancels_without_error() {
    // No auto-ack: nothing is acknowledged, so most of the file stays
    // buffered when the flush lands.
    let device = ScriptedDevice::new(false);
    device.push_line("{\"r\":{\"fv\":100},\"f\":[1,0,5]}");
    let (control, control_written) = device.make_channel("mock-control", true);
    let session = Arc::new(G2Core::new());
    let options = G2CoreOptions {
        dont_setup: true,
        ..Default::default()
    };
    session.open_channels(control, None, &options).await.unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 1..=50 {
        writeln!(file, "G1 X{i}").unwrap();
    }
    file.flush().unwrap();

    let sender = session.clone();
    let path = file.path().to_path_buf();
    let send = tokio::spawn(async move { sender.send_file(path).await });

    wait_until("first lines transmitted", || {
        control_written.contains("N1 G1 X1")
    })
    .await;
    session.flush().unwrap();

    send.await.unwrap().unwrap();
    // The abort byte and the queue clear went out with the flush.
    assert!(control_written.contains("\u{04}"));
    assert!(control_written.contains("{clr:n}"));
}

#[tokio::test]
async fn missing_file_reports_a_read_stream_error() {
    let device = ScriptedDevice::new(true);
    let (session, _) = ready_session(&device).await;
    let err = session
        .send_file("/nonexistent/program.gcode")
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::ReadStream { .. }));
}

#[tokio::test]
async fn a_second_send_starts_clean_after_completion() {
    let device = ScriptedDevice::new(true);
    let (session, data_written) = ready_session(&device).await;

    for round in 0..2 {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "G0 X{round}").unwrap();
        file.flush().unwrap();

        let mut rx = session.receiver();
        let sender = session.clone();
        let path = file.path().to_path_buf();
        let send = tokio::spawn(async move { sender.send_file(path).await });

        loop {
            match rx.recv().await.unwrap() {
                DriverEvent::DoneSending { forced: false } => break,
                _ => continue,
            }
        }
        device.push_line("{\"sr\":{\"stat\":4}}");
        send.await.unwrap().unwrap();
    }
    // Each round renumbered from 1.
    assert_eq!(
        data_written
            .all()
            .iter()
            .filter(|w| w.starts_with("N1 "))
            .count(),
        2
    );
}
