//! Peripheral Server: the FTMS (Fitness Machine Service) GATT server this
//! bridge presents to a consumer app.
//!
//! Grounded directly on `ftms/src/ftms_service.rs` — the `Fun` callback
//! model for plain Notify characteristics, the `characteristic_control()` +
//! IO-mode reader/writer pattern for Control Point write+indicate, and the
//! same advertisement shape. Generalized to read live state from `Shared`
//! instead of a Unix-socket sidecar, to apply the FTMS<->vendor unit
//! reconciliation rules at the opcode-handling seam, and to add
//! smart-notify suppression.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bluer::adv::Advertisement;
use bluer::gatt::local::{
    characteristic_control, Application, Characteristic, CharacteristicControlEvent,
    CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, Service,
};
use futures::{pin_mut, FutureExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::ftms_protocol::{
    self, status, ControlPointCommand, CONTROL_POINT, FEATURE, FTMS_SERVICE, INCLINE_RANGE,
    MACHINE_STATUS, RESULT_SUCCESS, SPEED_RANGE, TRAINING_STATUS, TRAINING_STATUS_IDLE,
    TREADMILL_DATA,
};
use crate::state::{QueuedResponse, Shared, TargetCommand};

const NOTIFY_INTERVAL: Duration = Duration::from_millis(1000);
/// Smart-notify suppression window: identical frames within this window
/// are not re-sent.
const SMART_NOTIFY_WINDOW: Duration = Duration::from_secs(5);

/// Given the current and previously-sent Treadmill Data frames and the
/// time since the last send, decide whether a notification should go out.
/// Pure so the smart-notify rule (spec property #7 / scenario S6) is
/// testable without a live GATT session.
pub fn should_notify(
    candidate: &[u8],
    last_sent: Option<&[u8]>,
    time_since_last_send: Option<Duration>,
) -> bool {
    match (last_sent, time_since_last_send) {
        (Some(last), Some(elapsed)) if last == candidate && elapsed < SMART_NOTIFY_WINDOW => false,
        _ => true,
    }
}

/// Translate a parsed Control Point command into the vendor-side
/// `TargetCommand` to enqueue (if any) and the Status notification bytes
/// to emit, applying the FTMS<->vendor unit reconciliation rules (spec
/// property #8): incline is multiplied by 10 going from FTMS tenths-of-a-
/// percent to vendor hundredths-of-a-percent; speed passes through raw.
///
/// `is_moving` reflects the current derived speed and only affects the
/// Request Control grant: it reports `04` (started) if the belt is already
/// moving, `02 01` (stopped) otherwise.
pub fn translate_command(cmd: ControlPointCommand, is_moving: bool) -> (Option<TargetCommand>, Vec<u8>) {
    match cmd {
        ControlPointCommand::RequestControl => {
            let status_bytes = if is_moving {
                status::STARTED_OR_RESUMED.to_vec()
            } else {
                status::STOPPED_OR_PAUSED.to_vec()
            };
            (None, status_bytes)
        }
        ControlPointCommand::Reset => (None, Vec::new()),
        ControlPointCommand::SetTargetSpeed(v) => {
            (Some(TargetCommand::SetSpeed(v)), status::target_speed_changed(v))
        }
        ControlPointCommand::SetTargetIncline(v) => {
            let vendor_raw = (v as i32 * 10) as u16;
            (
                Some(TargetCommand::SetIncline(vendor_raw)),
                status::target_incline_changed(v),
            )
        }
        ControlPointCommand::StartResume => (None, status::STARTED_OR_RESUMED.to_vec()),
        ControlPointCommand::StopPause => {
            (Some(TargetCommand::SetSpeed(0)), status::STOPPED_OR_PAUSED.to_vec())
        }
    }
}

/// Run the FTMS GATT peripheral. Advertises, serves the fixed
/// characteristics, and drives Treadmill Data notifications from
/// `Shared`'s derived state with smart-notify suppression.
pub async fn run(
    shared: Arc<Shared>,
    adapter: bluer::Adapter,
    advertised_name: String,
) -> bluer::Result<()> {
    let adv = Advertisement {
        advertisement_type: bluer::adv::Type::Peripheral,
        service_uuids: vec![FTMS_SERVICE].into_iter().collect(),
        local_name: Some(advertised_name.clone()),
        discoverable: Some(true),
        ..Default::default()
    };
    let _adv_handle = adapter.advertise(adv).await?;
    info!("peripheral: advertising as '{}'", advertised_name);

    let td_shared = shared.clone();
    let treadmill_data_notify_fn: Box<
        dyn Fn(bluer::gatt::local::CharacteristicNotifier) -> std::pin::Pin<Box<dyn futures::Future<Output = ()> + Send>>
            + Send
            + Sync,
    > = Box::new(move |notifier| {
        let shared = td_shared.clone();
        async move {
            tokio::spawn(run_treadmill_data_notifier(shared, notifier));
        }
        .boxed()
    });

    let status_notifier: Arc<Mutex<Option<bluer::gatt::local::CharacteristicNotifier>>> =
        Arc::new(Mutex::new(None));
    let sn_clone = status_notifier.clone();
    let machine_status_notify_fn: Box<
        dyn Fn(bluer::gatt::local::CharacteristicNotifier) -> std::pin::Pin<Box<dyn futures::Future<Output = ()> + Send>>
            + Send
            + Sync,
    > = Box::new(move |notifier| {
        let sn = sn_clone.clone();
        async move {
            let mut notifier = notifier;
            let _ = notifier.notify(status::STOPPED_OR_PAUSED.to_vec()).await;
            *sn.lock().await = Some(notifier);
        }
        .boxed()
    });

    let training_notifier: Arc<Mutex<Option<bluer::gatt::local::CharacteristicNotifier>>> =
        Arc::new(Mutex::new(None));
    let tn_clone = training_notifier.clone();
    let training_status_notify_fn: Box<
        dyn Fn(bluer::gatt::local::CharacteristicNotifier) -> std::pin::Pin<Box<dyn futures::Future<Output = ()> + Send>>
            + Send
            + Sync,
    > = Box::new(move |notifier| {
        let tn = tn_clone.clone();
        async move {
            let mut notifier = notifier;
            let _ = notifier.notify(TRAINING_STATUS_IDLE.to_vec()).await;
            *tn.lock().await = Some(notifier);
        }
        .boxed()
    });

    let (cp_control, cp_handle) = characteristic_control();
    let cp_status_notifier = status_notifier.clone();
    let cp_training_notifier = training_notifier.clone();
    let cp_shared = shared.clone();

    let app = Application {
        services: vec![Service {
            uuid: FTMS_SERVICE,
            primary: true,
            characteristics: vec![
                Characteristic {
                    uuid: FEATURE,
                    read: Some(CharacteristicRead {
                        read: true,
                        fun: Box::new(|_req| {
                            async move { Ok(ftms_protocol::encode_feature()) }.boxed()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Characteristic {
                    uuid: TREADMILL_DATA,
                    notify: Some(CharacteristicNotify {
                        notify: true,
                        method: CharacteristicNotifyMethod::Fun(treadmill_data_notify_fn),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Characteristic {
                    uuid: SPEED_RANGE,
                    read: Some(CharacteristicRead {
                        read: true,
                        fun: Box::new(|_req| {
                            async move { Ok(ftms_protocol::encode_speed_range()) }.boxed()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Characteristic {
                    uuid: INCLINE_RANGE,
                    read: Some(CharacteristicRead {
                        read: true,
                        fun: Box::new(|_req| {
                            async move { Ok(ftms_protocol::encode_incline_range()) }.boxed()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                // Mandatory when Control Point is present (FTMS spec).
                Characteristic {
                    uuid: TRAINING_STATUS,
                    read: Some(CharacteristicRead {
                        read: true,
                        fun: Box::new(|_req| {
                            async move { Ok(TRAINING_STATUS_IDLE.to_vec()) }.boxed()
                        }),
                        ..Default::default()
                    }),
                    notify: Some(CharacteristicNotify {
                        notify: true,
                        method: CharacteristicNotifyMethod::Fun(training_status_notify_fn),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Characteristic {
                    uuid: CONTROL_POINT,
                    write: Some(CharacteristicWrite {
                        write: true,
                        method: CharacteristicWriteMethod::Io,
                        ..Default::default()
                    }),
                    notify: Some(CharacteristicNotify {
                        indicate: true,
                        method: CharacteristicNotifyMethod::Io,
                        ..Default::default()
                    }),
                    control_handle: cp_handle,
                    ..Default::default()
                },
                Characteristic {
                    uuid: MACHINE_STATUS,
                    read: Some(CharacteristicRead {
                        read: true,
                        fun: Box::new(|_req| {
                            async move { Ok(status::STOPPED_OR_PAUSED.to_vec()) }.boxed()
                        }),
                        ..Default::default()
                    }),
                    notify: Some(CharacteristicNotify {
                        notify: true,
                        method: CharacteristicNotifyMethod::Fun(machine_status_notify_fn),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }],
        ..Default::default()
    };

    let _app_handle = adapter.serve_gatt_application(app).await?;
    info!("peripheral: FTMS GATT service registered");

    let mut cp_reader: Option<bluer::gatt::CharacteristicReader> = None;
    let mut cp_writer: Option<bluer::gatt::CharacteristicWriter> = None;
    let mut read_buf = Vec::new();

    pin_mut!(cp_control);

    loop {
        tokio::select! {
            evt = cp_control.next() => {
                match evt {
                    Some(CharacteristicControlEvent::Write(req)) => {
                        read_buf = vec![0u8; req.mtu()];
                        match req.accept() {
                            Ok(reader) => cp_reader = Some(reader),
                            Err(e) => warn!("peripheral: failed to accept Control Point write: {}", e),
                        }
                    }
                    Some(CharacteristicControlEvent::Notify(notifier)) => {
                        cp_writer = Some(notifier);
                    }
                    None => {
                        info!("peripheral: Control Point control stream ended");
                        break;
                    }
                }
            }
            read_res = async {
                match &mut cp_reader {
                    Some(reader) => reader.read(&mut read_buf).await,
                    None => futures::future::pending().await,
                }
            } => {
                match read_res {
                    Ok(0) => { cp_reader = None; }
                    Ok(n) => {
                        let bytes = &read_buf[..n];
                        debug!("peripheral: Control Point write {:02x?}", bytes);
                        handle_control_point_write(
                            bytes,
                            &cp_shared,
                            &cp_status_notifier,
                            &cp_training_notifier,
                        ).await;
                    }
                    Err(e) => {
                        warn!("peripheral: Control Point read error: {}", e);
                        cp_reader = None;
                    }
                }
            }
            // The actual indication-dispatch path for `response_queue`
            // (spec §3/§4.4: "dispatched by the peripheral server main
            // loop"). Selecting on this directly, rather than draining it
            // only alongside a GATT write, means the channel always has a
            // live consumer -- a burst of writes can never fill the bounded
            // channel and block the producer forever.
            maybe_resp = cp_shared.recv_response() => {
                match maybe_resp {
                    Some(resp) => {
                        let payload = ftms_protocol::encode_control_response(resp.opcode, resp.result);
                        if let Some(writer) = cp_writer.as_mut() {
                            if let Err(e) = writer.write(&payload).await {
                                warn!("peripheral: Control Point indication error: {}", e);
                                cp_writer = None;
                            }
                        } else {
                            debug!("peripheral: dropping Control Point response, no indication subscriber");
                        }
                    }
                    None => warn!("peripheral: response queue closed unexpectedly"),
                }
            }
        }
    }

    Ok(())
}

/// Parse and act on one Control Point write, then enqueue the indication
/// `peripheral::run`'s dispatch branch owes the client -- success and
/// rejection responses both go through `response_queue` (spec §4.4: "All
/// control responses are queued to response_queue and dispatched by the
/// server main loop as Indications"); nothing is written to the GATT link
/// from here directly.
async fn handle_control_point_write(
    bytes: &[u8],
    shared: &Arc<Shared>,
    status_notifier: &Arc<Mutex<Option<bluer::gatt::local::CharacteristicNotifier>>>,
    _training_notifier: &Arc<Mutex<Option<bluer::gatt::local::CharacteristicNotifier>>>,
) {
    let opcode_hint = bytes.first().copied().unwrap_or(0);
    match ftms_protocol::parse_control_point(bytes) {
        Ok(cmd) => {
            let is_moving = shared.session.lock().await.derived.speed_kph > 0.0;
            let (target, status_bytes) = translate_command(cmd, is_moving);
            if let Some(target) = target {
                let _ = shared.control_sender().send(target).await;
            }
            if !status_bytes.is_empty() {
                let mut sn = status_notifier.lock().await;
                if let Some(notifier) = sn.as_mut() {
                    if notifier.is_stopped() {
                        *sn = None;
                    } else if let Err(e) = notifier.notify(status_bytes).await {
                        warn!("peripheral: Status notification error: {}", e);
                        *sn = None;
                    }
                }
            }
            let opcode = ftms_protocol::opcode_of(cmd);
            shared
                .response_sender()
                .send(QueuedResponse { opcode, result: RESULT_SUCCESS })
                .await
                .ok();
        }
        Err(err) => {
            warn!("peripheral: rejected Control Point write: {:?}", err);
            let result = match err {
                ftms_protocol::ControlPointError::UnsupportedOpcode => {
                    ftms_protocol::RESULT_OP_NOT_SUPPORTED
                }
                ftms_protocol::ControlPointError::InvalidParameter => {
                    ftms_protocol::RESULT_INVALID_PARAMETER
                }
            };
            shared
                .response_sender()
                .send(QueuedResponse { opcode: opcode_hint, result })
                .await
                .ok();
        }
    }
}

async fn run_treadmill_data_notifier(
    shared: Arc<Shared>,
    mut notifier: bluer::gatt::local::CharacteristicNotifier,
) {
    info!("peripheral: Treadmill Data notification session started");
    let mut interval = tokio::time::interval(NOTIFY_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shared.telemetry_notify.notified() => {}
        }

        if notifier.is_stopped() {
            break;
        }

        let (frame, should_send) = {
            let mut s = shared.session.lock().await;
            let d = s.derived;
            let incline_tenths = (d.incline_pct * 10.0).round() as i16;
            let speed_raw = (d.speed_kph * 100.0).round().clamp(0.0, u16::MAX as f64) as u16;
            let frame = ftms_protocol::encode_treadmill_data(
                speed_raw,
                incline_tenths,
                d.distance_m,
                d.calories_kcal,
                d.elapsed_time_s,
            );
            let elapsed = s.last_notified_ftms_at.map(|t| Instant::now().saturating_duration_since(t));
            let send = should_notify(&frame, s.last_notified_ftms_frame.as_deref(), elapsed);
            if send {
                s.last_notified_ftms_frame = Some(frame.clone());
                s.last_notified_ftms_at = Some(Instant::now());
            }
            (frame, send)
        };

        if should_send {
            if let Err(e) = notifier.notify(frame).await {
                warn!("peripheral: Treadmill Data notification error: {}", e);
                break;
            }
        }
    }
    info!("peripheral: Treadmill Data notification session ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_notify_suppresses_identical_frame_within_window() {
        let a = vec![1, 2, 3];
        assert!(!should_notify(&a, Some(&a), Some(Duration::from_secs(1))));
    }

    #[test]
    fn smart_notify_allows_after_window_elapses() {
        let a = vec![1, 2, 3];
        assert!(should_notify(&a, Some(&a), Some(Duration::from_secs(6))));
    }

    #[test]
    fn smart_notify_allows_when_frame_differs() {
        let a = vec![1, 2, 3];
        let b = vec![1, 2, 4];
        assert!(should_notify(&b, Some(&a), Some(Duration::from_secs(1))));
    }

    #[test]
    fn smart_notify_allows_first_ever_send() {
        assert!(should_notify(&[1, 2, 3], None, None));
    }

    #[test]
    fn unit_conversion_law_incline_multiplies_by_ten() {
        let (target, _) = translate_command(ControlPointCommand::SetTargetIncline(50), false);
        assert_eq!(target, Some(TargetCommand::SetIncline(500)));
    }

    #[test]
    fn unit_conversion_law_speed_passes_through() {
        let (target, _) = translate_command(ControlPointCommand::SetTargetSpeed(300), false);
        assert_eq!(target, Some(TargetCommand::SetSpeed(300)));
    }

    #[test]
    fn stop_pause_enqueues_zero_speed() {
        let (target, status_bytes) = translate_command(ControlPointCommand::StopPause, true);
        assert_eq!(target, Some(TargetCommand::SetSpeed(0)));
        assert_eq!(status_bytes, vec![0x02, 0x01]);
    }

    #[test]
    fn start_resume_enqueues_nothing_but_emits_status() {
        let (target, status_bytes) = translate_command(ControlPointCommand::StartResume, false);
        assert_eq!(target, None);
        assert_eq!(status_bytes, vec![0x04]);
    }

    #[test]
    fn request_control_reports_started_when_moving() {
        let (target, status_bytes) = translate_command(ControlPointCommand::RequestControl, true);
        assert_eq!(target, None);
        assert_eq!(status_bytes, vec![0x04]);
    }

    #[test]
    fn request_control_reports_stopped_when_idle() {
        let (target, status_bytes) = translate_command(ControlPointCommand::RequestControl, false);
        assert_eq!(target, None);
        assert_eq!(status_bytes, vec![0x02, 0x01]);
    }

    #[test]
    fn s1_speed_set_produces_expected_status_bytes() {
        let cmd = ftms_protocol::parse_control_point(&[0x02, 0x2C, 0x01]).unwrap();
        let (target, status_bytes) = translate_command(cmd, false);
        assert_eq!(target, Some(TargetCommand::SetSpeed(300)));
        assert_eq!(status_bytes, vec![0x05, 0x2C, 0x01]);
    }

    #[test]
    fn s2_incline_set_produces_vendor_raw_500() {
        let cmd = ftms_protocol::parse_control_point(&[0x03, 0x32, 0x00]).unwrap();
        let (target, status_bytes) = translate_command(cmd, false);
        assert_eq!(target, Some(TargetCommand::SetIncline(500)));
        assert_eq!(status_bytes, vec![0x06, 0x32, 0x00]);
    }
}
