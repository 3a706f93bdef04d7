//! TCP debug server: a line-protocol twin of the peripheral's BLE surface,
//! for exercising the bridge without BLE hardware.
//!
//! Grounded directly on `ftms/src/debug_server.rs` (same command set,
//! same hex encode/decode helpers, same `cp <hex>` → parse → execute →
//! respond flow), generalized to also show central-link state since this
//! bridge owns both roles in one process where the teacher's daemons only
//! ever owned one each.

use std::sync::Arc;

use log::info;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::ftms_protocol;
use crate::peripheral::translate_command;
use crate::state::{QueuedResponse, Shared};

pub async fn run(
    shared: Arc<Shared>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("debug server listening on port {}", port);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("debug client connected from {}", addr);
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, shared).await {
                info!("debug client {} disconnected: {}", addr, e);
            }
        });
    }
}

async fn handle_client(
    stream: tokio::net::TcpStream,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(b"bridge-debug> connected. type 'help' for commands.\n")
        .await?;

    loop {
        writer.write_all(b"bridge-debug> ").await?;

        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim().to_lowercase();
                if line.is_empty() {
                    continue;
                }

                let response = match line.split_once(' ') {
                    Some(("cp", hex)) => handle_cp(hex.trim(), &shared).await,
                    Some(("mock", arg)) => handle_mock(arg.trim(), &shared).await,
                    _ => match line.as_str() {
                        "help" => Ok(HELP_TEXT.to_string()),
                        "state" => Ok(handle_state(&shared).await),
                        "td" => Ok(handle_td(&shared).await),
                        "feat" => Ok(format!("feat {}", hex_encode(&ftms_protocol::encode_feature()))),
                        "sr" => Ok(format!("range {}", hex_encode(&ftms_protocol::encode_speed_range()))),
                        "ir" => Ok(format!("range {}", hex_encode(&ftms_protocol::encode_incline_range()))),
                        "mock" => Ok("usage: mock <speed_kph> <incline_pct> or mock off".to_string()),
                        "sub" => {
                            handle_subscribe(&shared, &mut writer).await?;
                            continue;
                        }
                        "quit" | "exit" => return Ok(()),
                        _ => Ok(format!("unknown command: '{}'. type 'help'.", line)),
                    },
                };

                match response {
                    Ok(msg) => {
                        writer.write_all(msg.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                    }
                    Err(e) => {
                        writer.write_all(format!("error: {}\n", e).as_bytes()).await?;
                    }
                }
            }
            None => return Ok(()),
        }
    }
}

async fn handle_state(shared: &Arc<Shared>) -> String {
    let s = shared.session.lock().await;
    let d = s.derived;
    format!(
        "central:    {}\n\
         peripheral: {}\n\
         speed:      {:.2} km/h\n\
         incline:    {:.2}%\n\
         distance:   {:.1} m\n\
         elapsed:    {}s\n\
         calories:   {:.1} kcal",
        s.central_connected, s.peripheral_connected, d.speed_kph, d.incline_pct, d.distance_m,
        d.elapsed_time_s, d.calories_kcal,
    )
}

async fn handle_td(shared: &Arc<Shared>) -> String {
    let s = shared.session.lock().await;
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
    format!(
        "data {} (speed={} incline={} dist={:.1}m elapsed={}s)",
        hex_encode(&frame), speed_raw, incline_tenths, d.distance_m, d.elapsed_time_s,
    )
}

async fn handle_cp(
    hex: &str,
    shared: &Arc<Shared>,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let bytes = hex_decode(hex)?;
    if bytes.is_empty() {
        return Ok("error: empty control point data".to_string());
    }
    let opcode_hint = bytes[0];

    match ftms_protocol::parse_control_point(&bytes) {
        Ok(cmd) => {
            let is_moving = shared.session.lock().await.derived.speed_kph > 0.0;
            let (target, _status_bytes) = translate_command(cmd, is_moving);
            if let Some(target) = target {
                let _ = shared.control_sender().send(target).await;
            }
            let opcode = ftms_protocol::opcode_of(cmd);
            let response = ftms_protocol::encode_control_response(opcode, ftms_protocol::RESULT_SUCCESS);
            shared
                .response_sender()
                .send(QueuedResponse { opcode, result: ftms_protocol::RESULT_SUCCESS })
                .await
                .ok();
            Ok(format!("parsed: {:?}\nresp {}", cmd, hex_encode(&response)))
        }
        Err(err) => {
            let response = ftms_protocol::encode_error_response(opcode_hint, err);
            Ok(format!(
                "parsed: rejected ({:?})\nresp {}",
                err,
                hex_encode(&response)
            ))
        }
    }
}

/// Fakes treadmill telemetry directly into `SessionState`, bypassing the
/// central session entirely (for exercising the peripheral/FTMS side
/// without a real I_TL treadmill). Mirrors the teacher's `mock <bpm>` / `mock
/// off` debug command, generalized from a single heart-rate field to the
/// treadmill's speed/incline/distance/elapsed/calories tuple.
async fn handle_mock(
    arg: &str,
    shared: &Arc<Shared>,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    if arg == "off" {
        let mut s = shared.session.lock().await;
        s.central_connected = false;
        s.derived = crate::derived_state::DerivedState::default();
        return Ok("mock off - central link reset to disconnected".to_string());
    }

    let mut parts = arg.split_whitespace();
    let speed_kph: f64 = match parts.next().and_then(|v| v.parse().ok()) {
        Some(v) => v,
        None => return Ok("usage: mock <speed_kph> <incline_pct> or mock off".to_string()),
    };
    let incline_pct: f64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0.0);

    let mut s = shared.session.lock().await;
    s.central_connected = true;
    s.derived.speed_kph = speed_kph;
    s.derived.incline_pct = incline_pct;
    s.last_notify_at = Some(std::time::Instant::now());
    drop(s);
    shared.telemetry_notify.notify_waiters();

    Ok(format!("mock: speed={speed_kph:.2} km/h incline={incline_pct:.2}%"))
}

async fn handle_subscribe(
    shared: &Arc<Shared>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    writer
        .write_all(b"subscribed to treadmill data at 1 Hz. ctrl-c to stop.\n")
        .await?;

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        interval.tick().await;
        let line = format!("{}\n", handle_td(shared).await);
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join("")
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
    let hex = hex.replace(' ', "");
    if hex.len() % 2 != 0 {
        return Err("hex string must have even length".into());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
        })
        .collect()
}

const HELP_TEXT: &str = "\
commands:
  state           show current bridge state (human-readable)
  td              read treadmill data characteristic (0x2ACD) as hex
  feat            read feature characteristic (0x2ACC) as hex
  sr              read supported speed range (0x2AD4) as hex
  ir              read supported incline range (0x2AD5) as hex
  cp <hex>        write to control point (0x2AD9), execute + show response
  mock <s> <i>    fake connected treadmill at speed s km/h, incline i% (no hardware needed)
  mock off        stop mocking, revert central link to disconnected
  sub             subscribe to 1 Hz treadmill data stream
  help            this message
  quit            disconnect

control point examples:
  cp 00           Request Control
  cp 02 2c01      Set Target Speed 3.00 km/h (300 = 0x012c LE)
  cp 03 3200      Set Target Incline 5.0% (50 = 0x0032 LE)
  cp 07           Start or Resume
  cp 08           Stop or Pause

all values are little-endian hex, matching raw BLE GATT writes.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips() {
        let bytes = vec![0x02, 0x2C, 0x01];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn hex_decode_rejects_odd_length() {
        assert!(hex_decode("abc").is_err());
    }

    #[test]
    fn hex_decode_ignores_spaces() {
        assert_eq!(hex_decode("02 2c 01").unwrap(), vec![0x02, 0x2C, 0x01]);
    }
}
