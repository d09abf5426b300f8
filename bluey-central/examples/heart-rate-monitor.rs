//! Monitors a simulated heart rate sensor through the fake backend.
//!
//! Run with `RUST_LOG=bluey_central=trace` to see the session's side of
//! the conversation.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bluey_central::backend::BackendEvent;
use bluey_central::characteristic::{CharacteristicInfo, CharacteristicProperties};
use bluey_central::descriptor::CLIENT_CHARACTERISTIC_CONFIGURATION;
use bluey_central::fake::{FakeBackend, FakeRequest};
use bluey_central::service::ServiceInfo;
use bluey_central::uuid::uuid_from_u16;
use bluey_central::{Address, GattStatus, SessionConfig};
use log::{info, warn};
use uuid::Uuid;

const HEART_RATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180D);
const HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0x2A37);
const BODY_SENSOR_LOCATION_CHARACTERISTIC_UUID: Uuid = uuid_from_u16(0x2A38);

fn heart_rate_service() -> ServiceInfo {
    ServiceInfo::new(HEART_RATE_SERVICE_UUID)
        .with_characteristic(CharacteristicInfo::new(HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID,
                                                     0,
                                                     CharacteristicProperties::NOTIFY)
                             .with_descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION))
        .with_characteristic(CharacteristicInfo::new(BODY_SENSOR_LOCATION_CHARACTERISTIC_UUID,
                                                     1,
                                                     CharacteristicProperties::READ))
}

/// Plays the part of the platform stack and the sensor itself.
async fn simulate_sensor(backend: FakeBackend) {
    let mut ticker: Option<tokio::task::JoinHandle<()>> = None;
    while let Some(request) = backend.next_request().await {
        match request {
            FakeRequest::Connect { .. } => {
                backend.emit(BackendEvent::Connected);
            }
            FakeRequest::DiscoverServices => {
                backend.emit(BackendEvent::ServicesDiscovered { status: GattStatus::SUCCESS });
            }
            FakeRequest::Read(target) => {
                // "Chest"
                backend.emit(BackendEvent::CharacteristicRead {
                    target,
                    status: GattStatus::SUCCESS,
                    value: vec![1],
                });
            }
            FakeRequest::WriteDescriptor { target, descriptor, value } => {
                backend.emit(BackendEvent::DescriptorWritten {
                    target,
                    descriptor,
                    status: GattStatus::SUCCESS,
                });
                if let Some(task) = ticker.take() {
                    task.abort();
                }
                if value.first().map_or(false, |enable| *enable != 0) {
                    let backend = backend.clone();
                    ticker = Some(tokio::spawn(async move {
                        let mut bpm = 60u8;
                        loop {
                            tokio::time::sleep(Duration::from_millis(250)).await;
                            let changed = BackendEvent::CharacteristicChanged {
                                target,
                                value: vec![0, bpm],
                            };
                            if !backend.emit(changed) {
                                break;
                            }
                            bpm = bpm.wrapping_add(3);
                        }
                    }));
                }
            }
            FakeRequest::ReadRssi => {
                backend.emit(BackendEvent::RssiRead { rssi: -58, status: GattStatus::SUCCESS });
            }
            FakeRequest::Disconnect => {
                backend.emit(BackendEvent::Disconnected { status: GattStatus::SUCCESS });
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder().filter_level(log::LevelFilter::Warn) // Default Log Level
                         .parse_default_env()
                         .init();

    let backend = FakeBackend::new(vec![heart_rate_service()]);
    tokio::spawn(simulate_sensor(backend.clone()));

    let address = Address::from_str("F1:E2:D3:C4:B5:A6")?;
    let mut config = SessionConfig::new(address);
    config.set_name("Simulated HRM");
    let session = config.start(Arc::new(backend)).await?;

    let mut connection = session.connect(false);
    let peripheral = match connection.recv().await {
        Some(result) => result?,
        None => return Err("Connection stream ended".into()),
    };
    info!("Connected: {}", serde_json::to_string(&peripheral)?);

    let location = session.read(HEART_RATE_SERVICE_UUID, BODY_SENSOR_LOCATION_CHARACTERISTIC_UUID)
                          .await?;
    println!("Sensor location: {:?}", location);
    println!("RSSI: {}", session.read_rssi().await?);

    let (subscribed, mut measurements) =
        session.subscribe(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID);
    subscribed.await?;

    for _ in 0..8 {
        match measurements.recv().await {
            Some(notification) => match notification.value.get(1) {
                Some(bpm) => println!("#{}: {} bpm", notification.sequence, bpm),
                None => warn!("Short heart rate measurement: {:?}", notification.value),
            },
            None => break,
        }
    }

    session.unsubscribe(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_CHARACTERISTIC_UUID)
           .await?;
    session.disconnect();

    Ok(())
}
