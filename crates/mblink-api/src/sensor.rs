// ── Sensor and button events ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::broadcast;

const SENSOR_CHANNEL_CAPACITY: usize = 256;

/// One accelerometer sample in raw device units (milli-g).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccelerometerData {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum Button {
    A,
    B,
}

/// A button press or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonEvent {
    pub button: Button,
    pub state: bool,
}

/// Broadcast fan-out for a transport's sensor streams.
#[derive(Debug)]
pub struct SensorHub {
    accelerometer: broadcast::Sender<AccelerometerData>,
    buttons: broadcast::Sender<ButtonEvent>,
}

impl Default for SensorHub {
    fn default() -> Self {
        let (accelerometer, _) = broadcast::channel(SENSOR_CHANNEL_CAPACITY);
        let (buttons, _) = broadcast::channel(SENSOR_CHANNEL_CAPACITY);
        Self {
            accelerometer,
            buttons,
        }
    }
}

impl SensorHub {
    pub fn publish_accelerometer(&self, data: AccelerometerData) {
        let _ = self.accelerometer.send(data);
    }

    pub fn publish_button(&self, event: ButtonEvent) {
        let _ = self.buttons.send(event);
    }

    pub fn subscribe_accelerometer(&self) -> broadcast::Receiver<AccelerometerData> {
        self.accelerometer.subscribe()
    }

    pub fn subscribe_buttons(&self) -> broadcast::Receiver<ButtonEvent> {
        self.buttons.subscribe()
    }
}
