//! Sensor telemetry record and its radio wire layout

/// Size of a telemetry frame on the radio: `{i32 id, i32 pct, f32 volts}`
pub const WIRE_LEN: usize = 12;

/// One soil-moisture reading from a sensing spoke
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TelemetryRecord {
    /// Spoke identifier
    pub node_id: i32,
    /// Moisture percentage, normalised to 0-100 on the spoke
    pub moisture_pct: i32,
    /// Spoke battery voltage
    pub battery_volts: f32,
}

impl TelemetryRecord {
    /// Decode a packed little-endian frame; `None` unless exactly [`WIRE_LEN`] bytes
    pub fn from_wire(frame: &[u8]) -> Option<Self> {
        let bytes: &[u8; WIRE_LEN] = frame.try_into().ok()?;
        Some(Self {
            node_id: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            moisture_pct: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            battery_volts: f32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }

    /// Encode as the spokes transmit it
    pub fn to_wire(&self) -> [u8; WIRE_LEN] {
        let mut out = [0u8; WIRE_LEN];
        out[0..4].copy_from_slice(&self.node_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.moisture_pct.to_le_bytes());
        out[8..12].copy_from_slice(&self.battery_volts.to_le_bytes());
        out
    }
}
