//! Wire schema for L1 <-> L2 traffic.
//!
//! Messages travel the bus as JSON-encoded payloads of the tagged unions
//! below. The bus itself treats them as opaque bytes; encoding and
//! decoding live entirely on this side of the transport.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// NODE IDENTITY
// ============================================================================

/// Kind of an L1 node, as advertised by the node itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Radar,
    Lidar,
    Camera,
    Imu,
    Gps,
    Coherent,
    Other(String),
}

impl From<String> for NodeType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "radar" => Self::Radar,
            "lidar" => Self::Lidar,
            "camera" => Self::Camera,
            "imu" => Self::Imu,
            "gps" => Self::Gps,
            "coherent" => Self::Coherent,
            _ => Self::Other(s),
        }
    }
}

impl From<NodeType> for String {
    fn from(t: NodeType) -> Self {
        t.as_str().to_string()
    }
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Radar => "radar",
            Self::Lidar => "lidar",
            Self::Camera => "camera",
            Self::Imu => "imu",
            Self::Gps => "gps",
            Self::Coherent => "coherent",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity block every L1 message carries about its sender.
///
/// The registry keys on `node_id`; re-registration overwrites the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub node_type: NodeType,
    pub location: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NodeIdentity {
    pub fn new(node_id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            location: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }
}

/// Reported health of an L1 node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Online,
    Offline,
    Degraded,
    Error,
}

// ============================================================================
// L1 -> L2
// ============================================================================

/// Message published by an L1 node on the `l1_to_l2` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L1ToL2Message {
    pub message_id: String,
    pub sender: NodeIdentity,
    pub timestamp_ms: u64,
    pub payload: L1Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum L1Payload {
    SensorData(SensorData),
    Capability(CapabilityAdvertisement),
    NodeStatus(NodeStatusReport),
    Heartbeat(Heartbeat),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SensorData {
    Radar(RadarData),
    Lidar(LidarData),
    Image(ImageData),
    Imu(ImuData),
    Gps(GpsData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadarData {
    pub max_range: f64,
    pub angular_resolution: f64,
    pub detections: Vec<RadarDetection>,
}

/// A single radar return in polar coordinates (radians, meters).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RadarDetection {
    pub range: f64,
    pub azimuth: f64,
    pub elevation: f64,
    pub velocity: f64,
    /// Radar cross-section; small returns get filtered out downstream.
    pub rcs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LidarData {
    pub angular_resolution: f64,
    pub range_min: f64,
    pub range_max: f64,
    pub num_points: u32,
    pub points: Vec<LidarPoint>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LidarPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub encoding: String,
    pub exposure_time: f64,
    pub gain: f64,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Triplet {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImuData {
    pub linear_acceleration: Triplet,
    pub angular_velocity: Triplet,
    pub magnetic_field: Triplet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsData {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed: f64,
    pub heading: f64,
    pub num_satellites: u32,
    pub hdop: f64,
}

/// What a node can do, sent once on startup and on request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityAdvertisement {
    pub node_id: String,
    pub sensor_types: Vec<String>,
    #[serde(default)]
    pub data_formats: Vec<String>,
    pub update_rate_hz: f64,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusReport {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub detail: String,
    pub last_heartbeat_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub status_info: BTreeMap<String, String>,
}

// ============================================================================
// L2 -> L1
// ============================================================================

/// Message published by the coordinator on the `l2_to_l1` topic.
///
/// An empty `target_node_id` addresses every node (broadcast).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2ToL1Message {
    pub message_id: String,
    #[serde(default)]
    pub target_node_id: String,
    pub timestamp_ms: u64,
    pub payload: L2Payload,
}

impl L2ToL1Message {
    /// Builds a message addressed to one node.
    pub fn to_node(
        message_id: impl Into<String>,
        target: impl Into<String>,
        timestamp_ms: u64,
        payload: L2Payload,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            target_node_id: target.into(),
            timestamp_ms,
            payload,
        }
    }

    /// Builds a broadcast message.
    pub fn broadcast(message_id: impl Into<String>, timestamp_ms: u64, payload: L2Payload) -> Self {
        Self {
            message_id: message_id.into(),
            target_node_id: String::new(),
            timestamp_ms,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_node_id.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum L2Payload {
    Control(ControlCommand),
    ConfigUpdate(ConfigurationUpdate),
    FusionResult(FusionResult),
    System(SystemCommand),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlCommand {
    StartSensor,
    StopSensor,
    ChangeRate { rate_hz: f64 },
    PointGimbal { theta: f64, phi: f64 },
    Calibrate,
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationUpdate {
    pub section: String,
    pub parameters: BTreeMap<String, String>,
}

/// Periodic summary of what the fusion algorithm currently believes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionResult {
    pub algorithm_name: String,
    pub result_type: String,
    pub confidence: f64,
    pub result_data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemCommand {
    Shutdown,
    Restart,
    SyncTime,
}

// ============================================================================
// WIRE CODEC
// ============================================================================

/// Encodes a message for the bus.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Decodes a bus payload.
pub fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radar_message_survives_the_wire() {
        let msg = L1ToL2Message {
            message_id: "radar_001_42".into(),
            sender: NodeIdentity::new("radar_001", NodeType::Radar).with_location("north_mast"),
            timestamp_ms: 1_700_000_000_000,
            payload: L1Payload::SensorData(SensorData::Radar(RadarData {
                max_range: 200.0,
                angular_resolution: 0.1,
                detections: vec![RadarDetection {
                    range: 50.0,
                    azimuth: 0.0,
                    elevation: 0.0,
                    velocity: -3.0,
                    rcs: 1.0,
                }],
            })),
        };

        let decoded: L1ToL2Message = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.sender.node_id, "radar_001");
        assert_eq!(decoded.sender.node_type, NodeType::Radar);
        match decoded.payload {
            L1Payload::SensorData(SensorData::Radar(r)) => {
                assert_eq!(r.detections.len(), 1);
                assert_eq!(r.detections[0].range, 50.0);
            }
            other => panic!("wrong payload case: {:?}", other),
        }
    }

    #[test]
    fn unknown_node_type_round_trips_as_other() {
        let t: NodeType = "sonar".to_string().into();
        assert_eq!(t, NodeType::Other("sonar".into()));
        assert_eq!(String::from(t), "sonar");
    }

    #[test]
    fn empty_target_means_broadcast() {
        let msg = L2ToL1Message::broadcast("L2_0", 0, L2Payload::System(SystemCommand::SyncTime));
        assert!(msg.is_broadcast());

        let msg = L2ToL1Message::to_node(
            "L2_1",
            "coherent_001",
            0,
            L2Payload::Control(ControlCommand::PointGimbal { theta: 0.0, phi: 0.0 }),
        );
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn garbage_payload_fails_to_decode() {
        assert!(decode::<L1ToL2Message>(b"not json").is_err());
    }
}
