use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Display orientation reported by the sensor, in quarter turns clockwise
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum Orientation {
    #[default]
    Landscape = 0,
    Portrait = 1,
    LandscapeFlipped = 2,
    PortraitFlipped = 3,
}

impl Orientation {
    pub fn from_index(value: i64) -> Option<Self> {
        match value {
            0 => Some(Orientation::Landscape),
            1 => Some(Orientation::Portrait),
            2 => Some(Orientation::LandscapeFlipped),
            3 => Some(Orientation::PortraitFlipped),
            _ => None,
        }
    }

    pub fn as_index(self) -> u8 {
        self as u8
    }

    pub fn degrees(self) -> u16 {
        self.as_index() as u16 * 90
    }
}

impl From<Orientation> for u8 {
    fn from(value: Orientation) -> Self {
        value.as_index()
    }
}

impl TryFrom<u8> for Orientation {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Orientation::from_index(value as i64).ok_or_else(|| format!("Invalid orientation: {}", value))
    }
}

impl std::fmt::Display for Orientation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}°)", self.as_index(), self.degrees())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Frame has no device address")]
    MissingAddress,
}

/// One decoded sensor message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub address: String,
    /// `None` when the field is absent, not an integer, or outside 0..=3
    pub orientation: Option<Orientation>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl TelemetryRecord {
    /// Decode a frame produced by the extractor.
    ///
    /// The address is read from `address`, falling back to `mac`.
    pub fn from_frame(frame: &str) -> Result<Self, TelemetryError> {
        let value: Value = serde_json::from_str(frame)?;
        let object = value.as_object().ok_or(TelemetryError::NotAnObject)?;

        let address = ["address", "mac"]
            .iter()
            .filter_map(|key| object.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|addr| !addr.is_empty())
            .ok_or(TelemetryError::MissingAddress)?
            .to_string();

        let orientation = object
            .get("orientation")
            .and_then(Value::as_i64)
            .and_then(Orientation::from_index);

        Ok(Self {
            address,
            orientation,
            x: axis(object, "x"),
            y: axis(object, "y"),
            z: axis(object, "z"),
        })
    }
}

fn axis(object: &Map<String, Value>, key: &str) -> Option<f64> {
    object.get(key).and_then(Value::as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_mac_and_orientation() {
        let record = TelemetryRecord::from_frame(r#"{"mac":"11:22:33:44:55:66","orientation":1,"x":0.5,"y":-9.8}"#).unwrap();
        assert_eq!(record.address, "11:22:33:44:55:66");
        assert_eq!(record.orientation, Some(Orientation::Portrait));
        assert_eq!(record.x, Some(0.5));
        assert_eq!(record.y, Some(-9.8));
        assert_eq!(record.z, None);
    }

    #[test]
    fn address_field_takes_precedence() {
        let record = TelemetryRecord::from_frame(r#"{"address":"AA","mac":"BB","orientation":3}"#).unwrap();
        assert_eq!(record.address, "AA");
        assert_eq!(record.orientation, Some(Orientation::PortraitFlipped));
    }

    #[test]
    fn out_of_range_orientation_still_identifies() {
        for frame in [r#"{"mac":"AA","orientation":7}"#, r#"{"mac":"AA","orientation":"1"}"#, r#"{"mac":"AA"}"#, r#"{"mac":"AA","orientation":1.5}"#] {
            let record = TelemetryRecord::from_frame(frame).unwrap();
            assert_eq!(record.address, "AA");
            assert_eq!(record.orientation, None, "frame {}", frame);
        }
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(matches!(TelemetryRecord::from_frame("{not json}"), Err(TelemetryError::Malformed(_))));
        assert!(matches!(TelemetryRecord::from_frame("[1,2]"), Err(TelemetryError::NotAnObject)));
        assert!(matches!(TelemetryRecord::from_frame(r#"{"orientation":1}"#), Err(TelemetryError::MissingAddress)));
        assert!(matches!(TelemetryRecord::from_frame(r#"{"mac":"  ","orientation":1}"#), Err(TelemetryError::MissingAddress)));
        assert!(matches!(TelemetryRecord::from_frame(r#"{"mac":42}"#), Err(TelemetryError::MissingAddress)));
    }

    #[test]
    fn orientation_serializes_as_index() {
        assert_eq!(serde_json::to_string(&Orientation::LandscapeFlipped).unwrap(), "2");
        assert_eq!(serde_json::from_str::<Orientation>("1").unwrap(), Orientation::Portrait);
        assert!(serde_json::from_str::<Orientation>("4").is_err());
    }
}
