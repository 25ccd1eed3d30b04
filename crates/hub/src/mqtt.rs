use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::clock::CalendarZone;
use crate::config::TopicConfig;
use crate::db::{DeviceIdentity, DeviceStatus, NewReading};

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// A sensor sample as found on the sensor topic, before persistence.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SensorMsg {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub illuminance: Option<f64>,
    pub precipitation: Option<f64>,
    /// `None` when absent or unparsable.
    pub measured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AckMsg {
    pub identity: DeviceIdentity,
    pub status: DeviceStatus,
    pub action_by: Option<String>,
}

/// Outbound command on the command topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandMsg {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: DeviceStatus,
    #[serde(rename = "actionBy", skip_serializing_if = "Option::is_none")]
    pub action_by: Option<String>,
}

const TEMPERATURE_KEYS: &[&str] = &["temp", "temperature"];
const HUMIDITY_KEYS: &[&str] = &["humid", "humidity"];
const ILLUMINANCE_KEYS: &[&str] = &["light", "lux", "illuminance"];
const PRECIPITATION_KEYS: &[&str] = &["rain", "precipitation"];
const ACTION_BY_KEYS: &[&str] = &["actionBy", "action_by"];

/// Epoch values above this are milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

impl SensorMsg {
    pub fn from_map(map: &Map<String, Value>, zone: CalendarZone) -> Self {
        Self {
            temperature: first_number(map, TEMPERATURE_KEYS),
            humidity: first_number(map, HUMIDITY_KEYS),
            illuminance: first_number(map, ILLUMINANCE_KEYS),
            precipitation: first_number(map, PRECIPITATION_KEYS),
            measured_at: map.get("measured_at").and_then(|v| parse_timestamp(v, zone)),
        }
    }

    pub fn has_metrics(&self) -> bool {
        self.temperature.is_some()
            || self.humidity.is_some()
            || self.illuminance.is_some()
            || self.precipitation.is_some()
    }

    /// Stamp with `fallback` when the source gave no usable time.
    pub fn into_new_reading(self, fallback: DateTime<Utc>) -> NewReading {
        NewReading {
            temperature: self.temperature,
            humidity: self.humidity,
            illuminance: self.illuminance,
            precipitation: self.precipitation,
            measured_at: self.measured_at.unwrap_or(fallback),
        }
    }
}

impl AckMsg {
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, String> {
        let (identity, status, action_by) = status_fields(map)?;
        Ok(Self { identity, status, action_by })
    }

    /// Key used to pick an ordered lane for this ACK.
    pub fn lane_key(&self) -> String {
        match (&self.identity.id, &self.identity.name) {
            (Some(id), _) => format!("id:{id}"),
            (None, Some(name)) => format!("name:{}", name.trim()),
            (None, None) => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Sensor,
    Ack,
}

pub fn route(topic: &str, topics: &TopicConfig) -> Option<Route> {
    if topic == topics.sensors {
        Some(Route::Sensor)
    } else if topic == topics.acks {
        Some(Route::Ack)
    } else {
        None
    }
}

/// Broker payloads must be a JSON object.
pub fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, String> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {}", kind_of(&other))),
        Err(e) => Err(format!("invalid json: {e}")),
    }
}

/// Parse an "ON"/"OFF" status (case-insensitive, trims whitespace).
pub fn parse_status(raw: &[u8]) -> Result<DeviceStatus, String> {
    let s = String::from_utf8_lossy(raw).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(DeviceStatus::On),
        "OFF" => Ok(DeviceStatus::Off),
        _ => Err(format!("unknown device status '{s}'")),
    }
}

/// `{id?, name?, status, actionBy?}` as used by ACKs and command requests.
/// Requires an identity and an ON/OFF status.
pub fn status_fields(
    map: &Map<String, Value>,
) -> Result<(DeviceIdentity, DeviceStatus, Option<String>), String> {
    let identity = identity_from_map(map);
    if identity.is_empty() {
        return Err("either id or name is required".to_string());
    }
    let status = match map.get("status") {
        Some(Value::String(s)) => parse_status(s.as_bytes())?,
        Some(other) => return Err(format!("status is not a string: {other}")),
        None => return Err("status is required".to_string()),
    };
    Ok((identity, status, first_string(map, ACTION_BY_KEYS)))
}

fn identity_from_map(map: &Map<String, Value>) -> DeviceIdentity {
    let id = match map.get("id") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    let name = first_string(map, &["name"]);
    DeviceIdentity { id, name }
}

/// The first key present with a usable number wins.
fn first_number(map: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| map.get(*k).and_then(number))
}

fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match map.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

fn number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|x| x.is_finite())
}

fn parse_timestamp(v: &Value, zone: CalendarZone) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return Some(t.with_timezone(&Utc));
            }
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .and_then(|naive| zone.to_utc(naive))
        }
        Value::Number(n) => {
            let n = n.as_i64()?;
            if n.abs() >= EPOCH_MILLIS_THRESHOLD {
                DateTime::from_timestamp_millis(n)
            } else {
                DateTime::from_timestamp(n, 0)
            }
        }
        _ => None,
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use serde_json::json;

    fn utc() -> CalendarZone {
        CalendarZone::Fixed(FixedOffset::east_opt(0).unwrap())
    }

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn topics() -> TopicConfig {
        TopicConfig::default()
    }

    // -- route ----------------------------------------------------------------

    #[test]
    fn route_sensor_topic() {
        assert_eq!(route(&topics().sensors, &topics()), Some(Route::Sensor));
    }

    #[test]
    fn route_ack_topic() {
        assert_eq!(route(&topics().acks, &topics()), Some(Route::Ack));
    }

    #[test]
    fn route_command_topic_is_not_inbound() {
        assert_eq!(route(&topics().commands, &topics()), None);
    }

    #[test]
    fn route_unknown_topic() {
        assert_eq!(route("foo/bar", &topics()), None);
        assert_eq!(route("", &topics()), None);
    }

    // -- parse_object ---------------------------------------------------------

    #[test]
    fn parse_object_accepts_object() {
        let map = parse_object(br#"{"temp":1}"#).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn parse_object_rejects_garbage() {
        assert!(parse_object(b"not json").is_err());
        assert!(parse_object(b"").is_err());
    }

    #[test]
    fn parse_object_rejects_non_object() {
        let err = parse_object(b"[1,2]").unwrap_err();
        assert!(err.contains("array"), "{err}");
    }

    // -- parse_status ---------------------------------------------------------

    #[test]
    fn parse_status_variants() {
        assert_eq!(parse_status(b"ON"), Ok(DeviceStatus::On));
        assert_eq!(parse_status(b"off"), Ok(DeviceStatus::Off));
        assert_eq!(parse_status(b"  oN\n"), Ok(DeviceStatus::On));
    }

    #[test]
    fn parse_status_garbage() {
        assert!(parse_status(b"TOGGLE").is_err());
        assert!(parse_status(b"").is_err());
    }

    // -- SensorMsg --------------------------------------------------------------

    #[test]
    fn sensor_canonical_keys() {
        let msg = SensorMsg::from_map(
            &obj(json!({"temperature": 29.3, "humidity": 57, "lux": 268.3})),
            utc(),
        );
        assert_eq!(msg.temperature, Some(29.3));
        assert_eq!(msg.humidity, Some(57.0));
        assert_eq!(msg.illuminance, Some(268.3));
        assert_eq!(msg.precipitation, None);
        assert_eq!(msg.measured_at, None);
    }

    #[test]
    fn sensor_short_aliases() {
        let msg = SensorMsg::from_map(
            &obj(json!({"temp": 20, "humid": 40, "light": 100, "rain": 1.5})),
            utc(),
        );
        assert_eq!(msg.temperature, Some(20.0));
        assert_eq!(msg.humidity, Some(40.0));
        assert_eq!(msg.illuminance, Some(100.0));
        assert_eq!(msg.precipitation, Some(1.5));
    }

    #[test]
    fn sensor_short_alias_wins_over_long() {
        let msg = SensorMsg::from_map(&obj(json!({"temp": 1, "temperature": 2})), utc());
        assert_eq!(msg.temperature, Some(1.0));
    }

    #[test]
    fn sensor_unusable_alias_falls_through() {
        let msg = SensorMsg::from_map(&obj(json!({"temp": null, "temperature": 2})), utc());
        assert_eq!(msg.temperature, Some(2.0));
    }

    #[test]
    fn sensor_non_numeric_is_absent_not_zero() {
        let msg = SensorMsg::from_map(
            &obj(json!({"temp": "hot", "humid": true, "light": "12.5"})),
            utc(),
        );
        assert_eq!(msg.temperature, None);
        assert_eq!(msg.humidity, None);
        assert_eq!(msg.illuminance, Some(12.5));
        assert!(msg.has_metrics());
    }

    #[test]
    fn sensor_without_metrics() {
        let msg = SensorMsg::from_map(&obj(json!({"foo": 1})), utc());
        assert!(!msg.has_metrics());
    }

    #[test]
    fn sensor_measured_at_rfc3339() {
        let msg = SensorMsg::from_map(
            &obj(json!({"temp": 1, "measured_at": "2025-10-03T10:00:00+07:00"})),
            utc(),
        );
        assert_eq!(
            msg.measured_at.unwrap().to_rfc3339(),
            "2025-10-03T03:00:00+00:00"
        );
    }

    #[test]
    fn sensor_measured_at_naive_uses_zone() {
        let zone = CalendarZone::Fixed(FixedOffset::east_opt(7 * 3600).unwrap());
        let msg = SensorMsg::from_map(
            &obj(json!({"temp": 1, "measured_at": "2025-10-03 10:00:00"})),
            zone,
        );
        assert_eq!(
            msg.measured_at.unwrap().to_rfc3339(),
            "2025-10-03T03:00:00+00:00"
        );
    }

    #[test]
    fn sensor_measured_at_epoch_seconds_and_millis() {
        let secs = SensorMsg::from_map(&obj(json!({"temp": 1, "measured_at": 1_759_485_600})), utc());
        let millis =
            SensorMsg::from_map(&obj(json!({"temp": 1, "measured_at": 1_759_485_600_000_i64})), utc());
        assert_eq!(secs.measured_at, millis.measured_at);
        assert!(secs.measured_at.is_some());
    }

    #[test]
    fn sensor_measured_at_unparsable_is_none() {
        let msg = SensorMsg::from_map(&obj(json!({"temp": 1, "measured_at": "yesterday"})), utc());
        assert_eq!(msg.measured_at, None);
    }

    #[test]
    fn into_new_reading_uses_fallback_only_when_missing() {
        let fallback = DateTime::from_timestamp(1_000, 0).unwrap();
        let explicit = DateTime::from_timestamp(2_000, 0).unwrap();

        let r = SensorMsg { temperature: Some(1.0), ..Default::default() }.into_new_reading(fallback);
        assert_eq!(r.measured_at, fallback);

        let r = SensorMsg { measured_at: Some(explicit), ..Default::default() }
            .into_new_reading(fallback);
        assert_eq!(r.measured_at, explicit);
    }

    // -- AckMsg -----------------------------------------------------------------

    #[test]
    fn ack_by_id() {
        let ack = AckMsg::from_map(&obj(json!({"id": 2, "status": "OFF"}))).unwrap();
        assert_eq!(ack.identity, DeviceIdentity { id: Some(2), name: None });
        assert_eq!(ack.status, DeviceStatus::Off);
        assert_eq!(ack.action_by, None);
    }

    #[test]
    fn ack_by_name_with_attribution() {
        let ack =
            AckMsg::from_map(&obj(json!({"name": "fan", "status": "on", "actionBy": "User"})))
                .unwrap();
        assert_eq!(ack.identity.name.as_deref(), Some("fan"));
        assert_eq!(ack.status, DeviceStatus::On);
        assert_eq!(ack.action_by.as_deref(), Some("User"));
    }

    #[test]
    fn ack_numeric_string_id() {
        let ack = AckMsg::from_map(&obj(json!({"id": "7", "status": "ON"}))).unwrap();
        assert_eq!(ack.identity.id, Some(7));
    }

    #[test]
    fn ack_requires_identity() {
        assert!(AckMsg::from_map(&obj(json!({"status": "ON"}))).is_err());
        assert!(AckMsg::from_map(&obj(json!({"name": "  ", "status": "ON"}))).is_err());
    }

    #[test]
    fn ack_requires_valid_status() {
        assert!(AckMsg::from_map(&obj(json!({"id": 1}))).is_err());
        assert!(AckMsg::from_map(&obj(json!({"id": 1, "status": "BLINK"}))).is_err());
        assert!(AckMsg::from_map(&obj(json!({"id": 1, "status": 1}))).is_err());
    }

    #[test]
    fn ack_lane_key_prefers_id() {
        let a = AckMsg::from_map(&obj(json!({"id": 3, "name": "fan", "status": "ON"}))).unwrap();
        let b = AckMsg::from_map(&obj(json!({"name": "fan", "status": "ON"}))).unwrap();
        assert_eq!(a.lane_key(), "id:3");
        assert_eq!(b.lane_key(), "name:fan");
    }

    // -- CommandMsg ---------------------------------------------------------------

    #[test]
    fn command_serializes_optional_fields() {
        let full = CommandMsg {
            id: 2,
            name: Some("fan".into()),
            status: DeviceStatus::On,
            action_by: Some("User".into()),
        };
        assert_eq!(
            serde_json::to_value(&full).unwrap(),
            json!({"id": 2, "name": "fan", "status": "ON", "actionBy": "User"})
        );

        let bare = CommandMsg { id: 2, name: None, status: DeviceStatus::Off, action_by: None };
        assert_eq!(
            serde_json::to_value(&bare).unwrap(),
            json!({"id": 2, "status": "OFF"})
        );
    }
}
