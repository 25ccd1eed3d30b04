//! Simulated actuators: apply hub commands and build the ACKs that confirm
//! them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    On,
    Off,
}

impl Status {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ON" => Some(Self::On),
            "OFF" => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    id: Option<i64>,
    name: Option<String>,
    status: String,
    #[serde(rename = "actionBy")]
    action_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub status: Status,
    pub action_by: Option<String>,
}

pub fn parse_command(payload: &[u8]) -> Result<Command, String> {
    let raw: RawCommand = serde_json::from_slice(payload).map_err(|e| format!("invalid command: {e}"))?;
    let status = Status::parse(&raw.status).ok_or_else(|| format!("unknown status '{}'", raw.status))?;
    if raw.id.is_none() && raw.name.as_deref().map_or(true, |n| n.trim().is_empty()) {
        return Err("command has neither id nor name".to_string());
    }
    Ok(Command {
        id: raw.id,
        name: raw.name,
        status,
        action_by: raw.action_by,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: Status,
    #[serde(rename = "actionBy", skip_serializing_if = "Option::is_none")]
    pub action_by: Option<String>,
}

/// Local on/off state keyed by device name (or `#<id>` when unnamed).
#[derive(Debug, Default)]
pub struct DeviceBank {
    states: BTreeMap<String, Status>,
}

impl DeviceBank {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            states: names.into_iter().map(|n| (n.into(), Status::Off)).collect(),
        }
    }

    pub fn apply(&mut self, cmd: &Command) -> Ack {
        let key = match (&cmd.name, cmd.id) {
            (Some(name), _) if !name.trim().is_empty() => name.trim().to_string(),
            (_, Some(id)) => format!("#{id}"),
            _ => String::new(),
        };
        self.states.insert(key, cmd.status);
        Ack {
            id: cmd.id,
            name: cmd.name.clone(),
            status: cmd.status,
            action_by: cmd.action_by.clone(),
        }
    }

    pub fn is_on(&self, name: &str) -> bool {
        self.states.get(name) == Some(&Status::On)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.states.len()
    }
}
