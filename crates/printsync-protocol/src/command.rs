//! Remote printer commands carried by domain frames (`motion`, `temperature`,
//! `execute`, `files`, `gcode`).

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum MotionCommand {
    Home {
        #[serde(default)]
        axes: Vec<String>,
    },
    /// Relative jog; keys are axis names, values are distances in mm.
    Move {
        #[serde(deserialize_with = "lenient_axes")]
        axes: BTreeMap<String, f64>,
    },
    Extrude {
        #[serde(deserialize_with = "lenient_f64")]
        value: f64,
    },
    Retract {
        #[serde(deserialize_with = "lenient_f64")]
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum TemperatureCommand {
    Temperature {
        heater: String,
        #[serde(deserialize_with = "lenient_f64")]
        value: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ExecuteCommand {
    Pause,
    Resume,
    Cancel,
    Toggle,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum FilesCommand {
    Print {
        file: String,
    },
    Select {
        file: String,
    },
    /// `content` is the base64-encoded file body.
    Upload {
        file: String,
        content: String,
    },
    /// `content` names a file held by the backend, fetched before upload.
    UploadBig {
        file: String,
        content: String,
    },
    Delete {
        file: String,
    },
    NewFolder {
        folder: String,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum GcodeLines {
    One(String),
    Many(Vec<String>),
}

impl GcodeLines {
    pub fn script(&self) -> String {
        match self {
            GcodeLines::One(line) => line.clone(),
            GcodeLines::Many(lines) => lines.join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum GcodeCommand {
    Send { lines: GcodeLines },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrinterCommand {
    Motion(MotionCommand),
    Temperature(TemperatureCommand),
    Execute(ExecuteCommand),
    Files(FilesCommand),
    Gcode(GcodeCommand),
    /// Domain or sub-tag this agent does not understand; ignored by the router.
    Unknown { domain: Option<String>, reason: String },
}

const DOMAINS: [&str; 5] = ["motion", "temperature", "execute", "files", "gcode"];

impl PrinterCommand {
    /// Pick the first domain key present in the frame and decode its body.
    pub fn from_frame(map: &Map<String, Value>) -> Self {
        let Some((domain, body)) = DOMAINS
            .iter()
            .find_map(|d| map.get(*d).map(|body| (*d, body.clone())))
        else {
            return PrinterCommand::Unknown {
                domain: None,
                reason: "frame carries no command domain".into(),
            };
        };

        let decoded = match domain {
            "motion" => serde_json::from_value(body).map(PrinterCommand::Motion),
            "temperature" => serde_json::from_value(body).map(PrinterCommand::Temperature),
            "execute" => serde_json::from_value(body).map(PrinterCommand::Execute),
            "files" => serde_json::from_value(body).map(PrinterCommand::Files),
            _ => serde_json::from_value(body).map(PrinterCommand::Gcode),
        };
        decoded.unwrap_or_else(|err| PrinterCommand::Unknown {
            domain: Some(domain.to_owned()),
            reason: err.to_string(),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

impl NumberOrText {
    fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
        match self {
            NumberOrText::Number(n) => Ok(n),
            NumberOrText::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("not a number: {s:?}"))),
        }
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    NumberOrText::deserialize(deserializer)?.into_f64()
}

fn lenient_axes<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, f64>, D::Error> {
    BTreeMap::<String, NumberOrText>::deserialize(deserializer)?
        .into_iter()
        .map(|(axis, v)| v.into_f64().map(|d| (axis, d)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(frame: Value) -> PrinterCommand {
        let Value::Object(map) = frame else {
            panic!("test frame must be an object");
        };
        PrinterCommand::from_frame(&map)
    }

    #[test]
    fn numeric_strings_are_accepted() {
        let cmd = decode(json!({"temperature": {"cmd": "temperature", "heater": "bed", "value": "60"}}));
        assert_eq!(
            cmd,
            PrinterCommand::Temperature(TemperatureCommand::Temperature {
                heater: "bed".into(),
                value: 60.0
            })
        );

        let cmd = decode(json!({"motion": {"cmd": "move", "axes": {"x": "10", "z": -0.5}}}));
        let PrinterCommand::Motion(MotionCommand::Move { axes }) = cmd else {
            panic!("expected a move, got {cmd:?}");
        };
        assert_eq!(axes.get("x"), Some(&10.0));
        assert_eq!(axes.get("z"), Some(&-0.5));
    }

    #[test]
    fn domain_precedence_follows_fixed_order() {
        let cmd = decode(json!({
            "gcode": {"cmd": "send", "lines": "M105"},
            "execute": {"cmd": "resume"}
        }));
        assert_eq!(cmd, PrinterCommand::Execute(ExecuteCommand::Resume));
    }

    #[test]
    fn unknown_sub_tags_are_reported_not_fatal() {
        let cmd = decode(json!({"execute": {"cmd": "self_destruct"}}));
        assert!(matches!(
            cmd,
            PrinterCommand::Unknown { domain: Some(ref d), .. } if d == "execute"
        ));

        let cmd = decode(json!({"lights": {"cmd": "on"}}));
        assert!(matches!(cmd, PrinterCommand::Unknown { domain: None, .. }));
    }

    #[test]
    fn gcode_lines_join_with_newlines() {
        let cmd = decode(json!({"gcode": {"cmd": "send", "lines": ["G28", "G1 X5"]}}));
        let PrinterCommand::Gcode(GcodeCommand::Send { lines }) = cmd else {
            panic!("expected gcode send");
        };
        assert_eq!(lines.script(), "G28\nG1 X5");
    }

    #[test]
    fn upload_big_uses_snake_case_tag() {
        let cmd = decode(json!({"files": {"cmd": "upload_big", "file": "a.gcode", "content": "bucket/a"}}));
        assert_eq!(
            cmd,
            PrinterCommand::Files(FilesCommand::UploadBig {
                file: "a.gcode".into(),
                content: "bucket/a".into()
            })
        );
    }
}
