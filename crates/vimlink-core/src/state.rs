use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Snapshot of an editor's live state.
///
/// Only the fields the verifier inspects are typed; everything else the
/// plugin reports is carried through untouched in `extra`. Missing or `null`
/// collections read as empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EditorState {
    #[serde(default, deserialize_with = "null_as_default")]
    pub windows: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tabs: Vec<TabInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_buffer: Option<BufferInfo>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub buffers: Vec<BufferInfo>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TabInfo {
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub active: bool,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BufferInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub modified: bool,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl EditorState {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    /// Zero-based position of the first tab flagged active.
    pub fn active_tab_index(&self) -> Option<usize> {
        self.tabs.iter().position(|tab| tab.active)
    }

    pub fn current_buffer_id(&self) -> Option<&Value> {
        self.current_buffer.as_ref().and_then(|buffer| buffer.id.as_ref())
    }

    pub fn modified_buffers(&self) -> impl Iterator<Item = &BufferInfo> {
        self.buffers.iter().filter(|buffer| buffer.modified)
    }
}

impl BufferInfo {
    /// Buffer name as an editor would show it, `[No Name]` when unnamed.
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "[No Name]",
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Editors report flags as booleans or as 0/1 numbers; accept both.
pub fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(false),
        Value::Bool(flag) => Ok(flag),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|n| n != 0.0)),
        Value::String(s) => Ok(!s.is_empty() && s != "0"),
        _ => Err(serde::de::Error::custom("expected boolean or number for flag")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_and_null_fields_read_as_empty() {
        let state: EditorState =
            serde_json::from_value(json!({"windows": null, "mode": "n"})).expect("parse");
        assert_eq!(state.window_count(), 0);
        assert_eq!(state.tab_count(), 0);
        assert!(state.current_buffer.is_none());
        assert_eq!(state.extra.get("mode"), Some(&json!("n")));

        assert_eq!(EditorState::from_value(Value::Null).expect("null"), EditorState::default());
    }

    #[test]
    fn numeric_flags_are_accepted() {
        let state: EditorState = serde_json::from_value(json!({
            "tabs": [{"active": 0, "nr": 1}, {"active": 1, "nr": 2}],
            "current_buffer": {"id": 3, "name": "notes.md", "modified": 1},
            "buffers": [
                {"id": 3, "name": "notes.md", "modified": 1},
                {"id": 4, "name": "", "modified": true},
                {"id": 5, "name": "done.txt", "modified": false}
            ]
        }))
        .expect("parse");

        assert_eq!(state.active_tab_index(), Some(1));
        assert_eq!(state.current_buffer_id(), Some(&json!(3)));
        let names = state
            .modified_buffers()
            .map(BufferInfo::display_name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["notes.md", "[No Name]"]);
    }

    #[test]
    fn unknown_fields_survive_serialization() {
        let raw = json!({
            "windows": [{"id": 1000}],
            "tabs": [],
            "buffers": [],
            "cursor": [12, 4],
            "current_buffer": {"id": 1, "name": "a.rs", "modified": false, "filetype": "rust"}
        });
        let state: EditorState = serde_json::from_value(raw.clone()).expect("parse");
        let back = serde_json::to_value(&state).expect("serialize");
        assert_eq!(back, raw);
    }
}
