//! Effect verification for fire-and-forget editor commands.
//!
//! The plugin never reports whether an arbitrary command worked, so success is
//! inferred by comparing the state read just before sending the command with
//! the state read after the settle delay.

use crate::state::EditorState;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub success: bool,
    pub message: String,
}

impl Verification {
    fn passed(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Families of commands with a dedicated success heuristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFamily {
    Split,
    VerticalSplit,
    TabNew,
    TabNext,
    TabPrevious,
    Edit(String),
    Set,
    WinCmd,
    Write,
    Other,
}

impl CommandFamily {
    /// Classifies the trimmed, lower-cased command text.
    pub fn classify(command: &str) -> Self {
        let cmd = command.trim().to_lowercase();
        let is = |verb: &str| cmd == verb || cmd.starts_with(&format!("{verb} "));

        if is("split") {
            CommandFamily::Split
        } else if is("vsplit") {
            CommandFamily::VerticalSplit
        } else if is("tabnew") {
            CommandFamily::TabNew
        } else if cmd == "tabnext" {
            CommandFamily::TabNext
        } else if cmd == "tabprevious" {
            CommandFamily::TabPrevious
        } else if cmd.starts_with("edit ") || cmd.starts_with("e ") {
            let target = cmd.split_whitespace().nth(1).unwrap_or_default();
            CommandFamily::Edit(target.to_string())
        } else if cmd.starts_with("set ") {
            CommandFamily::Set
        } else if cmd.starts_with("wincmd ") {
            CommandFamily::WinCmd
        } else if cmd == "w" || cmd == "write" {
            CommandFamily::Write
        } else {
            CommandFamily::Other
        }
    }
}

pub fn verify_command(command: &str, before: &EditorState, after: &EditorState) -> Verification {
    match CommandFamily::classify(command) {
        CommandFamily::Split => window_growth("Window split", before, after),
        CommandFamily::VerticalSplit => window_growth("Vertical split", before, after),
        CommandFamily::TabNew => {
            let (was, now) = (before.tab_count(), after.tab_count());
            if now > was {
                Verification::passed(format!(
                    "New tab created successfully. Tabs increased from {was} to {now}."
                ))
            } else {
                Verification::failed(format!(
                    "Tab creation may have failed. Tab count unchanged: {was}."
                ))
            }
        }
        CommandFamily::TabNext => tab_move("last", before, after),
        CommandFamily::TabPrevious => tab_move("first", before, after),
        CommandFamily::Edit(target) => {
            let opened = after
                .current_buffer
                .as_ref()
                .and_then(|buffer| buffer.name.as_deref());
            match opened {
                Some(name) if name.to_lowercase().contains(&target) => {
                    Verification::passed(format!("File opened successfully: {name}"))
                }
                other => Verification::failed(format!(
                    "File opening may have failed. Current buffer: {}",
                    other.unwrap_or("unknown")
                )),
            }
        }
        CommandFamily::Set => Verification::passed(format!("Setting command executed: {command}")),
        CommandFamily::WinCmd => {
            let now = after.current_buffer_id();
            if before.current_buffer_id() != now {
                Verification::passed(format!(
                    "Window navigation successful. Moved to buffer {}.",
                    now.map(render_id).unwrap_or_else(|| "none".to_string())
                ))
            } else {
                Verification::passed(format!("Window navigation command executed: {command}"))
            }
        }
        CommandFamily::Write => match after.current_buffer.as_ref() {
            Some(buffer) if !buffer.modified => Verification::passed(format!(
                "File saved successfully: {}",
                buffer.display_name()
            )),
            _ => Verification::passed(format!("Write command executed: {command}")),
        },
        CommandFamily::Other => {
            Verification::passed(format!("Command executed successfully: {command}"))
        }
    }
}

fn window_growth(label: &str, before: &EditorState, after: &EditorState) -> Verification {
    let (was, now) = (before.window_count(), after.window_count());
    if now > was {
        Verification::passed(format!(
            "{label} successful. Windows increased from {was} to {now}."
        ))
    } else {
        Verification::failed(format!(
            "{label} may have failed. Window count unchanged: {was}."
        ))
    }
}

fn tab_move(edge: &str, before: &EditorState, after: &EditorState) -> Verification {
    let (was, now) = (before.active_tab_index(), after.active_tab_index());
    if was != now {
        Verification::passed(format!(
            "Tab navigation successful. Active tab changed from {} to {}.",
            tab_number(was),
            tab_number(now)
        ))
    } else {
        Verification::failed(format!(
            "Tab navigation may have failed or already at {edge} tab."
        ))
    }
}

fn tab_number(index: Option<usize>) -> usize {
    index.map_or(0, |idx| idx + 1)
}

fn render_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
