//! Operations offered to the tool dispatch layer.

use crate::{
    config::BrokerConfig,
    connection::EditorConnection,
    detector::run_exit,
    error::BrokerError,
    registry::{InstanceRegistry, InstanceSummary},
    store::BrokerStore,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vimlink_core::{
    verify_command, BufferInfo, EditorCall, EditorState, ExitAction, ExitCommand, HelpReply,
    MacroReply, TabInfo,
};

pub const DEFAULT_MACRO_REGISTER: &str = "q";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InstanceListing {
    pub instances: Vec<InstanceSummary>,
    pub selected: Option<String>,
    pub selection_required: bool,
    /// Last choice made, kept across restarts. Never applied automatically.
    pub preferred: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The editor closed its connection in response to an exit command.
    Exited { command: String },
    Verified {
        command: String,
        message: String,
        before: EditorState,
        after: EditorState,
    },
}

impl CommandOutcome {
    pub fn message(&self) -> &str {
        match self {
            CommandOutcome::Exited { .. } => "Vim exited successfully",
            CommandOutcome::Verified { message, .. } => message,
        }
    }
}

/// Result of a guarded exit. Unsaved changes decline the exit; that is a
/// decision, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDecision {
    Exited { action: ExitAction },
    Declined { buffers: Vec<String> },
}

impl ExitDecision {
    pub fn message(&self) -> String {
        match self {
            ExitDecision::Exited {
                action: ExitAction::Check,
            } => "Vim exited successfully (no unsaved changes)".to_string(),
            ExitDecision::Exited {
                action: ExitAction::SaveAndExit,
            } => "All changes saved and Vim exited successfully".to_string(),
            ExitDecision::Exited {
                action: ExitAction::ForceExit,
            } => "Vim force exited (unsaved changes discarded)".to_string(),
            ExitDecision::Declined { buffers } => format!(
                "Cannot exit Vim: {} buffer(s) have unsaved changes: {}",
                buffers.len(),
                buffers.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HelpLookup {
    Found {
        query: String,
        tag: Option<String>,
        file: Option<String>,
        line: Option<Value>,
    },
    NotFound {
        query: String,
    },
}

impl HelpLookup {
    pub fn message(&self) -> String {
        match self {
            HelpLookup::Found {
                query,
                tag,
                file,
                line,
            } => format!(
                "Found help for '{query}':\n\nTag: {}\nFile: {}\nLine: {}\n\nHelp window opened in Vim.",
                tag.as_deref().unwrap_or("unknown"),
                file.as_deref().unwrap_or("unknown"),
                line.as_ref().map(Value::to_string).unwrap_or_else(|| "unknown".to_string())
            ),
            HelpLookup::NotFound { query } => format!("No help found for '{query}'."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroRecording {
    pub register: String,
    pub sequence: String,
    pub executed: bool,
    pub output: Option<String>,
}

impl MacroRecording {
    pub fn message(&self) -> String {
        let mut message = format!("Macro recorded in register \"{}\"", self.register);
        if self.executed {
            message.push_str(" and executed");
        }
        message.push_str(&format!("\nSequence: {}", self.sequence));
        if let Some(output) = self.output.as_deref().filter(|out| !out.is_empty()) {
            message.push('\n');
            message.push_str(output);
        }
        message
    }
}

/// One broker per process: the instance table, the selection and the
/// timeouts every operation runs under.
pub struct Broker {
    config: BrokerConfig,
    registry: InstanceRegistry,
}

impl Broker {
    pub fn new(config: BrokerConfig, store: Arc<dyn BrokerStore>) -> Self {
        Self {
            config,
            registry: InstanceRegistry::new(store),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub async fn list_instances(&self) -> InstanceListing {
        let instances = self.registry.list().await;
        InstanceListing {
            instances,
            selected: self.registry.selected().await,
            selection_required: self.registry.selection_required().await,
            preferred: self.registry.remembered().await,
        }
    }

    pub async fn select_instance(&self, id: &str) -> Result<(), BrokerError> {
        self.registry.select(id).await
    }

    pub async fn get_state(&self) -> Result<EditorState, BrokerError> {
        let (id, connection) = self.registry.require_selected().await?;
        self.fetch_state(&id, &connection).await
    }

    pub async fn buffers(&self) -> Result<Vec<BufferInfo>, BrokerError> {
        Ok(self.get_state().await?.buffers)
    }

    pub async fn tabs(&self) -> Result<Vec<TabInfo>, BrokerError> {
        Ok(self.get_state().await?.tabs)
    }

    /// Runs `command` on the selected instance. Exit-class commands complete
    /// when the editor disconnects; everything else is verified by comparing
    /// state before and after.
    pub async fn execute_command(&self, command: &str) -> Result<CommandOutcome, BrokerError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        let (id, connection) = self.registry.require_selected().await?;

        if ExitCommand::matches(command) {
            run_exit(
                &self.registry,
                &id,
                connection,
                command,
                self.config.exit_timeout,
            )
            .await?;
            return Ok(CommandOutcome::Exited {
                command: command.to_string(),
            });
        }

        let before = self.fetch_state(&id, &connection).await?;
        let request_id = connection.send_oneway(EditorCall::execute(command)).await?;
        debug!(event = "broker_command_sent", instance_id = %id, request_id, command);
        tokio::time::sleep(self.config.settle_delay).await;
        let after = self.fetch_state(&id, &connection).await?;

        let verification = verify_command(command, &before, &after);
        if !verification.success {
            warn!(
                event = "broker_verification_failed",
                instance_id = %id,
                command,
                message = %verification.message
            );
            return Err(BrokerError::VerificationFailure(verification.message));
        }
        Ok(CommandOutcome::Verified {
            command: command.to_string(),
            message: verification.message,
            before,
            after,
        })
    }

    /// `action` is one of `check` (default), `save_and_exit`, `force_exit`.
    pub async fn guarded_exit(&self, action: Option<&str>) -> Result<ExitDecision, BrokerError> {
        let action = action
            .unwrap_or_default()
            .parse::<ExitAction>()
            .map_err(BrokerError::InvalidArgument)?;
        let (id, connection) = self.registry.require_selected().await?;

        if action == ExitAction::Check {
            let state = self.fetch_state(&id, &connection).await?;
            let buffers = state
                .modified_buffers()
                .map(|buffer| buffer.display_name().to_string())
                .collect::<Vec<_>>();
            if !buffers.is_empty() {
                info!(event = "broker_exit_declined", instance_id = %id, modified = buffers.len());
                return Ok(ExitDecision::Declined { buffers });
            }
        }

        let command = action.command().to_string();
        run_exit(
            &self.registry,
            &id,
            connection,
            &command,
            self.config.exit_timeout,
        )
        .await?;
        Ok(ExitDecision::Exited { action })
    }

    pub async fn search_help(&self, query: &str) -> Result<HelpLookup, BrokerError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "query must not be empty".to_string(),
            ));
        }
        let (_, connection) = self.registry.require_selected().await?;
        let raw = connection
            .request(
                EditorCall::SearchHelp {
                    query: query.to_string(),
                },
                self.config.help_timeout,
            )
            .await?;
        let reply: HelpReply = parse_reply(raw, "search_help")?;
        Ok(if reply.success {
            HelpLookup::Found {
                query: query.to_string(),
                tag: reply.tag,
                file: reply.file,
                line: reply.line,
            }
        } else {
            HelpLookup::NotFound {
                query: query.to_string(),
            }
        })
    }

    pub async fn record_macro(
        &self,
        sequence: &str,
        register: Option<&str>,
        execute: Option<bool>,
    ) -> Result<MacroRecording, BrokerError> {
        if sequence.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "macro_sequence must not be empty".to_string(),
            ));
        }
        let register = register.unwrap_or(DEFAULT_MACRO_REGISTER);
        let mut chars = register.chars();
        let valid = matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_alphanumeric());
        if !valid {
            return Err(BrokerError::InvalidArgument(
                "Register must be a single letter (a-z) or digit (0-9)".to_string(),
            ));
        }
        let execute = execute.unwrap_or(true);

        let (_, connection) = self.registry.require_selected().await?;
        let raw = connection
            .request(
                EditorCall::RecordMacro {
                    macro_sequence: sequence.to_string(),
                    register: register.to_string(),
                    execute,
                },
                self.config.request_timeout,
            )
            .await?;
        let reply: MacroReply = parse_reply(raw, "record_macro")?;
        if !reply.success {
            return Err(BrokerError::RemoteError(
                reply.error.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }
        Ok(MacroRecording {
            register: register.to_string(),
            sequence: sequence.to_string(),
            executed: execute,
            output: reply.output,
        })
    }

    /// Disconnects every editor and removes the registry snapshot. The
    /// preference file is left for the next process.
    pub async fn shutdown(&self) {
        let closed = self.registry.close_all().await;
        info!(event = "broker_shutdown", closed);
    }

    async fn fetch_state(
        &self,
        id: &str,
        connection: &EditorConnection,
    ) -> Result<EditorState, BrokerError> {
        let raw = connection
            .request(EditorCall::get_state(), self.config.request_timeout)
            .await?;
        let state = EditorState::from_value(raw)
            .map_err(|err| BrokerError::RemoteError(format!("malformed state document: {err}")))?;
        self.registry
            .record_state(id, connection.conn_id(), state.clone())
            .await;
        Ok(state)
    }
}

fn parse_reply<T: serde::de::DeserializeOwned>(
    raw: Value,
    method: &str,
) -> Result<T, BrokerError> {
    serde_json::from_value(raw)
        .map_err(|err| BrokerError::RemoteError(format!("malformed {method} reply: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use vimlink_core::{InstanceInfo, Outbound, RemoteFault, ReplyFrame};

    enum Answer {
        Reply(Value),
        Fail(&'static str),
        Silent,
    }

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            request_timeout: Duration::from_millis(300),
            help_timeout: Duration::from_millis(300),
            exit_timeout: Duration::from_millis(300),
            settle_delay: Duration::from_millis(20),
            ..BrokerConfig::default()
        }
    }

    /// Registers an in-process editor that answers requests with `answer`.
    async fn broker_with_editor<F>(mut answer: F) -> (Arc<Broker>, Arc<EditorConnection>)
    where
        F: FnMut(&EditorCall) -> Answer + Send + 'static,
    {
        let broker = Arc::new(Broker::new(test_config(), Arc::new(MemoryStore::default())));
        let (tx, mut rx) = mpsc::channel(16);
        let connection = Arc::new(EditorConnection::new(1, tx));
        broker
            .registry()
            .register("vim-a", InstanceInfo::default(), connection.clone())
            .await;

        let editor = connection.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Outbound::Request(frame) = message else {
                    continue;
                };
                let reply = match answer(&frame.call) {
                    Answer::Reply(result) => ReplyFrame {
                        id: frame.id,
                        result: Some(result),
                        error: None,
                    },
                    Answer::Fail(message) => ReplyFrame {
                        id: frame.id,
                        result: None,
                        error: Some(RemoteFault {
                            message: message.to_string(),
                        }),
                    },
                    Answer::Silent => continue,
                };
                editor.deliver(reply);
            }
        });
        (broker, connection)
    }

    #[tokio::test]
    async fn split_is_verified_against_fresh_state() {
        let mut windows = 1;
        let (broker, _conn) = broker_with_editor(move |call| match call {
            EditorCall::GetState {} => {
                Answer::Reply(json!({"windows": vec![json!({}); windows]}))
            }
            EditorCall::ExecuteCommand { command } if command == "split" => {
                windows += 1;
                Answer::Silent
            }
            _ => Answer::Silent,
        })
        .await;

        let outcome = broker.execute_command(" split ").await.expect("split");
        assert_eq!(
            outcome.message(),
            "Window split successful. Windows increased from 1 to 2."
        );
        let CommandOutcome::Verified { before, after, .. } = outcome else {
            panic!("expected verified outcome");
        };
        assert_eq!((before.window_count(), after.window_count()), (1, 2));
    }

    #[tokio::test]
    async fn unchanged_state_is_a_verification_failure() {
        let (broker, _conn) = broker_with_editor(|call| match call {
            EditorCall::GetState {} => Answer::Reply(json!({"windows": [{}]})),
            _ => Answer::Silent,
        })
        .await;

        let err = broker.execute_command("vsplit").await.expect_err("unchanged");
        assert_eq!(
            err.to_string(),
            "Command verification failed: Vertical split may have failed. Window count unchanged: 1."
        );
    }

    #[tokio::test]
    async fn empty_command_and_missing_selection_are_rejected() {
        let broker = Broker::new(test_config(), Arc::new(MemoryStore::default()));
        assert!(matches!(
            broker.execute_command("   ").await,
            Err(BrokerError::InvalidArgument(_))
        ));
        assert_eq!(
            broker.get_state().await,
            Err(BrokerError::NoInstanceSelected)
        );
    }

    #[tokio::test]
    async fn state_fetch_times_out_when_editor_is_silent() {
        let (broker, conn) = broker_with_editor(|_| Answer::Silent).await;
        let err = broker.get_state().await.expect_err("silent editor");
        assert_eq!(
            err,
            BrokerError::Timeout {
                method: "get_state",
                waited_ms: 300
            }
        );
        assert!(conn.pending().is_empty());
    }

    #[tokio::test]
    async fn check_declines_when_buffers_are_modified() {
        let (broker, conn) = broker_with_editor(|call| match call {
            EditorCall::GetState {} => Answer::Reply(json!({
                "buffers": [
                    {"id": 1, "name": "notes.md", "modified": 1},
                    {"id": 2, "name": "", "modified": true},
                    {"id": 3, "name": "clean.rs", "modified": 0}
                ]
            })),
            _ => Answer::Silent,
        })
        .await;

        let decision = broker.guarded_exit(None).await.expect("decision");
        assert_eq!(
            decision,
            ExitDecision::Declined {
                buffers: vec!["notes.md".to_string(), "[No Name]".to_string()]
            }
        );
        assert!(decision.message().starts_with("Cannot exit Vim: 2 buffer(s)"));
        assert!(!conn.is_closed());
        assert_eq!(broker.registry().pending_exit("vim-a").await, Some(false));
    }

    #[tokio::test]
    async fn force_exit_completes_when_editor_disconnects() {
        let closer = Arc::new(std::sync::Mutex::new(None::<Arc<EditorConnection>>));
        let hook = closer.clone();
        let (broker, conn) = broker_with_editor(move |call| {
            if let EditorCall::ExecuteCommand { command } = call {
                assert_eq!(command, "qall!");
                if let Some(conn) = hook.lock().expect("lock").clone() {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        conn.close();
                    });
                }
            }
            Answer::Silent
        })
        .await;
        *closer.lock().expect("lock") = Some(conn);

        let decision = broker
            .guarded_exit(Some("force_exit"))
            .await
            .expect("exit");
        assert_eq!(
            decision,
            ExitDecision::Exited {
                action: ExitAction::ForceExit
            }
        );
        assert!(broker.list_instances().await.instances.is_empty());
        assert_eq!(broker.registry().pending_exit("vim-a").await, None);
    }

    #[tokio::test]
    async fn unknown_exit_action_is_invalid() {
        let (broker, _conn) = broker_with_editor(|_| Answer::Silent).await;
        assert!(matches!(
            broker.guarded_exit(Some("shutdown")).await,
            Err(BrokerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn help_lookup_reports_found_and_not_found() {
        let (broker, _conn) = broker_with_editor(|call| match call {
            EditorCall::SearchHelp { query } if query == "textwidth" => Answer::Reply(json!({
                "success": true,
                "tag": "'textwidth'",
                "file": "options.txt",
                "line": 7011
            })),
            EditorCall::SearchHelp { .. } => Answer::Reply(json!({"success": false})),
            _ => Answer::Silent,
        })
        .await;

        let found = broker.search_help("textwidth").await.expect("found");
        assert_eq!(
            found,
            HelpLookup::Found {
                query: "textwidth".to_string(),
                tag: Some("'textwidth'".to_string()),
                file: Some("options.txt".to_string()),
                line: Some(json!(7011)),
            }
        );
        assert!(found.message().contains("File: options.txt"));

        let missing = broker.search_help("nonsense").await.expect("not found");
        assert_eq!(
            missing,
            HelpLookup::NotFound {
                query: "nonsense".to_string()
            }
        );
        assert!(matches!(
            broker.search_help("  ").await,
            Err(BrokerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn macro_recording_validates_register_and_maps_failures() {
        let (broker, _conn) = broker_with_editor(|call| match call {
            EditorCall::RecordMacro {
                register, execute, ..
            } if register == "q" => {
                assert!(*execute);
                Answer::Reply(json!({"success": true, "output": "3 lines changed"}))
            }
            EditorCall::RecordMacro { register, .. } if register == "a" => {
                Answer::Reply(json!({"success": false, "error": "E354: Invalid register"}))
            }
            EditorCall::RecordMacro { .. } => Answer::Fail("recording interrupted"),
            _ => Answer::Silent,
        })
        .await;

        let recorded = broker.record_macro("0gUwj", None, None).await.expect("recorded");
        assert_eq!(
            recorded.message(),
            "Macro recorded in register \"q\" and executed\nSequence: 0gUwj\n3 lines changed"
        );

        assert_eq!(
            broker.record_macro("dd", Some("a"), Some(false)).await,
            Err(BrokerError::RemoteError("E354: Invalid register".to_string()))
        );
        assert_eq!(
            broker.record_macro("dd", Some("b"), None).await,
            Err(BrokerError::RemoteError("recording interrupted".to_string()))
        );
        for bad in ["", "ab", "@", "é"] {
            assert!(matches!(
                broker.record_macro("dd", Some(bad), None).await,
                Err(BrokerError::InvalidArgument(_))
            ));
        }
    }

    #[tokio::test]
    async fn shutdown_closes_connections_and_clears_snapshot() {
        let store = Arc::new(MemoryStore::default());
        let broker = Broker::new(test_config(), store.clone());
        let (tx, _rx) = mpsc::channel(4);
        let conn = Arc::new(EditorConnection::new(1, tx));
        broker
            .registry()
            .register("vim-a", InstanceInfo::default(), conn.clone())
            .await;
        assert_eq!(store.saved_ids(), vec!["vim-a"]);

        broker.shutdown().await;
        assert!(conn.is_closed());
        assert!(store.saved_ids().is_empty());
        assert_eq!(store.saved_preference().as_deref(), Some("vim-a"));
    }
}
