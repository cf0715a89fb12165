use std::fmt;
use std::str::FromStr;

/// Commands that end the editor process instead of replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitVerb {
    Quit,
    QuitAll,
    WriteQuit,
    WriteQuitAll,
}

impl ExitVerb {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "q" => Some(ExitVerb::Quit),
            "qa" | "qall" => Some(ExitVerb::QuitAll),
            "wq" => Some(ExitVerb::WriteQuit),
            "wqa" | "wqall" => Some(ExitVerb::WriteQuitAll),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitVerb::Quit => "q",
            ExitVerb::QuitAll => "qall",
            ExitVerb::WriteQuit => "wq",
            ExitVerb::WriteQuitAll => "wqall",
        }
    }
}

/// An exit-class command: one recognized verb, optionally forced with `!`.
///
/// Matching is case-sensitive and token-exact: the verb must be followed by
/// end of input or whitespace, so `quit`, `qqq` and `wqrite` are not exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitCommand {
    pub verb: ExitVerb,
    pub force: bool,
}

impl ExitCommand {
    pub const QUIT_ALL: Self = Self {
        verb: ExitVerb::QuitAll,
        force: false,
    };
    pub const FORCE_QUIT_ALL: Self = Self {
        verb: ExitVerb::QuitAll,
        force: true,
    };
    pub const WRITE_QUIT_ALL: Self = Self {
        verb: ExitVerb::WriteQuitAll,
        force: false,
    };

    pub fn parse(command: &str) -> Option<Self> {
        let token = command.trim().split(char::is_whitespace).next()?;
        let (word, force) = match token.strip_suffix('!') {
            Some(word) => (word, true),
            None => (token, false),
        };
        let verb = ExitVerb::from_token(word)?;
        Some(Self { verb, force })
    }

    pub fn matches(command: &str) -> bool {
        Self::parse(command).is_some()
    }
}

impl fmt::Display for ExitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb.as_str())?;
        if self.force {
            f.write_str("!")?;
        }
        Ok(())
    }
}

/// How a guarded exit treats unsaved buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitAction {
    #[default]
    Check,
    SaveAndExit,
    ForceExit,
}

impl ExitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitAction::Check => "check",
            ExitAction::SaveAndExit => "save_and_exit",
            ExitAction::ForceExit => "force_exit",
        }
    }

    /// Command sent once the action has decided to exit.
    pub fn command(&self) -> ExitCommand {
        match self {
            ExitAction::Check => ExitCommand::QUIT_ALL,
            ExitAction::SaveAndExit => ExitCommand::WRITE_QUIT_ALL,
            ExitAction::ForceExit => ExitCommand::FORCE_QUIT_ALL,
        }
    }
}

impl fmt::Display for ExitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitAction {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "" | "check" => Ok(ExitAction::Check),
            "save_and_exit" | "save-and-exit" => Ok(ExitAction::SaveAndExit),
            "force_exit" | "force-exit" => Ok(ExitAction::ForceExit),
            other => Err(format!(
                "Invalid action '{other}'. Use: check, save_and_exit, or force_exit"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_exit_verbs_with_optional_force() {
        for command in ["q", "qa!", "wqall", "wq filename", "  qall  ", "q!", "wqa", "wq! notes.txt"] {
            assert!(ExitCommand::matches(command), "{command} should be exit-class");
        }
        assert_eq!(
            ExitCommand::parse("qa!"),
            Some(ExitCommand {
                verb: ExitVerb::QuitAll,
                force: true
            })
        );
        assert_eq!(
            ExitCommand::parse("wq filename").map(|cmd| cmd.verb),
            Some(ExitVerb::WriteQuit)
        );
    }

    #[test]
    fn rejects_lookalikes() {
        for command in ["quit", "qqq", "wqrite", "Q", "QA", "q!!", "qa!x", "", "   ", "set q", "w"] {
            assert!(!ExitCommand::matches(command), "{command:?} must not be exit-class");
        }
    }

    #[test]
    fn display_uses_canonical_spelling() {
        assert_eq!(ExitCommand::QUIT_ALL.to_string(), "qall");
        assert_eq!(ExitCommand::FORCE_QUIT_ALL.to_string(), "qall!");
        assert_eq!(ExitCommand::WRITE_QUIT_ALL.to_string(), "wqall");
        assert_eq!(ExitCommand::parse("qa").map(|c| c.to_string()), Some("qall".to_string()));
    }

    #[test]
    fn exit_action_parses_and_maps_to_commands() {
        assert_eq!("check".parse::<ExitAction>(), Ok(ExitAction::Check));
        assert_eq!(" Force_Exit ".parse::<ExitAction>(), Ok(ExitAction::ForceExit));
        assert_eq!("save_and_exit".parse::<ExitAction>(), Ok(ExitAction::SaveAndExit));
        assert!("shutdown".parse::<ExitAction>().is_err());

        assert_eq!(ExitAction::Check.command().to_string(), "qall");
        assert_eq!(ExitAction::SaveAndExit.command().to_string(), "wqall");
        assert_eq!(ExitAction::ForceExit.command().to_string(), "qall!");
    }
}
