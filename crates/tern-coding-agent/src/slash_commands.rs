use crate::hooks::types::HookCommand;

/// Source of a slash command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlashCommandSource {
    Hook,
    Builtin,
}

/// Slash command metadata for dispatch and completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashCommandInfo {
    pub name: String,
    pub description: Option<String>,
    pub source: SlashCommandSource,
    /// Prompt text the command expands to, if it is a prompt command.
    pub expansion: Option<String>,
}

/// Built-in commands. These are UI commands with no prompt expansion.
pub fn builtin_slash_commands() -> Vec<SlashCommandInfo> {
    let commands = [
        ("model", "Select model"),
        ("thinking", "Set thinking level"),
        ("session", "Show session info and stats"),
        ("name", "Set session display name"),
        ("branch", "Branch from a previous message"),
        ("tree", "Navigate the session tree"),
        ("compact", "Manually compact context"),
        ("new", "Start a new session"),
        ("resume", "Resume another session"),
        ("login", "Login provider"),
        ("logout", "Logout provider"),
        ("quit", "Quit"),
    ];

    commands
        .into_iter()
        .map(|(name, description)| SlashCommandInfo {
            name: name.to_string(),
            description: Some(description.to_string()),
            source: SlashCommandSource::Builtin,
            expansion: None,
        })
        .collect()
}

/// The dispatch table: hook commands first, then built-ins. A hook command
/// shadowing a built-in name wins.
pub fn command_table(hook_commands: &[HookCommand]) -> Vec<SlashCommandInfo> {
    let mut table: Vec<SlashCommandInfo> = hook_commands
        .iter()
        .map(|c| SlashCommandInfo {
            name: c.name.clone(),
            description: c.description.clone(),
            source: SlashCommandSource::Hook,
            expansion: c.expansion.clone(),
        })
        .collect();

    for builtin in builtin_slash_commands() {
        if !table.iter().any(|c| c.name == builtin.name) {
            table.push(builtin);
        }
    }
    table
}

/// Expand `/name args` into the command's prompt text. Returns `None` when
/// the input is not a slash command or the command has no expansion.
pub fn expand_slash_command(input: &str, table: &[SlashCommandInfo]) -> Option<String> {
    let rest = input.strip_prefix('/')?;
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest.trim(), ""),
    };

    let command = table.iter().find(|c| c.name == name)?;
    let expansion = command.expansion.as_ref()?;

    if args.is_empty() {
        Some(expansion.clone())
    } else {
        Some(format!("{expansion}\n\n{args}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook_command(name: &str, expansion: Option<&str>) -> HookCommand {
        HookCommand {
            name: name.to_string(),
            description: None,
            expansion: expansion.map(String::from),
        }
    }

    #[test]
    fn builtins_contain_compact() {
        assert!(builtin_slash_commands().iter().any(|c| c.name == "compact"));
    }

    #[test]
    fn hook_commands_shadow_builtins() {
        let table = command_table(&[hook_command("compact", Some("Summarize aggressively"))]);
        let first = table.iter().find(|c| c.name == "compact").unwrap();
        assert_eq!(first.source, SlashCommandSource::Hook);
    }

    #[test]
    fn expansion_appends_arguments() {
        let table = command_table(&[hook_command("review", Some("Review the current diff."))]);
        assert_eq!(
            expand_slash_command("/review", &table).as_deref(),
            Some("Review the current diff.")
        );
        assert_eq!(
            expand_slash_command("/review focus on tests", &table).as_deref(),
            Some("Review the current diff.\n\nfocus on tests")
        );
    }

    #[test]
    fn non_commands_pass_through() {
        let table = command_table(&[]);
        assert!(expand_slash_command("hello /world", &table).is_none());
        // Built-in UI commands have no expansion.
        assert!(expand_slash_command("/model", &table).is_none());
    }
}
