/// What a line typed at the prompt asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    Quit,
    ChooseUsername(String),
    Send(String),
    ShowWho,
    Help,
}

pub const HELP: &str = "commands: /name <username>, /who, /help, /quit. Anything else is sent as a message.";

/// Parse one line of input. Until a username is chosen, a bare line is
/// taken as the username.
pub fn parse_line(line: &str, has_username: bool) -> Action {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(command) = line.strip_prefix('/') else {
        if line.trim().is_empty() {
            return Action::None;
        }
        return if has_username {
            Action::Send(line.to_string())
        } else {
            Action::ChooseUsername(line.trim().to_string())
        };
    };

    let parts: Vec<&str> = command.splitn(2, ' ').collect();
    match parts[0] {
        "quit" | "q" => Action::Quit,
        "who" => Action::ShowWho,
        "help" | "h" => Action::Help,
        "name" => match parts.get(1).map(|name| name.trim()) {
            Some(name) if !name.is_empty() => Action::ChooseUsername(name.to_string()),
            _ => Action::Help,
        },
        // "//text" sends a message starting with a slash
        _ if command.starts_with('/') => {
            if has_username {
                Action::Send(command.to_string())
            } else {
                Action::None
            }
        }
        _ => Action::Help,
    }
}
