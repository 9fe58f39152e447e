//! Line-oriented operator console: `SET`, `LIST`, `CLEAR`, `HELP`.

use thiserror::Error;

use crate::address::DeviceAddress;
use crate::eeprom::Eeprom;
use crate::registry::{name_input, NameRegistry, RegistryError, Upsert};

const HELP_LINES: [&str; 4] = [
    " SET <address> <name>   name the sensor with a 16 hex char address",
    " LIST                   list stored names",
    " CLEAR                  erase every stored name",
    " HELP                   show this text",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Set {
        address: DeviceAddress,
        name: &'a str,
    },
    List,
    Clear,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Unknown cmd: '{0}'")]
    Unknown(String),
    #[error("Could not parse address: '{0}'")]
    BadAddress(String),
    #[error("Missing name")]
    MissingName,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleReply {
    pub lines: Vec<String>,
    /// Set when the stored table changed and live names need refreshing.
    pub names_changed: bool,
}

impl ConsoleReply {
    fn line(line: impl Into<String>) -> Self {
        Self {
            lines: vec![line.into()],
            names_changed: false,
        }
    }

    fn changed(mut self) -> Self {
        self.names_changed = true;
        self
    }
}

/// Returns `None` for blank lines.
pub fn parse_command(line: &str) -> Option<Result<Command<'_>, CommandError>> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    if line.trim().is_empty() {
        return None;
    }

    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));

    let command = match cmd {
        "SET" => parse_set(rest),
        "LIST" => Ok(Command::List),
        "CLEAR" => Ok(Command::Clear),
        "HELP" => Ok(Command::Help),
        other => Err(CommandError::Unknown(other.to_string())),
    };

    Some(command)
}

fn parse_set(args: &str) -> Result<Command<'_>, CommandError> {
    let (address, name) = args.split_once(' ').unwrap_or((args, ""));

    let address = address
        .parse::<DeviceAddress>()
        .map_err(|_| CommandError::BadAddress(address.to_string()))?;
    let name = name_input(name).map_err(|_| CommandError::MissingName)?;

    Ok(Command::Set { address, name })
}

pub fn execute<E: Eeprom>(registry: &mut NameRegistry<E>, command: Command<'_>) -> ConsoleReply {
    match command {
        Command::Set { address, name } => match registry.add_or_update(&address, name) {
            Ok(Upsert::Appended { index }) => {
                ConsoleReply::line(format!("OK Address not found, appended at index {index}"))
                    .changed()
            }
            Ok(Upsert::Updated { index }) => {
                ConsoleReply::line(format!("OK Updated index {index}")).changed()
            }
            Err(RegistryError::Full { capacity }) => {
                ConsoleReply::line(format!("ERROR Registry full ({capacity} slots)"))
            }
            Err(err) => ConsoleReply::line(format!("ERROR {err}")),
        },
        Command::List => {
            let table = registry.load();
            let mut lines = Vec::with_capacity(table.count() + 2);
            lines.push(format!("OK {} found", table.count()));
            lines.push(" Index;Address;Name".to_string());
            lines.extend(table.render_listing().iter().map(|row| format!(" {row}")));
            ConsoleReply {
                lines,
                names_changed: false,
            }
        }
        Command::Clear => match registry.clear() {
            Ok(()) => ConsoleReply::line("OK Cleared").changed(),
            Err(err) => ConsoleReply::line(format!("ERROR {err}")),
        },
        Command::Help => {
            let mut lines = vec!["OK Commands:".to_string()];
            lines.extend(HELP_LINES.iter().map(|line| line.to_string()));
            ConsoleReply {
                lines,
                names_changed: false,
            }
        }
    }
}

pub fn handle_line<E: Eeprom>(registry: &mut NameRegistry<E>, line: &str) -> ConsoleReply {
    match parse_command(line) {
        None => ConsoleReply::default(),
        Some(Ok(command)) => execute(registry, command),
        Some(Err(err)) => ConsoleReply::line(format!("ERROR {err}")),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::RegistryLayout;
    use crate::eeprom::MemoryEeprom;

    fn registry() -> NameRegistry<MemoryEeprom> {
        NameRegistry::new(MemoryEeprom::new(512), RegistryLayout::default()).unwrap()
    }

    #[test]
    fn set_then_list() {
        let mut registry = registry();

        let reply = handle_line(&mut registry, "SET 281A2B030000800C fridge\r\n");
        assert_eq!(
            reply.lines,
            vec!["OK Address not found, appended at index 0".to_string()]
        );
        assert!(reply.names_changed);

        let reply = handle_line(&mut registry, "SET 281a2b030000800c kitchen fridge\n");
        assert_eq!(reply.lines, vec!["OK Updated index 0".to_string()]);

        let reply = handle_line(&mut registry, "LIST\n");
        assert_eq!(
            reply.lines,
            vec![
                "OK 1 found".to_string(),
                " Index;Address;Name".to_string(),
                " 0;281A2B030000800C;kitchen f".to_string(),
            ]
        );
        assert!(!reply.names_changed);
    }

    #[test]
    fn unknown_command_is_reported() {
        let mut registry = registry();
        let reply = handle_line(&mut registry, "DELETE 281A2B030000800C\n");
        assert_eq!(reply.lines, vec!["ERROR Unknown cmd: 'DELETE'".to_string()]);

        let reply = handle_line(&mut registry, "list\n");
        assert_eq!(reply.lines, vec!["ERROR Unknown cmd: 'list'".to_string()]);
    }

    #[test]
    fn malformed_address_leaves_registry_untouched() {
        let mut registry = registry();

        let reply = handle_line(&mut registry, "SET 281A2B fridge");
        assert_eq!(
            reply.lines,
            vec!["ERROR Could not parse address: '281A2B'".to_string()]
        );

        let reply = handle_line(&mut registry, "SET 281A2B030000800G fridge");
        assert_eq!(
            reply.lines,
            vec!["ERROR Could not parse address: '281A2B030000800G'".to_string()]
        );

        assert!(registry.eeprom().as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn set_requires_a_name() {
        let mut registry = registry();
        assert_eq!(
            parse_command("SET 281A2B030000800C\r\n"),
            Some(Err(CommandError::MissingName))
        );
        let reply = handle_line(&mut registry, "SET 281A2B030000800C   ");
        assert_eq!(reply.lines, vec!["ERROR Missing name".to_string()]);
    }

    #[test]
    fn full_registry_message() {
        let layout = RegistryLayout {
            max_slots: 2,
            name_capacity: 10,
        };
        let mut registry = NameRegistry::new(MemoryEeprom::new(64), layout).unwrap();

        handle_line(&mut registry, "SET 2800000000000001 a");
        handle_line(&mut registry, "SET 2800000000000002 b");
        let reply = handle_line(&mut registry, "SET 2800000000000003 c");

        assert_eq!(
            reply.lines,
            vec!["ERROR Registry full (2 slots)".to_string()]
        );
        assert!(!reply.names_changed);
        assert_eq!(registry.load().count(), 2);
    }

    #[test]
    fn clear_and_help() {
        let mut registry = registry();
        handle_line(&mut registry, "SET 2800000000000001 a");

        let reply = handle_line(&mut registry, "CLEAR");
        assert_eq!(reply.lines, vec!["OK Cleared".to_string()]);
        assert!(reply.names_changed);
        assert_eq!(registry.load().count(), 0);

        let reply = handle_line(&mut registry, "HELP");
        assert_eq!(reply.lines[0], "OK Commands:");
        assert_eq!(reply.lines.len(), 5);
    }

    #[test]
    fn blank_lines_produce_nothing() {
        let mut registry = registry();
        assert_eq!(parse_command("\r\n"), None);
        assert_eq!(handle_line(&mut registry, ""), ConsoleReply::default());
    }
}
