//! Client half of the scripting session: console commands, open consoles per
//! environment, and how server pushes update them. Transport-agnostic; callers
//! ship the returned [`ClientMessage`]s however they like.

use std::collections::BTreeMap;

use super::permissions::AdminFlags;
use super::protocol::{ClientMessage, ServerMessage};
use crate::error::CommandError;

pub type ConsoleId = u64;

#[derive(Clone, Debug, PartialEq)]
pub struct Console {
    pub id: ConsoleId,
    pub env: String,
    pub state: String,
    pub output: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClientNotice {
    Environments(Vec<String>),
    ConsoleOpened { console: ConsoleId, env: String },
    ConsoleUpdated { console: ConsoleId, env: String },
    ConsoleClosed { console: ConsoleId, env: String },
}

#[derive(Default)]
pub struct ScriptClient {
    flags: AdminFlags,
    consoles: BTreeMap<ConsoleId, Console>,
    next_console: ConsoleId,
}

impl ScriptClient {
    pub fn new(flags: AdminFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    pub fn set_flags(&mut self, flags: AdminFlags) {
        self.flags = flags;
    }

    pub fn can_script(&self) -> bool {
        self.flags.can_script()
    }

    pub fn console(&self, id: ConsoleId) -> Option<&Console> {
        self.consoles.get(&id)
    }

    pub fn consoles_for(&self, env: &str) -> Vec<ConsoleId> {
        self.consoles
            .values()
            .filter(|c| c.env == env)
            .map(|c| c.id)
            .collect()
    }

    /// Parses `lua <env>`, `lualist`, `luanew <env>` or `luadel <env>`.
    pub fn command(&self, line: &str) -> Result<ClientMessage, CommandError> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        match command {
            "lua" | "lualist" | "luanew" | "luadel" => self.require_permission()?,
            other => return Err(CommandError::UnknownCommand(other.to_string())),
        }
        if command == "lualist" {
            return Ok(ClientMessage::ListEnvironmentsRequest);
        }
        let [env] = args.as_slice() else {
            return Err(CommandError::Usage(command.to_string()));
        };
        let name = env.to_string();
        Ok(match command {
            "lua" => ClientMessage::ViewEnvironment { name },
            "luanew" => ClientMessage::RequestCreateEnvironment { name },
            _ => ClientMessage::RequestDeleteEnvironment { name },
        })
    }

    /// Source submitted from a console. Blank source sends nothing.
    pub fn execute(
        &self,
        console: ConsoleId,
        source: &str,
    ) -> Result<Option<ClientMessage>, CommandError> {
        self.require_permission()?;
        let console = self
            .consoles
            .get(&console)
            .ok_or(CommandError::UnknownConsole(console))?;
        if source.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(ClientMessage::ScriptExecute {
            env_name: console.env.clone(),
            source: source.to_string(),
        }))
    }

    /// Closing the last console of an environment stops viewing it.
    pub fn close_console(&mut self, console: ConsoleId) -> Option<ClientMessage> {
        let closed = self.consoles.remove(&console)?;
        if !self.consoles_for(&closed.env).is_empty() {
            return None;
        }
        Some(ClientMessage::EndViewEnvironment { name: closed.env })
    }

    pub fn receive(&mut self, message: ServerMessage) -> Vec<ClientNotice> {
        match message {
            ServerMessage::ListEnvironments { names } => vec![ClientNotice::Environments(names)],
            ServerMessage::ConfirmView { name, state } => {
                let id = self.next_console;
                self.next_console += 1;
                self.consoles.insert(
                    id,
                    Console {
                        id,
                        env: name.clone(),
                        state,
                        output: Vec::new(),
                    },
                );
                vec![ClientNotice::ConsoleOpened {
                    console: id,
                    env: name,
                }]
            }
            ServerMessage::ScriptState {
                env_name,
                state,
                result,
            } => self
                .consoles
                .values_mut()
                .filter(|c| c.env == env_name)
                .map(|c| {
                    c.state = state.clone();
                    if !result.is_empty() {
                        c.output.extend(result.lines().map(str::to_string));
                    }
                    ClientNotice::ConsoleUpdated {
                        console: c.id,
                        env: env_name.clone(),
                    }
                })
                .collect(),
            ServerMessage::EnvironmentDeleted { name } => {
                let closed = self.consoles_for(&name);
                closed
                    .into_iter()
                    .filter_map(|id| self.consoles.remove(&id))
                    .map(|c| ClientNotice::ConsoleClosed {
                        console: c.id,
                        env: c.env,
                    })
                    .collect()
            }
        }
    }

    fn require_permission(&self) -> Result<(), CommandError> {
        if self.can_script() {
            Ok(())
        } else {
            Err(CommandError::NoPermission)
        }
    }
}
