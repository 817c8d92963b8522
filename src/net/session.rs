//! Per-connection scripting sessions: who may script, who is viewing which
//! environment, and the replies pushed back to viewers.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use bevy::prelude::*;
use crossbeam_channel::Receiver;
use tokio::sync::mpsc::UnboundedSender;

use super::permissions::AdminRegistry;
use super::protocol::{ClientMessage, ServerMessage, MAX_LISTED_ENVIRONMENTS};
use crate::scripting::render::{self, NO_ENVIRONMENT_DATA, NO_RETURN_VALUE};
use crate::scripting::with_environments;

pub type ConnectionId = u64;

const MAX_AUDIT_ENTRIES: usize = 256;

/// Bidirectional viewer bookkeeping. Pairs are only ever inserted and removed
/// through this type, so both maps always agree.
#[derive(Resource, Default, Debug)]
pub struct ViewerSessions {
    by_connection: BTreeMap<ConnectionId, BTreeSet<String>>,
    by_environment: BTreeMap<String, BTreeSet<ConnectionId>>,
}

impl ViewerSessions {
    pub fn add(&mut self, conn: ConnectionId, env: &str) -> bool {
        let added = self
            .by_connection
            .entry(conn)
            .or_default()
            .insert(env.to_string());
        self.by_environment
            .entry(env.to_string())
            .or_default()
            .insert(conn);
        added
    }

    pub fn remove(&mut self, conn: ConnectionId, env: &str) -> bool {
        let removed = remove_pair(&mut self.by_connection, &conn, env);
        remove_pair(&mut self.by_environment, env, &conn);
        removed
    }

    pub fn is_viewing(&self, conn: ConnectionId, env: &str) -> bool {
        self.by_connection
            .get(&conn)
            .is_some_and(|envs| envs.contains(env))
    }

    pub fn viewers(&self, env: &str) -> Vec<ConnectionId> {
        self.by_environment
            .get(env)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn viewing(&self, conn: ConnectionId) -> Vec<String> {
        self.by_connection
            .get(&conn)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every viewer of `env`, returning who was watching.
    pub fn evict_environment(&mut self, env: &str) -> Vec<ConnectionId> {
        let viewers = self.by_environment.remove(env).unwrap_or_default();
        for conn in &viewers {
            remove_pair(&mut self.by_connection, conn, env);
        }
        viewers.into_iter().collect()
    }

    /// Drops every environment `conn` was viewing.
    pub fn disconnect(&mut self, conn: ConnectionId) -> Vec<String> {
        let envs = self.by_connection.remove(&conn).unwrap_or_default();
        for env in &envs {
            remove_pair(&mut self.by_environment, env.as_str(), &conn);
        }
        envs.into_iter().collect()
    }

    pub fn is_consistent(&self) -> bool {
        let forward = self
            .by_connection
            .iter()
            .all(|(conn, envs)| {
                !envs.is_empty()
                    && envs.iter().all(|env| {
                        self.by_environment
                            .get(env)
                            .is_some_and(|c| c.contains(conn))
                    })
            });
        let inverse = self
            .by_environment
            .iter()
            .all(|(env, conns)| {
                !conns.is_empty()
                    && conns.iter().all(|conn| {
                        self.by_connection
                            .get(conn)
                            .is_some_and(|e| e.contains(env))
                    })
            });
        forward && inverse
    }
}

fn remove_pair<K, V, Q, R>(map: &mut BTreeMap<K, BTreeSet<V>>, key: &Q, value: &R) -> bool
where
    K: Ord + Borrow<Q>,
    Q: Ord + ?Sized,
    V: Ord + Borrow<R>,
    R: Ord + ?Sized,
{
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(value);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}

pub struct Connection {
    pub user: String,
    pub outbox: UnboundedSender<ServerMessage>,
}

#[derive(Resource, Default)]
pub struct ConnectedUsers {
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectedUsers {
    pub fn insert(&mut self, conn: ConnectionId, user: String, outbox: UnboundedSender<ServerMessage>) {
        self.connections.insert(conn, Connection { user, outbox });
    }

    pub fn remove(&mut self, conn: ConnectionId) -> Option<Connection> {
        self.connections.remove(&conn)
    }

    pub fn user(&self, conn: ConnectionId) -> Option<&str> {
        self.connections.get(&conn).map(|c| c.user.as_str())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn send(&self, conn: ConnectionId, message: ServerMessage) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        if connection.outbox.send(message).is_err() {
            debug!("[LuaHost net] Outbox for connection {conn} is closed");
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuditOutcome {
    Accepted,
    Denied,
    Dropped(&'static str),
}

#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub conn: ConnectionId,
    pub user: String,
    pub request: &'static str,
    pub environment: Option<String>,
    pub outcome: AuditOutcome,
}

/// Most recent session decisions, oldest first.
#[derive(Resource, Default, Debug)]
pub struct ScriptAuditLog {
    pub entries: VecDeque<AuditEntry>,
}

impl ScriptAuditLog {
    pub fn push(&mut self, entry: AuditEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > MAX_AUDIT_ENTRIES {
            self.entries.pop_front();
        }
    }

    pub fn last(&self) -> Option<&AuditEntry> {
        self.entries.back()
    }
}

/// Traffic forwarded from the transport thread into the simulation.
pub enum NetEvent {
    Connected {
        conn: ConnectionId,
        user: String,
        outbox: UnboundedSender<ServerMessage>,
    },
    Message {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Disconnected {
        conn: ConnectionId,
    },
}

#[derive(Resource)]
pub struct NetworkInbox(pub Receiver<NetEvent>);

pub fn process_network_events(world: &mut World) {
    let events: Vec<NetEvent> = match world.get_resource::<NetworkInbox>() {
        Some(inbox) => inbox.0.try_iter().collect(),
        None => return,
    };
    for event in events {
        match event {
            NetEvent::Connected { conn, user, outbox } => {
                info!("[LuaHost net] {user} connected as #{conn}");
                world
                    .resource_mut::<ConnectedUsers>()
                    .insert(conn, user, outbox);
            }
            NetEvent::Message { conn, message } => handle_client_message(world, conn, message),
            NetEvent::Disconnected { conn } => disconnect(world, conn),
        }
    }
}

pub fn disconnect(world: &mut World, conn: ConnectionId) {
    let dropped = world.resource_mut::<ViewerSessions>().disconnect(conn);
    if let Some(connection) = world.resource_mut::<ConnectedUsers>().remove(conn) {
        info!(
            "[LuaHost net] {} disconnected (#{conn}), closed {} view(s)",
            connection.user,
            dropped.len()
        );
    }
}

/// Authorizes and applies one request. Rejected requests never get a reply.
pub fn handle_client_message(world: &mut World, conn: ConnectionId, message: ClientMessage) {
    let Some(user) = world
        .resource::<ConnectedUsers>()
        .user(conn)
        .map(str::to_string)
    else {
        warn!("[LuaHost net] Dropping {} from unknown connection #{conn}", message.kind());
        return;
    };
    let request = message.kind();
    let environment = message.environment().map(str::to_string);

    let authorized = world
        .get_resource::<AdminRegistry>()
        .is_some_and(|admins| admins.can_script(&user));
    let outcome = if authorized {
        apply(world, conn, &user, message)
    } else {
        warn!("[LuaHost net] {user} attempted '{request}' without scripting permission");
        AuditOutcome::Denied
    };

    if let AuditOutcome::Dropped(reason) = &outcome {
        debug!("[LuaHost net] Dropped '{request}' from {user}: {reason}");
    }
    world.resource_mut::<ScriptAuditLog>().push(AuditEntry {
        conn,
        user,
        request,
        environment,
        outcome,
    });
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

fn apply(world: &mut World, conn: ConnectionId, user: &str, message: ClientMessage) -> AuditOutcome {
    match message {
        ClientMessage::ListEnvironmentsRequest => {
            let Some(mut names) = with_environments(world, |_, envs| envs.names()) else {
                return AuditOutcome::Dropped("scripting unavailable");
            };
            if names.len() > MAX_LISTED_ENVIRONMENTS {
                warn!(
                    "[LuaHost net] Listing {} of {} environments for {user}",
                    MAX_LISTED_ENVIRONMENTS,
                    names.len()
                );
                names.truncate(MAX_LISTED_ENVIRONMENTS);
            }
            world
                .resource::<ConnectedUsers>()
                .send(conn, ServerMessage::ListEnvironments { names });
            AuditOutcome::Accepted
        }
        ClientMessage::RequestCreateEnvironment { name } => {
            if is_blank(&name) {
                return AuditOutcome::Dropped("blank name");
            }
            match with_environments(world, |_, envs| envs.create_environment(&name)) {
                Some(true) => AuditOutcome::Accepted,
                Some(false) => AuditOutcome::Dropped("name taken"),
                None => AuditOutcome::Dropped("scripting unavailable"),
            }
        }
        ClientMessage::RequestDeleteEnvironment { name } => {
            if is_blank(&name) {
                return AuditOutcome::Dropped("blank name");
            }
            if with_environments(world, |_, envs| envs.contains(&name)) != Some(true) {
                return AuditOutcome::Dropped("unknown environment");
            }
            let viewers = world.resource_mut::<ViewerSessions>().evict_environment(&name);
            {
                let users = world.resource::<ConnectedUsers>();
                for viewer in viewers {
                    users.send(viewer, ServerMessage::EnvironmentDeleted { name: name.clone() });
                }
            }
            with_environments(world, |_, envs| envs.delete_environment(&name));
            info!("[LuaHost net] {user} deleted environment '{name}'");
            AuditOutcome::Accepted
        }
        ClientMessage::ViewEnvironment { name } => {
            if is_blank(&name) {
                return AuditOutcome::Dropped("blank name");
            }
            let Some(Some(state)) = with_environments(world, |_, envs| envs.environment_state(&name))
            else {
                return AuditOutcome::Dropped("unknown environment");
            };
            world.resource_mut::<ViewerSessions>().add(conn, &name);
            world
                .resource::<ConnectedUsers>()
                .send(conn, ServerMessage::ConfirmView { name, state });
            AuditOutcome::Accepted
        }
        ClientMessage::EndViewEnvironment { name } => {
            if world.resource_mut::<ViewerSessions>().remove(conn, &name) {
                AuditOutcome::Accepted
            } else {
                AuditOutcome::Dropped("not viewing")
            }
        }
        ClientMessage::ScriptExecute { env_name, source } => {
            if is_blank(&env_name) || is_blank(&source) {
                return AuditOutcome::Dropped("blank request");
            }
            if !world.resource::<ViewerSessions>().is_viewing(conn, &env_name) {
                warn!("[LuaHost net] {user} executed in '{env_name}' without viewing it");
                return AuditOutcome::Dropped("not viewing");
            }
            let outcome = with_environments(world, |world, envs| {
                let result = match envs.exec_in_environment(world, &env_name, &source)? {
                    Ok(values) => {
                        render::render_values(&values).unwrap_or_else(|| NO_RETURN_VALUE.to_string())
                    }
                    Err(e) => render::error_text(&e),
                };
                let state = envs
                    .environment_state(&env_name)
                    .unwrap_or_else(|| NO_ENVIRONMENT_DATA.to_string());
                Some((state, result))
            });
            let Some(Some((state, result))) = outcome else {
                return AuditOutcome::Dropped("unknown environment");
            };
            info!("[LuaHost net] {user} ran script in '{env_name}': {result}");
            let viewers = world.resource::<ViewerSessions>().viewers(&env_name);
            let users = world.resource::<ConnectedUsers>();
            for viewer in viewers {
                users.send(
                    viewer,
                    ServerMessage::ScriptState {
                        env_name: env_name.clone(),
                        state: state.clone(),
                        result: result.clone(),
                    },
                );
            }
            AuditOutcome::Accepted
        }
    }
}
