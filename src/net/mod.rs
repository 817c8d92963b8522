//! Remote scripting sessions: wire codec, permission flags, per-connection
//! viewer state inside the simulation, and the WebSocket transport.

pub mod client;
pub mod permissions;
pub mod protocol;
pub mod server;
pub mod session;

use bevy::prelude::*;
use crossbeam_channel::Sender;

use crate::config::{HostConfig, UserConfig};
pub use client::{ClientNotice, ScriptClient};
pub use permissions::{AdminFlags, AdminRegistry};
pub use protocol::{ClientMessage, ServerMessage};
pub use session::{
    ConnectedUsers, ConnectionId, NetEvent, NetworkInbox, ScriptAuditLog, ViewerSessions,
};

/// Feeds [`NetEvent`]s into the simulation without going through a socket.
#[derive(Resource, Clone)]
pub struct NetworkSender(pub Sender<NetEvent>);

pub struct LuaNetPlugin {
    pub bind: String,
    pub listen: bool,
    pub rate_limit_per_sec: u32,
    pub users: Vec<UserConfig>,
}

impl LuaNetPlugin {
    pub fn from_config(cfg: &HostConfig) -> Self {
        Self {
            bind: cfg.bind.clone(),
            listen: cfg.listen,
            rate_limit_per_sec: cfg.rate_limit_per_sec,
            users: cfg.users.clone(),
        }
    }
}

impl Plugin for LuaNetPlugin {
    fn build(&self, app: &mut App) {
        let (tx, rx) = crossbeam_channel::unbounded::<NetEvent>();
        let admins = AdminRegistry::from_users(&self.users).unwrap_or_else(|e| {
            error!("[LuaHost net] {e}; nobody may script this session");
            AdminRegistry::default()
        });

        app.insert_resource(admins)
            .init_resource::<ViewerSessions>()
            .init_resource::<ConnectedUsers>()
            .init_resource::<ScriptAuditLog>()
            .insert_resource(NetworkInbox(rx))
            .insert_resource(NetworkSender(tx.clone()))
            .add_systems(Update, session::process_network_events);

        if !self.listen {
            return;
        }
        let security = server::ServerSecurity::from_users(&self.users, self.rate_limit_per_sec);
        if let Err(e) = server::spawn_server(self.bind.clone(), security, tx) {
            error!("[LuaHost net] Failed to spawn network thread: {e}");
        }
    }
}
