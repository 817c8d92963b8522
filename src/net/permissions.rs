use std::collections::HashMap;

use bevy::prelude::*;

use crate::config::UserConfig;
use crate::error::ConfigError;

bitflags::bitflags! {
    /// Administrative permission bits held by a connected user.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AdminFlags: u32 {
        const DEBUG = 1 << 0;
        const FUN = 1 << 1;
        const HOST = 1 << 2;
    }
}

impl AdminFlags {
    /// Case-insensitive flag name from configuration.
    pub fn parse(name: &str) -> Option<Self> {
        Self::from_name(&name.trim().to_ascii_uppercase())
    }

    pub fn can_script(self) -> bool {
        self.contains(Self::DEBUG | Self::FUN)
    }
}

/// Current flags per user name. Consulted on every session request, so
/// grants and revocations apply from the next message onward.
#[derive(Resource, Default, Debug)]
pub struct AdminRegistry {
    users: HashMap<String, AdminFlags>,
}

impl AdminRegistry {
    pub fn from_users(users: &[UserConfig]) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for user in users {
            registry.set(&user.name, user.admin_flags()?);
        }
        Ok(registry)
    }

    pub fn flags(&self, user: &str) -> AdminFlags {
        self.users.get(user).copied().unwrap_or_default()
    }

    pub fn can_script(&self, user: &str) -> bool {
        self.flags(user).can_script()
    }

    pub fn set(&mut self, user: &str, flags: AdminFlags) {
        self.users.insert(user.to_string(), flags);
    }

    pub fn grant(&mut self, user: &str, flags: AdminFlags) {
        let current = self.flags(user);
        self.set(user, current | flags);
    }

    pub fn revoke(&mut self, user: &str, flags: AdminFlags) {
        if let Some(current) = self.users.get_mut(user) {
            current.remove(flags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripting_needs_both_debug_and_fun() {
        assert!(!AdminFlags::DEBUG.can_script());
        assert!(!AdminFlags::FUN.can_script());
        assert!(!(AdminFlags::HOST | AdminFlags::FUN).can_script());
        assert!((AdminFlags::DEBUG | AdminFlags::FUN).can_script());
        assert_eq!(AdminFlags::parse(" Debug "), Some(AdminFlags::DEBUG));
        assert_eq!(AdminFlags::parse("fun"), Some(AdminFlags::FUN));
        assert_eq!(AdminFlags::parse("root"), None);
        assert_eq!(AdminFlags::default(), AdminFlags::empty());
    }

    #[test]
    fn registry_tracks_grants_and_revocations() {
        let users = vec![UserConfig {
            name: "alice".to_string(),
            token: "t".to_string(),
            flags: vec!["debug".to_string(), "fun".to_string()],
        }];
        let mut registry = AdminRegistry::from_users(&users).expect("valid flags");
        assert!(registry.can_script("alice"));
        assert!(!registry.can_script("bob"));

        registry.revoke("alice", AdminFlags::FUN);
        assert!(!registry.can_script("alice"));
        assert_eq!(registry.flags("alice"), AdminFlags::DEBUG);

        registry.grant("bob", AdminFlags::DEBUG | AdminFlags::FUN);
        assert!(registry.can_script("bob"));
    }

    #[test]
    fn unknown_flag_names_fail_registry_build() {
        let users = vec![UserConfig {
            name: "carol".to_string(),
            token: "t".to_string(),
            flags: vec!["wizard".to_string()],
        }];
        assert!(matches!(
            AdminRegistry::from_users(&users),
            Err(ConfigError::UnknownFlag { .. })
        ));
    }
}
