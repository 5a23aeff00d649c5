//! Guild cache
//!
//! Built from gateway dispatches and shared by the event source (previous
//! timeout values, guild names) and the platform (availability, role
//! hierarchy). Members the gateway has not shown us yet are simply absent:
//! the gateway requests every guild's member list after `GUILD_CREATE`, and
//! the platform fetches stragglers on demand.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use modsync_core::{GuildId, GuildRef, RoleId, UserId};

use crate::api;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRole {
    pub position: i64,
    pub permissions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedMember {
    pub roles: Vec<RoleId>,
    pub communication_disabled_until: Option<DateTime<Utc>>,
}

impl From<&api::Member> for CachedMember {
    fn from(member: &api::Member) -> Self {
        Self {
            roles: member.roles.clone(),
            communication_disabled_until: member.communication_disabled_until,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedGuild {
    pub id: GuildId,
    pub name: Option<String>,
    pub owner_id: Option<UserId>,
    pub available: bool,
    pub roles: HashMap<RoleId, CachedRole>,
    pub members: HashMap<UserId, CachedMember>,
}

impl CachedGuild {
    fn pending(id: GuildId) -> Self {
        Self {
            id,
            name: None,
            owner_id: None,
            available: false,
            roles: HashMap::new(),
            members: HashMap::new(),
        }
    }

    fn set_roles(&mut self, roles: &[api::Role]) {
        self.roles = roles
            .iter()
            .map(|role| {
                (
                    role.id,
                    CachedRole {
                        position: role.position,
                        permissions: role.permission_bits(),
                    },
                )
            })
            .collect();
    }
}

/// How long a ban we issued is expected to come back as `GUILD_BAN_ADD`
pub const OWN_BAN_WINDOW: Duration = Duration::from_secs(30);

/// The member's previous state is unknown: neither the member nor the guild was cached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotCached;

/// Shared view of the connected guilds
#[derive(Debug, Default)]
pub struct GuildCache {
    bot_user: Mutex<Option<UserId>>,
    guilds: Mutex<HashMap<GuildId, CachedGuild>>,
    /// Bans issued by this process, awaiting their gateway event
    own_bans: Mutex<HashMap<(GuildId, UserId), Instant>>,
}

impl GuildCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn guilds(&self) -> MutexGuard<'_, HashMap<GuildId, CachedGuild>> {
        self.guilds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_bot_user(&self, id: UserId) {
        *self
            .bot_user
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id);
    }

    pub fn bot_user(&self) -> Option<UserId> {
        *self
            .bot_user
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register the guilds announced by `READY`; they stay unavailable until `GUILD_CREATE`
    pub fn register_pending(&self, ids: impl IntoIterator<Item = GuildId>) {
        let mut guilds = self.guilds();
        for id in ids {
            guilds.entry(id).or_insert_with(|| CachedGuild::pending(id));
        }
    }

    /// Full guild state from `GUILD_CREATE`
    pub fn upsert_guild(&self, guild: &api::Guild) {
        let mut guilds = self.guilds();
        let entry = guilds
            .entry(guild.id)
            .or_insert_with(|| CachedGuild::pending(guild.id));

        if guild.unavailable == Some(true) {
            entry.available = false;
            return;
        }

        entry.available = true;
        if guild.name.is_some() {
            entry.name = guild.name.clone();
        }
        if guild.owner_id.is_some() {
            entry.owner_id = guild.owner_id;
        }
        entry.set_roles(&guild.roles);
        for member in &guild.members {
            if let Some(user) = &member.user {
                entry.members.insert(user.id, CachedMember::from(member));
            }
        }
    }

    /// Guild settings from `GUILD_UPDATE`; members are kept
    pub fn update_guild(&self, guild: &api::Guild) {
        let mut guilds = self.guilds();
        if let Some(entry) = guilds.get_mut(&guild.id) {
            if guild.name.is_some() {
                entry.name = guild.name.clone();
            }
            if guild.owner_id.is_some() {
                entry.owner_id = guild.owner_id;
            }
            if !guild.roles.is_empty() {
                entry.set_roles(&guild.roles);
            }
        }
    }

    /// `GUILD_DELETE`: an outage keeps the entry, leaving the guild drops it
    pub fn delete_guild(&self, guild: &api::UnavailableGuild) {
        let mut guilds = self.guilds();
        if guild.unavailable == Some(true) {
            if let Some(entry) = guilds.get_mut(&guild.id) {
                entry.available = false;
            }
        } else {
            guilds.remove(&guild.id);
        }
    }

    pub fn upsert_role(&self, guild: GuildId, role: &api::Role) {
        if let Some(entry) = self.guilds().get_mut(&guild) {
            entry.roles.insert(
                role.id,
                CachedRole {
                    position: role.position,
                    permissions: role.permission_bits(),
                },
            );
        }
    }

    pub fn remove_role(&self, guild: GuildId, role: RoleId) {
        if let Some(entry) = self.guilds().get_mut(&guild) {
            entry.roles.remove(&role);
            for member in entry.members.values_mut() {
                member.roles.retain(|id| *id != role);
            }
        }
    }

    pub fn upsert_member(&self, guild: GuildId, user: UserId, member: CachedMember) {
        if let Some(entry) = self.guilds().get_mut(&guild) {
            entry.members.insert(user, member);
        }
    }

    /// Members from a `GUILD_MEMBERS_CHUNK`
    pub fn upsert_members(&self, guild: GuildId, members: &[api::Member]) {
        if let Some(entry) = self.guilds().get_mut(&guild) {
            for member in members {
                if let Some(user) = &member.user {
                    entry.members.insert(user.id, CachedMember::from(member));
                }
            }
        }
    }

    pub fn remove_member(&self, guild: GuildId, user: UserId) {
        if let Some(entry) = self.guilds().get_mut(&guild) {
            entry.members.remove(&user);
        }
    }

    /// Apply a member update and return the timeout the member had before
    ///
    /// A member the cache never saw is stored from now on, but its previous
    /// timeout is unknown and reported as [`NotCached`].
    pub fn update_member(
        &self,
        guild: GuildId,
        user: UserId,
        member: CachedMember,
    ) -> Result<Option<DateTime<Utc>>, NotCached> {
        let mut guilds = self.guilds();
        let entry = guilds.get_mut(&guild).ok_or(NotCached)?;
        entry
            .members
            .insert(user, member)
            .map(|previous| previous.communication_disabled_until)
            .ok_or(NotCached)
    }

    fn own_bans(&self) -> MutexGuard<'_, HashMap<(GuildId, UserId), Instant>> {
        self.own_bans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remember a ban about to be issued by this process
    pub fn note_own_ban(&self, guild: GuildId, user: UserId) {
        let now = Instant::now();
        let mut bans = self.own_bans();
        bans.retain(|_, expires| *expires > now);
        bans.insert((guild, user), now + OWN_BAN_WINDOW);
    }

    /// Drop the note for a ban that was not issued after all
    pub fn forget_own_ban(&self, guild: GuildId, user: UserId) {
        self.own_bans().remove(&(guild, user));
    }

    /// Consume the note for a ban event; `true` if the ban was ours
    pub fn take_own_ban(&self, guild: GuildId, user: UserId) -> bool {
        self.own_bans()
            .remove(&(guild, user))
            .is_some_and(|expires| expires > Instant::now())
    }

    pub fn is_available(&self, guild: GuildId) -> bool {
        self.guilds()
            .get(&guild)
            .is_some_and(|entry| entry.available)
    }

    /// Reference with the cached name, for reasons and log lines
    pub fn guild_ref(&self, guild: GuildId) -> GuildRef {
        match self.guilds().get(&guild).and_then(|entry| entry.name.clone()) {
            Some(name) => GuildRef::named(guild, name),
            None => GuildRef::new(guild),
        }
    }

    pub fn member(&self, guild: GuildId, user: UserId) -> Option<CachedMember> {
        self.guilds()
            .get(&guild)
            .and_then(|entry| entry.members.get(&user).cloned())
    }

    /// Copy of one guild's state
    pub fn snapshot(&self, guild: GuildId) -> Option<CachedGuild> {
        self.guilds().get(&guild).cloned()
    }

    /// Number of guilds the session knows about
    pub fn len(&self) -> usize {
        self.guilds().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guilds().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guild_json(id: u64, name: &str) -> api::Guild {
        serde_json::from_value(serde_json::json!({
            "id": id.to_string(),
            "name": name,
            "owner_id": "1",
            "roles": [
                {"id": id.to_string(), "position": 0, "permissions": "0"},
                {"id": "500", "position": 5, "permissions": "4"}
            ],
            "members": [
                {"user": {"id": "42", "username": "troll"}, "roles": ["500"]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn pending_guilds_are_unavailable_until_created() {
        let cache = GuildCache::new();
        let id = GuildId::new(1001);

        cache.register_pending([id]);
        assert_eq!(cache.len(), 1);
        assert!(!cache.is_available(id));

        cache.upsert_guild(&guild_json(1001, "Alpha"));
        assert!(cache.is_available(id));
        assert_eq!(cache.guild_ref(id), GuildRef::named(id, "Alpha"));
        assert_eq!(
            cache.member(id, UserId::new(42)).map(|m| m.roles),
            Some(vec![RoleId::new(500)])
        );
    }

    #[test]
    fn outage_keeps_entry_but_marks_unavailable() {
        let cache = GuildCache::new();
        let id = GuildId::new(1001);
        cache.upsert_guild(&guild_json(1001, "Alpha"));

        cache.delete_guild(&api::UnavailableGuild {
            id,
            unavailable: Some(true),
        });
        assert!(!cache.is_available(id));
        assert_eq!(cache.len(), 1);

        cache.delete_guild(&api::UnavailableGuild {
            id,
            unavailable: None,
        });
        assert!(cache.is_empty());
    }

    #[test]
    fn update_member_returns_previous_timeout() {
        let cache = GuildCache::new();
        let guild = GuildId::new(1001);
        let user = UserId::new(42);
        cache.upsert_guild(&guild_json(1001, "Alpha"));

        let until = Utc::now() + chrono::Duration::hours(1);
        let previous = cache.update_member(
            guild,
            user,
            CachedMember {
                roles: vec![],
                communication_disabled_until: Some(until),
            },
        );
        assert_eq!(previous, Ok(None));

        let previous = cache.update_member(guild, user, CachedMember::default());
        assert_eq!(previous, Ok(Some(until)));
    }

    #[test]
    fn unknown_member_has_unknown_previous_timeout() {
        let cache = GuildCache::new();
        cache.upsert_guild(&guild_json(1001, "Alpha"));

        let previous =
            cache.update_member(GuildId::new(1001), UserId::new(7), CachedMember::default());
        assert_eq!(previous, Err(NotCached));

        // Known from now on
        assert!(cache.member(GuildId::new(1001), UserId::new(7)).is_some());
        let previous =
            cache.update_member(GuildId::new(1001), UserId::new(7), CachedMember::default());
        assert_eq!(previous, Ok(None));
    }

    #[test]
    fn unknown_guild_has_unknown_previous_timeout() {
        let cache = GuildCache::new();

        let previous =
            cache.update_member(GuildId::new(1001), UserId::new(7), CachedMember::default());
        assert_eq!(previous, Err(NotCached));
        assert!(cache.is_empty());
    }

    #[test]
    fn member_chunks_fill_the_cache() {
        let cache = GuildCache::new();
        let guild = GuildId::new(1001);
        cache.upsert_guild(&guild_json(1001, "Alpha"));
        let until = Utc::now() + chrono::Duration::hours(1);

        let members: Vec<api::Member> = serde_json::from_value(serde_json::json!([
            {"user": {"id": "77", "username": "muted"}, "roles": [], "communication_disabled_until": until.to_rfc3339()},
            {"user": {"id": "78", "username": "plain"}, "roles": ["500"]}
        ]))
        .unwrap();
        cache.upsert_members(guild, &members);

        assert_eq!(
            cache
                .member(guild, UserId::new(77))
                .and_then(|m| m.communication_disabled_until)
                .map(|t| t.timestamp()),
            Some(until.timestamp())
        );
        assert!(cache.member(guild, UserId::new(78)).is_some());
    }

    #[test]
    fn own_ban_is_taken_once() {
        let cache = GuildCache::new();
        let (guild, user) = (GuildId::new(1001), UserId::new(42));

        assert!(!cache.take_own_ban(guild, user));
        cache.note_own_ban(guild, user);
        assert!(!cache.take_own_ban(GuildId::new(1002), user));
        assert!(cache.take_own_ban(guild, user));
        assert!(!cache.take_own_ban(guild, user));

        cache.note_own_ban(guild, user);
        cache.forget_own_ban(guild, user);
        assert!(!cache.take_own_ban(guild, user));
    }

    #[test]
    fn removed_role_is_stripped_from_members() {
        let cache = GuildCache::new();
        let guild = GuildId::new(1001);
        cache.upsert_guild(&guild_json(1001, "Alpha"));

        cache.remove_role(guild, RoleId::new(500));

        let snapshot = cache.snapshot(guild).unwrap();
        assert!(!snapshot.roles.contains_key(&RoleId::new(500)));
        assert_eq!(
            cache.member(guild, UserId::new(42)).map(|m| m.roles),
            Some(vec![])
        );
    }

    #[test]
    fn unknown_guild_name_falls_back_to_id() {
        let cache = GuildCache::new();
        let id = GuildId::new(77);
        assert_eq!(cache.guild_ref(id).label(), "77");
    }
}
