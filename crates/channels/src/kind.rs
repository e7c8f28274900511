/// Channel variant, selected by name prefix at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
    Cache,
    PrivateCache,
    PresenceCache,
    EncryptedPrivate,
}

impl ChannelKind {
    /// Classify a channel name. Prefixes are checked longest-first so that
    /// `private-cache-x` is not mistaken for a plain private channel.
    pub fn of(name: &str) -> Self {
        if name.starts_with("private-encrypted-") {
            Self::EncryptedPrivate
        } else if name.starts_with("private-cache-") {
            Self::PrivateCache
        } else if name.starts_with("presence-cache-") {
            Self::PresenceCache
        } else if name.starts_with("cache-") {
            Self::Cache
        } else if name.starts_with("private-") {
            Self::Private
        } else if name.starts_with("presence-") {
            Self::Presence
        } else {
            Self::Public
        }
    }

    /// Subscription requires a signed `auth` token.
    pub fn requires_auth(self) -> bool {
        !matches!(self, Self::Public | Self::Cache)
    }

    /// Tracks distinct users and emits member_added / member_removed.
    pub fn is_presence(self) -> bool {
        matches!(self, Self::Presence | Self::PresenceCache)
    }

    /// Retains the last externally broadcast payload for replay.
    pub fn caches_last_event(self) -> bool {
        matches!(self, Self::Cache | Self::PrivateCache | Self::PresenceCache)
    }

    /// `client-*` events may only target authenticated channels.
    pub fn allows_client_events(self) -> bool {
        self.requires_auth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_dispatch() {
        assert_eq!(ChannelKind::of("room-1"), ChannelKind::Public);
        assert_eq!(ChannelKind::of("private-room"), ChannelKind::Private);
        assert_eq!(ChannelKind::of("presence-room"), ChannelKind::Presence);
        assert_eq!(ChannelKind::of("cache-room"), ChannelKind::Cache);
        assert_eq!(ChannelKind::of("private-cache-room"), ChannelKind::PrivateCache);
        assert_eq!(
            ChannelKind::of("presence-cache-room"),
            ChannelKind::PresenceCache
        );
        assert_eq!(
            ChannelKind::of("private-encrypted-room"),
            ChannelKind::EncryptedPrivate
        );
    }

    #[test]
    fn longest_prefix_wins() {
        // A name that also matches a shorter prefix must take the longer one.
        assert_ne!(ChannelKind::of("private-cache-x"), ChannelKind::Private);
        assert_ne!(ChannelKind::of("presence-cache-x"), ChannelKind::Presence);
        assert_ne!(
            ChannelKind::of("private-encrypted-x"),
            ChannelKind::Private
        );
    }

    #[test]
    fn capability_matrix() {
        assert!(!ChannelKind::Public.requires_auth());
        assert!(!ChannelKind::Cache.requires_auth());
        assert!(ChannelKind::Private.requires_auth());
        assert!(ChannelKind::PresenceCache.requires_auth());
        assert!(ChannelKind::EncryptedPrivate.requires_auth());

        assert!(ChannelKind::Presence.is_presence());
        assert!(ChannelKind::PresenceCache.is_presence());
        assert!(!ChannelKind::Private.is_presence());

        assert!(ChannelKind::Cache.caches_last_event());
        assert!(ChannelKind::PrivateCache.caches_last_event());
        assert!(ChannelKind::PresenceCache.caches_last_event());
        assert!(!ChannelKind::Public.caches_last_event());
    }
}
