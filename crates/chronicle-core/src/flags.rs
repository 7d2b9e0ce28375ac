//! Voice state-flags bitmask codec.
//!
//! Eight independent boolean voice attributes are packed into a single `u8`
//! with fixed bit positions. Encoding is a pure OR over the set bits, so it
//! is order-independent and `decode(encode(x)) == x` for every combination.

/// Bit positions for the voice state flags.
pub mod bits {
    /// User is in the guild's AFK channel.
    pub const AFK_CHANNEL: u8 = 1 << 0;
    /// User muted themselves.
    pub const SELF_MUTED: u8 = 1 << 1;
    /// User deafened themselves.
    pub const SELF_DEAFENED: u8 = 1 << 2;
    /// A moderator muted the user.
    pub const SERVER_MUTED: u8 = 1 << 3;
    /// A moderator deafened the user.
    pub const SERVER_DEAFENED: u8 = 1 << 4;
    /// User is streaming (screen share / go-live).
    pub const STREAMING: u8 = 1 << 5;
    /// User has their camera on.
    pub const VIDEO: u8 = 1 << 6;
    /// User is suppressed (e.g., stage audience).
    pub const SUPPRESSED: u8 = 1 << 7;
}

/// The eight boolean voice attributes tracked per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VoiceAttributes {
    pub afk_channel: bool,
    pub self_muted: bool,
    pub self_deafened: bool,
    pub server_muted: bool,
    pub server_deafened: bool,
    pub streaming: bool,
    pub video: bool,
    pub suppressed: bool,
}

impl VoiceAttributes {
    /// Pack the attributes into the 8-bit state flags.
    pub fn encode(self) -> u8 {
        let mut flags = 0u8;
        if self.afk_channel {
            flags |= bits::AFK_CHANNEL;
        }
        if self.self_muted {
            flags |= bits::SELF_MUTED;
        }
        if self.self_deafened {
            flags |= bits::SELF_DEAFENED;
        }
        if self.server_muted {
            flags |= bits::SERVER_MUTED;
        }
        if self.server_deafened {
            flags |= bits::SERVER_DEAFENED;
        }
        if self.streaming {
            flags |= bits::STREAMING;
        }
        if self.video {
            flags |= bits::VIDEO;
        }
        if self.suppressed {
            flags |= bits::SUPPRESSED;
        }
        flags
    }

    /// Unpack state flags back into attributes.
    pub fn decode(flags: u8) -> Self {
        Self {
            afk_channel: flags & bits::AFK_CHANNEL != 0,
            self_muted: flags & bits::SELF_MUTED != 0,
            self_deafened: flags & bits::SELF_DEAFENED != 0,
            server_muted: flags & bits::SERVER_MUTED != 0,
            server_deafened: flags & bits::SERVER_DEAFENED != 0,
            streaming: flags & bits::STREAMING != 0,
            video: flags & bits::VIDEO != 0,
            suppressed: flags & bits::SUPPRESSED != 0,
        }
    }

    /// Whether the user is muted in any way.
    pub fn is_muted(self) -> bool {
        self.self_muted || self.server_muted
    }

    /// Whether the user is deafened in any way.
    pub fn is_deafened(self) -> bool {
        self.self_deafened || self.server_deafened
    }
}

/// Human-readable category label for a set of state flags.
///
/// Used as the `state_category` column of voice time aggregates. The mapping
/// is by precedence: AFK beats deafened beats muted beats broadcasting.
pub fn state_category(flags: u8) -> &'static str {
    let attrs = VoiceAttributes::decode(flags);
    if attrs.afk_channel {
        "afk"
    } else if attrs.is_deafened() {
        "deafened"
    } else if attrs.is_muted() {
        "muted"
    } else if attrs.streaming || attrs.video {
        "broadcasting"
    } else if attrs.suppressed {
        "suppressed"
    } else {
        "active"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_combinations() {
        for flags in 0u8..=255 {
            let attrs = VoiceAttributes::decode(flags);
            assert_eq!(attrs.encode(), flags, "round trip failed for {flags:#010b}");
        }
    }

    #[test]
    fn test_encode_is_order_independent() {
        // Encoding only reads the booleans, so two equal structs built in any
        // order must encode identically.
        let a = VoiceAttributes {
            streaming: true,
            self_muted: true,
            ..Default::default()
        };
        let b = VoiceAttributes {
            self_muted: true,
            streaming: true,
            ..Default::default()
        };
        assert_eq!(a.encode(), b.encode());
        assert_eq!(a.encode(), bits::SELF_MUTED | bits::STREAMING);
    }

    #[test]
    fn test_convenience_booleans() {
        let attrs = VoiceAttributes::decode(bits::SERVER_MUTED);
        assert!(attrs.is_muted());
        assert!(!attrs.is_deafened());

        let attrs = VoiceAttributes::decode(bits::SELF_DEAFENED);
        assert!(attrs.is_deafened());
    }

    #[test]
    fn test_state_category_precedence() {
        assert_eq!(state_category(0), "active");
        assert_eq!(state_category(bits::STREAMING), "broadcasting");
        assert_eq!(state_category(bits::SELF_MUTED), "muted");
        assert_eq!(state_category(bits::SELF_MUTED | bits::SELF_DEAFENED), "deafened");
        assert_eq!(state_category(bits::AFK_CHANNEL | bits::VIDEO), "afk");
        assert_eq!(state_category(bits::SUPPRESSED), "suppressed");
    }
}
