use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::SYSTEM_SENDER;
use crate::error::IdError;

// ---------------------------------------------------------------------------
// ObjectId
// ---------------------------------------------------------------------------

/// 96-bit identifier for conversations, groups, invitations and messages.
///
/// Layout: 4-byte big-endian unix seconds, 5 random bytes fixed for the
/// lifetime of the process, 3-byte big-endian counter. Byte order, hex order
/// and creation order agree, so ids double as pagination cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

struct ProcessSeed {
    random: [u8; 5],
    counter: AtomicU32,
}

const COUNTER_MASK: u32 = 0x00ff_ffff;

fn process_seed() -> &'static ProcessSeed {
    static SEED: OnceLock<ProcessSeed> = OnceLock::new();
    SEED.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let mut random = [0u8; 5];
        rng.fill(&mut random);
        // Start in the lower half so the 24-bit counter cannot wrap early.
        let start = rng.gen_range(0..0x0080_0000);
        ProcessSeed {
            random,
            counter: AtomicU32::new(start),
        }
    })
}

impl ObjectId {
    pub const LEN: usize = 12;

    pub fn new() -> Self {
        let secs = Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        let seed = process_seed();
        let count = seed.counter.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;

        let mut bytes = [0u8; Self::LEN];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&seed.random);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let invalid = || IdError::InvalidObjectId(s.to_string());
        if s.len() != Self::LEN * 2 {
            return Err(invalid());
        }
        let bytes = hex::decode(s).map_err(|_| invalid())?;
        let mut arr = [0u8; Self::LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Creation time, to the second.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let mut secs = [0u8; 4];
        secs.copy_from_slice(&self.0[..4]);
        DateTime::from_timestamp(u32::from_be_bytes(secs) as i64, 0).unwrap_or_default()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// Chat user key: a trimmed, lowercased email address.
///
/// The rest of the platform keys users by object id; chat deliberately keys
/// them by email, which every collaborator (token, push registry, user
/// store) agrees on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

const MAX_EMAIL_LEN: usize = 254;

impl UserId {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let email = raw.trim().to_lowercase();
        if is_valid_email(&email) {
            Ok(Self(email))
        } else {
            Err(IdError::InvalidEmail(raw.to_string()))
        }
    }

    /// The sender of group system messages. Never a real user.
    pub fn system() -> Self {
        Self(SYSTEM_SENDER.to_string())
    }

    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_SENDER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_email(email: &str) -> bool {
    if email.is_empty() || email.len() > MAX_EMAIL_LEN {
        return false;
    }
    if email.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| !label.is_empty())
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == SYSTEM_SENDER {
            return Ok(Self::system());
        }
        Self::parse(&s).map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Persisted enums
// ---------------------------------------------------------------------------

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(IdError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// `accepted` and `active` are equivalent for delivery.
    ConversationStatus, "conversation status" {
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
        Active => "active",
    }
}

impl ConversationStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Accepted | Self::Active)
    }
}

text_enum! {
    InvitationStatus, "invitation status" {
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
    }
}

text_enum! {
    GroupInvitationStatus, "group invitation status" {
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
        Cancelled => "cancelled",
    }
}

text_enum! {
    MessageKind, "message kind" {
        Text => "text",
        Image => "image",
        File => "file",
    }
}

text_enum! {
    GroupMessageKind, "group message kind" {
        Message => "message",
        System => "system",
    }
}

text_enum! {
    GroupRole, "group role" {
        Admin => "admin",
        Member => "member",
    }
}

text_enum! {
    /// Answer to a direct or group invitation.
    InvitationAction, "invitation action" {
        Accept => "accept",
        Reject => "reject",
    }
}
