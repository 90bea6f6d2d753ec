//! Typed events projected from decoded frame bodies.
//!
//! Every recognized `type` tag maps to one [`EventKind`] and one projection
//! struct. Projection never fails: a missing or non-numeric field becomes `0`
//! or an empty string, and unknown fields are ignored.

use serde::Serialize;

use crate::stt::{self, FieldMap};

/// Recognized event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// `loginres` / `loginresp`: the server accepted the login.
    LoginResponse,
    /// `chatmsg`: a chat message.
    Barrage,
    /// `onlinegift`: a critical hit while collecting online rewards.
    Storm,
    /// `dgb`: a gift sent in the room.
    SendGift,
    /// `uenter`: a user with special attributes entered.
    SpecialUser,
    /// `rss`: the stream went live or offline.
    SwitchBroadcast,
    /// `ranklist`: contribution rank update.
    BroadcastRank,
    /// `ssd`: a super barrage.
    SuperBarrage,
    /// `spbc`: a gift broadcast inside the room.
    RoomGiftBroadcast,
}

impl EventKind {
    /// Every kind, in registration order.
    pub const ALL: [EventKind; 9] = [
        EventKind::LoginResponse,
        EventKind::Barrage,
        EventKind::Storm,
        EventKind::SendGift,
        EventKind::SpecialUser,
        EventKind::SwitchBroadcast,
        EventKind::BroadcastRank,
        EventKind::SuperBarrage,
        EventKind::RoomGiftBroadcast,
    ];

    /// Map a body's `type` tag to a kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "loginres" | "loginresp" => Some(Self::LoginResponse),
            "chatmsg" => Some(Self::Barrage),
            "onlinegift" => Some(Self::Storm),
            "dgb" => Some(Self::SendGift),
            "uenter" => Some(Self::SpecialUser),
            "rss" => Some(Self::SwitchBroadcast),
            "ranklist" => Some(Self::BroadcastRank),
            "ssd" => Some(Self::SuperBarrage),
            "spbc" => Some(Self::RoomGiftBroadcast),
            _ => None,
        }
    }

    /// Canonical wire tag.
    pub fn tag(self) -> &'static str {
        match self {
            Self::LoginResponse => "loginres",
            Self::Barrage => "chatmsg",
            Self::Storm => "onlinegift",
            Self::SendGift => "dgb",
            Self::SpecialUser => "uenter",
            Self::SwitchBroadcast => "rss",
            Self::BroadcastRank => "ranklist",
            Self::SuperBarrage => "ssd",
            Self::RoomGiftBroadcast => "spbc",
        }
    }
}

/// A value that can be read out of a [`FieldMap`] with a default.
trait FieldValue: Sized {
    fn read(fields: &FieldMap, code: &str) -> Self;
}

impl FieldValue for i64 {
    fn read(fields: &FieldMap, code: &str) -> Self {
        fields.int(code)
    }
}

impl FieldValue for String {
    fn read(fields: &FieldMap, code: &str) -> Self {
        fields.string(code)
    }
}

impl FieldValue for Effect {
    fn read(fields: &FieldMap, _code: &str) -> Self {
        Effect::from_fields(fields)
    }
}

impl FieldValue for Vec<RankEntry> {
    fn read(fields: &FieldMap, code: &str) -> Self {
        let Some(raw) = fields.get(code) else {
            return Vec::new();
        };
        match stt::decode_list(raw) {
            Ok(items) => items.iter().map(RankEntry::from_fields).collect(),
            Err(e) => {
                tracing::debug!(code, "Unreadable rank list: {e}");
                Vec::new()
            }
        }
    }
}

macro_rules! projection {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                pub $field:ident: $ty:ty = $code:literal,
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $ty,
            )*
        }

        impl $name {
            /// Project a decoded body, defaulting missing fields.
            pub fn from_fields(fields: &FieldMap) -> Self {
                Self {
                    $( $field: <$ty as FieldValue>::read(fields, $code), )*
                }
            }
        }
    };
}

projection! {
    /// Combo effect attached to a chat message or room entry.
    pub struct Effect {
        /// Effect id.
        pub id: i64 = "eid",
        /// Effect type.
        pub kind: i64 = "etp",
        /// Times the effect fired.
        pub count: i64 = "sc",
        /// Effect flag.
        pub flag: i64 = "ef",
    }
}

projection! {
    /// Login accepted.
    pub struct LoginResponse {
        pub user_id: i64 = "userid",
        pub room_group: i64 = "roomgroup",
        pub platform_group: i64 = "pg",
        pub session_id: i64 = "sessionid",
        pub user_name: String = "username",
        pub nickname: String = "nickname",
        /// 1 while the room is live.
        pub live_status: i64 = "live_stat",
        pub is_illegal: i64 = "is_illegal",
        pub illegal_content: String = "ill_ct",
        pub illegal_timestamp: i64 = "ill_ts",
        /// Server time.
        pub now: i64 = "now",
        pub phone_bound: i64 = "ps",
        pub email_bound: i64 = "es",
        pub identity_type: i64 = "it",
        pub identity_status: i64 = "its",
        pub needs_phone_verification: i64 = "npv",
        pub best_diligent_level: i64 = "best_dlev",
        pub diligent_level: i64 = "cur_lev",
        pub view_requirement: i64 = "nrc",
        pub hidden: i64 = "ih",
        pub service_id: i64 = "sid",
        pub sahf: i64 = "sahf",
    }
}

projection! {
    /// Chat message.
    pub struct Barrage {
        pub group_id: i64 = "gid",
        pub room_id: i64 = "rid",
        pub uid: i64 = "uid",
        pub nickname: String = "nn",
        /// Message text.
        pub text: String = "txt",
        /// Unique message id.
        pub cid: i64 = "cid",
        pub level: i64 = "level",
        pub gift_title: i64 = "gt",
        /// Colour code, 0 for the default colour.
        pub color: i64 = "col",
        pub client_type: i64 = "ct",
        pub room_group: i64 = "rg",
        pub platform_group: i64 = "pg",
        pub diligent_level: i64 = "dlv",
        pub diligent_count: i64 = "dc",
        pub best_diligent_level: i64 = "bdlv",
        pub chat_type: i64 = "cmt",
        pub sahf: i64 = "sahf",
        /// Avatar path.
        pub avatar: String = "ic",
        pub noble_level: i64 = "nl",
        pub noble_chat: i64 = "nc",
        pub gateway_in: i64 = "gatin",
        pub gateway_out: i64 = "gatout",
        pub room_service_in: i64 = "chtin",
        pub room_service_out: i64 = "chtout",
        pub sender_in: i64 = "repin",
        pub sender_out: i64 = "repout",
        pub badge_name: String = "bnn",
        pub badge_level: i64 = "bl",
        pub badge_room_id: i64 = "brid",
        pub badge_checksum: i64 = "hc",
        pub anchor_level: i64 = "ol",
        pub reversed: i64 = "rev",
        pub highlighted: i64 = "hl",
        pub fan_message: i64 = "ifs",
        pub p2p: i64 = "p2p",
        pub effect: Effect = "el",
    }
}

projection! {
    /// Critical hit while collecting online rewards.
    pub struct Storm {
        pub room_id: i64 = "rid",
        pub uid: i64 = "uid",
        pub group_id: i64 = "gid",
        /// Rewards received.
        pub amount: i64 = "sil",
        pub reward_level: i64 = "if",
        pub client_type: i64 = "ct",
        pub nickname: String = "nn",
        /// Critical multiplier.
        pub multiplier: i64 = "ur",
        pub level: i64 = "level",
        pub broadcast_type: i64 = "btype",
    }
}

projection! {
    /// Gift sent in the room.
    pub struct SendGift {
        pub room_id: i64 = "rid",
        pub group_id: i64 = "gid",
        pub gift_id: i64 = "gfid",
        pub gift_style: i64 = "gs",
        pub uid: i64 = "uid",
        pub nickname: String = "nn",
        /// Non-zero for large gifts.
        pub big_gift: i64 = "bg",
        pub avatar: i64 = "ic",
        pub effect_id: i64 = "eid",
        pub level: i64 = "level",
        pub anchor_weight: i64 = "dw",
        pub gift_count: i64 = "gfcnt",
        pub hits: i64 = "hits",
        pub diligent_level: i64 = "dlv",
        pub diligent_count: i64 = "dc",
        pub best_diligent_level: i64 = "bdl",
        pub room_group: i64 = "rg",
        pub platform_group: i64 = "pg",
        pub rpid: i64 = "rpid",
        pub rpidn: i64 = "rpidn",
        pub slt: i64 = "slt",
        pub elt: i64 = "elt",
        pub noble_level: i64 = "nl",
        pub sahf: i64 = "sahf",
        pub badge_name: String = "bnn",
        pub badge_level: i64 = "bl",
        pub badge_room_id: i64 = "brid",
        pub badge_checksum: i64 = "hc",
        pub attack_power: i64 = "fc",
    }
}

projection! {
    /// A user with special attributes entered the room.
    pub struct SpecialUser {
        pub room_id: i64 = "rid",
        pub group_id: i64 = "gid",
        pub nickname: String = "nn",
        pub strength: i64 = "str",
        pub level: i64 = "level",
        pub gift_title: i64 = "gt",
        pub room_group: i64 = "rg",
        pub platform_group: i64 = "pg",
        pub diligent_level: i64 = "dlv",
        pub diligent_count: i64 = "dc",
        pub best_diligent_level: i64 = "bdlv",
        pub avatar: i64 = "ic",
        pub noble_level: i64 = "nl",
        pub ceid: i64 = "ceid",
        pub last_week_rank: i64 = "crw",
        pub anchor_level: i64 = "ol",
        pub effect: Effect = "el",
        pub sahf: i64 = "sahf",
        pub welcome_effect_id: i64 = "wgei",
    }
}

projection! {
    /// The stream started or stopped.
    pub struct SwitchBroadcast {
        pub room_id: i64 = "rid",
        pub group_id: i64 = "gid",
        /// 1 while live, 0 otherwise.
        pub status: i64 = "ss",
        pub code: i64 = "code",
        pub reason: i64 = "rt",
        pub reason_value: i64 = "rtv",
        pub notify: i64 = "notify",
        /// Only set when the stream stopped.
        pub end_time: i64 = "endtime",
    }
}

projection! {
    /// One row of a rank list.
    pub struct RankEntry {
        pub uid: i64 = "uid",
        pub nickname: String = "nickname",
        pub last_rank: i64 = "lrk",
        pub current_rank: i64 = "crk",
        /// -1 fell, 0 unchanged, 1 rose.
        pub rank_change: i64 = "rs",
        pub contribution: i64 = "gold",
        pub icon: String = "icon",
        pub level: i64 = "level",
        pub platform_group: i64 = "pg",
        pub room_group: i64 = "rg",
    }
}

projection! {
    /// Contribution rank update.
    pub struct BroadcastRank {
        pub room_id: i64 = "rid",
        pub timestamp: i64 = "ts",
        pub sequence: i64 = "seq",
        pub group_id: i64 = "gid",
        pub all_time: Vec<RankEntry> = "list_all",
        pub weekly: Vec<RankEntry> = "list",
        pub daily: Vec<RankEntry> = "list_day",
    }
}

projection! {
    /// Super barrage.
    pub struct SuperBarrage {
        pub room_id: i64 = "rid",
        pub group_id: i64 = "gid",
        pub id: i64 = "sdid",
        /// Room the barrage links to.
        pub target_room_id: i64 = "trid",
        pub content: String = "content",
        pub url: String = "url",
        pub client_type: i64 = "clitp",
        pub jump_type: i64 = "jmptp",
    }
}

projection! {
    /// Gift broadcast inside the room.
    pub struct RoomGiftBroadcast {
        pub room_id: i64 = "rid",
        pub group_id: i64 = "gid",
        pub sender_name: String = "sn",
        pub receiver_name: String = "dn",
        pub gift_name: i64 = "gn",
        pub gift_count: i64 = "gc",
        pub receiver_room_id: i64 = "drid",
        pub gift_style: i64 = "gs",
        pub has_bag: i64 = "gb",
        pub display_style: i64 = "es",
        pub gift_id: i64 = "gfid",
        pub effect_id: i64 = "eid",
        pub broadcast_gift_type: i64 = "bgl",
        pub ifs: i64 = "ifs",
        pub category: i64 = "cl2",
    }
}

/// A projected event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "event")]
pub enum Event {
    LoginResponse(LoginResponse),
    Barrage(Barrage),
    Storm(Storm),
    SendGift(SendGift),
    SpecialUser(SpecialUser),
    SwitchBroadcast(SwitchBroadcast),
    BroadcastRank(BroadcastRank),
    SuperBarrage(SuperBarrage),
    RoomGiftBroadcast(RoomGiftBroadcast),
}

impl Event {
    /// Project `fields` as an event of `kind`.
    pub fn project(kind: EventKind, fields: &FieldMap) -> Self {
        match kind {
            EventKind::LoginResponse => Self::LoginResponse(LoginResponse::from_fields(fields)),
            EventKind::Barrage => Self::Barrage(Barrage::from_fields(fields)),
            EventKind::Storm => Self::Storm(Storm::from_fields(fields)),
            EventKind::SendGift => Self::SendGift(SendGift::from_fields(fields)),
            EventKind::SpecialUser => Self::SpecialUser(SpecialUser::from_fields(fields)),
            EventKind::SwitchBroadcast => {
                Self::SwitchBroadcast(SwitchBroadcast::from_fields(fields))
            }
            EventKind::BroadcastRank => Self::BroadcastRank(BroadcastRank::from_fields(fields)),
            EventKind::SuperBarrage => Self::SuperBarrage(SuperBarrage::from_fields(fields)),
            EventKind::RoomGiftBroadcast => {
                Self::RoomGiftBroadcast(RoomGiftBroadcast::from_fields(fields))
            }
        }
    }

    /// Project a body by its `type` tag. `None` for missing or unknown tags.
    pub fn from_fields(fields: &FieldMap) -> Option<Self> {
        let kind = EventKind::from_tag(fields.kind()?)?;
        Some(Self::project(kind, fields))
    }

    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::LoginResponse(_) => EventKind::LoginResponse,
            Self::Barrage(_) => EventKind::Barrage,
            Self::Storm(_) => EventKind::Storm,
            Self::SendGift(_) => EventKind::SendGift,
            Self::SpecialUser(_) => EventKind::SpecialUser,
            Self::SwitchBroadcast(_) => EventKind::SwitchBroadcast,
            Self::BroadcastRank(_) => EventKind::BroadcastRank,
            Self::SuperBarrage(_) => EventKind::SuperBarrage,
            Self::RoomGiftBroadcast(_) => EventKind::RoomGiftBroadcast,
        }
    }
}
