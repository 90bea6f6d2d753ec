//! Live barrage client: binary TCP framing, per-room connection lifecycle,
//! heartbeat, reconnection, and a dispatch pipeline that turns frames into
//! typed events for caller-supplied handlers.

pub mod compression;
pub mod events;
pub mod framing;
pub mod handlers;
pub mod live;
pub mod reconnection;
pub mod room;
pub mod stt;
pub mod token;

pub use events::{Event, EventKind};
pub use framing::{EncodeError, FrameConfig, FrameError, encode, read_frame, write_frame};
pub use handlers::Handlers;
pub use live::{Live, LiveConfig, LiveError};
pub use reconnection::{ReconnectConfig, ReconnectRequest, ReconnectState};
pub use room::{
    InboundMessage, Room, RoomConfig, RoomContext, RoomError, RoomId, RoomSeed, RoomState,
    RoomStateWatch,
};
pub use stt::{FieldMap, decode_body};
pub use token::{Clock, HttpTokenProvider, SystemClock, Token, TokenError, TokenProvider};
