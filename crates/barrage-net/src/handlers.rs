//! Caller-supplied event handlers.
//!
//! One slot per [`EventKind`], plus a slot for rooms that fail terminally.
//! Registering a handler for a kind that already has one replaces it.

use std::sync::Arc;

use crate::events::{
    Barrage, BroadcastRank, Event, EventKind, LoginResponse, RoomGiftBroadcast, SendGift,
    SpecialUser, Storm, SuperBarrage, SwitchBroadcast,
};
use crate::room::{RoomError, RoomId};

type Callback<T> = Arc<dyn Fn(RoomId, &T) + Send + Sync>;

/// Handler registry, built before the session starts.
///
/// ```ignore
/// let handlers = Handlers::new()
///     .on_barrage(|room, msg| println!("[{room}] {}: {}", msg.nickname, msg.text))
///     .on_send_gift(|room, gift| println!("[{room}] gift {}", gift.gift_id));
/// ```
#[derive(Clone, Default)]
pub struct Handlers {
    login_response: Option<Callback<LoginResponse>>,
    barrage: Option<Callback<Barrage>>,
    storm: Option<Callback<Storm>>,
    send_gift: Option<Callback<SendGift>>,
    special_user: Option<Callback<SpecialUser>>,
    switch_broadcast: Option<Callback<SwitchBroadcast>>,
    broadcast_rank: Option<Callback<BroadcastRank>>,
    super_barrage: Option<Callback<SuperBarrage>>,
    room_gift_broadcast: Option<Callback<RoomGiftBroadcast>>,
    room_failure: Option<Callback<RoomError>>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<EventKind> = EventKind::ALL
            .into_iter()
            .filter(|kind| self.is_registered(*kind))
            .collect();
        f.debug_struct("Handlers")
            .field("registered", &registered)
            .field("room_failure", &self.room_failure.is_some())
            .finish()
    }
}

impl Handlers {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `loginres` / `loginresp`, after the group has been joined.
    pub fn on_login_response(
        mut self,
        f: impl Fn(RoomId, &LoginResponse) + Send + Sync + 'static,
    ) -> Self {
        self.login_response = Some(Arc::new(f));
        self
    }

    /// Handle `chatmsg` chat messages.
    pub fn on_barrage(mut self, f: impl Fn(RoomId, &Barrage) + Send + Sync + 'static) -> Self {
        self.barrage = Some(Arc::new(f));
        self
    }

    /// Handle `onlinegift` storms of online-reward critical hits.
    pub fn on_storm(mut self, f: impl Fn(RoomId, &Storm) + Send + Sync + 'static) -> Self {
        self.storm = Some(Arc::new(f));
        self
    }

    /// Handle `dgb` gifts.
    pub fn on_send_gift(mut self, f: impl Fn(RoomId, &SendGift) + Send + Sync + 'static) -> Self {
        self.send_gift = Some(Arc::new(f));
        self
    }

    /// Handle `uenter` arrivals of special users.
    pub fn on_special_user(
        mut self,
        f: impl Fn(RoomId, &SpecialUser) + Send + Sync + 'static,
    ) -> Self {
        self.special_user = Some(Arc::new(f));
        self
    }

    /// Handle `rss` broadcast switches.
    pub fn on_switch_broadcast(
        mut self,
        f: impl Fn(RoomId, &SwitchBroadcast) + Send + Sync + 'static,
    ) -> Self {
        self.switch_broadcast = Some(Arc::new(f));
        self
    }

    /// Handle `ranklist` broadcast rankings.
    pub fn on_broadcast_rank(
        mut self,
        f: impl Fn(RoomId, &BroadcastRank) + Send + Sync + 'static,
    ) -> Self {
        self.broadcast_rank = Some(Arc::new(f));
        self
    }

    /// Handle `ssd` super barrages.
    pub fn on_super_barrage(
        mut self,
        f: impl Fn(RoomId, &SuperBarrage) + Send + Sync + 'static,
    ) -> Self {
        self.super_barrage = Some(Arc::new(f));
        self
    }

    /// Handle `spbc` room-wide gift broadcasts.
    pub fn on_room_gift_broadcast(
        mut self,
        f: impl Fn(RoomId, &RoomGiftBroadcast) + Send + Sync + 'static,
    ) -> Self {
        self.room_gift_broadcast = Some(Arc::new(f));
        self
    }

    /// Called when a room gives up for good, e.g. no token could be issued.
    /// The room has already been removed from the session when this runs.
    pub fn on_room_failure(
        mut self,
        f: impl Fn(RoomId, &RoomError) + Send + Sync + 'static,
    ) -> Self {
        self.room_failure = Some(Arc::new(f));
        self
    }

    /// Whether a handler is registered for `kind`.
    pub fn is_registered(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::LoginResponse => self.login_response.is_some(),
            EventKind::Barrage => self.barrage.is_some(),
            EventKind::Storm => self.storm.is_some(),
            EventKind::SendGift => self.send_gift.is_some(),
            EventKind::SpecialUser => self.special_user.is_some(),
            EventKind::SwitchBroadcast => self.switch_broadcast.is_some(),
            EventKind::BroadcastRank => self.broadcast_rank.is_some(),
            EventKind::SuperBarrage => self.super_barrage.is_some(),
            EventKind::RoomGiftBroadcast => self.room_gift_broadcast.is_some(),
        }
    }

    /// Deliver `event` to its handler. Returns `false` when none is registered.
    pub(crate) fn dispatch(&self, room_id: RoomId, event: &Event) -> bool {
        fn call<T>(slot: &Option<Callback<T>>, room_id: RoomId, value: &T) -> bool {
            match slot {
                Some(f) => {
                    f(room_id, value);
                    true
                }
                None => false,
            }
        }

        match event {
            Event::LoginResponse(e) => call(&self.login_response, room_id, e),
            Event::Barrage(e) => call(&self.barrage, room_id, e),
            Event::Storm(e) => call(&self.storm, room_id, e),
            Event::SendGift(e) => call(&self.send_gift, room_id, e),
            Event::SpecialUser(e) => call(&self.special_user, room_id, e),
            Event::SwitchBroadcast(e) => call(&self.switch_broadcast, room_id, e),
            Event::BroadcastRank(e) => call(&self.broadcast_rank, room_id, e),
            Event::SuperBarrage(e) => call(&self.super_barrage, room_id, e),
            Event::RoomGiftBroadcast(e) => call(&self.room_gift_broadcast, room_id, e),
        }
    }

    pub(crate) fn room_failed(&self, room_id: RoomId, error: &RoomError) {
        if let Some(f) = &self.room_failure {
            f(room_id, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_empty_registry_has_no_handlers() {
        let handlers = Handlers::new();
        for kind in EventKind::ALL {
            assert!(!handlers.is_registered(kind));
        }
    }

    #[test]
    fn test_registered_handler_receives_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handlers = Handlers::new().on_barrage(move |room, msg| {
            sink.lock().unwrap().push((room, msg.text.clone()));
        });

        assert!(handlers.is_registered(EventKind::Barrage));
        assert!(!handlers.is_registered(EventKind::SendGift));

        let event = Event::Barrage(Barrage {
            text: "hello".into(),
            ..Default::default()
        });
        assert!(handlers.dispatch(9, &event));
        assert!(!handlers.dispatch(9, &Event::Storm(Storm::default())));
        assert_eq!(*seen.lock().unwrap(), [(9, "hello".to_string())]);
    }

    #[test]
    fn test_reregistering_replaces_handler() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (hits.clone(), hits.clone());
        let handlers = Handlers::new()
            .on_storm(move |_, _| first.lock().unwrap().push("first"))
            .on_storm(move |_, _| second.lock().unwrap().push("second"));

        handlers.dispatch(1, &Event::Storm(Storm::default()));
        assert_eq!(*hits.lock().unwrap(), ["second"]);
    }

    #[test]
    fn test_room_failure_handler() {
        let failed = Arc::new(Mutex::new(None));
        let sink = failed.clone();
        let handlers = Handlers::new().on_room_failure(move |room, err| {
            *sink.lock().unwrap() = Some((room, err.to_string()));
        });

        handlers.room_failed(3, &RoomError::Cancelled);
        assert_eq!(
            *failed.lock().unwrap(),
            Some((3, RoomError::Cancelled.to_string()))
        );
    }
}
