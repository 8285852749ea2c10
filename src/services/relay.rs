use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::Utc;
use futures::Stream;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    watch,
};
use tracing::{debug, info, warn};

use crate::{
    error::AppError,
    models::location::{Coordinate, LocationEntry, LocationEvent, ParticipantKey, ParticipantRole},
};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum RelayError {
    #[error("location sharing is not active for this participant")]
    NotWatching,
    #[error("ride {0} is no longer live")]
    RideClosed(String),
    #[error("position is out of range")]
    InvalidPosition,
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::InvalidPosition => AppError::BadRequest(err.to_string()),
            RelayError::NotWatching | RelayError::RideClosed(_) => {
                AppError::Conflict(err.to_string())
            }
        }
    }
}

/// One reading from a participant's position watch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PositionReport {
    Fix {
        lat: f64,
        lng: f64,
        #[serde(default)]
        accuracy: Option<f64>,
    },
    Unavailable { unavailable: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Published(LocationEntry),
    /// Positioning failed on the client; nothing was written.
    Notice(String),
}

struct RideRecord {
    entries: HashMap<ParticipantKey, LocationEntry>,
    /// One cancel handle per active watch. Dropping the sender ends every
    /// subscription opened under that watch.
    watching: HashMap<ParticipantKey, watch::Sender<()>>,
    tx: broadcast::Sender<LocationEvent>,
}

impl RideRecord {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            entries: HashMap::new(),
            watching: HashMap::new(),
            tx,
        }
    }

    fn scope(&self, role: ParticipantRole) -> Vec<LocationEntry> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.key.role == role)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.key.participant_id.cmp(&b.key.participant_id));
        entries
    }

    fn is_idle(&self) -> bool {
        self.watching.is_empty() && self.tx.receiver_count() == 0
    }
}

#[derive(Default)]
struct RelayState {
    rides: HashMap<String, RideRecord>,
    closed: HashSet<String>,
}

impl RelayState {
    fn open_record(&mut self, ride_id: &str) -> Result<&mut RideRecord, RelayError> {
        if self.closed.contains(ride_id) {
            return Err(RelayError::RideClosed(ride_id.to_string()));
        }
        Ok(self
            .rides
            .entry(ride_id.to_string())
            .or_insert_with(RideRecord::new))
    }

    fn release_if_idle(&mut self, ride_id: &str) {
        if self.rides.get(ride_id).is_some_and(RideRecord::is_idle) {
            self.rides.remove(ride_id);
            debug!(ride_id, "idle live location record dropped");
        }
    }
}

/// Last-value location records, one per live ride.
///
/// Each participant owns exactly one slot keyed by role and participant id.
/// Drivers receive updates for the passenger scope, passengers for the driver
/// scope. Records live only in memory: they are dropped once nobody watches
/// or listens, and a closed ride can never be reopened.
#[derive(Clone, Default)]
pub struct LocationRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LocationRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts the position watch for a participant.
    pub fn activate(&self, ride_id: &str, key: ParticipantKey) -> Result<(), RelayError> {
        let mut state = self.state();
        let record = state.open_record(ride_id)?;
        if !record.watching.contains_key(&key) {
            let (cancel, _) = watch::channel(());
            record.watching.insert(key.clone(), cancel);
            info!(ride_id, role = %key.role, participant = %key.participant_id, "location sharing started");
        }
        Ok(())
    }

    /// Writes a report into the participant's own slot.
    pub fn publish(
        &self,
        ride_id: &str,
        key: &ParticipantKey,
        report: PositionReport,
    ) -> Result<PublishOutcome, RelayError> {
        let (position, accuracy_m) = match report {
            PositionReport::Unavailable { unavailable } => {
                debug!(ride_id, participant = %key.participant_id, reason = %unavailable, "position unavailable");
                return Ok(PublishOutcome::Notice(format!(
                    "location unavailable, not sharing: {unavailable}"
                )));
            }
            PositionReport::Fix { lat, lng, accuracy } => (Coordinate::new(lat, lng), accuracy),
        };
        if !position.is_valid() {
            return Err(RelayError::InvalidPosition);
        }

        let mut state = self.state();
        if state.closed.contains(ride_id) {
            return Err(RelayError::RideClosed(ride_id.to_string()));
        }
        let record = state
            .rides
            .get_mut(ride_id)
            .filter(|record| record.watching.contains_key(key))
            .ok_or(RelayError::NotWatching)?;
        let entry = LocationEntry {
            ride_id: ride_id.to_string(),
            key: key.clone(),
            position,
            accuracy_m,
            recorded_at: Utc::now(),
        };
        record.entries.insert(key.clone(), entry.clone());
        // No receivers is fine: nobody is looking at the map right now.
        let _ = record.tx.send(LocationEvent::Moved(entry.clone()));
        Ok(PublishOutcome::Published(entry))
    }

    /// Stops the participant's watch, clears its slot and ends the
    /// subscriptions opened under that watch.
    pub fn deactivate(&self, ride_id: &str, key: &ParticipantKey) {
        let mut state = self.state();
        let Some(record) = state.rides.get_mut(ride_id) else {
            return;
        };
        let was_watching = record.watching.remove(key).is_some();
        if record.entries.remove(key).is_some() || was_watching {
            let _ = record.tx.send(LocationEvent::Left {
                ride_id: ride_id.to_string(),
                key: key.clone(),
            });
            info!(ride_id, role = %key.role, participant = %key.participant_id, "location sharing stopped");
        }
        state.release_if_idle(ride_id);
    }

    /// Current entries in the scope `role` listens to.
    pub fn snapshot(&self, ride_id: &str, role: ParticipantRole) -> Vec<LocationEntry> {
        self.state()
            .rides
            .get(ride_id)
            .map(|record| record.scope(role.sibling()))
            .unwrap_or_default()
    }

    fn subscribe(
        &self,
        ride_id: &str,
        role: ParticipantRole,
        cancel: Option<watch::Receiver<()>>,
    ) -> Result<Subscription, RelayError> {
        let mut state = self.state();
        let record = state.open_record(ride_id)?;
        Ok(Subscription {
            relay: self.clone(),
            ride_id: ride_id.to_string(),
            listen_to: role.sibling(),
            initial: record.scope(role.sibling()),
            rx: Some(record.tx.subscribe()),
            cancel,
        })
    }

    /// Drops the ride's record for good. Open subscriptions end and later
    /// activations and writes fail.
    pub fn close_ride(&self, ride_id: &str) {
        let mut state = self.state();
        state.closed.insert(ride_id.to_string());
        if let Some(record) = state.rides.remove(ride_id) {
            info!(
                ride_id,
                participants = record.watching.len(),
                "live location record closed"
            );
        }
    }

    /// Starts a watch and the matching subscription in one go. The
    /// subscription ends when the watch is deactivated.
    pub fn join(&self, ride_id: &str, key: ParticipantKey) -> Result<LiveSession, RelayError> {
        let cancel = {
            let mut state = self.state();
            let record = state.open_record(ride_id)?;
            let sender = record.watching.entry(key.clone()).or_insert_with(|| {
                info!(ride_id, role = %key.role, participant = %key.participant_id, "location sharing started");
                watch::channel(()).0
            });
            sender.subscribe()
        };
        let subscription = self.subscribe(ride_id, key.role, Some(cancel))?;
        Ok(LiveSession {
            relay: self.clone(),
            ride_id: ride_id.to_string(),
            key,
            subscription,
            left: false,
        })
    }

    pub fn live_rides(&self) -> usize {
        self.state().rides.len()
    }
}

/// Receives changes to one scope of a ride's location record.
pub struct Subscription {
    relay: LocationRelay,
    ride_id: String,
    listen_to: ParticipantRole,
    initial: Vec<LocationEntry>,
    rx: Option<broadcast::Receiver<LocationEvent>>,
    cancel: Option<watch::Receiver<()>>,
}

impl Subscription {
    /// Next change in the watched scope, or `None` once the ride closes or
    /// the owning watch is deactivated.
    pub async fn recv(&mut self) -> Option<LocationEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            let received = match self.cancel.as_mut() {
                Some(cancel) => tokio::select! {
                    biased;
                    _ = cancel.changed() => return None,
                    received = rx.recv() => received,
                },
                None => rx.recv().await,
            };
            match received {
                Ok(event) if event.key().role == self.listen_to => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "location subscriber lagged, skipping to latest");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Release the receiver first so the idle check sees it gone.
        self.rx.take();
        self.relay.state().release_if_idle(&self.ride_id);
    }
}

/// A participant's position watch plus its subscription to the sibling scope.
/// Leaving, or dropping the session, tears both down.
pub struct LiveSession {
    relay: LocationRelay,
    ride_id: String,
    key: ParticipantKey,
    subscription: Subscription,
    left: bool,
}

impl LiveSession {
    pub fn key(&self) -> &ParticipantKey {
        &self.key
    }

    pub fn report(&self, report: PositionReport) -> Result<PublishOutcome, RelayError> {
        self.relay.publish(&self.ride_id, &self.key, report)
    }

    pub async fn next_update(&mut self) -> Option<LocationEvent> {
        self.subscription.recv().await
    }

    /// Sibling entries present at join time, then live changes. Dropping the
    /// stream leaves the ride.
    pub fn into_stream(mut self) -> impl Stream<Item = LocationEvent> + Send + 'static {
        let initial: Vec<_> = std::mem::take(&mut self.subscription.initial)
            .into_iter()
            .map(LocationEvent::Moved)
            .collect();
        let backlog = futures::stream::iter(initial);
        let live = futures::stream::unfold(self, |mut session| async move {
            session.next_update().await.map(|event| (event, session))
        });
        futures::StreamExt::chain(backlog, live)
    }

    pub fn leave(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if !self.left {
            self.left = true;
            self.relay.deactivate(&self.ride_id, &self.key);
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn fix(lat: f64, lng: f64) -> PositionReport {
        PositionReport::Fix {
            lat,
            lng,
            accuracy: Some(5.0),
        }
    }

    fn driver() -> ParticipantKey {
        ParticipantKey::new(ParticipantRole::Driver, "d-1")
    }

    fn passenger(id: &str) -> ParticipantKey {
        ParticipantKey::new(ParticipantRole::Passenger, id)
    }

    #[tokio::test]
    async fn passenger_sees_driver_updates() {
        let relay = LocationRelay::new();
        let driving = relay.join("r1", driver()).expect("driver joins");
        let mut rider = relay.join("r1", passenger("p-1")).expect("rider joins");

        driving.report(fix(12.97, 77.59)).expect("publish");
        match rider.next_update().await {
            Some(LocationEvent::Moved(entry)) => {
                assert_eq!(&entry.key, driving.key());
                assert_eq!(entry.position, Coordinate::new(12.97, 77.59));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn driver_only_hears_passengers() {
        let relay = LocationRelay::new();
        let mut driving = relay.join("r1", driver()).unwrap();
        let p1 = relay.join("r1", passenger("p-1")).unwrap();

        driving.report(fix(1.0, 1.0)).expect("own publish");
        p1.report(fix(2.0, 2.0)).expect("passenger publish");

        match driving.next_update().await {
            Some(LocationEvent::Moved(entry)) => assert_eq!(entry.key, passenger("p-1")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn writes_stay_in_own_slot() {
        let relay = LocationRelay::new();
        relay.activate("r1", passenger("p-1")).unwrap();
        relay.activate("r1", passenger("p-2")).unwrap();
        relay.publish("r1", &passenger("p-1"), fix(1.0, 1.0)).unwrap();
        relay.publish("r1", &passenger("p-2"), fix(2.0, 2.0)).unwrap();
        relay.publish("r1", &passenger("p-1"), fix(3.0, 3.0)).unwrap();

        let seen = relay.snapshot("r1", ParticipantRole::Driver);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].position, Coordinate::new(3.0, 3.0));
        assert_eq!(seen[1].position, Coordinate::new(2.0, 2.0));
    }

    #[test]
    fn unavailable_position_writes_nothing() {
        let relay = LocationRelay::new();
        relay.activate("r1", driver()).unwrap();
        let outcome = relay
            .publish(
                "r1",
                &driver(),
                PositionReport::Unavailable {
                    unavailable: "permission denied".into(),
                },
            )
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::Notice(_)));
        assert!(relay.snapshot("r1", ParticipantRole::Passenger).is_empty());
    }

    #[test]
    fn publishing_requires_an_active_watch() {
        let relay = LocationRelay::new();
        relay.activate("r1", driver()).unwrap();
        assert_eq!(
            relay.publish("r1", &passenger("p-1"), fix(1.0, 1.0)),
            Err(RelayError::NotWatching)
        );
        assert_eq!(
            relay.publish("r2", &driver(), fix(1.0, 1.0)),
            Err(RelayError::NotWatching)
        );
    }

    #[tokio::test]
    async fn leaving_stops_writes_and_notifies() {
        let relay = LocationRelay::new();
        let mut rider = relay.join("r1", passenger("p-1")).unwrap();
        let driving = relay.join("r1", driver()).unwrap();
        driving.report(fix(1.0, 1.0)).unwrap();
        assert!(matches!(rider.next_update().await, Some(LocationEvent::Moved(_))));

        driving.leave();
        assert!(matches!(rider.next_update().await, Some(LocationEvent::Left { .. })));
        assert!(relay.snapshot("r1", ParticipantRole::Passenger).is_empty());
        assert_eq!(
            relay.publish("r1", &driver(), fix(2.0, 2.0)),
            Err(RelayError::NotWatching)
        );
    }

    #[tokio::test]
    async fn deactivating_ends_the_participants_subscription() {
        let relay = LocationRelay::new();
        let mut rider = relay.join("r1", passenger("p-1")).unwrap();
        relay.activate("r1", driver()).unwrap();

        relay.deactivate("r1", &passenger("p-1"));
        relay.publish("r1", &driver(), fix(5.0, 5.0)).unwrap();

        let after = tokio::time::timeout(Duration::from_secs(1), rider.next_update())
            .await
            .expect("subscription resolves instead of hanging");
        assert_eq!(after, None);
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_the_watch() {
        let relay = LocationRelay::new();
        relay.activate("r1", driver()).unwrap();
        let stream = relay.join("r1", passenger("p-1")).unwrap().into_stream();
        relay.publish("r1", &passenger("p-1"), fix(1.0, 1.0)).unwrap();

        drop(stream);
        assert_eq!(
            relay.publish("r1", &passenger("p-1"), fix(2.0, 2.0)),
            Err(RelayError::NotWatching)
        );
        assert!(relay.snapshot("r1", ParticipantRole::Driver).is_empty());
    }

    #[tokio::test]
    async fn closing_the_ride_ends_subscriptions() {
        let relay = LocationRelay::new();
        let mut sub = relay
            .subscribe("r1", ParticipantRole::Passenger, None)
            .unwrap();
        relay.close_ride("r1");
        assert_eq!(sub.recv().await, None);
        assert_eq!(relay.live_rides(), 0);
    }

    #[test]
    fn closed_rides_stay_closed() {
        let relay = LocationRelay::new();
        relay.activate("r1", driver()).unwrap();
        relay.close_ride("r1");

        assert!(matches!(
            relay.subscribe("r1", ParticipantRole::Passenger, None),
            Err(RelayError::RideClosed(_))
        ));
        assert_eq!(
            relay.activate("r1", driver()),
            Err(RelayError::RideClosed("r1".into()))
        );
        assert!(matches!(
            relay.join("r1", passenger("p-1")),
            Err(RelayError::RideClosed(_))
        ));
        assert_eq!(
            relay.publish("r1", &driver(), fix(1.0, 1.0)),
            Err(RelayError::RideClosed("r1".into()))
        );
        assert_eq!(relay.live_rides(), 0);
    }

    #[test]
    fn idle_records_are_dropped() {
        let relay = LocationRelay::new();
        let session = relay.join("r1", driver()).unwrap();
        assert_eq!(relay.live_rides(), 1);
        session.leave();
        assert_eq!(relay.live_rides(), 0);

        relay.activate("r2", driver()).unwrap();
        relay.deactivate("r2", &driver());
        assert_eq!(relay.live_rides(), 0);
    }
}
