//! Optional lifecycle observers for matches and tournaments.
//!
//! Nothing in the crate depends on observers being attached; they only receive copies of
//! lifecycle events, synchronously, on the thread that produced them.

use std::{fmt, sync::Arc};

use crate::match_runner::MatchStatus;
use crate::tournament::{PlayerKey, TournamentStatus};

/// Something that happened to a match or a tournament.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// A match was built.
    MatchCreated {
        /// Match id.
        match_id: u64,
        /// Match name.
        name: String,
    },
    /// A match moved to a new status.
    MatchStatusChanged {
        /// Match id.
        match_id: u64,
        /// New status.
        status: MatchStatus,
    },
    /// A tournament started a match.
    MatchStarted {
        /// Tournament id.
        tournament_id: String,
        /// Match id.
        match_id: u64,
        /// Participants, in seat order.
        players: Vec<PlayerKey>,
        /// Number of live matches, this one included.
        live: usize,
    },
    /// A tournament match ended, successfully or not.
    MatchEnded {
        /// Tournament id.
        tournament_id: String,
        /// Match id.
        match_id: u64,
        /// Whether results were recorded.
        success: bool,
        /// Number of live matches left.
        live: usize,
    },
    /// A tournament moved to a new status.
    TournamentStatusChanged {
        /// Tournament id.
        tournament_id: String,
        /// New status.
        status: TournamentStatus,
    },
    /// Rank states changed after a match.
    RanksUpdated {
        /// Tournament id.
        tournament_id: String,
    },
}

/// Receives lifecycle events.
pub trait LifecycleObserver: Send + Sync {
    /// Called for every event. Must not block for long.
    fn on_event(&self, event: &LifecycleEvent);
}

impl<F> LifecycleObserver for F
where
    F: Fn(&LifecycleEvent) + Send + Sync,
{
    fn on_event(&self, event: &LifecycleEvent) {
        self(event)
    }
}

/// A cheap-to-clone list of observers.
#[derive(Clone, Default)]
pub struct Observers {
    list: Vec<Arc<dyn LifecycleObserver>>,
}

impl Observers {
    /// No observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer.
    #[must_use]
    pub fn with(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.list.push(observer);
        self
    }

    /// True when nobody listens.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub(crate) fn publish(&self, event: LifecycleEvent) {
        for observer in &self.list {
            observer.on_event(&event);
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Observers({})", self.list.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn every_observer_gets_the_event() {
        let seen = Arc::new(Mutex::new(vec![]));
        let a = seen.clone();
        let b = seen.clone();
        let observers = Observers::new()
            .with(Arc::new(move |e: &LifecycleEvent| a.lock().unwrap().push(("a", e.clone()))))
            .with(Arc::new(move |e: &LifecycleEvent| b.lock().unwrap().push(("b", e.clone()))));

        observers.publish(LifecycleEvent::MatchCreated {
            match_id: 1,
            name: "m".into(),
        });
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "a");
        assert_eq!(seen[1].0, "b");
    }

    #[test]
    fn no_observer_is_fine() {
        let observers = Observers::default();
        assert!(observers.is_empty());
        observers.publish(LifecycleEvent::RanksUpdated {
            tournament_id: "t".into(),
        });
    }
}
