//! Identifier and timestamp strategies.
//!
//! An [`IdService`] is created once per store and owns both the clock and the
//! id generator. In deterministic mode both are counters, so two stores fed the
//! same calls produce byte-identical logs.

use uuid::Uuid;

use crate::clock::{Clock, DeterministicClock, Hlc, HlcClock};
use crate::ids::*;
use crate::CoreError;

/// High 64 bits shared by every deterministic uuid.
pub const DETERMINISTIC_UUID_PREFIX: u64 = 0x0000_0000_0000_7000;

pub trait IdGenerator: Send {
    fn next_uuid(&mut self) -> Uuid;
}

/// Time-ordered random ids (uuid v7).
#[derive(Debug, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_uuid(&mut self) -> Uuid {
        Uuid::now_v7()
    }
}

/// Strictly increasing counter ids.
#[derive(Debug, Default)]
pub struct DeterministicIds {
    counter: u64,
}

impl DeterministicIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for DeterministicIds {
    fn next_uuid(&mut self) -> Uuid {
        self.counter += 1;
        Uuid::from_u64_pair(DETERMINISTIC_UUID_PREFIX, self.counter)
    }
}

pub struct IdService {
    clock: Box<dyn Clock>,
    ids: Box<dyn IdGenerator>,
    deterministic: bool,
}

impl IdService {
    pub fn new(clock: Box<dyn Clock>, ids: Box<dyn IdGenerator>, deterministic: bool) -> Self {
        Self {
            clock,
            ids,
            deterministic,
        }
    }

    /// Wall-clock timestamps and uuid v7 ids.
    pub fn random() -> Self {
        Self::new(Box::new(HlcClock::new()), Box::new(RandomIds), false)
    }

    /// Counter-derived timestamps and ids for replayable runs.
    pub fn deterministic() -> Self {
        Self::new(
            Box::new(DeterministicClock::new()),
            Box::new(DeterministicIds::new()),
            true,
        )
    }

    pub fn for_mode(deterministic: bool) -> Self {
        if deterministic {
            Self::deterministic()
        } else {
            Self::random()
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    pub fn now(&mut self) -> Result<Hlc, CoreError> {
        self.clock.tick()
    }

    pub fn change_id(&mut self) -> ChangeId {
        ChangeId::from_uuid(self.ids.next_uuid())
    }

    pub fn change_set_id(&mut self) -> ChangeSetId {
        ChangeSetId::from_uuid(self.ids.next_uuid())
    }

    pub fn commit_id(&mut self) -> CommitId {
        CommitId::from_uuid(self.ids.next_uuid())
    }

    pub fn version_id(&mut self) -> VersionId {
        VersionId::from_uuid(self.ids.next_uuid())
    }

    pub fn conflict_id(&mut self) -> ConflictId {
        ConflictId::from_uuid(self.ids.next_uuid())
    }

    pub fn tx_id(&mut self) -> TxId {
        TxId::from_uuid(self.ids.next_uuid())
    }

    /// Moves the deterministic id counter past everything already stored, so a
    /// reopened store never reissues an id. No-op for random mode.
    pub fn skip_past(&mut self, highest: Option<Uuid>, latest: Option<Hlc>) {
        if !self.deterministic {
            return;
        }
        if let Some(highest) = highest {
            let (prefix, counter) = highest.as_u64_pair();
            if prefix == DETERMINISTIC_UUID_PREFIX {
                self.ids = Box::new(DeterministicIds { counter });
            }
        }
        if let Some(latest) = latest {
            self.clock = Box::new(DeterministicClock::starting_at(latest.wall_ms() + 1));
        }
    }
}

impl std::fmt::Debug for IdService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdService")
            .field("deterministic", &self.deterministic)
            .finish()
    }
}
