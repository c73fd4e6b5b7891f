//! Daily roster initialization.
//!
//! Builds the starting presence state for every tracked employee from the
//! roster and whatever attendance rows already exist for the day, so a
//! restarted agent picks up where it left off.

use crate::core::presence::{EmployeeId, PresenceState};
use crate::store::{RetryPolicy, SharedStore, StoreError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Role of a user in the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Manager,
    #[default]
    Employee,
}

impl Role {
    /// Whether users with this role receive leave approval requests.
    pub fn approves_leave(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

/// One user tracked by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: EmployeeId,
    pub username: String,
    #[serde(default)]
    pub role: Role,
}

impl RosterEntry {
    pub fn new(id: EmployeeId, username: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            username: username.into(),
            role,
        }
    }

    /// Roster entry with the `Employee` role.
    pub fn employee(id: EmployeeId, username: impl Into<String>) -> Self {
        Self::new(id, username, Role::Employee)
    }
}

/// Initialization failures. Any of them aborts the day.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("roster is empty; nothing to track")]
    EmptyRoster,
    #[error("failed to fetch roster: {0}")]
    Roster(#[source] StoreError),
    #[error("failed to look up attendance for employee {employee}: {source}")]
    Lookup {
        employee: EmployeeId,
        #[source]
        source: StoreError,
    },
}

/// Starting state for one day.
#[derive(Debug, Clone)]
pub struct DayRoster {
    pub date: NaiveDate,
    pub states: HashMap<EmployeeId, PresenceState>,
    /// Lowercased username to employee id
    pub usernames: HashMap<String, EmployeeId>,
}

impl DayRoster {
    /// Roster where every entry starts Absent. Used when no store is consulted.
    pub fn absent(date: NaiveDate, entries: &[RosterEntry]) -> Self {
        let mut roster = Self {
            date,
            states: HashMap::with_capacity(entries.len()),
            usernames: HashMap::with_capacity(entries.len()),
        };
        for entry in entries {
            roster.insert(entry, PresenceState::absent(entry.id, date));
        }
        roster
    }

    fn insert(&mut self, entry: &RosterEntry, state: PresenceState) {
        self.usernames
            .insert(entry.username.to_lowercase(), entry.id);
        self.states.insert(entry.id, state);
    }

    /// Resolve a username (case-insensitive) to an employee id.
    pub fn resolve(&self, username: &str) -> Option<EmployeeId> {
        self.usernames.get(&username.to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Builds a [`DayRoster`] from the record store. Never writes.
pub struct DailyRosterInitializer {
    store: SharedStore,
    retry: RetryPolicy,
}

impl DailyRosterInitializer {
    pub fn new(store: SharedStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Build the starting states for `date`.
    ///
    /// Running this twice against an unchanged store yields the same result.
    pub async fn initialize(&self, date: NaiveDate) -> Result<DayRoster, InitError> {
        let store = &self.store;
        let entries = self
            .retry
            .run("list_roster", move || store.list_roster())
            .await
            .map_err(InitError::Roster)?;

        if entries.is_empty() {
            return Err(InitError::EmptyRoster);
        }

        let mut roster = DayRoster {
            date,
            states: HashMap::with_capacity(entries.len()),
            usernames: HashMap::with_capacity(entries.len()),
        };
        let mut resumed = 0usize;

        for entry in &entries {
            let employee = entry.id;
            let existing = self
                .retry
                .run("find_record", move || store.find_record(employee, date))
                .await
                .map_err(|source| InitError::Lookup { employee, source })?;

            let state = match existing {
                Some(record) => {
                    debug!(
                        employee,
                        status = %record.status,
                        "seeding presence from existing record"
                    );
                    resumed += 1;
                    PresenceState::from_record(&record)
                }
                None => PresenceState::absent(employee, date),
            };
            roster.insert(entry, state);
        }

        info!(
            %date,
            employees = roster.len(),
            resumed,
            "daily roster initialized"
        );
        Ok(roster)
    }
}
