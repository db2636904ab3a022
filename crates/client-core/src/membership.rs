//! Optimistic add/remove of one identifier in a remote set-valued field.
//!
//! Local state flips before the remote write is issued, and every remote
//! write is a single set union or set difference. Two bindings exist:
//! favorites (`users/{me}.favorites`, element = image URL) and participation
//! (`events/{id}.participants`, element = my user id).

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::AppError,
    store::DocumentStore,
    types::{DocumentPath, FieldUpdate, MembershipField, UserIdentity},
};

/// What to do with the optimistic local state when the remote write fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Restore the last confirmed value unless a newer toggle of the same
    /// element has been issued since.
    #[default]
    Rollback,
    /// Leave the optimistic value in place.
    KeepOptimistic,
}

impl FailurePolicy {
    pub fn from_rollback_flag(rollback: bool) -> Self {
        if rollback {
            Self::Rollback
        } else {
            Self::KeepOptimistic
        }
    }
}

#[derive(Debug, Default)]
struct LocalState {
    /// Optimistic membership shown to the user.
    members: HashSet<String>,
    /// Membership last read from or confirmed by the remote store.
    confirmed: HashSet<String>,
    /// Toggle counter per element; only the latest toggle may roll back.
    generations: HashMap<String, u64>,
    /// Remote writes not yet settled, per element.
    in_flight: HashMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Favorites,
    Participation { event_id: String },
}

/// Local membership view plus the toggle protocol against a remote store.
#[derive(Debug, Clone)]
pub struct MembershipToggle<S> {
    store: S,
    scope: Scope,
    policy: FailurePolicy,
    local: Arc<Mutex<LocalState>>,
}

impl<S: DocumentStore> MembershipToggle<S> {
    /// Favorites of the signed-in user.
    pub fn favorites(store: S, policy: FailurePolicy) -> Self {
        Self::with_scope(store, Scope::Favorites, policy)
    }

    /// Participants of one event.
    pub fn participation(store: S, event_id: impl Into<String>, policy: FailurePolicy) -> Self {
        Self::with_scope(
            store,
            Scope::Participation {
                event_id: event_id.into(),
            },
            policy,
        )
    }

    fn with_scope(store: S, scope: Scope, policy: FailurePolicy) -> Self {
        Self {
            store,
            scope,
            policy,
            local: Arc::default(),
        }
    }

    pub fn field(&self) -> MembershipField {
        match self.scope {
            Scope::Favorites => MembershipField::Favorites,
            Scope::Participation { .. } => MembershipField::Participants,
        }
    }

    /// Replace local state with members read from the remote record.
    pub fn seed<I, T>(&self, members: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let members: HashSet<String> = members.into_iter().map(Into::into).collect();
        let mut local = self.lock_local();
        local.confirmed.clone_from(&members);
        local.members = members;
    }

    /// Adopt a fresher remote view, e.g. from a live subscription.
    ///
    /// Elements with a write still in flight keep their optimistic value.
    pub fn resync<I, T>(&self, members: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let remote: HashSet<String> = members.into_iter().map(Into::into).collect();
        let mut local = self.lock_local();
        let LocalState {
            members,
            confirmed,
            in_flight,
            ..
        } = &mut *local;

        members.retain(|element| in_flight.contains_key(element) || remote.contains(element));
        for element in &remote {
            if !in_flight.contains_key(element) {
                members.insert(element.clone());
            }
        }
        *confirmed = remote;
    }

    pub fn is_member(&self, element: &str) -> bool {
        self.lock_local().members.contains(element)
    }

    /// Local members, sorted.
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.lock_local().members.iter().cloned().collect();
        members.sort();
        members
    }

    /// Flip `element` and issue exactly one remote union or difference.
    ///
    /// Returns the intended membership. Nothing is sent, and local state is
    /// untouched, when `identity` is absent or `element` is empty.
    pub async fn toggle(
        &self,
        identity: Option<&UserIdentity>,
        element: &str,
    ) -> Result<bool, AppError> {
        let identity = identity.ok_or_else(|| AppError::unauthenticated("toggle_membership"))?;
        if element.trim().is_empty() {
            return Err(AppError::invalid_argument(
                "membership element must not be empty",
            ));
        }

        let parent = match &self.scope {
            Scope::Favorites => DocumentPath::user(identity.as_str()),
            Scope::Participation { event_id } => DocumentPath::event(event_id.as_str()),
        };
        let field = self.field().field_name().to_owned();

        let (intended, generation) = {
            let mut local = self.lock_local();
            let intended = !local.members.remove(element);
            if intended {
                local.members.insert(element.to_owned());
            }
            *local.in_flight.entry(element.to_owned()).or_insert(0) += 1;
            let generation = local.generations.entry(element.to_owned()).or_insert(0);
            *generation += 1;
            (intended, *generation)
        };

        let elements = vec![element.to_owned()];
        let update = if intended {
            FieldUpdate::ArrayUnion { field, elements }
        } else {
            FieldUpdate::ArrayRemove { field, elements }
        };

        debug!(%parent, element, intended, "issuing membership update");
        let result = self.store.update(&parent, vec![update]).await;

        let mut local = self.lock_local();
        if let Some(pending) = local.in_flight.get_mut(element) {
            *pending -= 1;
            if *pending == 0 {
                local.in_flight.remove(element);
            }
        }
        match result {
            Ok(()) => {
                if intended {
                    local.confirmed.insert(element.to_owned());
                } else {
                    local.confirmed.remove(element);
                }
                Ok(intended)
            }
            Err(err) => {
                let latest = local.generations.get(element) == Some(&generation);
                let rolled_back = self.policy == FailurePolicy::Rollback && latest;
                if rolled_back {
                    if local.confirmed.contains(element) {
                        local.members.insert(element.to_owned());
                    } else {
                        local.members.remove(element);
                    }
                }
                drop(local);
                warn!(%parent, element, intended, rolled_back, error = %err, "membership update failed");
                Err(err.into_write_error())
            }
        }
    }

    /// Participation toggle for the caller's own identity.
    pub async fn toggle_self(&self, identity: Option<&UserIdentity>) -> Result<bool, AppError> {
        let identity = identity.ok_or_else(|| AppError::unauthenticated("toggle_participation"))?;
        self.toggle(Some(identity), identity.as_str()).await
    }

    fn lock_local(&self) -> MutexGuard<'_, LocalState> {
        // Every critical section leaves the state consistent, so poisoning is harmless.
        self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
