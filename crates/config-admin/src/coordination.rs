//! Transactional batching of delivery work.
//!
//! A [`Coordination`] is an explicit handle the caller opens around a group
//! of configuration changes. Work submitted with the handle is buffered by a
//! per-manager [`CoordinationBatcher`] participant. When the coordination
//! ends or fails the buffered delivery tasks are compacted and released to
//! the update queue. Buffered events are released unchanged.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ConfigAdminError, Result};
use crate::event::EventDispatch;
use crate::queue::DeliveryQueue;
use crate::target::TargetKind;
use crate::targeted::service_pid;
use crate::task::DeliveryTask;

/// Callback interface for coordination participants. Ending and failing
/// take the same path unless a participant says otherwise.
pub trait Participant: Send + Sync {
    fn ended(&self, coordination: &Coordination);

    fn failed(&self, coordination: &Coordination, _reason: &str) {
        self.ended(coordination);
    }
}

struct Registered {
    key: Uuid,
    participant: Arc<dyn Participant>,
    any: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct CoordinationState {
    terminated: bool,
    participants: Vec<Registered>,
}

/// Explicit transaction handle.
pub struct Coordination {
    id: Uuid,
    name: String,
    state: Mutex<CoordinationState>,
}

impl Coordination {
    pub fn begin(name: impl Into<String>) -> Self {
        let coordination = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: Mutex::new(CoordinationState::default()),
        };
        debug!(coordination = %coordination.name, id = %coordination.id, "Coordination started");
        coordination
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Participant registered under `key`, created on first use.
    pub fn participant<P, F>(&self, key: Uuid, create: F) -> Result<Arc<P>>
    where
        P: Participant + Any + Send + Sync + 'static,
        F: FnOnce() -> P,
    {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(ConfigAdminError::CoordinationTerminated(self.name.clone()));
        }
        if let Some(existing) = state.participants.iter().find(|r| r.key == key) {
            if let Ok(found) = existing.any.clone().downcast::<P>() {
                return Ok(found);
            }
        }
        let participant = Arc::new(create());
        state.participants.push(Registered {
            key,
            participant: participant.clone(),
            any: participant.clone(),
        });
        Ok(participant)
    }

    /// End the coordination, releasing every participant's work.
    pub fn end(&self) -> Result<()> {
        let participants = self.terminate()?;
        debug!(coordination = %self.name, participants = participants.len(), "Coordination ended");
        for p in participants {
            p.ended(self);
        }
        Ok(())
    }

    /// Fail the coordination. Participants are notified like on end.
    pub fn fail(&self, reason: &str) -> Result<()> {
        let participants = self.terminate()?;
        warn!(coordination = %self.name, reason = %reason, "Coordination failed");
        for p in participants {
            p.failed(self, reason);
        }
        Ok(())
    }

    fn terminate(&self) -> Result<Vec<Arc<dyn Participant>>> {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(ConfigAdminError::CoordinationTerminated(self.name.clone()));
        }
        state.terminated = true;
        Ok(state
            .participants
            .drain(..)
            .map(|r| r.participant)
            .collect())
    }
}

impl Drop for Coordination {
    fn drop(&mut self) {
        if !self.is_terminated() {
            let _ = self.fail("dropped without end");
        }
    }
}

impl std::fmt::Debug for Coordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordination")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[derive(Default)]
struct Buffered {
    tasks: Vec<DeliveryTask>,
    events: Vec<EventDispatch>,
}

/// Per-manager participant buffering delivery tasks and events.
pub struct CoordinationBatcher {
    updates: Arc<DeliveryQueue<DeliveryTask>>,
    events: Arc<DeliveryQueue<EventDispatch>>,
    buffered: Mutex<Buffered>,
}

impl CoordinationBatcher {
    pub fn new(
        updates: Arc<DeliveryQueue<DeliveryTask>>,
        events: Arc<DeliveryQueue<EventDispatch>>,
    ) -> Self {
        Self {
            updates,
            events,
            buffered: Mutex::new(Buffered::default()),
        }
    }

    pub fn add_task(&self, task: DeliveryTask) {
        self.buffered.lock().tasks.push(task);
    }

    pub fn add_event(&self, dispatch: EventDispatch) {
        self.buffered.lock().events.push(dispatch);
    }
}

impl Participant for CoordinationBatcher {
    fn ended(&self, coordination: &Coordination) {
        let Buffered { tasks, events } = std::mem::take(&mut *self.buffered.lock());
        let submitted = tasks.len();
        let compacted = compact(tasks);
        debug!(
            coordination = %coordination.name(),
            submitted,
            released = compacted.len(),
            "Releasing coordinated delivery tasks"
        );
        for task in compacted {
            self.updates.schedule(task);
        }
        for dispatch in events {
            self.events.schedule(dispatch);
        }
    }
}

/// Collapse buffered tasks:
///
/// 1. per configuration PID only the last update or delete survives;
/// 2. a delete following a creation (first update at revision 1) cancels
///    both;
/// 3. plain initial provides drop PIDs that a surviving update or delete
///    will deliver anyway, and vanish when no PID is left.
///
/// Survivors keep their relative order.
pub fn compact(tasks: Vec<DeliveryTask>) -> Vec<DeliveryTask> {
    let mut keep = vec![true; tasks.len()];
    let mut last: HashMap<String, usize> = HashMap::new();
    let mut first_is_create: HashMap<String, bool> = HashMap::new();

    for (i, task) in tasks.iter().enumerate() {
        let Some((pid, is_delete)) = task.change_pid() else {
            continue;
        };
        let created = match task {
            DeliveryTask::Update(change) => change.revision() == 1,
            _ => false,
        };
        let first_created = *first_is_create.entry(pid.to_string()).or_insert(created);
        let previous = last.insert(pid.to_string(), i);
        if let Some(previous) = previous {
            keep[previous] = false;
            if is_delete && first_created {
                keep[i] = false;
                last.remove(pid);
                first_is_create.remove(pid);
            }
        }
    }

    let delivered: HashSet<String> = last
        .values()
        .filter_map(|&i| tasks[i].change_pid())
        .map(|(pid, _)| service_pid(pid).to_string())
        .collect();

    tasks
        .into_iter()
        .zip(keep)
        .filter(|(_, keep)| *keep)
        .filter_map(|(task, _)| match task {
            DeliveryTask::InitialProvide { target, pids } if target.kind() == TargetKind::Plain => {
                let pids: Vec<String> = pids
                    .into_iter()
                    .filter(|pid| !delivered.contains(pid.as_str()))
                    .collect();
                if pids.is_empty() {
                    None
                } else {
                    Some(DeliveryTask::InitialProvide { target, pids })
                }
            }
            other => Some(other),
        })
        .collect()
}
