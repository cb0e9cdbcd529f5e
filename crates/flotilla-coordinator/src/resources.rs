use crate::types::ResourceVector;
use chrono::{DateTime, Utc};
use flotilla_core::{AgentId, FlotillaError, FlotillaResult, ReservationId, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Capacity held on one agent for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub amounts: ResourceVector,
    pub reserved_at: DateTime<Utc>,
}

struct Ledger {
    capacity: ResourceVector,
    reserved: ResourceVector,
    terminated: bool,
}

/// Tracks per-agent capacity and the reservations carved out of it.
///
/// For every agent and every dimension the sum of live reservations never
/// exceeds the declared capacity. Reserve is all-or-nothing.
#[derive(Default)]
pub struct ResourceManager {
    agents: HashMap<AgentId, Ledger>,
    reservations: HashMap<ReservationId, Reservation>,
    by_task: HashMap<TaskId, ReservationId>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an agent. Re-registering replaces the declared capacity.
    pub fn register_agent(&mut self, agent: AgentId, capacity: ResourceVector) {
        let reserved = self
            .agents
            .remove(&agent)
            .map(|l| l.reserved)
            .unwrap_or_default();
        self.agents.insert(
            agent,
            Ledger {
                capacity,
                reserved,
                terminated: false,
            },
        );
    }

    /// Refuse further reservations on an agent while existing ones drain.
    pub fn mark_terminated(&mut self, agent: AgentId) {
        if let Some(ledger) = self.agents.get_mut(&agent) {
            ledger.terminated = true;
        }
    }

    /// Forget an agent, releasing and returning whatever it still held.
    pub fn remove_agent(&mut self, agent: AgentId) -> Vec<Reservation> {
        let released = self.release_agent(agent);
        self.agents.remove(&agent);
        released
    }

    /// Atomically reserve `amounts` on `agent` for `task`.
    pub fn try_reserve(
        &mut self,
        agent: AgentId,
        task: TaskId,
        amounts: &ResourceVector,
        now: DateTime<Utc>,
    ) -> FlotillaResult<ReservationId> {
        let ledger = self
            .agents
            .get_mut(&agent)
            .ok_or(FlotillaError::UnknownAgent(agent))?;
        if ledger.terminated {
            return Err(FlotillaError::AgentUnhealthy(agent));
        }
        if self.by_task.contains_key(&task) {
            return Err(FlotillaError::AlreadyReserved(task));
        }
        let available = available_of(ledger);
        if let Some((dimension, requested, available)) = amounts.first_shortfall(&available) {
            return Err(FlotillaError::InsufficientResources {
                agent,
                dimension,
                requested,
                available,
            });
        }

        ledger.reserved.add(amounts);
        let reservation = Reservation {
            id: ReservationId::new(),
            agent_id: agent,
            task_id: task,
            amounts: amounts.clone(),
            reserved_at: now,
        };
        let id = reservation.id;
        self.by_task.insert(task, id);
        self.reservations.insert(id, reservation);
        debug!(agent_id = %agent, task_id = %task, reservation_id = %id, "Reserved resources");
        Ok(id)
    }

    /// Release a reservation. Releasing an unknown or already released id is a no-op.
    pub fn release(&mut self, id: ReservationId) -> Option<Reservation> {
        let reservation = self.reservations.remove(&id)?;
        self.by_task.remove(&reservation.task_id);
        if let Some(ledger) = self.agents.get_mut(&reservation.agent_id) {
            ledger.reserved.sub(&reservation.amounts);
        }
        Some(reservation)
    }

    /// Release whatever is held for `task`.
    pub fn release_task(&mut self, task: TaskId) -> Option<Reservation> {
        let id = *self.by_task.get(&task)?;
        self.release(id)
    }

    /// Release every reservation held on `agent`.
    pub fn release_agent(&mut self, agent: AgentId) -> Vec<Reservation> {
        let ids: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| r.agent_id == agent)
            .map(|r| r.id)
            .collect();
        ids.into_iter().filter_map(|id| self.release(id)).collect()
    }

    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.get(&id)
    }

    pub fn reservation_for_task(&self, task: TaskId) -> Option<&Reservation> {
        self.by_task
            .get(&task)
            .and_then(|id| self.reservations.get(id))
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Free capacity on `agent`.
    pub fn available(&self, agent: AgentId) -> Option<ResourceVector> {
        self.agents.get(&agent).map(available_of)
    }

    /// Whether `amounts` would currently fit on `agent`.
    pub fn fits(&self, agent: AgentId, amounts: &ResourceVector) -> bool {
        self.agents
            .get(&agent)
            .is_some_and(|l| !l.terminated && amounts.fits_within(&available_of(l)))
    }

    /// Peak utilization across dimensions, in percent.
    pub fn utilization(&self, agent: AgentId) -> f64 {
        self.agents
            .get(&agent)
            .map_or(0.0, |l| peak_percent(&l.reserved, &l.capacity))
    }

    /// Utilization per dimension, in percent.
    pub fn utilization_breakdown(&self, agent: AgentId) -> BTreeMap<String, f64> {
        let Some(ledger) = self.agents.get(&agent) else {
            return BTreeMap::new();
        };
        ledger
            .capacity
            .dimensions()
            .filter(|(_, cap)| *cap > 0)
            .map(|(dim, cap)| {
                (
                    dim.to_string(),
                    ledger.reserved.get(dim) as f64 / cap as f64 * 100.0,
                )
            })
            .collect()
    }

    /// Fleet-wide utilization over agents that are not terminated.
    ///
    /// Reservations and capacities are summed per dimension first, then the
    /// busiest dimension is reported. An empty fleet reads as 0%.
    pub fn system_utilization(&self) -> f64 {
        let mut capacity = ResourceVector::new();
        let mut reserved = ResourceVector::new();
        for ledger in self.agents.values().filter(|l| !l.terminated) {
            capacity.add(&ledger.capacity);
            reserved.add(&ledger.reserved);
        }
        peak_percent(&reserved, &capacity)
    }

    /// All reservations, ordered by id for stable snapshots.
    pub fn snapshot(&self) -> Vec<Reservation> {
        let mut reservations: Vec<Reservation> = self.reservations.values().cloned().collect();
        reservations.sort_by_key(|r| r.id);
        reservations
    }

    /// Rebuild the ledger from checkpointed parts.
    ///
    /// `agents` yields `(id, capacity, terminated)`. Fails if a reservation
    /// names an unknown agent, if a task holds two reservations, or if any
    /// agent would end up oversubscribed.
    pub fn from_parts(
        agents: impl IntoIterator<Item = (AgentId, ResourceVector, bool)>,
        reservations: Vec<Reservation>,
    ) -> FlotillaResult<Self> {
        let mut manager = Self::new();
        for (id, capacity, terminated) in agents {
            manager.register_agent(id, capacity);
            if terminated {
                manager.mark_terminated(id);
            }
        }
        for reservation in reservations {
            let Some(ledger) = manager.agents.get_mut(&reservation.agent_id) else {
                return Err(FlotillaError::IntegrityViolation(format!(
                    "reservation {} held on unknown agent {}",
                    reservation.id, reservation.agent_id
                )));
            };
            if manager.by_task.contains_key(&reservation.task_id) {
                return Err(FlotillaError::IntegrityViolation(format!(
                    "task {} holds more than one reservation",
                    reservation.task_id
                )));
            }
            ledger.reserved.add(&reservation.amounts);
            if let Some((dim, reserved, capacity)) =
                ledger.reserved.first_shortfall(&ledger.capacity)
            {
                return Err(FlotillaError::IntegrityViolation(format!(
                    "agent {} oversubscribed on {dim}: {reserved} reserved of {capacity}",
                    reservation.agent_id
                )));
            }
            manager.by_task.insert(reservation.task_id, reservation.id);
            manager.reservations.insert(reservation.id, reservation);
        }
        Ok(manager)
    }
}

fn available_of(ledger: &Ledger) -> ResourceVector {
    let mut available = ledger.capacity.clone();
    available.sub(&ledger.reserved);
    available
}

fn peak_percent(reserved: &ResourceVector, capacity: &ResourceVector) -> f64 {
    capacity
        .dimensions()
        .filter(|(_, cap)| *cap > 0)
        .map(|(dim, cap)| reserved.get(dim) as f64 / cap as f64 * 100.0)
        .fold(0.0, f64::max)
}
