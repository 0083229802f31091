//! Orchestrator actor - owns the session table and admission.
//!
//! The table is mutated only here. Sessions run in their own tasks; the
//! actor just tracks which ids are reserved, which are live, and which
//! retired recently.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply send failures are ignored; the caller may have gone away

use std::collections::{HashMap, HashSet, VecDeque};

use runcell_core::SessionId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::commands::{Lookup, OrchestratorCommand, OrchestratorError, OrchestratorStats};
use crate::session::{Retirement, SessionHandle};

/// A row in the session table.
#[derive(Debug)]
enum Slot {
    /// Admitted; workspace and terminal are being set up.
    Reserved,
    Live(SessionHandle),
}

/// Remembers recently retired ids, oldest forgotten first.
#[derive(Debug)]
struct Tombstones {
    order: VecDeque<SessionId>,
    ids: HashSet<SessionId>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: SessionId) {
        if self.capacity == 0 || !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &SessionId) -> bool {
        self.ids.contains(id)
    }
}

pub struct OrchestratorActor {
    receiver: mpsc::Receiver<OrchestratorCommand>,
    retirements: mpsc::UnboundedReceiver<Retirement>,
    sessions: HashMap<SessionId, Slot>,
    retired: Tombstones,
    max_sessions: usize,
    shutting_down: bool,
    opened_total: u64,
    retired_total: u64,
}

impl OrchestratorActor {
    pub fn new(
        receiver: mpsc::Receiver<OrchestratorCommand>,
        retirements: mpsc::UnboundedReceiver<Retirement>,
        max_sessions: usize,
        retired_memory: usize,
    ) -> Self {
        Self {
            receiver,
            retirements,
            sessions: HashMap::new(),
            retired: Tombstones::new(retired_memory),
            max_sessions,
            shutting_down: false,
            opened_total: 0,
            retired_total: 0,
        }
    }

    /// Runs until every handle is dropped.
    ///
    /// Retirements are drained before commands so a slot freed by a close
    /// is available to the next reservation.
    pub async fn run(mut self) {
        info!(max_sessions = self.max_sessions, "Orchestrator starting");

        loop {
            tokio::select! {
                biased;
                Some(retirement) = self.retirements.recv() => self.handle_retirement(retirement),
                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        info!(sessions = self.sessions.len(), "Orchestrator stopped");
    }

    fn handle_command(&mut self, command: OrchestratorCommand) {
        match command {
            OrchestratorCommand::Reserve { respond_to } => {
                let result = self.handle_reserve();
                let _ = respond_to.send(result);
            }
            OrchestratorCommand::Activate {
                session_id,
                handle,
                respond_to,
            } => {
                let result = self.handle_activate(session_id, handle);
                let _ = respond_to.send(result);
            }
            OrchestratorCommand::Release { session_id } => {
                if let Some(Slot::Reserved) = self.sessions.get(&session_id) {
                    self.sessions.remove(&session_id);
                    debug!(%session_id, "Reservation released");
                }
            }
            OrchestratorCommand::Lookup {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_lookup(&session_id));
            }
            OrchestratorCommand::List { respond_to } => {
                let _ = respond_to.send(self.live_handles());
            }
            OrchestratorCommand::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
            OrchestratorCommand::Shutdown { respond_to } => {
                if !self.shutting_down {
                    info!(sessions = self.sessions.len(), "Orchestrator shutting down");
                }
                self.shutting_down = true;
                let _ = respond_to.send(self.live_handles());
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_reserve(&mut self) -> Result<SessionId, OrchestratorError> {
        if self.shutting_down {
            return Err(OrchestratorError::Unavailable("daemon is shutting down".into()));
        }
        if self.sessions.len() >= self.max_sessions {
            warn!(
                current = self.sessions.len(),
                max = self.max_sessions,
                "Session limit reached, rejecting open"
            );
            return Err(OrchestratorError::Unavailable(format!(
                "session limit reached (max: {})",
                self.max_sessions
            )));
        }

        let mut session_id = SessionId::generate();
        while self.sessions.contains_key(&session_id) || self.retired.contains(&session_id) {
            session_id = SessionId::generate();
        }
        self.sessions.insert(session_id.clone(), Slot::Reserved);
        debug!(%session_id, live = self.sessions.len(), "Slot reserved");
        Ok(session_id)
    }

    fn handle_activate(
        &mut self,
        session_id: SessionId,
        handle: SessionHandle,
    ) -> Result<(), OrchestratorError> {
        if self.shutting_down {
            self.sessions.remove(&session_id);
            return Err(OrchestratorError::Unavailable("daemon is shutting down".into()));
        }
        match self.sessions.get_mut(&session_id) {
            Some(slot) if matches!(slot, Slot::Reserved) => {
                *slot = Slot::Live(handle);
                self.opened_total += 1;
                info!(%session_id, live = self.sessions.len(), "Session opened");
                Ok(())
            }
            _ => Err(OrchestratorError::NotFound(session_id)),
        }
    }

    fn handle_lookup(&self, session_id: &SessionId) -> Lookup {
        match self.sessions.get(session_id) {
            Some(Slot::Live(handle)) => Lookup::Live(handle.clone()),
            Some(Slot::Reserved) => Lookup::Pending,
            None if self.retired.contains(session_id) => Lookup::Retired,
            None => Lookup::Unknown,
        }
    }

    fn handle_retirement(&mut self, retirement: Retirement) {
        let Retirement {
            session_id,
            state,
            reason,
        } = retirement;
        if self.sessions.remove(&session_id).is_some() {
            self.retired_total += 1;
        }
        self.retired.insert(session_id.clone());
        info!(
            %session_id,
            %state,
            %reason,
            live = self.sessions.len(),
            "Session retired"
        );
    }

    fn live_handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(handle) => Some(handle.clone()),
                Slot::Reserved => None,
            })
            .collect()
    }

    fn stats(&self) -> OrchestratorStats {
        let reserved = self
            .sessions
            .values()
            .filter(|slot| matches!(slot, Slot::Reserved))
            .count();
        OrchestratorStats {
            live: self.sessions.len() - reserved,
            reserved,
            max_sessions: self.max_sessions,
            opened_total: self.opened_total,
            retired_total: self.retired_total,
            shutting_down: self.shutting_down,
        }
    }
}
