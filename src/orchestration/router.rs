//! Capability-based routing of ready chunks to registered workers.
//!
//! The `CapabilityRouter` keeps registrations in registration order. A chunk
//! is routed to the capable agent with the most headroom; agents tied on
//! headroom are taken round-robin, starting after the last agent chosen.

use std::collections::BTreeSet;

use crate::agent::{format_capabilities, required_capabilities, AgentId, AgentRegistration, Capability};
use crate::core::chunk::Chunk;
use crate::error::{Error, Result};
use crate::{clog_debug, clog_warn};

/// Routes chunks to agents by capability and load.
///
/// # Example
///
/// ```
/// use std::collections::BTreeSet;
/// use cadence::agent::{AgentId, Capability};
/// use cadence::core::{Chunk, ChunkKind};
/// use cadence::orchestration::CapabilityRouter;
///
/// let mut router = CapabilityRouter::new();
/// router
///     .register(AgentId::from("scribe"), BTreeSet::from([Capability::Note]), 2)
///     .unwrap();
///
/// let mut chunk = Chunk::new(ChunkKind::Note, "jot");
/// chunk.transition(cadence::core::ChunkState::Ready).unwrap();
/// assert_eq!(router.route(&mut chunk).unwrap(), AgentId::from("scribe"));
/// assert_eq!(router.get(&AgentId::from("scribe")).unwrap().current_load, 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CapabilityRouter {
    agents: Vec<AgentRegistration>,
    /// Registration position the next tie-break starts from.
    cursor: usize,
}

impl CapabilityRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, or replace the capabilities and limit of an existing
    /// registration. Current load survives re-registration.
    pub fn register(
        &mut self,
        id: AgentId,
        capabilities: BTreeSet<Capability>,
        max_concurrent: usize,
    ) -> Result<AgentRegistration> {
        if max_concurrent == 0 {
            return Err(Error::Validation(format!(
                "agent {} must accept at least one concurrent chunk",
                id
            )));
        }
        if capabilities.is_empty() {
            return Err(Error::Validation(format!(
                "agent {} declares no capabilities",
                id
            )));
        }

        if let Some(existing) = self.agents.iter_mut().find(|a| a.id == id) {
            clog_debug!(
                "Re-registering agent {} with [{}] x{}",
                id,
                format_capabilities(&capabilities),
                max_concurrent
            );
            existing.capabilities = capabilities;
            existing.max_concurrent = max_concurrent;
            return Ok(existing.clone());
        }

        clog_debug!(
            "Registering agent {} with [{}] x{}",
            id,
            format_capabilities(&capabilities),
            max_concurrent
        );
        let registration = AgentRegistration::new(id, capabilities, max_concurrent);
        self.agents.push(registration.clone());
        Ok(registration)
    }

    /// Remove a registration. Work already dispatched to it is unaffected.
    pub fn deregister(&mut self, id: &AgentId) -> Result<AgentRegistration> {
        let pos = self
            .agents
            .iter()
            .position(|a| &a.id == id)
            .ok_or_else(|| Error::AgentNotFound(id.clone()))?;
        let removed = self.agents.remove(pos);
        if pos < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.agents.len() {
            self.cursor = 0;
        }
        Ok(removed)
    }

    /// Pick an agent for `chunk`, increment its load and mark the chunk
    /// assigned.
    ///
    /// # Errors
    /// - `NoCapableAgent` if no registration covers the required capabilities
    /// - `AgentsBusy` if every capable agent is at capacity
    /// - `Validation` if the chunk names an unknown capability
    pub fn route(&mut self, chunk: &mut Chunk) -> Result<AgentId> {
        let required = required_capabilities(chunk)?;
        let pos = self.select(chunk, &required)?;

        chunk.assign(self.agents[pos].id.clone())?;
        self.cursor = (pos + 1) % self.agents.len();
        let agent = &mut self.agents[pos];
        agent.current_load += 1;

        clog_debug!(
            "Routed chunk {} [{}] to {} (load {}/{})",
            chunk.id.short(),
            format_capabilities(&required),
            agent.id,
            agent.current_load,
            agent.max_concurrent
        );
        Ok(agent.id.clone())
    }

    /// Index of the agent `route` would choose, without side effects.
    fn select(&self, chunk: &Chunk, required: &BTreeSet<Capability>) -> Result<usize> {
        let capable: Vec<usize> = (0..self.agents.len())
            .filter(|&i| self.agents[i].provides(required))
            .collect();
        if capable.is_empty() {
            clog_warn!(
                "No agent provides [{}] for chunk {}",
                format_capabilities(required),
                chunk.id.short()
            );
            return Err(Error::NoCapableAgent {
                chunk_id: chunk.id,
                required: format_capabilities(required),
            });
        }

        let best_headroom = capable
            .iter()
            .map(|&i| self.agents[i].headroom())
            .max()
            .unwrap_or(0);
        if best_headroom == 0 {
            return Err(Error::AgentsBusy { chunk_id: chunk.id });
        }

        let n = self.agents.len();
        capable
            .into_iter()
            .filter(|&i| self.agents[i].headroom() == best_headroom)
            .min_by_key(|&i| (i + n - self.cursor % n) % n)
            .ok_or(Error::AgentsBusy { chunk_id: chunk.id })
    }

    /// Give back one unit of load after a dispatch completes.
    pub fn release(&mut self, id: &AgentId) -> Result<()> {
        let agent = self
            .agents
            .iter_mut()
            .find(|a| &a.id == id)
            .ok_or_else(|| Error::AgentNotFound(id.clone()))?;
        agent.current_load = agent.current_load.saturating_sub(1);
        Ok(())
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentRegistration> {
        self.agents.iter().find(|a| &a.id == id)
    }

    /// Registrations in registration order.
    pub fn agents(&self) -> &[AgentRegistration] {
        &self.agents
    }

    pub fn total_load(&self) -> usize {
        self.agents.iter().map(|a| a.current_load).sum()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
