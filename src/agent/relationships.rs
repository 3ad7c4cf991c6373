use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agent::AgentSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Delegation,
    Waiting,
    DataFlow,
    Completed,
}

/// Directed edge between two agents. Neither endpoint owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRelationship {
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub relationship_type: RelationshipType,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentRelationship {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_type: RelationshipType,
        description: Option<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            relationship_type,
            description,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.relationship_type != RelationshipType::Completed
    }

    fn key(&self) -> (&str, &str, RelationshipType) {
        (&self.source_id, &self.target_id, self.relationship_type)
    }
}

/// Recorded edges plus the rules for deriving the live graph from agent state
#[derive(Debug, Default)]
pub struct RelationshipGraph {
    edges: Vec<AgentRelationship>,
}

impl RelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edge. An identical active edge is kept instead of a
    /// duplicate; the flag is true only when a new edge was stored.
    pub fn add(&mut self, relationship: AgentRelationship) -> (AgentRelationship, bool) {
        if let Some(existing) = self
            .edges
            .iter()
            .find(|r| r.is_active() && r.key() == relationship.key())
        {
            return (existing.clone(), false);
        }
        self.edges.push(relationship.clone());
        (relationship, true)
    }

    /// Mark every `waiting` edge out of `source_id` completed, returning the changed edges
    pub fn complete_waiting(&mut self, source_id: &str) -> Vec<AgentRelationship> {
        self.edges
            .iter_mut()
            .filter(|r| r.source_id == source_id && r.relationship_type == RelationshipType::Waiting)
            .map(|r| {
                r.relationship_type = RelationshipType::Completed;
                r.clone()
            })
            .collect()
    }

    /// Drop edges touching an agent that left the pool
    pub fn forget(&mut self, agent_id: &str) {
        self.edges
            .retain(|r| r.source_id != agent_id && r.target_id != agent_id);
    }

    /// Settle the edges an agent's finished run closes, returning the changed edges.
    ///
    /// Every active edge out of `agent_id` becomes `completed`, and so does
    /// every active edge into it whose source is not in `live`. The change is
    /// permanent: a later run on the same slot records new edges.
    pub fn complete_finished(&mut self, agent_id: &str, live: &HashSet<String>) -> Vec<AgentRelationship> {
        self.edges
            .iter_mut()
            .filter(|r| r.is_active())
            .filter(|r| {
                r.source_id == agent_id || (r.target_id == agent_id && !live.contains(&r.source_id))
            })
            .map(|r| {
                r.relationship_type = RelationshipType::Completed;
                r.clone()
            })
            .collect()
    }

    /// Current view of the graph.
    ///
    /// Recorded edges are merged with edges implied by `assignedBy` and
    /// `waitingFor`. An implied edge is skipped when a recorded edge between
    /// the same pair already covers it, and reads as `completed` once its
    /// source has finished.
    pub fn derive(&self, agents: &[AgentSnapshot], active_only: bool) -> Vec<AgentRelationship> {
        let by_id: HashMap<&str, &AgentSnapshot> =
            agents.iter().map(|a| (a.id.as_str(), a)).collect();
        let recorded = |implied: &AgentRelationship| {
            self.edges.iter().any(|r| {
                r.source_id == implied.source_id
                    && r.target_id == implied.target_id
                    && (r.relationship_type == implied.relationship_type || !r.is_active())
            })
        };

        let mut implied_edges: Vec<AgentRelationship> = Vec::new();
        for agent in agents {
            if let Some(assigner) = &agent.assigned_by {
                let implied = AgentRelationship {
                    source_id: assigner.clone(),
                    target_id: agent.id.clone(),
                    relationship_type: RelationshipType::Delegation,
                    description: agent.current_task.clone(),
                    created_at: agent.started_at.unwrap_or_else(Utc::now),
                };
                if !recorded(&implied) && !implied_edges.iter().any(|r| r.key() == implied.key()) {
                    implied_edges.push(implied);
                }
            }
            if let Some(target) = &agent.waiting_for {
                let implied = AgentRelationship {
                    source_id: agent.id.clone(),
                    target_id: target.clone(),
                    relationship_type: RelationshipType::Waiting,
                    description: None,
                    created_at: Utc::now(),
                };
                if !recorded(&implied) && !implied_edges.iter().any(|r| r.key() == implied.key()) {
                    implied_edges.push(implied);
                }
            }
        }

        for relationship in &mut implied_edges {
            let source_finished = by_id
                .get(relationship.source_id.as_str())
                .is_some_and(|a| a.status.is_terminal());
            if source_finished {
                relationship.relationship_type = RelationshipType::Completed;
            }
        }

        let mut derived = self.edges.clone();
        derived.extend(implied_edges);

        if active_only {
            derived.retain(AgentRelationship::is_active);
        }
        derived.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        derived
    }
}
