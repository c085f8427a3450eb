//! Pipeline and component records
//!
//! A pipeline is an ordered list of components submitted as one unit. The
//! coordinator registers every component as pending on arrival, promotes
//! it to running when it is dispatched to a worker, and to done when the
//! worker reports back.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Pending,
    Running,
    Done,
}

/// One executable step of a pipeline.
#[derive(Debug, Clone)]
pub struct Component {
    pub name: String,
    pub id: String,
    /// Working directory, filled in when the component is driven.
    pub path: Option<PathBuf>,
    /// Full dispatch vector sent to the worker.
    pub command: Vec<String>,
    pub state: ComponentState,
    pub started_at_ms: Option<u64>,
    pub ended_at_ms: Option<u64>,
}

impl Component {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            path: None,
            command: Vec::new(),
            state: ComponentState::Pending,
            started_at_ms: None,
            ended_at_ms: None,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Tracks the components of the active pipeline by id.
#[derive(Debug, Default)]
pub struct TaskMonitor {
    components: HashMap<String, Component>,
}

impl TaskMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers components as pending. Ids are unique within a pipeline;
    /// a duplicate id is rejected.
    pub fn add_pending_components(
        &mut self,
        components: impl IntoIterator<Item = Component>,
    ) -> Result<()> {
        for component in components {
            debug!(id = %component.id, name = %component.name, "Component pending");
            if self
                .components
                .insert(component.id.clone(), component)
                .is_some()
            {
                return Err(Error::Scheduler("duplicate component id".to_string()));
            }
        }
        Ok(())
    }

    /// Mutable access to a pending component, for filling in path and
    /// command when the driver submits it.
    pub fn pending_component_mut(&mut self, id: &str) -> Result<&mut Component> {
        let component = self
            .components
            .get_mut(id)
            .ok_or_else(|| Error::Scheduler(format!("unknown component id: {}", id)))?;
        if component.state != ComponentState::Pending {
            return Err(Error::Scheduler(format!(
                "component {} is not pending",
                id
            )));
        }
        Ok(component)
    }

    /// Promotes a component to running when it is dispatched.
    pub fn record_component_started(&mut self, id: &str) -> Result<()> {
        let component = self
            .components
            .get_mut(id)
            .ok_or_else(|| Error::Scheduler(format!("unknown component id: {}", id)))?;
        component.state = ComponentState::Running;
        component.started_at_ms = Some(now_ms());
        Ok(())
    }

    /// Promotes a component to done when the worker reports it finished.
    pub fn record_component_done(&mut self, id: &str) -> Result<()> {
        let component = self
            .components
            .get_mut(id)
            .ok_or_else(|| Error::Scheduler(format!("unknown component id: {}", id)))?;
        component.state = ComponentState::Done;
        component.ended_at_ms = Some(now_ms());
        debug!(id = %id, "Component done");
        Ok(())
    }

    pub fn component(&self, id: &str) -> Option<&Component> {
        self.components.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_order() {
        let mut monitor = TaskMonitor::new();
        monitor
            .add_pending_components([Component::new("train", "c1")])
            .expect("add");

        {
            let component = monitor.pending_component_mut("c1").expect("pending");
            component.path = Some(PathBuf::from("/tmp/c1"));
            component.command = vec!["c1".to_string(), "/tmp/c1".to_string()];
        }

        monitor.record_component_started("c1").expect("start");
        assert_eq!(
            monitor.component("c1").unwrap().state,
            ComponentState::Running
        );
        // Once running it is no longer addressable as pending.
        assert!(monitor.pending_component_mut("c1").is_err());

        monitor.record_component_done("c1").expect("done");
        let component = monitor.component("c1").unwrap();
        assert_eq!(component.state, ComponentState::Done);
        assert!(component.started_at_ms.is_some());
        assert!(component.ended_at_ms.is_some());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut monitor = TaskMonitor::new();
        monitor
            .add_pending_components([Component::new("train", "c1")])
            .expect("add");
        assert!(monitor
            .add_pending_components([Component::new("test", "c1")])
            .is_err());
    }

    #[test]
    fn test_unknown_id_rejected() {
        let mut monitor = TaskMonitor::new();
        assert!(monitor.record_component_done("missing").is_err());
    }
}
