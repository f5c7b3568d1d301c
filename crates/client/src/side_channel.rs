//! Latest goals/resources pushed by the backend. Every update replaces the
//! previous one wholesale.

use casework_protocol::SideChannelSnapshot;

#[derive(Debug, Clone, Default)]
pub struct SideChannelStore {
    current: SideChannelSnapshot,
}

impl SideChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_update(&mut self, goals: Vec<String>, resources: Vec<String>) {
        self.current = SideChannelSnapshot { goals, resources };
    }

    pub fn apply(&mut self, snapshot: SideChannelSnapshot) {
        self.apply_update(snapshot.goals, snapshot.resources);
    }

    pub fn snapshot(&self) -> &SideChannelSnapshot {
        &self.current
    }

    pub fn clear(&mut self) {
        self.current = SideChannelSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_update_replaces_earlier_one() {
        let mut store = SideChannelStore::new();
        store.apply_update(vec!["A".to_string()], vec!["B".to_string()]);
        store.apply_update(vec!["C".to_string()], Vec::new());

        assert_eq!(
            store.snapshot(),
            &SideChannelSnapshot {
                goals: vec!["C".to_string()],
                resources: Vec::new(),
            }
        );
    }

    #[test]
    fn clear_empties_both_lists() {
        let mut store = SideChannelStore::new();
        store.apply_update(vec!["A".to_string()], vec!["B".to_string()]);
        store.clear();
        assert!(store.snapshot().is_empty());
    }
}
