use std::collections::HashMap;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// A mapping was set (`Some`) or cleared (`None`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingChange {
    pub address: String,
    pub target_index: Option<usize>,
}

/// In-memory device address -> target index table.
///
/// Every mutation that changes an entry is broadcast to subscribers.
pub struct MappingTable {
    entries: DashMap<String, usize>,
    changes: broadcast::Sender<MappingChange>,
}

impl MappingTable {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            entries: DashMap::new(),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MappingChange> {
        self.changes.subscribe()
    }

    /// Set a mapping, returning the previous target
    pub fn set(&self, address: &str, target_index: usize) -> Option<usize> {
        let previous = self.entries.insert(address.to_string(), target_index);
        if previous != Some(target_index) {
            self.notify(address, Some(target_index));
        }
        previous
    }

    /// Clear a mapping, returning the target it had
    pub fn clear(&self, address: &str) -> Option<usize> {
        let previous = self.entries.remove(address).map(|(_, target)| target);
        if previous.is_some() {
            self.notify(address, None);
        }
        previous
    }

    pub fn lookup(&self, address: &str) -> Option<usize> {
        self.entries.get(address).map(|entry| *entry.value())
    }

    pub fn snapshot(&self) -> HashMap<String, usize> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Replace the whole table with a freshly loaded copy
    pub fn replace_all(&self, mappings: HashMap<String, usize>) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !mappings.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for address in stale {
            self.clear(&address);
        }
        for (address, target_index) in mappings {
            self.set(&address, target_index);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn notify(&self, address: &str, target_index: Option<usize>) {
        log::debug!("Mapping change: {} -> {:?}", address, target_index);
        // No live sessions means no receivers, which is fine
        let _ = self.changes.send(MappingChange {
            address: address.to_string(),
            target_index,
        });
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_notify_once_per_change() {
        let table = MappingTable::new();
        let mut rx = table.subscribe();

        assert_eq!(table.set("AA", 2), None);
        assert_eq!(table.set("AA", 2), Some(2));
        assert_eq!(table.lookup("AA"), Some(2));
        assert_eq!(table.clear("AA"), Some(2));
        assert_eq!(table.clear("AA"), None);

        assert_eq!(rx.try_recv().unwrap(), MappingChange { address: "AA".into(), target_index: Some(2) });
        assert_eq!(rx.try_recv().unwrap(), MappingChange { address: "AA".into(), target_index: None });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn replace_all_drops_stale_entries() {
        let table = MappingTable::new();
        table.set("AA", 0);
        table.set("BB", 1);
        table.replace_all(HashMap::from([("BB".to_string(), 3), ("CC".to_string(), 0)]));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("BB"), Some(&3));
        assert_eq!(snapshot.get("CC"), Some(&0));
        assert_eq!(table.lookup("AA"), None);
    }
}
