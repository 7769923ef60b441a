//! Program key to command line table, e.g. `pw -> "mpirun -n 8 pw.x"`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTable {
    commands: BTreeMap<String, String>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(mut self, key: impl Into<String>, command: impl Into<String>) -> Self {
        self.insert(key, command);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, command: impl Into<String>) {
        self.commands.insert(key.into(), command.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.commands.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_plain_map() {
        let table: CommandTable =
            serde_yaml::from_str("pw: mpirun -n 8 pw.x\nph: ph.x\n").unwrap();
        assert_eq!(table.get("pw"), Some("mpirun -n 8 pw.x"));
        assert_eq!(table.get("dos"), None);
        assert_eq!(table.keys().collect::<Vec<_>>(), vec!["ph", "pw"]);
    }
}
