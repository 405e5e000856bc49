//! Common types used across fanload

use serde::{Deserialize, Serialize};

/// Kind of worker-pool task.
///
/// Readers produce rows from one physical file, writers bulk-write them to the
/// target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Reader,
    Writer,
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Reader => "reader",
            TaskKind::Writer => "writer",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_serialization() {
        assert_eq!(serde_json::to_string(&TaskKind::Writer).unwrap(), "\"writer\"");
        let kind: TaskKind = serde_json::from_str("\"reader\"").unwrap();
        assert_eq!(kind, TaskKind::Reader);
        assert_eq!(kind.to_string(), "reader");
    }
}
