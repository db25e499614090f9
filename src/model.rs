//! Per-user training-log document: clients own sessions, sessions own
//! exercises, exercises own recorded sets.

use serde::{Deserialize, Serialize};

/// The whole per-user document stored in the remote document store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserDocument {
  #[serde(default)]
  pub clients: Vec<Client>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
  pub name: String,
  #[serde(default)]
  pub sessions: Vec<Session>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
  /// Session date, ISO 8601 (YYYY-MM-DD)
  pub date: String,
  #[serde(default)]
  pub exercises: Vec<Exercise>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
  pub name: String,
  #[serde(default)]
  pub sets: Vec<SetEntry>,
}

/// One recorded set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetEntry {
  pub reps: u32,
  pub weight: f64,
}

impl UserDocument {
  pub fn client(&self, name: &str) -> Option<&Client> {
    self.clients.iter().find(|c| c.name.eq_ignore_ascii_case(name))
  }
}

impl Exercise {
  /// Heaviest weight recorded across this exercise's sets.
  pub fn top_weight(&self) -> Option<f64> {
    self
      .sets
      .iter()
      .map(|s| s.weight)
      .max_by(|a, b| a.total_cmp(b))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_document_parses_with_missing_collections() {
    // Documents created before a client logged anything have sparse fields
    let doc: UserDocument = serde_json::from_str(
      r#"{
        "clients": [
          {"name": "Amy"},
          {
            "name": "Ben",
            "sessions": [
              {
                "date": "2026-08-20",
                "exercises": [
                  {"name": "Bench Press", "sets": [{"reps": 8, "weight": 65.0}]}
                ]
              }
            ]
          }
        ]
      }"#,
    )
    .unwrap();

    assert_eq!(doc.clients.len(), 2);
    assert!(doc.client("amy").unwrap().sessions.is_empty());

    let ben = doc.client("Ben").unwrap();
    let exercise = &ben.sessions[0].exercises[0];
    assert_eq!(exercise.top_weight(), Some(65.0));
  }

  #[test]
  fn test_empty_document_round_trips() {
    let doc = UserDocument::default();
    let json = serde_json::to_value(&doc).unwrap();
    assert_eq!(json, serde_json::json!({"clients": []}));
  }
}
