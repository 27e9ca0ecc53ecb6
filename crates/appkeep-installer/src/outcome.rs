use std::fmt::Display;

/// Result of a best-effort step. A degraded step never fails the operation,
/// but its note is kept so the terminal event can report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Degraded(String),
}

impl Outcome {
    pub fn from_result<E: Display>(step: &str, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(err) => {
                tracing::warn!(step, error = %err, "best-effort step degraded");
                Self::Degraded(format!("{step}: {err}"))
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    pub fn note(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::Degraded(note) => Some(note),
        }
    }
}

/// Notes collected from the degraded steps of one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Degradations {
    notes: Vec<String>,
}

impl Degradations {
    pub fn record(&mut self, outcome: Outcome) {
        if let Outcome::Degraded(note) = outcome {
            self.notes.push(note);
        }
    }

    pub fn push(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }
}
