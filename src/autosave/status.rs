/// Save state of one entity as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SaveStatus {
  /// Current snapshot matches the last persisted one
  #[default]
  Saved,
  /// Unsaved changes; a save is scheduled (or autosave is paused)
  Pending,
  /// A save is in flight
  Saving,
  /// No connectivity; changes will be saved on reconnect
  Offline,
  /// The last save was rejected; a retry is owed
  Error(String),
}

impl SaveStatus {
  pub fn is_saved(&self) -> bool {
    matches!(self, SaveStatus::Saved)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, SaveStatus::Error(_))
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      SaveStatus::Error(e) => Some(e),
      _ => None,
    }
  }

  /// Whether the user could lose edits by leaving now.
  pub fn has_unsaved_changes(&self) -> bool {
    !self.is_saved()
  }

  pub fn label(&self) -> &'static str {
    match self {
      SaveStatus::Saved => "saved",
      SaveStatus::Pending => "pending",
      SaveStatus::Saving => "saving",
      SaveStatus::Offline => "offline",
      SaveStatus::Error(_) => "error",
    }
  }
}

impl std::fmt::Display for SaveStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SaveStatus::Error(e) => write!(f, "error: {}", e),
      other => f.write_str(other.label()),
    }
  }
}
