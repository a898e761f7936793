//! Autosave transition logic.
//!
//! Everything the controller knows about one entity lives in `Machine`, and
//! `Machine::handle` is the only place that changes it (including the
//! `SaveStatus`). Timers, the save call and the local store are driven by the
//! effects it returns, so the rules can be exercised without a runtime.

use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use super::status::SaveStatus;
use crate::cache::Snapshot;
use crate::config::RetryConfig;

pub(crate) type Reply<S> = oneshot::Sender<Result<Option<S>>>;

/// Notifications for whoever owns an autosaved entity.
#[derive(Debug, Clone, PartialEq)]
pub enum AutosaveEvent<S> {
  /// The backend accepted a save and returned this canonical snapshot.
  Saved(S),
  /// The backend assigned a new identity; routes and references using
  /// `provisional` must switch to `canonical`.
  IdentityChanged {
    provisional: String,
    canonical: String,
  },
  /// A save was rejected or timed out.
  SaveFailed(String),
}

pub(crate) enum Command<S> {
  Edited(S),
  Connectivity(bool),
  SetEnabled(bool),
  SaveNow { force: bool, reply: Reply<S> },
  DebounceElapsed,
  RetryElapsed,
  Settled(Result<S>),
}

pub(crate) enum Effect<S> {
  /// Start or restart the debounce timer.
  ArmDebounce,
  CancelDebounce,
  ArmRetry(Duration),
  CancelRetry,
  /// Call the backend with this snapshot.
  Dispatch(S),
  /// Write the canonical snapshot to the local store.
  Persist(S),
  /// Drop a retired identity from the local store.
  Forget(String),
  Emit(AutosaveEvent<S>),
}

struct ManualRequest<S> {
  force: bool,
  reply: Reply<S>,
}

struct InFlight<S> {
  /// Edit revision the dispatched snapshot was taken at
  revision: u64,
  identity: String,
  waiters: Vec<Reply<S>>,
}

pub(crate) struct Machine<S> {
  current: S,
  /// Last snapshot known to be persisted; `None` until the first save
  baseline: Option<S>,
  revision: u64,
  working_id: String,
  /// Provisional identities replaced by canonical ones
  retired_ids: Vec<String>,
  status: SaveStatus,
  online: bool,
  enabled: bool,
  /// A save is owed (set by failures and offline edits, cleared by success)
  owed: bool,
  failures: u32,
  in_flight: Option<InFlight<S>>,
  /// Manual saves requested while another save was in flight
  queued: Vec<ManualRequest<S>>,
  retry: RetryConfig,
}

impl<S: Snapshot> Machine<S> {
  pub fn new(
    current: S,
    baseline: Option<S>,
    online: bool,
    enabled: bool,
    retry: RetryConfig,
  ) -> Self {
    Self {
      working_id: current.identity().to_string(),
      current,
      baseline,
      revision: 0,
      retired_ids: Vec::new(),
      status: SaveStatus::Saved,
      online,
      enabled,
      owed: false,
      failures: 0,
      in_flight: None,
      queued: Vec::new(),
      retry,
    }
  }

  /// Effects for the initial snapshot.
  pub fn start(&mut self) -> Vec<Effect<S>> {
    self.refresh()
  }

  pub fn status(&self) -> &SaveStatus {
    &self.status
  }

  pub fn working_id(&self) -> &str {
    &self.working_id
  }

  fn is_dirty(&self) -> bool {
    match &self.baseline {
      Some(baseline) => !self.current.same_content(baseline),
      None => true,
    }
  }

  /// The single transition function.
  pub fn handle(&mut self, command: Command<S>) -> Vec<Effect<S>> {
    let effects = match command {
      Command::Edited(snapshot) => self.on_edit(snapshot),
      Command::Connectivity(online) => self.on_connectivity(online),
      Command::SetEnabled(enabled) => self.on_set_enabled(enabled),
      Command::SaveNow { force, reply } => self.on_save_now(ManualRequest { force, reply }),
      Command::DebounceElapsed => self.attempt(),
      Command::RetryElapsed if self.owed => self.attempt(),
      Command::RetryElapsed => Vec::new(),
      Command::Settled(result) => self.on_settled(result),
    };
    debug!(
      entity = %self.working_id,
      status = %self.status,
      revision = self.revision,
      "autosave transition"
    );
    effects
  }

  /// Fail every caller still waiting on a save (controller teardown).
  pub fn abandon(&mut self) {
    let waiters = self
      .in_flight
      .take()
      .map(|flight| flight.waiters)
      .unwrap_or_default();
    let queued = std::mem::take(&mut self.queued)
      .into_iter()
      .map(|request| request.reply);

    for waiter in waiters.into_iter().chain(queued) {
      let _ = waiter.send(Err(eyre!("autosave stopped before the save completed")));
    }
  }

  fn on_edit(&mut self, mut snapshot: S) -> Vec<Effect<S>> {
    if self.is_retired(snapshot.identity()) {
      snapshot.set_identity(&self.working_id);
    }
    self.current = snapshot;
    self.revision += 1;
    self.refresh()
  }

  /// Re-derive the status after the snapshot or the environment changed.
  fn refresh(&mut self) -> Vec<Effect<S>> {
    if self.in_flight.is_some() {
      // Picked up when the save settles
      return Vec::new();
    }

    let dirty = self.is_dirty();
    if !self.online {
      if dirty {
        self.owed = true;
      }
      self.status = SaveStatus::Offline;
      return vec![Effect::CancelDebounce];
    }

    if dirty {
      self.status = SaveStatus::Pending;
      if self.enabled && self.current.is_meaningful() {
        vec![Effect::ArmDebounce]
      } else {
        vec![Effect::CancelDebounce]
      }
    } else {
      if !self.status.is_error() {
        self.status = SaveStatus::Saved;
      }
      vec![Effect::CancelDebounce]
    }
  }

  /// Automatic save attempt: debounce expiry, retry timer or reconnect.
  fn attempt(&mut self) -> Vec<Effect<S>> {
    if self.in_flight.is_some() {
      return Vec::new();
    }

    if !self.online {
      if self.is_dirty() {
        self.owed = true;
      }
      self.status = SaveStatus::Offline;
      return Vec::new();
    }

    if !self.is_dirty() {
      // Reverted while we were waiting
      self.status = SaveStatus::Saved;
      self.owed = false;
      self.failures = 0;
      return vec![Effect::CancelRetry];
    }

    if !self.enabled || !self.current.is_meaningful() {
      self.status = SaveStatus::Pending;
      return Vec::new();
    }

    self.dispatch(Vec::new())
  }

  fn dispatch(&mut self, waiters: Vec<Reply<S>>) -> Vec<Effect<S>> {
    self.in_flight = Some(InFlight {
      revision: self.revision,
      identity: self.working_id.clone(),
      waiters,
    });
    self.status = SaveStatus::Saving;
    vec![
      Effect::CancelDebounce,
      Effect::CancelRetry,
      Effect::Dispatch(self.current.clone()),
    ]
  }

  fn on_save_now(&mut self, request: ManualRequest<S>) -> Vec<Effect<S>> {
    if self.in_flight.is_some() {
      self.queued.push(request);
      return Vec::new();
    }
    self.run_manual(vec![request])
  }

  /// Explicit saves skip the debounce and the meaningless-snapshot guard.
  fn run_manual(&mut self, requests: Vec<ManualRequest<S>>) -> Vec<Effect<S>> {
    let force = requests.iter().any(|request| request.force);
    if !force && !self.is_dirty() {
      for request in requests {
        let _ = request.reply.send(Ok(None));
      }
      return self.refresh();
    }

    let waiters = requests.into_iter().map(|request| request.reply).collect();
    self.dispatch(waiters)
  }

  fn on_connectivity(&mut self, online: bool) -> Vec<Effect<S>> {
    if online == self.online {
      return Vec::new();
    }
    self.online = online;

    if !online {
      if self.in_flight.is_some() || self.is_dirty() {
        self.owed = true;
      }
      self.status = SaveStatus::Offline;
      return vec![Effect::CancelDebounce, Effect::CancelRetry];
    }

    if self.in_flight.is_some() {
      self.status = SaveStatus::Saving;
      return Vec::new();
    }

    if self.owed {
      self.attempt()
    } else {
      self.refresh()
    }
  }

  fn on_set_enabled(&mut self, enabled: bool) -> Vec<Effect<S>> {
    if enabled == self.enabled {
      return Vec::new();
    }
    self.enabled = enabled;

    if !enabled {
      // Dirtiness still shows through the status, only the calls stop
      return vec![Effect::CancelDebounce, Effect::CancelRetry];
    }
    self.refresh()
  }

  fn on_settled(&mut self, result: Result<S>) -> Vec<Effect<S>> {
    let Some(flight) = self.in_flight.take() else {
      return Vec::new();
    };

    match result {
      Ok(canonical) => self.on_saved(flight, canonical),
      Err(report) => self.on_failed(flight, report),
    }
  }

  fn on_saved(&mut self, flight: InFlight<S>, canonical: S) -> Vec<Effect<S>> {
    let mut effects = Vec::new();

    let canonical_id = canonical.identity().to_string();
    if canonical_id != flight.identity {
      self.retired_ids.push(flight.identity.clone());
      self.working_id = canonical_id.clone();
      effects.push(Effect::Forget(flight.identity.clone()));
      effects.push(Effect::Emit(AutosaveEvent::IdentityChanged {
        provisional: flight.identity,
        canonical: canonical_id,
      }));
    }

    if self.revision == flight.revision {
      // Nothing changed meanwhile: adopt backend-filled fields too
      self.current = canonical.clone();
    } else if self.is_retired(self.current.identity()) {
      let working_id = self.working_id.clone();
      self.current.set_identity(&working_id);
    }

    self.baseline = Some(canonical.clone());
    self.owed = false;
    self.failures = 0;

    for waiter in flight.waiters {
      let _ = waiter.send(Ok(Some(canonical.clone())));
    }

    effects.push(Effect::CancelRetry);
    effects.push(Effect::Persist(canonical.clone()));
    effects.push(Effect::Emit(AutosaveEvent::Saved(canonical)));

    if !self.queued.is_empty() {
      let queued = std::mem::take(&mut self.queued);
      effects.extend(self.run_manual(queued));
      return effects;
    }

    let edited_meanwhile = self.revision != flight.revision;
    if edited_meanwhile
      && self.is_dirty()
      && self.online
      && self.enabled
      && self.current.is_meaningful()
    {
      // Exactly one follow-up save for edits made during the flight
      effects.extend(self.dispatch(Vec::new()));
    } else {
      effects.extend(self.refresh());
    }
    effects
  }

  fn on_failed(&mut self, flight: InFlight<S>, report: color_eyre::Report) -> Vec<Effect<S>> {
    let mut effects = Vec::new();
    let message = report.to_string();

    self.owed = true;
    self.failures += 1;

    // The first waiter gets the original report, the rest a copy of its message
    let mut report = Some(report);
    for waiter in flight.waiters {
      let err = report.take().unwrap_or_else(|| eyre!("{}", message));
      let _ = waiter.send(Err(err));
    }

    effects.push(Effect::Emit(AutosaveEvent::SaveFailed(message.clone())));

    if !self.online {
      self.status = SaveStatus::Offline;
    } else {
      self.status = SaveStatus::Error(message);
      if self.enabled {
        if let Some(delay) = self.retry.delay_for(self.failures) {
          effects.push(Effect::ArmRetry(delay));
        }
      }
    }

    if !self.queued.is_empty() {
      let queued = std::mem::take(&mut self.queued);
      effects.extend(self.run_manual(queued));
    }
    effects
  }

  fn is_retired(&self, id: &str) -> bool {
    self.retired_ids.iter().any(|retired| retired == id)
  }
}
