//! Per-entity autosave task.
//!
//! Each edited entity gets one tokio task that owns its `Machine`, the
//! debounce and retry timers, and the single in-flight save. Saves are strictly
//! serialized: a new one is only dispatched after the previous one settles.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::machine::{AutosaveEvent, Command, Effect, Machine};
use super::status::SaveStatus;
use crate::cache::{CacheStorage, DurableStore, Snapshot};
use crate::config::AutosaveConfig;

/// Backend save endpoint.
#[async_trait]
pub trait Saver<S>: Send + Sync {
  /// Persist `snapshot` and return the canonical version, whose identity may
  /// differ from the one sent.
  async fn save(&self, snapshot: S) -> Result<S>;
}

/// Builder for an autosave task.
pub struct AutosaveController<S: Snapshot, St: CacheStorage> {
  saver: Arc<dyn Saver<S>>,
  store: DurableStore<St>,
  online: watch::Receiver<bool>,
  config: AutosaveConfig,
  enabled: bool,
}

impl<S: Snapshot, St: CacheStorage + 'static> AutosaveController<S, St> {
  pub fn new(
    saver: Arc<dyn Saver<S>>,
    store: DurableStore<St>,
    online: watch::Receiver<bool>,
  ) -> Self {
    Self {
      saver,
      store,
      online,
      config: AutosaveConfig::default(),
      enabled: true,
    }
  }

  pub fn with_config(mut self, config: AutosaveConfig) -> Self {
    self.config = config;
    self
  }

  /// Start with automatic saves suspended (e.g. while a generation runs).
  pub fn disabled(mut self) -> Self {
    self.enabled = false;
    self
  }

  /// Start watching `current`. `baseline` is the last persisted snapshot, or
  /// `None` for an entity that has never been saved.
  pub fn spawn(
    mut self,
    current: S,
    baseline: Option<S>,
  ) -> (AutosaveHandle<S>, mpsc::UnboundedReceiver<AutosaveEvent<S>>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let online = *self.online.borrow_and_update();
    let machine = Machine::new(
      current,
      baseline,
      online,
      self.enabled,
      self.config.retry.clone(),
    );
    let (status_tx, status_rx) = watch::channel(machine.status().clone());
    let cancel = CancellationToken::new();

    let task = Task {
      machine,
      saver: self.saver,
      store: self.store,
      config: self.config,
      commands: commands_rx,
      online: self.online,
      events: events_tx,
      status: status_tx,
      cancel: cancel.clone(),
    };
    tokio::spawn(task.run());

    let handle = AutosaveHandle {
      commands: commands_tx,
      status: status_rx,
      cancel,
    };
    (handle, events_rx)
  }
}

/// Handle used by the editor to feed snapshots and read the save status.
///
/// The task stops when `shutdown` is called or every handle is dropped; any
/// pending timer or in-flight save is dropped with it.
pub struct AutosaveHandle<S> {
  commands: mpsc::UnboundedSender<Command<S>>,
  status: watch::Receiver<SaveStatus>,
  cancel: CancellationToken,
}

impl<S> Clone for AutosaveHandle<S> {
  fn clone(&self) -> Self {
    Self {
      commands: self.commands.clone(),
      status: self.status.clone(),
      cancel: self.cancel.clone(),
    }
  }
}

impl<S: Snapshot> AutosaveHandle<S> {
  /// Report the editor's latest snapshot.
  pub fn update(&self, snapshot: S) {
    self.send(Command::Edited(snapshot));
  }

  /// Suspend or resume automatic saves. The status keeps tracking changes.
  pub fn set_enabled(&self, enabled: bool) {
    self.send(Command::SetEnabled(enabled));
  }

  /// Save now if there are unsaved changes.
  ///
  /// Returns the canonical snapshot, or `None` when nothing needed saving.
  pub async fn save_now(&self) -> Result<Option<S>> {
    self.request_save(false).await
  }

  /// Save now even without changes (and even if the snapshot looks empty).
  pub async fn force_save(&self) -> Result<Option<S>> {
    self.request_save(true).await
  }

  pub fn status(&self) -> SaveStatus {
    self.status.borrow().clone()
  }

  /// Watch status changes.
  pub fn subscribe(&self) -> watch::Receiver<SaveStatus> {
    self.status.clone()
  }

  pub fn shutdown(&self) {
    self.cancel.cancel();
  }

  pub fn is_running(&self) -> bool {
    !self.commands.is_closed()
  }

  async fn request_save(&self, force: bool) -> Result<Option<S>> {
    let (reply, rx) = oneshot::channel();
    self
      .commands
      .send(Command::SaveNow { force, reply })
      .map_err(|_| eyre!("autosave has stopped"))?;
    rx.await.map_err(|_| eyre!("autosave has stopped"))?
  }

  fn send(&self, command: Command<S>) {
    if self.commands.send(command).is_err() {
      debug!("autosave has stopped, dropping command");
    }
  }
}

/// Timers and the in-flight save, each empty when not running.
struct Slots<S> {
  debounce: Option<Pin<Box<Sleep>>>,
  retry: Option<Pin<Box<Sleep>>>,
  in_flight: Option<BoxFuture<'static, Result<S>>>,
}

struct Task<S: Snapshot, St: CacheStorage> {
  machine: Machine<S>,
  saver: Arc<dyn Saver<S>>,
  store: DurableStore<St>,
  config: AutosaveConfig,
  commands: mpsc::UnboundedReceiver<Command<S>>,
  online: watch::Receiver<bool>,
  events: mpsc::UnboundedSender<AutosaveEvent<S>>,
  status: watch::Sender<SaveStatus>,
  cancel: CancellationToken,
}

impl<S: Snapshot, St: CacheStorage> Task<S, St> {
  async fn run(mut self) {
    let mut slots = Slots {
      debounce: None,
      retry: None,
      in_flight: None,
    };
    let mut watching_connectivity = true;

    let effects = self.machine.start();
    self.apply(effects, &mut slots);

    loop {
      let command = tokio::select! {
        biased;
        _ = self.cancel.cancelled() => break,
        result = next_in(&mut slots.in_flight) => {
          slots.in_flight = None;
          if let Err(e) = &result {
            warn!(entity = self.machine.working_id(), error = %e, "save failed");
          }
          Command::Settled(result)
        }
        changed = self.online.changed(), if watching_connectivity => match changed {
          Ok(()) => Command::Connectivity(*self.online.borrow_and_update()),
          Err(_) => {
            watching_connectivity = false;
            continue;
          }
        },
        command = self.commands.recv() => match command {
          Some(command) => command,
          None => break,
        },
        _ = next_in(&mut slots.debounce) => {
          slots.debounce = None;
          Command::DebounceElapsed
        }
        _ = next_in(&mut slots.retry) => {
          slots.retry = None;
          Command::RetryElapsed
        }
      };

      let effects = self.machine.handle(command);
      self.apply(effects, &mut slots);
    }

    self.machine.abandon();
    debug!(entity = self.machine.working_id(), "autosave stopped");
  }

  fn apply(&self, effects: Vec<Effect<S>>, slots: &mut Slots<S>) {
    for effect in effects {
      match effect {
        Effect::ArmDebounce => slots.debounce = Some(Box::pin(sleep(self.config.debounce()))),
        Effect::CancelDebounce => slots.debounce = None,
        Effect::ArmRetry(delay) => {
          debug!(entity = self.machine.working_id(), ?delay, "retry scheduled");
          slots.retry = Some(Box::pin(sleep(delay)));
        }
        Effect::CancelRetry => slots.retry = None,
        Effect::Dispatch(snapshot) => {
          debug!(entity = snapshot.identity(), "saving");
          slots.in_flight = Some(self.save(snapshot));
        }
        Effect::Persist(snapshot) => {
          info!(entity = snapshot.identity(), "saved");
          self.store.put_entity(&snapshot);
        }
        Effect::Forget(id) => self.store.delete_entity::<S>(&id),
        Effect::Emit(event) => {
          // The owner may have stopped listening
          let _ = self.events.send(event);
        }
      }
    }

    let status = self.machine.status();
    self.status.send_if_modified(|current| {
      if current != status {
        *current = status.clone();
        true
      } else {
        false
      }
    });
  }

  fn save(&self, snapshot: S) -> BoxFuture<'static, Result<S>> {
    let saver = Arc::clone(&self.saver);
    let limit = self.config.save_timeout();
    async move {
      match timeout(limit, saver.save(snapshot)).await {
        Ok(result) => result,
        Err(_) => Err(eyre!("save timed out after {}s", limit.as_secs())),
      }
    }
    .boxed()
  }
}

/// Await the future in `slot`, or never complete when the slot is empty.
async fn next_in<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
  match slot {
    Some(fut) => fut.await,
    None => std::future::pending().await,
  }
}
