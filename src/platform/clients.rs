use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// Events delivered to a client page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
  /// Plain text notification from the worker
  Message(String),
  /// A different worker now controls the page
  ControllerChange { worker: u64 },
}

struct ClientSlot {
  id: u64,
  /// Id of the controlling worker, if any
  controller: Option<u64>,
  tx: mpsc::UnboundedSender<ClientEvent>,
}

/// Open client pages, reachable from the worker side.
#[derive(Default)]
pub struct Clients {
  slots: Mutex<Vec<ClientSlot>>,
  next_id: AtomicU64,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  fn slots(&self) -> MutexGuard<'_, Vec<ClientSlot>> {
    let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
    // Pages whose receiver is gone are closed
    slots.retain(|slot| !slot.tx.is_closed());
    slots
  }

  /// Open a page, optionally already controlled by `controller`.
  pub fn connect(&self, controller: Option<u64>) -> (u64, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

    self.slots().push(ClientSlot { id, controller, tx });
    debug!(client = id, ?controller, "Client connected");

    (id, rx)
  }

  /// Ids of all open pages.
  pub fn match_all(&self) -> Vec<u64> {
    self.slots().iter().map(|slot| slot.id).collect()
  }

  #[cfg(test)]
  pub fn controller_of(&self, client: u64) -> Option<u64> {
    self
      .slots()
      .iter()
      .find(|slot| slot.id == client)
      .and_then(|slot| slot.controller)
  }

  /// Send `text` to every open page. Returns how many received it.
  pub fn post_message(&self, text: &str) -> usize {
    self
      .slots()
      .iter()
      .filter(|slot| slot.tx.send(ClientEvent::Message(text.to_string())).is_ok())
      .count()
  }

  /// Make `worker` the controller of every open page.
  ///
  /// Pages that already had it are left alone; the rest get a `ControllerChange`.
  pub fn claim(&self, worker: u64) -> usize {
    let mut claimed = 0;
    for slot in self.slots().iter_mut() {
      if slot.controller == Some(worker) {
        continue;
      }
      slot.controller = Some(worker);
      if slot.tx.send(ClientEvent::ControllerChange { worker }).is_ok() {
        claimed += 1;
      }
    }
    claimed
  }
}
