//! The storefront page as a client of the worker.

use color_eyre::Result;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cache::{CacheStorage, RegistrationStore};
use crate::config::WorkerConfig;
use crate::network::Network;
use crate::platform::{ClientEvent, Registration, UpdateCheck};
use crate::worker::WorkerMessage;

/// User-facing notices: blocking alerts, yes/no confirmations and passing toasts.
pub trait Prompt {
  fn alert(&self, message: &str);
  fn confirm(&self, message: &str) -> bool;
  fn toast(&self, message: &str);
}

/// Prompt on the controlling terminal.
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
  fn alert(&self, message: &str) {
    println!("! {}", message);
  }

  fn confirm(&self, message: &str) -> bool {
    print!("? {} [y/N] ", message);
    if std::io::stdout().flush().is_err() {
      return false;
    }

    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
      Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
      Err(_) => false,
    }
  }

  fn toast(&self, message: &str) {
    println!("· {}", message);
  }
}

/// Result of a checkout with offline resilience.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOutcome {
  /// The order waits for connectivity as a deferred task
  Queued,
  /// The platform cannot defer tasks; nothing was queued
  Unsupported,
}

/// An open storefront page.
pub struct ClientPage<P: Prompt> {
  id: u64,
  events: mpsc::UnboundedReceiver<ClientEvent>,
  prompt: P,
  reloads: usize,
}

impl<P: Prompt> ClientPage<P> {
  /// Open a page in the registration's scope, controlled by its active worker if any.
  pub fn open<S, N>(registration: &Registration<S, N>, prompt: P) -> Self
  where
    S: CacheStorage + RegistrationStore + 'static,
    N: Network,
  {
    let controller = registration.active().map(|worker| worker.id());
    let (id, events) = registration.clients().connect(controller);

    Self {
      id,
      events,
      prompt,
      reloads: 0,
    }
  }

  #[cfg(test)]
  pub fn prompt(&self) -> &P {
    &self.prompt
  }

  /// How many times the page reloaded after a controller change.
  pub fn reloads(&self) -> usize {
    self.reloads
  }

  /// Handle queued events. Returns how many were handled.
  ///
  /// Worker messages are shown as alerts. Any number of controller changes
  /// in one batch causes a single reload.
  pub fn pump(&mut self) -> usize {
    let mut handled = 0;
    let mut reload = false;

    while let Ok(event) = self.events.try_recv() {
      handled += 1;
      match event {
        ClientEvent::Message(text) => self.prompt.alert(&text),
        ClientEvent::ControllerChange { worker } => {
          debug!(client = self.id, worker, "Controller changed");
          reload = true;
        }
      }
    }

    if reload {
      self.reloads += 1;
      info!(client = self.id, reloads = self.reloads, "Reloading for the new worker");
    }

    handled
  }

  /// Queue the order as a deferred task so it is sent once connectivity returns.
  pub fn place_order<S, N>(&self, registration: &Registration<S, N>) -> Result<OrderOutcome>
  where
    S: CacheStorage + RegistrationStore + 'static,
    N: Network,
  {
    let Some(sync) = registration.sync() else {
      self
        .prompt
        .alert("Background sync is not supported on this platform");
      return Ok(OrderOutcome::Unsupported);
    };

    sync.register(&registration.config().order.tag)?;
    self
      .prompt
      .toast("Order queued. It will be sent once you are back online.");

    Ok(OrderOutcome::Queued)
  }

  /// Check for a new worker build; offer to switch to it if it ends up waiting.
  pub async fn check_for_update<S, N>(
    &self,
    registration: &Registration<S, N>,
    config: Arc<WorkerConfig>,
  ) -> Result<UpdateCheck<S, N>>
  where
    S: CacheStorage + RegistrationStore + 'static,
    N: Network,
  {
    let check = registration.update(config).await?;

    match &check {
      UpdateCheck::Unregistered => self.prompt.alert("No service worker registered"),
      UpdateCheck::UpToDate => self.prompt.toast("Already up to date"),
      UpdateCheck::Waiting(worker) => {
        if self
          .prompt
          .confirm("A new version is available. Update now?")
        {
          registration.post_message(worker, &WorkerMessage::SkipWaiting.to_value())?;
        }
      }
      UpdateCheck::Activated(worker) => {
        debug!(client = self.id, worker = worker.id(), "New worker took over without waiting");
      }
    }

    Ok(check)
  }
}
