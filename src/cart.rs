use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::client::Prompt;
use crate::config::data_dir;
use crate::menu::MenuItem;

/// Storage key of the persisted cart.
pub const CART_KEY: &str = "aromatna_cart_v1";

/// Shopping cart: menu item id to quantity. Quantities are always positive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cart {
  items: BTreeMap<String, u32>,
}

/// A cart line joined with its menu item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartLine<'a> {
  pub item: &'a MenuItem,
  pub qty: u32,
}

impl CartLine<'_> {
  pub fn subtotal(&self) -> u32 {
    self.item.price.saturating_mul(self.qty)
  }
}

impl Cart {
  pub fn default_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(format!("{}.json", CART_KEY)))
  }

  /// Load the cart from `path`. A missing or unreadable file is an empty cart.
  pub fn load(path: &Path) -> Self {
    let contents = match std::fs::read_to_string(path) {
      Ok(contents) => contents,
      Err(e) => {
        debug!(path = %path.display(), error = %e, "No saved cart");
        return Self::default();
      }
    };

    match serde_json::from_str::<Option<Cart>>(&contents) {
      Ok(cart) => cart.unwrap_or_default().without_empty_lines(),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Discarding corrupt cart");
        Self::default()
      }
    }
  }

  pub fn save(&self, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create directory {}: {}", parent.display(), e))?;
    }

    let contents =
      serde_json::to_string(self).map_err(|e| eyre!("Failed to serialize cart: {}", e))?;
    std::fs::write(path, contents)
      .map_err(|e| eyre!("Failed to write cart {}: {}", path.display(), e))
  }

  fn without_empty_lines(mut self) -> Self {
    self.items.retain(|_, qty| *qty > 0);
    self
  }

  pub fn add(&mut self, id: &str) {
    let qty = self.items.entry(id.to_string()).or_insert(0);
    *qty = qty.saturating_add(1);
  }

  /// Adjust the quantity of an item already in the cart, dropping it at zero.
  pub fn change_qty(&mut self, id: &str, delta: i64) {
    let Some(qty) = self.items.get_mut(id) else {
      return;
    };

    let next = i64::from(*qty) + delta;
    if next <= 0 {
      self.items.remove(id);
    } else {
      *qty = u32::try_from(next).unwrap_or(u32::MAX);
    }
  }

  pub fn remove(&mut self, id: &str) -> bool {
    self.items.remove(id).is_some()
  }

  pub fn clear(&mut self) {
    self.items.clear();
  }

  #[cfg(test)]
  pub fn qty(&self, id: &str) -> u32 {
    self.items.get(id).copied().unwrap_or(0)
  }

  /// Total number of units. Saturates at `u32::MAX`.
  pub fn count(&self) -> u32 {
    self
      .items
      .values()
      .fold(0, |sum, qty| sum.saturating_add(*qty))
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// Total price against `menu`; items missing from the menu count as zero.
  /// Saturates at `u32::MAX`.
  pub fn total(&self, menu: &[MenuItem]) -> u32 {
    self
      .lines(menu)
      .iter()
      .fold(0, |sum, line| sum.saturating_add(line.subtotal()))
  }

  /// Cart lines whose item is on `menu`, in id order.
  pub fn lines<'a>(&self, menu: &'a [MenuItem]) -> Vec<CartLine<'a>> {
    let by_id: HashMap<&str, &MenuItem> = menu.iter().map(|m| (m.id.as_str(), m)).collect();

    self
      .items
      .iter()
      .filter_map(|(id, qty)| {
        by_id
          .get(id.as_str())
          .map(|item| CartLine { item, qty: *qty })
      })
      .collect()
  }
}

/// Start checkout. Returns false when there is nothing to check out.
pub fn checkout<P: Prompt>(cart: &Cart, prompt: &P) -> bool {
  if cart.count() == 0 {
    prompt.toast("Cart is empty");
    return false;
  }
  prompt.toast("Checkout: demo mode");
  true
}
