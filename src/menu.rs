use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheStorage, RegistrationStore};
use crate::client::Prompt;
use crate::http::Request;
use crate::network::Network;
use crate::platform::Registration;

/// One drink on the menu. Prices are whole hryvnias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
  pub id: String,
  pub name: String,
  pub price: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub desc: Option<String>,
}

/// Menu shown when the API is unusable.
pub fn fallback_menu() -> Vec<MenuItem> {
  vec![MenuItem {
    id: "latte".to_string(),
    name: "Лате".to_string(),
    price: 65,
    desc: Some("Fallback (no menu from API).".to_string()),
  }]
}

pub fn format_price(amount: u32) -> String {
  format!("{} ₴", amount)
}

async fn fetch_menu<S, N>(registration: &Registration<S, N>) -> Result<Vec<MenuItem>>
where
  S: CacheStorage + RegistrationStore + 'static,
  N: Network,
{
  let config = registration.config();
  let url = config.resolve(&config.menu_endpoint)?;
  let result = registration.fetch(Request::get(url)).await?;
  debug!(source = %result.source, status = result.data.status, "Menu response");

  if !result.data.ok() {
    return Err(eyre!("Menu load failed: {}", result.data.status));
  }
  result.data.parse_json()
}

/// Load the menu through the page's worker.
///
/// An unusable reply falls back to [`fallback_menu`] and tells the user. An
/// empty list from the worker's offline reply is a valid, empty menu.
pub async fn load_menu<S, N, P>(registration: &Registration<S, N>, prompt: &P) -> Vec<MenuItem>
where
  S: CacheStorage + RegistrationStore + 'static,
  N: Network,
  P: Prompt,
{
  match fetch_menu(registration).await {
    Ok(menu) => menu,
    Err(e) => {
      warn!(error = %e, "Using fallback menu");
      prompt.toast("Menu in fallback mode");
      fallback_menu()
    }
  }
}
