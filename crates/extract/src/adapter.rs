use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use tabpilot_cdp_driver::TabDriver;
use tabpilot_core_types::TabId;

const SCROLL_JS: &str = r#"(async () => {
  const step = __STEP__, delay = __DELAY__, max = __MAX__;
  let iterations = 0;
  while (iterations < max) {
    const before = window.scrollY;
    window.scrollBy(0, step);
    await new Promise(r => setTimeout(r, delay));
    iterations += 1;
    if (window.scrollY <= before) break;
  }
  return iterations;
})()"#;

const CLICK_JS: &str = r#"(async () => {
  const nodes = document.querySelectorAll(__SELECTOR__);
  if (!nodes.length) return -1;
  let clicks = 0;
  for (const node of nodes) {
    if (clicks >= __MAX__) break;
    node.click();
    clicks += 1;
    await new Promise(r => setTimeout(r, __DELAY__));
  }
  return clicks;
})()"#;

const EXTRACT_JS: &str = r#"(() => {
  const listings = [];
  document.querySelectorAll('a[data-listing-id]').forEach((a, idx) => {
    const titleNode = a.querySelector('h3, h2');
    const card = a.closest('[data-search-result], li');
    const priceNode = card ? card.querySelector('.currency-value') : null;
    listings.push({
      listing_id: a.getAttribute('data-listing-id'),
      title: (a.getAttribute('title') || (titleNode ? titleNode.textContent : '') || '').trim(),
      url: a.href,
      price_text: priceNode ? priceNode.textContent.trim() : null,
      position: idx + 1
    });
  });
  const schemas = [];
  document.querySelectorAll('script[type="application/ld+json"]').forEach(s => {
    try { schemas.push(JSON.parse(s.textContent)); } catch (e) {}
  });
  let total = null;
  const countNode = document.querySelector('[data-search-results-count]');
  if (countNode) {
    const digits = countNode.textContent.replace(/[^0-9]/g, '');
    if (digits) total = Number(digits);
  }
  return { listings: listings, schemas: schemas, total_results_count: total };
})()"#;

const ACTIVE_PAGE_JS: &str = r#"(() => {
  const el = document.querySelector('[aria-current="page"], [aria-current="true"]');
  if (!el) return null;
  const n = parseInt(el.textContent.replace(/[^0-9]/g, ''), 10);
  return Number.isFinite(n) ? n : null;
})()"#;

/// Result of one content-script operation.
#[derive(Clone, Debug)]
pub struct AdapterOutcome {
    pub ok: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl AdapterOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(code: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(code.into()),
        }
    }
}

/// The narrow per-tab contract the executor calls.
#[async_trait]
pub trait ContentAdapter: Send + Sync {
    async fn scroll_to_bottom(&self, tab: &TabId, params: &Map<String, Value>) -> AdapterOutcome;
    async fn click(&self, tab: &TabId, params: &Map<String, Value>) -> AdapterOutcome;
    async fn extract_schema(&self, tab: &TabId, params: &Map<String, Value>) -> AdapterOutcome;
    /// The page number the site currently believes it is showing.
    async fn get_active_page(&self, tab: &TabId) -> Option<u32>;
}

/// Adapter that drives the rendered page by injected script.
pub struct ScriptAdapter {
    driver: Arc<dyn TabDriver>,
}

impl ScriptAdapter {
    pub fn new(driver: Arc<dyn TabDriver>) -> Self {
        Self { driver }
    }

    async fn run(&self, tab: &TabId, script: String) -> Result<Value, AdapterOutcome> {
        self.driver.eval(tab, &script).await.map_err(|err| {
            warn!(target: "extract", %tab, %err, "content script failed");
            AdapterOutcome::err("CONTENT_SCRIPT_ERROR")
        })
    }
}

fn u64_param(params: &Map<String, Value>, key: &str, default: u64) -> u64 {
    params.get(key).and_then(Value::as_u64).unwrap_or(default)
}

#[async_trait]
impl ContentAdapter for ScriptAdapter {
    async fn scroll_to_bottom(&self, tab: &TabId, params: &Map<String, Value>) -> AdapterOutcome {
        let script = SCROLL_JS
            .replace("__STEP__", &u64_param(params, "step", 600).to_string())
            .replace("__DELAY__", &u64_param(params, "delay", 400).to_string())
            .replace("__MAX__", &u64_param(params, "maxIterations", 20).to_string());
        match self.run(tab, script).await {
            Ok(value) => {
                let iterations = value.as_u64().unwrap_or(0);
                AdapterOutcome::ok(json!({ "iterations": iterations }))
            }
            Err(outcome) => outcome,
        }
    }

    async fn click(&self, tab: &TabId, params: &Map<String, Value>) -> AdapterOutcome {
        let Some(selector) = params.get("selector").and_then(Value::as_str) else {
            return AdapterOutcome::err("MISSING_SELECTOR");
        };
        // serde_json quoting keeps the selector safe inside the script.
        let quoted = match serde_json::to_string(selector) {
            Ok(quoted) => quoted,
            Err(_) => return AdapterOutcome::err("MISSING_SELECTOR"),
        };
        let script = CLICK_JS
            .replace("__SELECTOR__", &quoted)
            .replace("__MAX__", &u64_param(params, "maxTimes", 1).to_string())
            .replace("__DELAY__", &u64_param(params, "delay", 250).to_string());
        match self.run(tab, script).await {
            Ok(value) => match value.as_i64() {
                Some(-1) => AdapterOutcome::err("ELEMENT_NOT_FOUND"),
                Some(clicks) => AdapterOutcome::ok(json!({ "clicks": clicks })),
                None => AdapterOutcome::err("CONTENT_SCRIPT_ERROR"),
            },
            Err(outcome) => outcome,
        }
    }

    async fn extract_schema(&self, tab: &TabId, params: &Map<String, Value>) -> AdapterOutcome {
        match self.run(tab, EXTRACT_JS.to_string()).await {
            Ok(mut value) => {
                if let Some(types) = params.get("types").and_then(Value::as_array) {
                    let wanted: Vec<&str> =
                        types.iter().filter_map(Value::as_str).collect();
                    if !wanted.is_empty() {
                        if let Some(schemas) =
                            value.get_mut("schemas").and_then(Value::as_array_mut)
                        {
                            schemas.retain(|schema| {
                                schema
                                    .get("@type")
                                    .and_then(Value::as_str)
                                    .map_or(false, |t| wanted.contains(&t))
                            });
                        }
                    }
                }
                AdapterOutcome::ok(value)
            }
            Err(outcome) => outcome,
        }
    }

    async fn get_active_page(&self, tab: &TabId) -> Option<u32> {
        match self.driver.eval(tab, ACTIVE_PAGE_JS).await {
            Ok(value) => value.as_u64().map(|n| n as u32),
            Err(err) => {
                warn!(target: "extract", %tab, %err, "active page probe failed");
                None
            }
        }
    }
}
