use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use tabpilot_core_types::command::str_field;
use tabpilot_core_types::{CommandAction, CommandOutcome, CommandType, ErrorCode, TabId};

use crate::executor::Executor;

const DEFAULT_URL_TEMPLATE: &str = "https://www.etsy.com/search?q={searchTerm}&page={pageNumber}";

/// Per-page wait jitter bounds, milliseconds.
const JITTER_MIN_MS: u64 = 1500;
const JITTER_MAX_MS: u64 = 3000;

/// High-level driver: one templated `OPEN_URL` per search page, stopping a
/// term early when a page fails or the site falls back to an earlier page.
pub(crate) async fn run(
    executor: &Executor,
    id: &str,
    payload: &Map<String, Value>,
) -> CommandOutcome {
    let terms: Vec<String> = payload
        .get("searchTerms")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if terms.is_empty() {
        return CommandOutcome::failed(ErrorCode::InvalidCommand);
    }

    let template = str_field(payload, "urlTemplate")
        .unwrap_or(DEFAULT_URL_TEMPLATE)
        .to_string();
    let action_template: Vec<CommandAction> = match payload.get("actions") {
        None | Some(Value::Null) => default_actions(),
        Some(value) => match serde_json::from_value(value.clone()) {
            Ok(actions) => actions,
            Err(_) => return CommandOutcome::failed(ErrorCode::InvalidCommand),
        },
    };

    let max_pages = executor.state.settings().max_pages_per_search_term;
    let mut step = 0usize;

    for term in &terms {
        info!(target: "executor", %id, term, "search term started");
        for page in 1..=max_pages {
            step += 1;
            let url = template
                .replace("{searchTerm}", &encode(term))
                .replace("{pageNumber}", &page.to_string());
            let actions = prepared_actions(&action_template, term, page);

            let open_id = format!("{id}:{step}:OPEN_URL");
            let mut open_payload = Map::new();
            open_payload.insert("url".to_string(), json!(url));
            open_payload.insert("actions".to_string(), json!(actions));

            let outcome = executor
                .run_step(&open_id, CommandType::OpenUrl, open_payload, None)
                .await;
            let tab = outcome
                .data
                .get("tabId")
                .and_then(Value::as_str)
                .map(TabId::new);

            let mut stop = !outcome.is_completed();
            if !stop {
                if let Some(tab) = &tab {
                    if let Some(active) = executor.adapter.get_active_page(tab).await {
                        if active < page {
                            debug!(target: "executor", %id, term, page, active, "site fell back to an earlier page, stopping term");
                            stop = true;
                        }
                    }
                }
            }

            // The page tab never outlives its step, success or not.
            if let Some(tab) = &tab {
                executor.registry.cleanup(tab, true).await;
            }
            if stop {
                break;
            }
        }
    }

    executor.sink.export();
    CommandOutcome::completed()
}

fn default_actions() -> Vec<CommandAction> {
    vec![
        CommandAction {
            kind: CommandType::Wait,
            payload: object(json!({ "milliseconds": 2000 })),
        },
        CommandAction {
            kind: CommandType::ScrollToBottom,
            payload: Map::new(),
        },
        CommandAction {
            kind: CommandType::ExtractSchema,
            payload: Map::new(),
        },
    ]
}

/// Clone the template, re-jitter every WAIT and tag each step with the term
/// and page so streamed records carry their provenance.
fn prepared_actions(template: &[CommandAction], term: &str, page: u32) -> Vec<CommandAction> {
    template
        .iter()
        .map(|action| {
            let mut payload = action.payload.clone();
            if action.kind == CommandType::Wait {
                let millis = rand::thread_rng().gen_range(JITTER_MIN_MS..=JITTER_MAX_MS);
                payload.insert("milliseconds".to_string(), json!(millis));
            }
            payload.insert("searchTerm".to_string(), json!(term));
            payload.insert("pageNumber".to_string(), json!(page));
            CommandAction {
                kind: action.kind,
                payload,
            }
        })
        .collect()
}

fn encode(term: &str) -> String {
    url::form_urlencoded::byte_serialize(term.as_bytes()).collect()
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
