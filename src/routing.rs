//! Routing Tables
//!
//! For each (request type, preference) pair, a primary model, an ordered
//! fallback list, and request defaults. A parallel degraded table maps each
//! supported request type to a single cheap route with no fallbacks and
//! tighter token caps; it never escalates to a premium model.

use std::collections::HashMap;

use crate::models::{AppId, RoutingPreference};
use crate::providers::Provider;

/// A (provider, model) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: Provider,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: Provider, model: &str) -> Self {
        Self {
            provider,
            model: model.to_string(),
        }
    }
}

/// Request defaults applied when the caller leaves them unset.
#[derive(Debug, Clone)]
pub struct RouteDefaults {
    pub max_tokens: u32,
    pub temperature: f64,
    pub system_prompt: String,
    pub is_vision: bool,
}

/// One routing row: primary model, fallbacks in order, defaults.
#[derive(Debug, Clone)]
pub struct Route {
    pub primary: ModelRef,
    pub fallbacks: Vec<ModelRef>,
    pub defaults: RouteDefaults,
}

impl Route {
    /// Primary followed by fallbacks, in traversal order.
    pub fn entries(&self) -> Vec<ModelRef> {
        let mut out = Vec::with_capacity(1 + self.fallbacks.len());
        out.push(self.primary.clone());
        out.extend(self.fallbacks.iter().cloned());
        out
    }
}

/// Quality/balanced/cost routes for one request type.
#[derive(Debug, Clone)]
pub struct RouteSet {
    pub quality: Route,
    pub balanced: Route,
    pub cost: Route,
}

impl RouteSet {
    pub fn select(&self, preference: RoutingPreference) -> &Route {
        match preference {
            RoutingPreference::Quality => &self.quality,
            RoutingPreference::Balanced => &self.balanced,
            // The degraded preference never selects from the normal table;
            // callers fall back to cost if no degraded route exists.
            RoutingPreference::Cost | RoutingPreference::Degraded => &self.cost,
        }
    }
}

/// Normal routing table. Immutable after boot.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, RouteSet>,
}

impl RoutingTable {
    pub fn get(&self, request_type: &str) -> Option<&RouteSet> {
        self.routes.get(request_type)
    }

    pub fn insert(&mut self, request_type: &str, set: RouteSet) {
        self.routes.insert(request_type.to_string(), set);
    }

    pub fn request_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

/// Degraded routing table: one cheap route per supported request type.
#[derive(Debug, Clone, Default)]
pub struct DegradedTable {
    routes: HashMap<String, Route>,
}

impl DegradedTable {
    pub fn get(&self, request_type: &str) -> Option<&Route> {
        self.routes.get(request_type)
    }

    pub fn insert(&mut self, request_type: &str, route: Route) {
        self.routes.insert(request_type.to_string(), route);
    }
}

/// Normalize a raw request type to its canonical `<app>:<task>` key.
/// Legacy bare aliases are accepted for input and mapped here; unknown
/// shapes return `None`.
pub fn canonicalize_request_type(raw: &str) -> Option<String> {
    let canonical = match raw {
        "meal-scan" => "nutrition:meal-scan",
        "meal-text" => "nutrition:meal-text",
        "coach-chat" => "fitness:coach-chat",
        "workout-analysis" => "fitness:workout-analysis",
        "memory-refresh" => "fitness:memory-refresh",
        other => {
            let (app, task) = other.split_once(':')?;
            if AppId::parse(app).is_none() || task.is_empty() {
                return None;
            }
            other
        }
    };
    Some(canonical.to_string())
}

/// The app that owns a canonical request type.
pub fn app_of_request_type(request_type: &str) -> Option<AppId> {
    request_type.split_once(':').and_then(|(app, _)| AppId::parse(app))
}

fn text_defaults(max_tokens: u32, temperature: f64, system_prompt: &str) -> RouteDefaults {
    RouteDefaults {
        max_tokens,
        temperature,
        system_prompt: system_prompt.to_string(),
        is_vision: false,
    }
}

fn vision_defaults(max_tokens: u32, system_prompt: &str) -> RouteDefaults {
    RouteDefaults {
        max_tokens,
        temperature: 0.2,
        system_prompt: system_prompt.to_string(),
        is_vision: true,
    }
}

fn route(primary: ModelRef, fallbacks: Vec<ModelRef>, defaults: RouteDefaults) -> Route {
    Route {
        primary,
        fallbacks,
        defaults,
    }
}

fn sonnet() -> ModelRef {
    ModelRef::new(Provider::Anthropic, "claude-sonnet-4-20250514")
}
fn haiku() -> ModelRef {
    ModelRef::new(Provider::Anthropic, "claude-3-5-haiku-latest")
}
fn gpt4o() -> ModelRef {
    ModelRef::new(Provider::OpenAi, "gpt-4o")
}
fn gpt4o_mini() -> ModelRef {
    ModelRef::new(Provider::OpenAi, "gpt-4o-mini")
}
fn gemini_pro() -> ModelRef {
    ModelRef::new(Provider::Google, "gemini-1.5-pro")
}
fn gemini_flash() -> ModelRef {
    ModelRef::new(Provider::Google, "gemini-2.0-flash")
}
fn gemini_flash_lite() -> ModelRef {
    ModelRef::new(Provider::Google, "gemini-2.0-flash-lite")
}

/// Default routing tables for the four governed apps.
pub fn default_tables() -> (RoutingTable, DegradedTable) {
    let mut table = RoutingTable::default();
    let mut degraded = DegradedTable::default();

    let text_set = |system: &str, quality_tokens: u32| RouteSet {
        quality: route(
            sonnet(),
            vec![gpt4o(), gemini_pro()],
            text_defaults(quality_tokens, 0.7, system),
        ),
        balanced: route(
            gpt4o_mini(),
            vec![haiku(), gemini_flash()],
            text_defaults(quality_tokens, 0.7, system),
        ),
        cost: route(
            gemini_flash_lite(),
            vec![haiku()],
            text_defaults(quality_tokens.min(1024), 0.5, system),
        ),
    };
    let vision_set = |system: &str| RouteSet {
        quality: route(
            gpt4o(),
            vec![sonnet(), gemini_pro()],
            vision_defaults(1024, system),
        ),
        balanced: route(
            gpt4o_mini(),
            vec![gemini_flash()],
            vision_defaults(1024, system),
        ),
        cost: route(gemini_flash(), vec![gpt4o_mini()], vision_defaults(768, system)),
    };

    table.insert(
        "nutrition:meal-text",
        text_set("Parse the described meal into structured nutrition data.", 1024),
    );
    table.insert(
        "nutrition:meal-scan",
        vision_set("Identify foods in the photo and estimate nutrition facts."),
    );
    table.insert(
        "fitness:coach-chat",
        text_set("You are an encouraging, evidence-based fitness coach.", 2048),
    );
    table.insert(
        "fitness:workout-analysis",
        text_set("Analyze the workout log and summarize load and recovery.", 1536),
    );
    table.insert(
        "fitness:memory-refresh",
        text_set("Condense the user's training history into coaching memory.", 1024),
    );
    table.insert(
        "budget:receipt-scan",
        vision_set("Extract merchant, date, and line items from the receipt."),
    );
    table.insert(
        "budget:insights",
        text_set("Summarize spending patterns and surface anomalies.", 1536),
    );
    table.insert(
        "meetings:summary",
        text_set("Summarize the meeting transcript with key decisions.", 2048),
    );
    table.insert(
        "meetings:action-items",
        text_set("Extract action items with owners and due dates.", 1024),
    );

    // Degraded routes: cheapest competent model per task, no fallbacks,
    // tight token caps.
    let degraded_text = |system: &str| {
        route(haiku(), vec![], text_defaults(500, 0.3, system))
    };
    let degraded_vision = |system: &str| {
        route(gemini_flash(), vec![], vision_defaults(512, system))
    };

    degraded.insert(
        "nutrition:meal-text",
        degraded_text("Parse the described meal into structured nutrition data."),
    );
    degraded.insert(
        "nutrition:meal-scan",
        degraded_vision("Identify foods in the photo and estimate nutrition facts."),
    );
    degraded.insert(
        "fitness:coach-chat",
        degraded_text("You are an encouraging, evidence-based fitness coach."),
    );
    degraded.insert(
        "fitness:workout-analysis",
        degraded_text("Analyze the workout log and summarize load and recovery."),
    );
    degraded.insert(
        "fitness:memory-refresh",
        degraded_text("Condense the user's training history into coaching memory."),
    );
    degraded.insert(
        "budget:receipt-scan",
        degraded_vision("Extract merchant, date, and line items from the receipt."),
    );
    degraded.insert(
        "budget:insights",
        degraded_text("Summarize spending patterns and surface anomalies."),
    );
    degraded.insert(
        "meetings:summary",
        degraded_text("Summarize the meeting transcript with key decisions."),
    );
    degraded.insert(
        "meetings:action-items",
        degraded_text("Extract action items with owners and due dates."),
    );

    (table, degraded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_aliases_normalize_to_canonical_keys() {
        assert_eq!(
            canonicalize_request_type("meal-scan").as_deref(),
            Some("nutrition:meal-scan")
        );
        assert_eq!(
            canonicalize_request_type("coach-chat").as_deref(),
            Some("fitness:coach-chat")
        );
        assert_eq!(
            canonicalize_request_type("memory-refresh").as_deref(),
            Some("fitness:memory-refresh")
        );
        assert_eq!(
            canonicalize_request_type("nutrition:meal-text").as_deref(),
            Some("nutrition:meal-text")
        );
        assert_eq!(canonicalize_request_type("unknown-thing"), None);
        assert_eq!(canonicalize_request_type("wrongapp:task"), None);
    }

    #[test]
    fn every_routing_row_has_a_degraded_route() {
        let (table, degraded) = default_tables();
        for request_type in table.request_types() {
            assert!(
                degraded.get(request_type).is_some(),
                "missing degraded route for {request_type}"
            );
        }
    }

    #[test]
    fn degraded_routes_are_single_entry_and_tightly_capped() {
        let (_, degraded) = default_tables();
        let meal_scan = degraded.get("nutrition:meal-scan").unwrap();
        assert!(meal_scan.fallbacks.is_empty());
        assert!(meal_scan.defaults.max_tokens <= 600);
        assert!(meal_scan.defaults.is_vision);

        let chat = degraded.get("fitness:coach-chat").unwrap();
        assert_eq!(chat.primary.provider, Provider::Anthropic);
        assert!(chat.defaults.max_tokens <= 600);
    }

    #[test]
    fn app_ownership_follows_the_prefix() {
        assert_eq!(app_of_request_type("nutrition:meal-text"), Some(AppId::Nutrition));
        assert_eq!(app_of_request_type("meetings:summary"), Some(AppId::Meetings));
        assert_eq!(app_of_request_type("bogus"), None);
    }
}
