//! Mapping between action ids and event types.
//!
//! Actions are snake_case verbs (`transfer`, `approve_order`); their events
//! are PascalCase with the last word in past tense (`Transferred`,
//! `ApproveOrdered`). The heuristic is lossy in reverse, so the engine
//! consults an [`EventTypes`] table built from the schema first and falls
//! back to [`event_type_to_action`] only for types the schema never names.

use std::collections::HashMap;

use tracing::warn;

use crate::petri::Schema;

/// Consonants that are doubled after a short stressed vowel: `submit` -> `submitted`.
const DOUBLING_ENDINGS: &[&str] = &["fer", "mit", "cur", "pel", "trol", "gin"];

fn is_vowel(c: char) -> bool {
    matches!(c, 'a' | 'e' | 'i' | 'o' | 'u')
}

fn vowel_groups(word: &str) -> usize {
    let mut groups = 0;
    let mut in_group = false;
    for c in word.chars() {
        let vowel = is_vowel(c);
        if vowel && !in_group {
            groups += 1;
        }
        in_group = vowel;
    }
    groups
}

/// Whether the final consonant doubles before `-ed`.
fn doubles_final(word: &str) -> bool {
    let chars: Vec<char> = word.chars().collect();
    let &[.., a, b, c] = chars.as_slice() else {
        return false;
    };
    let cvc = !is_vowel(a) && is_vowel(b) && !is_vowel(c) && !matches!(c, 'w' | 'x' | 'y');
    cvc && (vowel_groups(word) == 1 || DOUBLING_ENDINGS.iter().any(|e| word.ends_with(e)))
}

fn past_tense(word: &str) -> String {
    if word.ends_with("ed") {
        return word.to_string();
    }
    if word.ends_with('e') {
        return format!("{word}d");
    }
    if let Some(stem) = word.strip_suffix('y') {
        if stem.chars().last().is_some_and(|c| !is_vowel(c)) {
            return format!("{stem}ied");
        }
    }
    if doubles_final(word) {
        if let Some(last) = word.chars().last() {
            return format!("{word}{last}ed");
        }
    }
    format!("{word}ed")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `transfer` -> `Transferred`, `validate` -> `Validated`, `approve_order` -> `ApproveOrdered`.
pub fn action_to_event_type(action_id: &str) -> String {
    let words: Vec<String> = action_id
        .split(['_', '-'])
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let Some((last, rest)) = words.split_last() else {
        return String::new();
    };

    let mut out: String = rest.iter().map(|w| capitalize(w)).collect();
    out.push_str(&capitalize(&past_tense(last)));
    out
}

/// Stems whose `-ed` form dropped a silent `e`.
const SILENT_E_STEMS: &[&str] = &["at", "iz", "is", "v", "u", "dg", "c", "rs", "ur", "bl", "pl"];

fn present_tense(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ied") {
        return format!("{stem}y");
    }
    let Some(stem) = word.strip_suffix("ed") else {
        return word.to_string();
    };
    if stem.is_empty() {
        return word.to_string();
    }

    let chars: Vec<char> = stem.chars().collect();
    if let &[.., a, b] = chars.as_slice() {
        if a == b && !is_vowel(b) && !matches!(b, 'l' | 's' | 'f' | 'z') {
            return chars[..chars.len() - 1].iter().collect();
        }
    }
    if stem.ends_with('e') || SILENT_E_STEMS.iter().any(|s| stem.ends_with(s)) {
        return if stem.ends_with('e') { stem.to_string() } else { format!("{stem}e") };
    }
    stem.to_string()
}

/// Best-effort inverse of [`action_to_event_type`]: `Transferred` -> `transfer`.
pub fn event_type_to_action(event_type: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    for c in event_type.chars() {
        if c.is_uppercase() && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }

    if let Some(last) = words.last_mut() {
        *last = present_tense(last);
    }
    words.join("_")
}

/// Action id <-> event type table for one schema.
///
/// Actions declaring an explicit `event_type` use it; the rest use
/// [`action_to_event_type`].
#[derive(Debug, Clone, Default)]
pub struct EventTypes {
    by_action: HashMap<String, String>,
    by_event: HashMap<String, String>,
}

impl EventTypes {
    pub fn from_schema(schema: &Schema) -> Self {
        let mut table = Self::default();
        for action in schema.actions() {
            let event_type = action
                .event_type
                .clone()
                .unwrap_or_else(|| action_to_event_type(&action.id));

            if let Some(existing) = table.by_event.get(&event_type) {
                warn!(
                    event_type = %event_type,
                    action_id = %action.id,
                    existing = %existing,
                    "event type already mapped, keeping first action"
                );
            } else {
                table.by_event.insert(event_type.clone(), action.id.clone());
            }
            table.by_action.insert(action.id.clone(), event_type);
        }
        table
    }

    pub fn event_type(&self, action_id: &str) -> String {
        self.by_action
            .get(action_id)
            .cloned()
            .unwrap_or_else(|| action_to_event_type(action_id))
    }

    pub fn action(&self, event_type: &str) -> String {
        self.by_event
            .get(event_type)
            .cloned()
            .unwrap_or_else(|| event_type_to_action(event_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::petri::Action;

    #[test]
    fn test_action_to_event_type() {
        assert_eq!(action_to_event_type("transfer"), "Transferred");
        assert_eq!(action_to_event_type("validate"), "Validated");
        assert_eq!(action_to_event_type("confirm"), "Confirmed");
        assert_eq!(action_to_event_type("submit"), "Submitted");
        assert_eq!(action_to_event_type("ship"), "Shipped");
        assert_eq!(action_to_event_type("open"), "Opened");
        assert_eq!(action_to_event_type("apply"), "Applied");
        assert_eq!(action_to_event_type("pay"), "Payed");
        assert_eq!(action_to_event_type("approve_order"), "ApproveOrdered");
        assert_eq!(action_to_event_type("mint"), "Minted");
        assert_eq!(action_to_event_type(""), "");
    }

    #[test]
    fn test_event_type_to_action() {
        assert_eq!(event_type_to_action("Transferred"), "transfer");
        assert_eq!(event_type_to_action("Validated"), "validate");
        assert_eq!(event_type_to_action("Confirmed"), "confirm");
        assert_eq!(event_type_to_action("Submitted"), "submit");
        assert_eq!(event_type_to_action("Approved"), "approve");
        assert_eq!(event_type_to_action("Applied"), "apply");
        assert_eq!(event_type_to_action("ApproveOrdered"), "approve_order");
        assert_eq!(event_type_to_action("Minted"), "mint");
    }

    #[test]
    fn test_round_trip_common_verbs() {
        for verb in ["transfer", "validate", "confirm", "submit", "approve", "cancel", "mint", "reject"] {
            assert_eq!(event_type_to_action(&action_to_event_type(verb)), verb, "{verb}");
        }
    }

    #[test]
    fn test_table_prefers_declared_types() {
        let schema = Schema::builder("orders")
            .token_state("p", 1)
            .action(Action::new("pay").with_event_type("PaymentReceived"))
            .action("ship")
            .build()
            .unwrap();
        let table = EventTypes::from_schema(&schema);

        assert_eq!(table.event_type("pay"), "PaymentReceived");
        assert_eq!(table.action("PaymentReceived"), "pay");
        assert_eq!(table.event_type("ship"), "Shipped");
        assert_eq!(table.action("Shipped"), "ship");
        // unknown types fall back to the heuristic
        assert_eq!(table.action("Refunded"), "refund");
    }
}
