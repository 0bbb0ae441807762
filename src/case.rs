//! Naming: snake_case conversion for payload keys and the injectable strategy the resolver uses
//! for foreign-key, junction, constraint and index names.

use serde_json::{Map, Value};

/// Convert a single identifier from camelCase/PascalCase to snake_case.
/// Acronym runs stay together: "HTTPServer" -> "http_server", "OrderItem" -> "order_item".
pub fn to_snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            continue;
        }
        if c.is_uppercase() {
            let prev = if i > 0 { Some(chars[i - 1]) } else { None };
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.map(|n| n.is_lowercase()).unwrap_or(false),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Convert all keys of a JSON object from camelCase to snake_case (in place).
/// Payloads are keyed by column name before validation.
pub fn object_keys_to_snake_case(obj: &mut Map<String, Value>) {
    let keys: Vec<String> = obj.keys().cloned().collect();
    for k in keys {
        let snake = to_snake_case(&k);
        if snake != k {
            if let Some(v) = obj.remove(&k) {
                obj.insert(snake, v);
            }
        }
    }
}

/// Irregular nouns the default strategy knows about (singular, plural).
const IRREGULAR: &[(&str, &str)] = &[
    ("person", "people"),
    ("child", "children"),
    ("man", "men"),
    ("woman", "women"),
    ("mouse", "mice"),
    ("goose", "geese"),
];

/// Nouns that are the same in singular and plural.
const UNCOUNTABLE: &[&str] = &["series", "species", "news", "equipment", "information", "data", "metadata"];

/// Names derived from entity and field names. Swap the strategy to change conventions
/// without touching the resolver.
pub trait NamingStrategy: Send + Sync {
    fn column_name(&self, field: &str) -> String {
        to_snake_case(field)
    }

    fn pluralize(&self, word: &str) -> String;

    /// Conventional foreign-key column pointing at `entity`: "Customer" -> "customer_id".
    fn foreign_key(&self, entity: &str) -> String {
        format!("{}_id", to_snake_case(entity))
    }

    /// Target-side column of a self-referential junction, which would otherwise collide with the source column.
    fn self_junction_key(&self, entity: &str) -> String {
        format!("related_{}_id", to_snake_case(entity))
    }

    fn junction_table(&self, through: &str) -> String {
        to_snake_case(through)
    }

    fn foreign_key_constraint(&self, table: &str, column: &str) -> String {
        format!("fk_{}_{}", table, column)
    }

    fn index_name(&self, table: &str, columns: &[String]) -> String {
        format!("idx_{}_{}", table, columns.join("_"))
    }

    /// Default include name for a to-many relationship with no explicit name.
    fn collection_name(&self, entity: &str) -> String {
        self.pluralize(&to_snake_case(entity))
    }
}

/// English snake_case conventions.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultNaming;

impl NamingStrategy for DefaultNaming {
    fn pluralize(&self, word: &str) -> String {
        let lower = word.to_lowercase();
        if word.is_empty() || UNCOUNTABLE.contains(&lower.as_str()) {
            return word.to_string();
        }
        if let Some((singular, plural)) = IRREGULAR.iter().find(|(s, _)| ends_with_word(&lower, s)) {
            return format!("{}{}", &word[..word.len() - singular.len()], plural);
        }
        if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with('z') || lower.ends_with("ch") || lower.ends_with("sh") {
            return format!("{}es", word);
        }
        if lower.ends_with('y') && !ends_with_vowel_y(&lower) {
            return format!("{}ies", &word[..word.len() - 1]);
        }
        format!("{}s", word)
    }
}

/// `word` equals `suffix` or ends with `_suffix`; "human" does not match "man".
fn ends_with_word(word: &str, suffix: &str) -> bool {
    word == suffix || word.ends_with(&format!("_{}", suffix))
}

fn ends_with_vowel_y(lower: &str) -> bool {
    let mut it = lower.chars().rev();
    it.next();
    matches!(it.next(), Some('a' | 'e' | 'i' | 'o' | 'u'))
}
