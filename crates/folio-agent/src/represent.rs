//! The representation seam: turning raw result values into display-ready
//! forms. Rich providers live with the embedding; the default renders the
//! raw JSON and infers a type name when the backend supplied none.

use folio_core::evaluating::RepresentedValue;

pub trait Representer: Send + Sync {
    fn prepare(&self, value_json: &str, type_name: Option<&str>) -> RepresentedValue;
}

/// Default representer: passes the raw JSON through as the single
/// representation.
pub struct DisplayRepresenter;

impl Representer for DisplayRepresenter {
    fn prepare(&self, value_json: &str, type_name: Option<&str>) -> RepresentedValue {
        let type_name = type_name
            .map(str::to_string)
            .or_else(|| infer_type_name(value_json));

        RepresentedValue {
            type_name,
            representations: vec![value_json.to_string()],
        }
    }
}

fn infer_type_name(value_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(value_json).ok()?;
    let name = match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    };
    Some(name.to_string())
}
