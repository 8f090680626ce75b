//! Contract between the parsing step and the rest of the pipeline: the instruction
//! sent with the document, the JSON Schema the reply must satisfy, and the typed
//! form it is decoded into.

use std::sync::LazyLock;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const EXTRACTION_PROMPT: &str = r#"Extract the key data from this receipt PDF and reply with a single JSON object, no prose, in exactly this shape:
{
  "merchant": { "name": "Store name", "address": "123 Main St, City, Country", "contact": "+123456789" },
  "transaction": { "date": "2023-10-01", "time": "12:00", "receipt_number": "ABC123456", "payment_method": "Credit Card" },
  "items": [ { "name": "Item 1", "quantity": 2, "unit_price": 10.00, "total_price": 20.00 } ],
  "totals": { "subtotal": 20.00, "taxes": 2.00, "total": 22.00, "currency": "USD" }
}
Use null for anything that is missing or unreadable. Dates as YYYY-MM-DD. Prices as plain numbers without currency symbols. Currency as an ISO 4217 code."#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    pub name: Option<String>,
    pub address: Option<String>,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub date: Option<String>,
    pub time: Option<String>,
    pub receipt_number: Option<String>,
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedItem {
    pub name: String,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub total_price: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Option<f64>,
    pub taxes: Option<f64>,
    pub total: Option<f64>,
    pub currency: Option<String>,
}

/// Validated output of the parsing step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedReceipt {
    pub merchant: Merchant,
    #[serde(default)]
    pub transaction: Transaction,
    pub items: Vec<ParsedItem>,
    #[serde(default)]
    pub totals: Totals,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SchemaError {
    #[error("model reply contains no JSON object")]
    NoJson,
    #[error("model reply is not valid JSON: {0}")]
    Malformed(String),
    #[error("model reply does not match the receipt schema: {0}")]
    Invalid(String),
}

fn nullable(kind: &str) -> Value {
    json!({ "type": [kind, "null"] })
}

static RECEIPT_SCHEMA: LazyLock<Result<JSONSchema, String>> = LazyLock::new(|| {
    let schema = json!({
        "type": "object",
        "required": ["merchant", "items"],
        "properties": {
            "merchant": {
                "type": "object",
                "properties": {
                    "name": nullable("string"),
                    "address": nullable("string"),
                    "contact": nullable("string")
                }
            },
            "transaction": {
                "type": ["object", "null"],
                "properties": {
                    "date": nullable("string"),
                    "time": nullable("string"),
                    "receipt_number": nullable("string"),
                    "payment_method": nullable("string")
                }
            },
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name"],
                    "properties": {
                        "name": { "type": "string", "minLength": 1 },
                        "quantity": nullable("number"),
                        "unit_price": nullable("number"),
                        "total_price": nullable("number")
                    }
                }
            },
            "totals": {
                "type": ["object", "null"],
                "properties": {
                    "subtotal": nullable("number"),
                    "taxes": nullable("number"),
                    "total": nullable("number"),
                    "currency": nullable("string")
                }
            }
        }
    });

    JSONSchema::compile(&schema).map_err(|e| e.to_string())
});

/// Decode the first JSON value of a model reply, ignoring the code fences and prose
/// around it.
fn first_json_value(text: &str) -> Result<Value, SchemaError> {
    let start = text.find('{').ok_or(SchemaError::NoJson)?;
    serde_json::Deserializer::from_str(&text[start..])
        .into_iter::<Value>()
        .next()
        .ok_or(SchemaError::NoJson)?
        .map_err(|e| SchemaError::Malformed(e.to_string()))
}

/// Decode and validate a raw model reply.
pub fn parse_model_output(text: &str) -> Result<ParsedReceipt, SchemaError> {
    let mut value = first_json_value(text)?;

    let schema = RECEIPT_SCHEMA
        .as_ref()
        .map_err(|e| SchemaError::Invalid(format!("schema failed to compile: {e}")))?;

    if let Err(errors) = schema.validate(&value) {
        let detail = errors
            .map(|e| format!("{}: {}", e.instance_path, e))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(SchemaError::Invalid(detail));
    }

    // `null` blocks are allowed by the schema but decode as their defaults.
    if let Some(obj) = value.as_object_mut() {
        obj.retain(|_, v| !v.is_null());
    }

    serde_json::from_value(value).map_err(|e| SchemaError::Invalid(e.to_string()))
}
