use tracing::warn;

use super::schema::ParsedReceipt;
use crate::entity::receipt::LineItem;

/// Difference tolerated between `quantity × unit_price` and the printed line total.
const LINE_TOLERANCE: f64 = 0.01;

/// Number of items named in the generated summary before the rest are counted.
const SUMMARY_ITEMS: usize = 3;

/// Fields written to a receipt when an extraction run commits.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFields {
    pub file_display_name: String,
    pub merchant_name: Option<String>,
    pub merchant_address: Option<String>,
    pub merchant_contact: Option<String>,
    pub transaction_date: Option<String>,
    pub transaction_amount: Option<String>,
    pub currency: Option<String>,
    pub receipt_summary: Option<String>,
    pub items: Vec<LineItem>,
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn money(amount: f64) -> String {
    format!("{amount:.2}")
}

fn quantity(q: f64) -> String {
    if q.fract() == 0.0 {
        format!("{q:.0}")
    } else {
        q.to_string()
    }
}

/// Map the parsed receipt onto the persisted shape. `file_name` is the display name
/// fallback when no merchant was recognised.
pub fn normalize(parsed: &ParsedReceipt, file_name: &str) -> ExtractedFields {
    let merchant_name = clean(&parsed.merchant.name);
    let transaction_date = clean(&parsed.transaction.date);

    let items: Vec<LineItem> = parsed
        .items
        .iter()
        .map(|item| {
            let quantity = item.quantity.unwrap_or(1.0);
            let unit_price = item
                .unit_price
                .or_else(|| {
                    item.total_price
                        .map(|t| if quantity != 0.0 { t / quantity } else { t })
                })
                .unwrap_or(0.0);
            let total_price = item.total_price.unwrap_or(quantity * unit_price);

            if (quantity * unit_price - total_price).abs() > LINE_TOLERANCE {
                warn!(
                    item = %item.name,
                    quantity,
                    unit_price,
                    total_price,
                    "Line item total does not match quantity × unit price"
                );
            }

            LineItem {
                name: item.name.trim().to_owned(),
                quantity,
                unit_price,
                total_price,
            }
        })
        .collect();

    let transaction_amount = match parsed.totals.total {
        Some(total) => Some(money(total)),
        None if !items.is_empty() => Some(money(items.iter().map(|i| i.total_price).sum())),
        None => None,
    };

    let currency = clean(&parsed.totals.currency).map(|c| c.to_uppercase());

    let file_display_name = match (&merchant_name, &transaction_date) {
        (Some(merchant), Some(date)) => format!("{merchant} – {date}"),
        (Some(merchant), None) => merchant.clone(),
        _ => file_name.to_owned(),
    };

    let mut fields = ExtractedFields {
        file_display_name,
        merchant_name,
        merchant_address: clean(&parsed.merchant.address),
        merchant_contact: clean(&parsed.merchant.contact),
        transaction_date,
        transaction_amount,
        currency,
        receipt_summary: None,
        items,
    };
    fields.receipt_summary = Some(summarize(&fields, parsed));
    fields
}

fn summarize(fields: &ExtractedFields, parsed: &ParsedReceipt) -> String {
    let mut sentences = Vec::new();

    let mut opening = format!(
        "Receipt from {}",
        fields.merchant_name.as_deref().unwrap_or("an unknown merchant")
    );
    if let Some(address) = &fields.merchant_address {
        opening.push_str(&format!(" at {address}"));
    }
    if let Some(contact) = &fields.merchant_contact {
        opening.push_str(&format!(" (contact: {contact})"));
    }
    if let Some(date) = &fields.transaction_date {
        opening.push_str(&format!(" dated {date}"));
        if let Some(time) = clean(&parsed.transaction.time) {
            opening.push_str(&format!(" {time}"));
        }
    }
    sentences.push(opening);

    let mut details = Vec::new();
    if let Some(number) = clean(&parsed.transaction.receipt_number) {
        details.push(format!("receipt number {number}"));
    }
    if let Some(method) = clean(&parsed.transaction.payment_method) {
        details.push(format!("paid by {method}"));
    }
    if !details.is_empty() {
        sentences.push(capitalize(&details.join(", ")));
    }

    if let Some(amount) = &fields.transaction_amount {
        let mut total = format!("Total {amount}");
        if let Some(currency) = &fields.currency {
            total.push_str(&format!(" {currency}"));
        }
        if let Some(taxes) = parsed.totals.taxes.filter(|t| *t > 0.0) {
            total.push_str(&format!(", including {} tax", money(taxes)));
        }
        sentences.push(total);
    }

    if !fields.items.is_empty() {
        let named: Vec<String> = fields
            .items
            .iter()
            .take(SUMMARY_ITEMS)
            .map(|item| {
                if item.quantity == 1.0 {
                    item.name.clone()
                } else {
                    format!("{} × {}", quantity(item.quantity), item.name)
                }
            })
            .collect();
        let mut line = format!(
            "{} item{}: {}",
            fields.items.len(),
            if fields.items.len() == 1 { "" } else { "s" },
            named.join(", ")
        );
        let rest = fields.items.len().saturating_sub(SUMMARY_ITEMS);
        if rest > 0 {
            line.push_str(&format!(" and {rest} more"));
        }
        sentences.push(line);
    }

    sentences.join(". ") + "."
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
