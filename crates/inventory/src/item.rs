use serde::{Deserialize, Serialize};

use stockcount_core::Entity;

/// Catalogue item as served by `GET /items/{item_code}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub item_code: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uom: Option<String>,
    /// Quantity the backend expects on hand, if the user may see it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_qty: Option<i64>,
}

impl Entity for Item {
    type Id = String;
    const KIND: &'static str = "item";

    fn id(&self) -> &Self::Id {
        &self.item_code
    }
}

impl Item {
    /// Normalize a scanned or typed item code the way the backend keys items.
    pub fn normalize_code(code: &str) -> String {
        code.trim().to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> Item {
        Item {
            item_code: "X1".to_string(),
            name: "Widget".to_string(),
            barcode: Some("4006381333931".to_string()),
            uom: Some("EA".to_string()),
            system_qty: Some(12),
        }
    }

    #[test]
    fn cache_key_uses_item_namespace() {
        assert_eq!(widget().cache_key(), "item:X1");
        assert_eq!(Item::key_for(&"X1".to_string()), "item:X1");
    }

    #[test]
    fn deserializes_without_optional_fields() {
        let item: Item =
            serde_json::from_value(serde_json::json!({"item_code": "A", "name": "Apple"})).unwrap();
        assert_eq!(item.barcode, None);
        assert_eq!(item.system_qty, None);
    }
}
