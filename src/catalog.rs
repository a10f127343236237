//! Product catalog collaborator.
//!
//! The gateway does not own the catalog; it reads products, combo options
//! and order lines through the [`Catalog`] trait. [`MemoryCatalog`] is a
//! JSON-loadable implementation used by the operator CLI and the tests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Catalog data
// ---------------------------------------------------------------------------

/// A sellable product as seen by the dispenser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub plu_code: Option<String>,
    /// Poured by (or known to) the dispenser.
    pub is_dispenser_drink: bool,
    /// Requires a credit on the machine. Dispenser drinks without it are
    /// served directly (bottles, cans).
    pub needs_distributor: bool,
    pub is_cocktail: bool,
    /// Only usable as a cocktail ingredient, never sold alone.
    pub is_ingredient_only: bool,
    pub credits_per_serving: u32,
    pub volume_cl: f64,
    pub list_price: f64,
    /// Ingredient options chosen explicitly on the product.
    pub selected_ingredients: Vec<ComboOption>,
    /// Combo categories the cocktail draws its ingredients from.
    pub combo_lines: Vec<ComboLine>,
    pub template_combo_lines: Vec<ComponentLine>,
    pub attribute_lines: Vec<ComponentLine>,
}

/// An option of a combo category, pointing at an ingredient product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComboOption {
    pub name: String,
    pub category_name: String,
    pub product_id: i64,
    pub plu_code: Option<String>,
    pub credits_per_serving: u32,
    pub price_extra: f64,
    pub active: bool,
}

impl Default for ComboOption {
    fn default() -> Self {
        Self {
            name: String::new(),
            category_name: String::new(),
            product_id: 0,
            plu_code: None,
            credits_per_serving: 1,
            price_extra: 0.0,
            active: true,
        }
    }
}

/// A combo category attached to a cocktail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComboLine {
    pub category_name: String,
}

/// A component association (template combo line or attribute line).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentLine {
    pub product_id: i64,
    pub name: String,
    pub plu_code: Option<String>,
    pub is_dispenser_drink: bool,
    pub credits_per_serving: u32,
    pub quantity: u32,
}

impl ComponentLine {
    /// Configured PLU, or `PLU{product_id}` when the component has none.
    pub fn effective_plu(&self) -> String {
        match self.plu_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => code.to_string(),
            _ => format!("PLU{}", self.product_id),
        }
    }
}

/// A POS order line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: String,
    pub product_id: i64,
    pub qty: f64,
    pub session_ref: String,
}

// ---------------------------------------------------------------------------
// Catalog trait
// ---------------------------------------------------------------------------

/// Read access to catalog and order data.
pub trait Catalog: Send + Sync {
    fn product(&self, id: i64) -> Option<Product>;

    fn products(&self) -> Vec<Product>;

    /// Active options of a combo category.
    fn combo_options(&self, category_name: &str) -> Vec<ComboOption>;

    fn order_line(&self, line_ref: &str) -> Option<OrderLine>;
}

// ---------------------------------------------------------------------------
// In-memory catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct CatalogData {
    products: Vec<Product>,
    combo_options: Vec<ComboOption>,
    order_lines: Vec<OrderLine>,
}

#[derive(Debug, Default)]
struct Indexed {
    products: HashMap<i64, Product>,
    combo_options: Vec<ComboOption>,
    order_lines: HashMap<String, OrderLine>,
}

/// Catalog held in memory, loadable from a JSON document of the form
/// `{"products": [...], "combo_options": [...], "order_lines": [...]}`.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: RwLock<Indexed>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let data: CatalogData = serde_json::from_str(json)?;
        let catalog = Self::new();
        for product in data.products {
            catalog.insert_product(product);
        }
        for option in data.combo_options {
            catalog.insert_combo_option(option);
        }
        for line in data.order_lines {
            catalog.upsert_order_line(line);
        }
        Ok(catalog)
    }

    pub fn insert_product(&self, product: Product) {
        if let Ok(mut data) = self.inner.write() {
            data.products.insert(product.id, product);
        }
    }

    pub fn insert_combo_option(&self, option: ComboOption) {
        if let Ok(mut data) = self.inner.write() {
            data.combo_options.push(option);
        }
    }

    pub fn upsert_order_line(&self, line: OrderLine) {
        if let Ok(mut data) = self.inner.write() {
            data.order_lines.insert(line.id.clone(), line);
        }
    }

    pub fn remove_order_line(&self, line_ref: &str) -> Option<OrderLine> {
        self.inner.write().ok()?.order_lines.remove(line_ref)
    }
}

impl Catalog for MemoryCatalog {
    fn product(&self, id: i64) -> Option<Product> {
        self.inner.read().ok()?.products.get(&id).cloned()
    }

    fn products(&self) -> Vec<Product> {
        let Ok(data) = self.inner.read() else {
            return Vec::new();
        };
        let mut products: Vec<Product> = data.products.values().cloned().collect();
        products.sort_by_key(|p| p.id);
        products
    }

    fn combo_options(&self, category_name: &str) -> Vec<ComboOption> {
        let Ok(data) = self.inner.read() else {
            return Vec::new();
        };
        data.combo_options
            .iter()
            .filter(|o| o.active && o.category_name == category_name)
            .cloned()
            .collect()
    }

    fn order_line(&self, line_ref: &str) -> Option<OrderLine> {
        self.inner.read().ok()?.order_lines.get(line_ref).cloned()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "products": [
            {"id": 1, "name": "Pils", "plu_code": "PLU007", "is_dispenser_drink": true,
             "needs_distributor": true, "credits_per_serving": 1},
            {"id": 2, "name": "Mojito", "is_dispenser_drink": true, "needs_distributor": true,
             "is_cocktail": true, "combo_lines": [{"category_name": "Rum"}]}
        ],
        "combo_options": [
            {"name": "White rum", "category_name": "Rum", "product_id": 10, "plu_code": "PLU010"},
            {"name": "Dark rum", "category_name": "Rum", "product_id": 11, "plu_code": "PLU011",
             "active": false},
            {"name": "Lime", "category_name": "Juice", "product_id": 12, "plu_code": "PLU012"}
        ],
        "order_lines": [
            {"id": "L1", "product_id": 1, "qty": 3.0, "session_ref": "S1"}
        ]
    }"#;

    #[test]
    fn test_load_from_json() {
        let catalog = MemoryCatalog::from_json(CATALOG).unwrap();
        let pils = catalog.product(1).unwrap();
        assert_eq!(pils.plu_code.as_deref(), Some("PLU007"));
        assert!(pils.needs_distributor);
        assert!(catalog.product(2).unwrap().is_cocktail);
        assert!(catalog.product(99).is_none());
        assert_eq!(catalog.products().len(), 2);
        assert_eq!(catalog.order_line("L1").unwrap().qty, 3.0);
    }

    #[test]
    fn test_combo_options_filters_inactive_and_category() {
        let catalog = MemoryCatalog::from_json(CATALOG).unwrap();
        let rum = catalog.combo_options("Rum");
        assert_eq!(rum.len(), 1);
        assert_eq!(rum[0].name, "White rum");
        assert_eq!(rum[0].credits_per_serving, 1);
    }

    #[test]
    fn test_order_line_lifecycle() {
        let catalog = MemoryCatalog::new();
        catalog.upsert_order_line(OrderLine {
            id: "L9".into(),
            product_id: 1,
            qty: 2.0,
            session_ref: "S1".into(),
        });
        assert!(catalog.order_line("L9").is_some());
        assert!(catalog.remove_order_line("L9").is_some());
        assert!(catalog.order_line("L9").is_none());
    }

    #[test]
    fn test_component_effective_plu() {
        let with = ComponentLine {
            product_id: 4,
            plu_code: Some("PLU021".into()),
            ..Default::default()
        };
        let without = ComponentLine {
            product_id: 4,
            plu_code: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(with.effective_plu(), "PLU021");
        assert_eq!(without.effective_plu(), "PLU4");
    }
}
