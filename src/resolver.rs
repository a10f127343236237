//! Ingredient resolution.
//!
//! Turns a product into the PLU codes the dispenser must credit. A simple
//! drink resolves to its own PLU. A cocktail is resolved through an ordered
//! chain of [`IngredientSource`]s; the first source returning a non-empty
//! list wins and later sources are never consulted.
//!
//! Chain order:
//! 1. ingredient options selected on the product
//! 2. combo lines expanded against the active options of their category
//! 3. template combo lines, dispenser components only
//! 4. attribute lines, dispenser components only
//! 5. placeholder default (only when enabled in config)

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, ComponentLine, Product};
use crate::error::ResolutionError;
use crate::gateway::parse_plu;

/// One ingredient to credit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngredientInfo {
    pub plu_code: String,
    pub name: String,
    pub product_id: i64,
    pub credits_per_serving: u32,
    pub price_extra: f64,
    pub category_name: String,
    /// Name of the source that produced it.
    pub source: &'static str,
}

/// Resolved ingredient list of a cocktail. Never empty.
#[derive(Debug, Clone, Serialize)]
pub struct CocktailResolution {
    pub product_id: i64,
    pub product_name: String,
    pub ingredients: Vec<IngredientInfo>,
}

/// One step of the cocktail fallback chain.
pub trait IngredientSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` or an empty list means "try the next source".
    fn resolve(&self, product: &Product) -> Option<Vec<IngredientInfo>>;
}

fn non_empty(list: Vec<IngredientInfo>) -> Option<Vec<IngredientInfo>> {
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

fn credits_or_one(credits: u32) -> u32 {
    credits.max(1)
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Options explicitly selected on the product.
pub struct SelectedOptions;

impl IngredientSource for SelectedOptions {
    fn name(&self) -> &'static str {
        "selected_options"
    }

    fn resolve(&self, product: &Product) -> Option<Vec<IngredientInfo>> {
        non_empty(
            product
                .selected_ingredients
                .iter()
                .filter_map(|option| {
                    let plu = option.plu_code.as_deref().filter(|p| !p.trim().is_empty())?;
                    Some(IngredientInfo {
                        plu_code: plu.to_string(),
                        name: option.name.clone(),
                        product_id: option.product_id,
                        credits_per_serving: credits_or_one(option.credits_per_serving),
                        price_extra: option.price_extra,
                        category_name: option.category_name.clone(),
                        source: self.name(),
                    })
                })
                .collect(),
        )
    }
}

/// Combo lines expanded against the catalog's active options.
pub struct ComboLineOptions {
    catalog: Arc<dyn Catalog>,
}

impl ComboLineOptions {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }
}

impl IngredientSource for ComboLineOptions {
    fn name(&self) -> &'static str {
        "combo_line_options"
    }

    fn resolve(&self, product: &Product) -> Option<Vec<IngredientInfo>> {
        let mut ingredients = Vec::new();
        for line in &product.combo_lines {
            for option in self.catalog.combo_options(&line.category_name) {
                match option.plu_code.as_deref().filter(|p| !p.trim().is_empty()) {
                    Some(plu) => ingredients.push(IngredientInfo {
                        plu_code: plu.to_string(),
                        name: option.name.clone(),
                        product_id: option.product_id,
                        credits_per_serving: credits_or_one(option.credits_per_serving),
                        price_extra: option.price_extra,
                        category_name: line.category_name.clone(),
                        source: self.name(),
                    }),
                    None => warn!(
                        option = %option.name,
                        cocktail = %product.name,
                        "combo option has no PLU code"
                    ),
                }
            }
        }
        non_empty(ingredients)
    }
}

fn dispenser_components(lines: &[ComponentLine], source: &'static str) -> Vec<IngredientInfo> {
    lines
        .iter()
        .filter(|line| line.is_dispenser_drink)
        .map(|line| IngredientInfo {
            plu_code: line.effective_plu(),
            name: line.name.clone(),
            product_id: line.product_id,
            credits_per_serving: credits_or_one(line.credits_per_serving),
            price_extra: 0.0,
            category_name: String::new(),
            source,
        })
        .collect()
}

/// Template combo-line associations.
pub struct TemplateComboLines;

impl IngredientSource for TemplateComboLines {
    fn name(&self) -> &'static str {
        "template_combo_lines"
    }

    fn resolve(&self, product: &Product) -> Option<Vec<IngredientInfo>> {
        non_empty(dispenser_components(&product.template_combo_lines, self.name()))
    }
}

/// Attribute-line associations.
pub struct AttributeLines;

impl IngredientSource for AttributeLines {
    fn name(&self) -> &'static str {
        "attribute_lines"
    }

    fn resolve(&self, product: &Product) -> Option<Vec<IngredientInfo>> {
        non_empty(dispenser_components(&product.attribute_lines, self.name()))
    }
}

/// Degraded-mode default: a base and a mix. Reaching it means the cocktail
/// is not configured.
pub struct PlaceholderDefault;

impl IngredientSource for PlaceholderDefault {
    fn name(&self) -> &'static str {
        "placeholder_default"
    }

    fn resolve(&self, product: &Product) -> Option<Vec<IngredientInfo>> {
        warn!(
            cocktail = %product.name,
            product_id = product.id,
            "no ingredients configured, dispensing placeholder base and mix"
        );
        let placeholder = |plu: &str, name: &str| IngredientInfo {
            plu_code: plu.to_string(),
            name: name.to_string(),
            product_id: 0,
            credits_per_serving: 1,
            price_extra: 0.0,
            category_name: String::new(),
            source: self.name(),
        };
        Some(vec![
            placeholder("BASE001", "Default base"),
            placeholder("MIX001", "Default mix"),
        ])
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Ordered chain of ingredient sources.
pub struct IngredientResolver {
    sources: Vec<Box<dyn IngredientSource>>,
}

impl IngredientResolver {
    /// Standard chain. The placeholder step is appended only when allowed.
    pub fn new(catalog: Arc<dyn Catalog>, allow_placeholder: bool) -> Self {
        let mut sources: Vec<Box<dyn IngredientSource>> = vec![
            Box::new(SelectedOptions),
            Box::new(ComboLineOptions::new(catalog)),
            Box::new(TemplateComboLines),
            Box::new(AttributeLines),
        ];
        if allow_placeholder {
            sources.push(Box::new(PlaceholderDefault));
        }
        Self { sources }
    }

    pub fn with_sources(sources: Vec<Box<dyn IngredientSource>>) -> Self {
        Self { sources }
    }

    /// PLU codes to credit for `product`: its own PLU for a simple drink, the
    /// ingredient list for a cocktail.
    pub fn resolve(&self, product: &Product) -> Result<Vec<IngredientInfo>, ResolutionError> {
        if product.is_cocktail {
            return Ok(self.resolve_cocktail(product)?.ingredients);
        }
        Ok(vec![self.resolve_simple(product)?])
    }

    /// The product's own PLU, validated.
    pub fn resolve_simple(&self, product: &Product) -> Result<IngredientInfo, ResolutionError> {
        let plu = product
            .plu_code
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ResolutionError::MissingPlu {
                product: product.name.clone(),
            })?;
        parse_plu(plu)?;
        Ok(IngredientInfo {
            plu_code: plu.to_string(),
            name: product.name.clone(),
            product_id: product.id,
            credits_per_serving: credits_or_one(product.credits_per_serving),
            price_extra: 0.0,
            category_name: String::new(),
            source: "product",
        })
    }

    /// Walk the chain; first non-empty source wins.
    pub fn resolve_cocktail(&self, product: &Product) -> Result<CocktailResolution, ResolutionError> {
        for source in &self.sources {
            match source.resolve(product) {
                Some(ingredients) if !ingredients.is_empty() => {
                    info!(
                        cocktail = %product.name,
                        source = source.name(),
                        count = ingredients.len(),
                        "cocktail ingredients resolved"
                    );
                    return Ok(CocktailResolution {
                        product_id: product.id,
                        product_name: product.name.clone(),
                        ingredients,
                    });
                }
                _ => debug!(cocktail = %product.name, source = source.name(), "no ingredients"),
            }
        }
        warn!(cocktail = %product.name, "no ingredient source matched");
        Err(ResolutionError::NoIngredientsResolved {
            product: product.name.clone(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
