//! Seller and product resolution for incoming orders.

use std::collections::{HashMap, HashSet};

use escrowline_types::{ProductRef, UserId};
use parking_lot::RwLock;

/// Answers whether the parties and listings an order names exist.
pub trait CatalogResolver: Send + Sync {
    fn seller_exists(&self, seller: UserId) -> bool;
    fn product_exists(&self, seller: UserId, product: &ProductRef) -> bool;
}

/// Accepts every seller and product. For deployments where the catalog is
/// validated upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCatalog;

impl CatalogResolver for OpenCatalog {
    fn seller_exists(&self, _seller: UserId) -> bool {
        true
    }

    fn product_exists(&self, _seller: UserId, _product: &ProductRef) -> bool {
        true
    }
}

/// A registered set of sellers and their listings.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    listings: RwLock<HashMap<UserId, HashSet<ProductRef>>>,
}

impl InMemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_seller(&self, seller: UserId) {
        self.listings.write().entry(seller).or_default();
    }

    pub fn add_product(&self, seller: UserId, product: impl Into<String>) {
        self.listings
            .write()
            .entry(seller)
            .or_default()
            .insert(ProductRef::new(product));
    }
}

impl CatalogResolver for InMemoryCatalog {
    fn seller_exists(&self, seller: UserId) -> bool {
        self.listings.read().contains_key(&seller)
    }

    fn product_exists(&self, seller: UserId, product: &ProductRef) -> bool {
        self.listings
            .read()
            .get(&seller)
            .is_some_and(|products| products.contains(product))
    }
}
