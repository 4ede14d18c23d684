use std::rc::Rc;
use std::time::Duration;

use chokepoint::ChokePoint;
use deal_utils::price::PriceHistoryLookup;

use crate::backend::DealSource;
use crate::error::FetchError;

/// Price history lookups by product key. Concurrent lookups for one key share a
/// single request, and answers are reused until they go stale.
pub struct PriceHistoryCache {
    lookups: ChokePoint<String, PriceHistoryLookup, FetchError>,
    source: Rc<dyn DealSource>,
}

impl PriceHistoryCache {
    pub fn new(source: Rc<dyn DealSource>, stale_after: Duration) -> Self {
        Self {
            lookups: ChokePoint::with_freshness(stale_after),
            source,
        }
    }

    pub async fn get(&self, product_key: &str) -> Result<Rc<PriceHistoryLookup>, FetchError> {
        if product_key.is_empty() {
            return Ok(Rc::new(PriceHistoryLookup::NotFound));
        }
        let fetch = self.source.fetch_price_history(product_key);
        self.lookups.get(product_key.to_string(), fetch).await
    }

    pub fn clear(&self) {
        self.lookups.clear();
    }
}
