use deal_utils::price::{PriceHistory, PriceHistoryLookup};
use deal_utils::{FilterCriteria, Page};
use futures::future::{FutureExt, LocalBoxFuture};
use reqwest::StatusCode;

use crate::config::FeedConfig;
use crate::error::FetchError;

/// The request for one page of the deals listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageQuery {
    pub limit: usize,
    /// Absent for the first page.
    pub cursor: Option<String>,
    pub criteria: FilterCriteria,
}

impl PageQuery {
    /// Query string parameters. Filters that aren't set are left out entirely.
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("limit", self.limit.to_string())];
        if let Some(cursor) = &self.cursor {
            params.push(("cursor", cursor.clone()));
        }
        if !self.criteria.search.is_empty() {
            params.push(("search", self.criteria.search.clone()));
        }
        if let Some(has_coupon) = self.criteria.has_coupon {
            params.push(("hasCoupon", has_coupon.to_string()));
        }
        if !self.criteria.stores.is_empty() {
            let stores: Vec<&str> = self.criteria.stores.iter().map(String::as_str).collect();
            params.push(("stores", stores.join(",")));
        }
        params
    }
}

/// Everything the feed needs from the deals backend.
pub trait DealSource {
    fn fetch_page(&self, query: &PageQuery) -> LocalBoxFuture<'static, Result<Page, FetchError>>;

    fn fetch_price_history(
        &self,
        product_key: &str,
    ) -> LocalBoxFuture<'static, Result<PriceHistoryLookup, FetchError>>;

    fn fetch_stores(&self) -> LocalBoxFuture<'static, Result<Vec<String>, FetchError>>;
}

/// [`DealSource`] over the backend's HTTP API.
#[derive(Clone, Debug)]
pub struct HttpDealSource {
    client: reqwest::Client,
    config: FeedConfig,
}

#[derive(serde::Deserialize)]
struct StoresResponse {
    stores: Vec<String>,
}

impl HttpDealSource {
    pub fn new(config: FeedConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: FeedConfig) -> Self {
        Self { client, config }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        request: reqwest::RequestBuilder,
    ) -> Result<T, FetchError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl DealSource for HttpDealSource {
    fn fetch_page(&self, query: &PageQuery) -> LocalBoxFuture<'static, Result<Page, FetchError>> {
        let request = self
            .client
            .get(self.config.deals_url())
            .query(&query.to_params());
        Self::get_json(request).boxed_local()
    }

    fn fetch_price_history(
        &self,
        product_key: &str,
    ) -> LocalBoxFuture<'static, Result<PriceHistoryLookup, FetchError>> {
        let url = self.config.price_history_url(product_key);
        let client = self.client.clone();
        async move {
            let response = client.get(url?).send().await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(PriceHistoryLookup::NotFound),
                status if !status.is_success() => Err(FetchError::Status(status.as_u16())),
                _ => {
                    let body = response.text().await?;
                    let history: PriceHistory = serde_json::from_str(&body)?;
                    Ok(PriceHistoryLookup::Found(history))
                }
            }
        }
        .boxed_local()
    }

    fn fetch_stores(&self) -> LocalBoxFuture<'static, Result<Vec<String>, FetchError>> {
        let request = self.client.get(self.config.stores_url());
        async move {
            let response: StoresResponse = Self::get_json(request).await?;
            Ok(response.stores)
        }
        .boxed_local()
    }
}
