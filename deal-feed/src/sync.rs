//! The live deal feed: paged fetches, push events and filter changes merged into
//! one view.
//!
//! [`SyncController`] owns a [`PagedCache`], the [`StreamSubscription`] feeding it
//! and every task it spawned on their behalf. Each change to the cache is
//! published as a [`FeedSnapshot`] on a watch channel.
//!
//! Live deals that pass the current filter are shown at the top right away, and a
//! refetch of the first page is scheduled to reconcile them with the backend. The
//! refetch is debounced: a burst of live deals leads to one refetch,
//! `reconciliation_delay` after the last of them.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use deal_utils::price::PriceHistoryLookup;
use deal_utils::{Deal, FilterCriteria, Page, matches};
use im::Vector;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use crate::backend::{DealSource, HttpDealSource};
use crate::cache::{FetchTicket, PageRequest, PagedCache};
use crate::config::FeedConfig;
use crate::error::{EventError, FetchError};
use crate::events::{
    MEDIA_UPDATED_EVENT, MediaUpdate, NEW_DEAL_EVENT, parse_media_update, parse_new_deal,
};
use crate::price_history::PriceHistoryCache;
use crate::sse::{ServerEvent, SseTransport};
use crate::subscription::{ConnectionState, EventHandler, EventTransport, StreamSubscription};

/// Everything the presentation layer renders from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeedSnapshot {
    pub items: Vector<Deal>,
    pub has_more: bool,
    pub is_initial_loading: bool,
    pub is_loading_more: bool,
    /// A first-page fetch for changed filters is running while the old results
    /// are still shown.
    pub is_filtering_in_progress: bool,
    pub is_revalidating: bool,
    pub error: Option<FetchError>,
    pub available_stores: Vec<String>,
}

impl FeedSnapshot {
    fn of(cache: &PagedCache) -> Self {
        Self {
            items: cache.items(),
            has_more: cache.has_more(),
            is_initial_loading: cache.is_initial_loading(),
            is_loading_more: cache.is_loading_more(),
            is_filtering_in_progress: cache.is_filtering_in_progress(),
            is_revalidating: cache.is_revalidating(),
            error: cache.error().cloned(),
            available_stores: cache.available_stores().map(<[String]>::to_vec).unwrap_or_default(),
        }
    }
}

#[derive(Default)]
struct Tasks {
    fetches: HashMap<FetchTicket, AbortHandle>,
    reconciliation: Option<JoinHandle<()>>,
}

/// The state event handlers and spawned tasks reach through a `Weak`. Once
/// `alive` is cleared nothing touches the cache again.
struct Engine {
    cache: RefCell<PagedCache>,
    source: Rc<dyn DealSource>,
    tasks: RefCell<Tasks>,
    alive: Cell<bool>,
    reconciliation_delay: Duration,
    snapshots: watch::Sender<FeedSnapshot>,
}

impl Engine {
    fn publish(&self) {
        let snapshot = FeedSnapshot::of(&self.cache.borrow());
        self.snapshots.send_replace(snapshot);
    }

    fn spawn_fetch(self: &Rc<Self>, request: PageRequest) {
        let fetch = self.source.fetch_page(&request.query);
        let ticket = request.ticket;
        let engine = Rc::downgrade(self);

        let task = tokio::task::spawn_local(async move {
            let result = fetch.await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            engine.tasks.borrow_mut().fetches.remove(&ticket);
            if !engine.alive.get() {
                return;
            }
            let changed = engine.cache.borrow_mut().complete(&request, result);
            if changed {
                engine.publish();
            }
        });
        self.tasks
            .borrow_mut()
            .fetches
            .insert(ticket, task.abort_handle());
    }

    fn abort_fetches(&self) {
        let fetches: Vec<AbortHandle> = self.tasks.borrow_mut().fetches.drain().map(|(_, f)| f).collect();
        for fetch in fetches {
            fetch.abort();
        }
    }

    fn cancel_reconciliation(&self) {
        if let Some(timer) = self.tasks.borrow_mut().reconciliation.take() {
            timer.abort();
        }
    }

    fn set_filter_criteria(self: &Rc<Self>, criteria: FilterCriteria) -> bool {
        if !self.alive.get() {
            return false;
        }
        let Some(request) = self.cache.borrow_mut().set_filter_criteria(criteria) else {
            return false;
        };
        // Everything in flight was issued under the old criteria
        self.abort_fetches();
        self.cancel_reconciliation();
        self.spawn_fetch(request);
        self.publish();
        true
    }

    fn accept_live_deal(self: &Rc<Self>, deal: Deal) {
        if !self.alive.get() {
            return;
        }
        let inserted = {
            let mut cache = self.cache.borrow_mut();
            if !matches(&deal, cache.criteria()) {
                log::debug!("Live deal {} doesn't match the current filters", deal.id);
                return;
            }
            cache.prepend_local(deal)
        };
        if inserted {
            self.publish();
        }
        self.schedule_reconciliation();
    }

    fn apply_media_update(self: &Rc<Self>, update: MediaUpdate) {
        if !self.alive.get() {
            return;
        }
        let patched = self
            .cache
            .borrow_mut()
            .patch_by_id(update.id, &update.patch);
        if patched {
            self.publish();
        }
    }

    fn schedule_reconciliation(self: &Rc<Self>) {
        let engine = Rc::downgrade(self);
        let delay = self.reconciliation_delay;

        let timer = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if !engine.alive.get() {
                return;
            }
            engine.tasks.borrow_mut().reconciliation = None;
            log::debug!("Reconciling live deals with the first page");
            engine.revalidate();
        });

        let previous = self.tasks.borrow_mut().reconciliation.replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn revalidate(self: &Rc<Self>) {
        let request = self.cache.borrow_mut().revalidate_first_page();
        self.spawn_fetch(request);
        self.publish();
    }

    fn shut_down(&self) {
        self.alive.set(false);
        self.abort_fetches();
        self.cancel_reconciliation();
    }
}

fn handler<T: 'static>(
    engine: &Rc<Engine>,
    event_name: &'static str,
    parse: fn(&str) -> Result<T, EventError>,
    apply: fn(&Rc<Engine>, T),
) -> EventHandler {
    let engine: Weak<Engine> = Rc::downgrade(engine);
    Rc::new(move |event: &ServerEvent| {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        match parse(&event.data) {
            Ok(payload) => apply(&engine, payload),
            Err(e) => log::warn!("Discarding malformed {event_name} event: {e}"),
        }
    })
}

/// Must be started inside a `tokio::task::LocalSet`. Dropping the controller tears
/// it down.
pub struct SyncController {
    engine: Rc<Engine>,
    subscription: StreamSubscription,
    handlers: Vec<(&'static str, EventHandler)>,
    price_history: PriceHistoryCache,
}

impl SyncController {
    /// Against the backend at `config.backend_url`, unfiltered and without a
    /// seeded page.
    pub fn connect(config: &FeedConfig) -> Self {
        Self::start(
            config,
            Rc::new(HttpDealSource::new(config.clone())),
            Rc::new(SseTransport::from_config(config)),
            FilterCriteria::default(),
            None,
        )
    }

    /// Fetch the first page and open the event stream. `initial_page` is shown
    /// right away if `criteria` filter nothing; the first page is refetched
    /// either way.
    pub fn start(
        config: &FeedConfig,
        source: Rc<dyn DealSource>,
        transport: Rc<dyn EventTransport>,
        criteria: FilterCriteria,
        initial_page: Option<Page>,
    ) -> Self {
        let mut cache = PagedCache::new(criteria, config.page_limit);
        if let Some(page) = initial_page {
            cache = cache.with_initial_page(page);
        }
        let first = cache.load_first_page();
        let (snapshots, _) = watch::channel(FeedSnapshot::of(&cache));

        let engine = Rc::new(Engine {
            cache: RefCell::new(cache),
            source: Rc::clone(&source),
            tasks: RefCell::new(Tasks::default()),
            alive: Cell::new(true),
            reconciliation_delay: config.reconciliation_delay,
            snapshots,
        });
        engine.spawn_fetch(first);

        let subscription = StreamSubscription::connect(transport, config.backoff, config.auto_reconnect);
        let handlers = vec![
            (
                NEW_DEAL_EVENT,
                handler(&engine, NEW_DEAL_EVENT, parse_new_deal, Engine::accept_live_deal),
            ),
            (
                MEDIA_UPDATED_EVENT,
                handler(
                    &engine,
                    MEDIA_UPDATED_EVENT,
                    parse_media_update,
                    Engine::apply_media_update,
                ),
            ),
        ];
        for (event, handler) in &handlers {
            subscription.add_handler(event, Rc::clone(handler));
        }

        log::info!("Deal feed started");
        Self {
            engine,
            subscription,
            handlers,
            price_history: PriceHistoryCache::new(source, config.price_history_stale_after),
        }
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.engine.snapshots.borrow().clone()
    }

    /// Receives a new snapshot after every change.
    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.engine.snapshots.subscribe()
    }

    pub fn criteria(&self) -> FilterCriteria {
        self.engine.cache.borrow().criteria().clone()
    }

    /// Returns whether the criteria actually changed, which resets the feed to a
    /// freshly fetched first page.
    pub fn set_filter_criteria(&self, criteria: FilterCriteria) -> bool {
        self.engine.set_filter_criteria(criteria)
    }

    pub fn set_search(&self, search: impl Into<String>) -> bool {
        self.set_filter_criteria(self.criteria().with_search(search))
    }

    pub fn set_has_coupon(&self, has_coupon: Option<bool>) -> bool {
        self.set_filter_criteria(self.criteria().with_has_coupon(has_coupon))
    }

    pub fn set_stores<S: Into<String>>(&self, stores: impl IntoIterator<Item = S>) -> bool {
        self.set_filter_criteria(self.criteria().with_stores(stores))
    }

    /// Call when the user scrolls near the end of the list.
    pub fn request_next_page(&self) -> bool {
        if !self.engine.alive.get() {
            return false;
        }
        let Some(request) = self.engine.cache.borrow_mut().request_next_page() else {
            return false;
        };
        self.engine.spawn_fetch(request);
        self.engine.publish();
        true
    }

    /// Reissue the fetch that last failed.
    pub fn retry(&self) -> bool {
        if !self.engine.alive.get() {
            return false;
        }
        let Some(request) = self.engine.cache.borrow_mut().retry() else {
            return false;
        };
        log::info!("Retrying page {}", request.index);
        self.engine.spawn_fetch(request);
        self.engine.publish();
        true
    }

    /// Refetch the first page now.
    pub fn refresh(&self) {
        if self.engine.alive.get() {
            self.engine.revalidate();
        }
    }

    pub async fn price_history(&self, product_key: &str) -> Result<Rc<PriceHistoryLookup>, FetchError> {
        self.price_history.get(product_key).await
    }

    /// The stores the user can filter by. Empty if they can't be fetched.
    pub async fn available_stores(&self) -> Vec<String> {
        match self.engine.source.fetch_stores().await {
            Ok(stores) => stores,
            Err(e) => {
                log::warn!("Could not fetch the store list: {e}");
                Vec::new()
            }
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.subscription.state()
    }

    /// Redial the event stream without waiting out the backoff.
    pub fn reconnect(&self) {
        self.subscription.reconnect();
    }

    /// Stop everything: handlers are removed, the event stream is closed, and
    /// pending fetches and timers are cancelled. Later results are ignored.
    pub fn teardown(&mut self) {
        if !self.engine.alive.get() {
            return;
        }
        self.engine.shut_down();
        for (event, handler) in self.handlers.drain(..) {
            self.subscription.remove_handler(event, &handler);
        }
        self.subscription.close();
        self.price_history.clear();
        log::info!("Deal feed torn down");
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use deal_utils::DealId;

    fn deal(id: DealId, store: &str) -> Deal {
        Deal {
            id,
            timestamp: Utc::now(),
            text: String::new(),
            product: Some(format!("Produto {id}")),
            description: None,
            store: Some(store.to_string()),
            price: None,
            coupons: vec![],
            links: vec![],
            media_type: None,
            local_path: None,
            photo_id: None,
            product_key: None,
            chat: None,
            chat_id: None,
        }
    }

    #[test]
    fn test_snapshot_reflects_cache_flags() {
        let mut cache = PagedCache::new(FilterCriteria::default(), 2);
        let request = cache.load_first_page();
        let loading = FeedSnapshot::of(&cache);
        assert!(loading.is_initial_loading);
        assert!(loading.has_more);
        assert!(loading.items.is_empty());

        let page = Page {
            items: vec![deal(2, "Kabum"), deal(1, "Amazon")],
            next_cursor: None,
            has_more: false,
            available_stores: Some(vec!["Amazon".to_string(), "Kabum".to_string()]),
        };
        cache.complete(&request, Ok(page));
        let loaded = FeedSnapshot::of(&cache);
        assert!(!loaded.is_initial_loading);
        assert!(!loaded.has_more);
        assert_eq!(loaded.items.len(), 2);
        assert_eq!(loaded.available_stores, vec!["Amazon", "Kabum"]);
    }
}
