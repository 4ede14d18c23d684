#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use deal_feed::{DealSource, EventStream, EventTransport, PageQuery, ServerEvent, TransportError};
use deal_feed::error::FetchError;
use deal_utils::price::PriceHistoryLookup;
use deal_utils::{Coupon, Deal, DealId, Page};
use futures::channel::mpsc;
use futures::future::{FutureExt, LocalBoxFuture};
use futures::StreamExt;
use tokio::sync::oneshot;

/// Let spawned local tasks run without moving the paused clock.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Move the paused clock forward, then let whatever woke up run.
pub async fn advance(by: Duration) {
    tokio::time::advance(by).await;
    settle().await;
}

pub fn deal(id: DealId, store: &str) -> Deal {
    Deal {
        id,
        timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        text: format!("Oferta {id}"),
        product: Some(format!("Produto {id}")),
        description: None,
        store: Some(store.to_string()),
        price: Some(10_000 + id),
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

pub fn with_coupon(mut deal: Deal) -> Deal {
    deal.coupons.push(Coupon {
        code: "PROMO10".to_string(),
        discount: Some("10%".to_string()),
        description: None,
        expires_at: None,
        url: None,
    });
    deal
}

pub fn page(ids: &[DealId], next_cursor: Option<&str>) -> Page {
    Page {
        items: ids.iter().map(|id| deal(*id, "Kabum")).collect(),
        next_cursor: next_cursor.map(str::to_string),
        has_more: next_cursor.is_some(),
        available_stores: None,
    }
}

pub fn ids(items: &im::Vector<Deal>) -> Vec<DealId> {
    items.iter().map(|deal| deal.id).collect()
}

pub fn new_deal_event(deal: &Deal) -> ServerEvent {
    ServerEvent::new("new-deal", serde_json::to_string(deal).unwrap())
}

pub fn media_event(id: DealId, local_path: &str) -> ServerEvent {
    ServerEvent::new(
        "image-updated",
        serde_json::json!({ "id": id, "localPath": local_path }).to_string(),
    )
}

/// Writes into one open connection. Dropping it ends the stream.
pub struct Connection {
    sender: mpsc::UnboundedSender<Result<ServerEvent, TransportError>>,
}

impl Connection {
    pub fn send(&self, event: ServerEvent) {
        let _ = self.sender.unbounded_send(Ok(event));
    }

    pub fn fail(&self) {
        let _ = self
            .sender
            .unbounded_send(Err(TransportError::Stream("connection reset".to_string())));
    }
}

enum Dial {
    Fail,
    Connect(mpsc::UnboundedReceiver<Result<ServerEvent, TransportError>>),
}

/// Transport that answers dials from a script. Once the script runs out, dials
/// never complete.
#[derive(Default)]
pub struct MockTransport {
    script: RefCell<VecDeque<Dial>>,
    opens: Cell<usize>,
}

impl MockTransport {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn fail_next(&self) {
        self.script.borrow_mut().push_back(Dial::Fail);
    }

    pub fn connect_next(&self) -> Connection {
        let (sender, receiver) = mpsc::unbounded();
        self.script.borrow_mut().push_back(Dial::Connect(receiver));
        Connection { sender }
    }

    pub fn opens(&self) -> usize {
        self.opens.get()
    }
}

impl EventTransport for MockTransport {
    fn open(&self) -> LocalBoxFuture<'static, Result<EventStream, TransportError>> {
        self.opens.set(self.opens.get() + 1);
        match self.script.borrow_mut().pop_front() {
            Some(Dial::Fail) => {
                futures::future::ready(Err(TransportError::Connect("refused".to_string()))).boxed_local()
            }
            Some(Dial::Connect(receiver)) => {
                futures::future::ready(Ok(receiver.boxed_local())).boxed_local()
            }
            None => futures::future::pending().boxed_local(),
        }
    }
}

/// A page fetch the test answers by hand.
pub struct PendingFetch {
    pub query: PageQuery,
    responder: oneshot::Sender<Result<Page, FetchError>>,
}

impl PendingFetch {
    /// Answering a fetch that was cancelled does nothing.
    pub fn respond(self, result: Result<Page, FetchError>) {
        let _ = self.responder.send(result);
    }
}

#[derive(Default)]
pub struct MockSource {
    fetches: RefCell<VecDeque<PendingFetch>>,
    fetch_count: Cell<usize>,
    price_calls: Rc<Cell<usize>>,
    price_answers: Rc<RefCell<VecDeque<Result<PriceHistoryLookup, FetchError>>>>,
    stores: RefCell<Option<Result<Vec<String>, FetchError>>>,
}

impl MockSource {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// The oldest page fetch nobody has answered yet.
    pub fn next_fetch(&self) -> PendingFetch {
        self.fetches
            .borrow_mut()
            .pop_front()
            .expect("no page fetch was issued")
    }

    pub fn outstanding(&self) -> usize {
        self.fetches.borrow().len()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.get()
    }

    pub fn answer_price_history(&self, answer: Result<PriceHistoryLookup, FetchError>) {
        self.price_answers.borrow_mut().push_back(answer);
    }

    pub fn price_calls(&self) -> usize {
        self.price_calls.get()
    }

    pub fn set_stores(&self, stores: Result<Vec<String>, FetchError>) {
        *self.stores.borrow_mut() = Some(stores);
    }
}

impl DealSource for MockSource {
    fn fetch_page(&self, query: &PageQuery) -> LocalBoxFuture<'static, Result<Page, FetchError>> {
        self.fetch_count.set(self.fetch_count.get() + 1);
        let (responder, answer) = oneshot::channel();
        self.fetches.borrow_mut().push_back(PendingFetch {
            query: query.clone(),
            responder,
        });
        async move {
            answer
                .await
                .unwrap_or_else(|_| Err(FetchError::Request("fetch abandoned".to_string())))
        }
        .boxed_local()
    }

    fn fetch_price_history(
        &self,
        _product_key: &str,
    ) -> LocalBoxFuture<'static, Result<PriceHistoryLookup, FetchError>> {
        let calls = Rc::clone(&self.price_calls);
        let answers = Rc::clone(&self.price_answers);
        // Counted when polled: lookups that get coalesced are dropped unpolled
        async move {
            calls.set(calls.get() + 1);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let answer = answers.borrow_mut().pop_front();
            answer.unwrap_or(Ok(PriceHistoryLookup::NotFound))
        }
        .boxed_local()
    }

    fn fetch_stores(&self) -> LocalBoxFuture<'static, Result<Vec<String>, FetchError>> {
        let stores = self.stores.borrow().clone().unwrap_or_else(|| Ok(Vec::new()));
        futures::future::ready(stores).boxed_local()
    }
}
