//! Cursor-paginated deal pages plus the live inserts layered on top of them.
//!
//! `PagedCache` does no I/O. Operations that need the backend hand back a
//! [`PageRequest`]; whoever performs the fetch reports the outcome through
//! [`PagedCache::complete`]. Every request is tagged with the filter generation
//! it was issued under, and results for an older generation, or for a request
//! that has since been superseded, are dropped.

use std::collections::{BTreeMap, HashSet};

use deal_utils::{Deal, DealId, FilterCriteria, MediaPatch, Page};
use im::Vector;

use crate::backend::PageQuery;
use crate::error::FetchError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FetchTicket(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchKind {
    /// Page 0 while nothing is shown yet.
    Initial,
    /// The page after the last one shown.
    LoadMore,
    /// Page 0 under criteria that just changed, while the old page 0 is shown.
    FilterChange,
    /// Page 0 again, to reconcile live inserts with the backend.
    Revalidate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub ticket: FetchTicket,
    pub index: usize,
    pub kind: FetchKind,
    pub query: PageQuery,
    generation: u64,
    issued_at: u64,
}

#[derive(Clone, Debug)]
struct CachedPage {
    items: Vector<Deal>,
    next_cursor: Option<String>,
    has_more: bool,
    available_stores: Option<Vec<String>>,
    generation: u64,
}

#[derive(Clone, Debug)]
struct OptimisticInsert {
    deal: Deal,
    seq: u64,
}

pub struct PagedCache {
    criteria: FilterCriteria,
    limit: usize,
    generation: u64,
    pages: Vec<CachedPage>,
    /// How many pages have been asked for, materialized or not.
    size: usize,
    in_flight: BTreeMap<usize, PageRequest>,
    next_ticket: u64,
    // bumped by every live insert; fetches remember the value they were issued at
    seq: u64,
    /// Live inserts the backend hasn't confirmed yet, newest first.
    optimistic: Vec<OptimisticInsert>,
    error: Option<FetchError>,
    failed: Option<(usize, FetchKind)>,
}

impl PagedCache {
    pub fn new(criteria: FilterCriteria, limit: usize) -> Self {
        Self {
            criteria,
            limit,
            generation: 0,
            pages: Vec::new(),
            size: 0,
            in_flight: BTreeMap::new(),
            next_ticket: 0,
            seq: 0,
            optimistic: Vec::new(),
            error: None,
            failed: None,
        }
    }

    /// Seed page 0 with a server-rendered page. Ignored under any filter, since the
    /// page was rendered without one.
    pub fn with_initial_page(mut self, page: Page) -> Self {
        if !self.criteria.is_unfiltered() {
            log::debug!("Not seeding the deal cache: initial page was rendered without filters");
            return self;
        }
        self.pages = vec![self.cached(page)];
        self.size = 1;
        self
    }

    /// Fetch page 0: the first load, or a refresh of the seeded page.
    pub fn load_first_page(&mut self) -> PageRequest {
        let kind = if self.pages.is_empty() {
            FetchKind::Initial
        } else {
            FetchKind::Revalidate
        };
        self.size = self.size.max(1);
        self.issue(0, kind)
    }

    /// Switch to `criteria`. Criteria equal by content to the current ones change
    /// nothing; anything else drops every page after the first and refetches page 0.
    pub fn set_filter_criteria(&mut self, criteria: FilterCriteria) -> Option<PageRequest> {
        if criteria == self.criteria {
            return None;
        }
        log::debug!("Filter criteria changed to {criteria:?}, resetting to the first page");

        self.criteria = criteria;
        self.generation += 1;
        self.pages.truncate(1);
        self.size = 1;
        self.in_flight.clear();
        self.optimistic.clear();
        self.error = None;
        self.failed = None;

        let kind = if self.pages.is_empty() {
            FetchKind::Initial
        } else {
            FetchKind::FilterChange
        };
        Some(self.issue(0, kind))
    }

    /// Ask for the page after the last one shown, unless the listing is exhausted,
    /// that page is already being fetched, or the last page belongs to old criteria.
    pub fn request_next_page(&mut self) -> Option<PageRequest> {
        let last = self.pages.last()?;
        if !last.has_more || last.generation != self.generation {
            return None;
        }
        let index = self.pages.len();
        if self.in_flight.contains_key(&index) {
            return None;
        }
        if last.next_cursor.is_none() {
            log::warn!("Page {} says there is more but has no cursor", index - 1);
            return None;
        }

        self.size = self.size.max(index + 1);
        Some(self.issue(index, FetchKind::LoadMore))
    }

    /// Refetch page 0 so live inserts can be checked against the backend. Replaces
    /// a page-0 fetch already in flight.
    pub fn revalidate_first_page(&mut self) -> PageRequest {
        let kind = match self.in_flight.get(&0) {
            Some(pending) if pending.kind != FetchKind::Revalidate => pending.kind,
            _ if self.pages.is_empty() => FetchKind::Initial,
            _ => FetchKind::Revalidate,
        };
        self.size = self.size.max(1);
        self.issue(0, kind)
    }

    /// Reissue the most recent failed fetch.
    pub fn retry(&mut self) -> Option<PageRequest> {
        let (index, kind) = self.failed?;
        if self.in_flight.contains_key(&index) || index > self.pages.len() {
            return None;
        }
        if index > 0 && self.pages[index - 1].next_cursor.is_none() {
            return None;
        }
        Some(self.issue(index, kind))
    }

    /// Apply the outcome of `request`. Returns whether anything changed; stale and
    /// superseded results change nothing.
    pub fn complete(&mut self, request: &PageRequest, result: Result<Page, FetchError>) -> bool {
        if request.generation != self.generation {
            log::debug!(
                "Dropping page {} fetched under earlier filter criteria",
                request.index
            );
            return false;
        }
        match self.in_flight.get(&request.index) {
            Some(current) if current.ticket == request.ticket => {}
            _ => {
                log::debug!("Dropping superseded fetch of page {}", request.index);
                return false;
            }
        }
        self.in_flight.remove(&request.index);

        match result {
            Err(e) => {
                log::warn!("Fetching page {} failed: {e}", request.index);
                self.error = Some(e);
                self.failed = Some((request.index, request.kind));
            }
            Ok(page) => {
                self.error = None;
                self.failed = None;
                if request.index == 0 {
                    self.apply_first_page(page, request.issued_at);
                } else {
                    self.apply_later_page(request.index, page);
                }
            }
        }
        true
    }

    /// Put a live deal at the head of page 0. Does nothing if a deal with the same
    /// id is already known. Before any page exists the deal is held back and shown
    /// once page 0 arrives.
    pub fn prepend_local(&mut self, deal: Deal) -> bool {
        if self.contains(deal.id) {
            log::debug!("Deal {} is already shown, skipping live insert", deal.id);
            return false;
        }

        self.seq += 1;
        self.optimistic.insert(
            0,
            OptimisticInsert {
                deal: deal.clone(),
                seq: self.seq,
            },
        );
        if let Some(first) = self.pages.first_mut() {
            first.items.push_front(deal);
        }
        true
    }

    /// Merge `patch` into the deal with `id`, wherever it is. A deal that isn't
    /// loaded is not an error; returns whether one was found.
    pub fn patch_by_id(&mut self, id: DealId, patch: &MediaPatch) -> bool {
        let mut found = false;
        for page in &mut self.pages {
            for deal in page.items.iter_mut().filter(|deal| deal.id == id) {
                deal.apply_media_patch(patch);
                found = true;
            }
        }
        for insert in self.optimistic.iter_mut().filter(|i| i.deal.id == id) {
            insert.deal.apply_media_patch(patch);
            found = true;
        }
        if !found {
            log::debug!("No loaded deal {id} to patch");
        }
        found
    }

    pub fn contains(&self, id: DealId) -> bool {
        self.pages
            .iter()
            .any(|page| page.items.iter().any(|deal| deal.id == id))
            || self.optimistic.iter().any(|insert| insert.deal.id == id)
    }

    /// Every shown deal, page by page.
    pub fn items(&self) -> Vector<Deal> {
        self.pages.iter().fold(Vector::new(), |mut items, page| {
            items.append(page.items.clone());
            items
        })
    }

    /// Taken from the last page; true until the first page says otherwise.
    pub fn has_more(&self) -> bool {
        self.pages.last().is_none_or(|page| page.has_more)
    }

    pub fn is_initial_loading(&self) -> bool {
        self.pages.is_empty() && !self.in_flight.is_empty()
    }

    pub fn is_loading_more(&self) -> bool {
        !self.pages.is_empty()
            && self.size > self.pages.len()
            && self.in_flight.contains_key(&self.pages.len())
    }

    pub fn is_filtering_in_progress(&self) -> bool {
        self.in_flight
            .get(&0)
            .is_some_and(|request| request.kind == FetchKind::FilterChange)
    }

    pub fn is_revalidating(&self) -> bool {
        !self.pages.is_empty()
            && self
                .in_flight
                .get(&0)
                .is_some_and(|request| request.kind == FetchKind::Revalidate)
    }

    pub fn error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn requested_pages(&self) -> usize {
        self.size
    }

    pub fn pending_inserts(&self) -> usize {
        self.optimistic.len()
    }

    pub fn available_stores(&self) -> Option<&[String]> {
        self.pages.first()?.available_stores.as_deref()
    }

    fn issue(&mut self, index: usize, kind: FetchKind) -> PageRequest {
        let cursor = index
            .checked_sub(1)
            .and_then(|previous| self.pages.get(previous))
            .and_then(|page| page.next_cursor.clone());
        let ticket = FetchTicket(self.next_ticket);
        self.next_ticket += 1;

        let request = PageRequest {
            ticket,
            index,
            kind,
            query: PageQuery {
                limit: self.limit,
                cursor,
                criteria: self.criteria.clone(),
            },
            generation: self.generation,
            issued_at: self.seq,
        };
        if let Some(previous) = self.in_flight.insert(index, request.clone()) {
            log::debug!("Page {index} fetch {:?} superseded", previous.ticket);
        }
        request
    }

    fn cached(&self, page: Page) -> CachedPage {
        CachedPage {
            items: page.items.into_iter().collect(),
            next_cursor: page.next_cursor,
            has_more: page.has_more,
            available_stores: page.available_stores,
            generation: self.generation,
        }
    }

    /// Page 0 from the backend is authoritative. Live inserts it contains are
    /// confirmed. Ones it lacks are kept if they arrived after the fetch was issued,
    /// and evicted otherwise: the backend had its chance to include them.
    ///
    /// With later pages loaded, the old first page's records that the response
    /// pushed out are kept after the fresh items. Page 1 continues from the old
    /// cursor and would never return them.
    fn apply_first_page(&mut self, page: Page, issued_at: u64) {
        let returned: HashSet<DealId> = page.items.iter().map(|deal| deal.id).collect();
        let live: HashSet<DealId> = self.optimistic.iter().map(|insert| insert.deal.id).collect();

        let mut kept = Vector::new();
        self.optimistic.retain(|insert| {
            if returned.contains(&insert.deal.id) {
                false
            } else if insert.seq > issued_at {
                kept.push_back(insert.deal.clone());
                true
            } else {
                log::debug!(
                    "Evicting live deal {}: missing from the refreshed first page",
                    insert.deal.id
                );
                false
            }
        });

        let mut fresh = self.cached(page);
        kept.append(fresh.items);
        fresh.items = kept;

        if self.pages.len() > 1 {
            let fresh_ids: HashSet<DealId> = fresh.items.iter().map(|deal| deal.id).collect();
            let pushed_out: Vector<Deal> = self.pages[0]
                .items
                .iter()
                .filter(|deal| !fresh_ids.contains(&deal.id) && !live.contains(&deal.id))
                .cloned()
                .collect();
            fresh.items.append(pushed_out);
        }

        let shown: HashSet<DealId> = fresh.items.iter().map(|deal| deal.id).collect();
        for later in self.pages.iter_mut().skip(1) {
            later.items.retain(|deal| !shown.contains(&deal.id));
        }

        match self.pages.len() {
            0 => self.pages.push(fresh),
            1 => self.pages[0] = fresh,
            // Later pages were fetched with the old cursor chain; keep it
            _ => {
                let first = &mut self.pages[0];
                first.items = fresh.items;
                if fresh.available_stores.is_some() {
                    first.available_stores = fresh.available_stores;
                }
            }
        }
    }

    fn apply_later_page(&mut self, index: usize, page: Page) {
        if index > self.pages.len() {
            log::warn!("Dropping page {index}: page {} was never loaded", index - 1);
            return;
        }

        let mut fresh = self.cached(page);
        let earlier: HashSet<DealId> = self.pages[..index]
            .iter()
            .flat_map(|page| page.items.iter().map(|deal| deal.id))
            .collect();
        fresh.items.retain(|deal| !earlier.contains(&deal.id));

        if index == self.pages.len() {
            self.pages.push(fresh);
        } else {
            self.pages[index] = fresh;
        }
    }
}
