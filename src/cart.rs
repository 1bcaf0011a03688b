//! Cart state engine
//!
//! Holds the authoritative in-memory item set for one reservation scope,
//! enforces capacity and key invariants, re-verifies availability on every
//! admission, and converts the cart into a booking batch with defined
//! partial-failure semantics. Mutations never return errors for business
//! outcomes; those come back as data ([`AddOutcome`], [`BatchResult`]) or as
//! events.
//!
//! Locking discipline: the state mutex is never held across an await, so
//! every upsert is atomic with respect to interleaved async operations.
//! Concurrent adds race only on their availability checks; their upserts
//! apply serially in completion order and quantities accumulate correctly
//! regardless of that order.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{NaiveDate, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::client::{AvailabilityChecker, BookingGateway};
use crate::config::CartConfig;
use crate::error::{CartError, CartResult};
use crate::models::{
    BatchResult, BookingConflict, BookingRequest, CartItem, CartSnapshot, EquipmentRef, ItemDates,
    ProjectContext,
};
use crate::notify::RemoteUpdate;
use crate::persist::EnvelopeManager;
use crate::registry;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted toward the UI adapter. The adapter owns all rendering and
/// confirmation dialogs; the engine only reports what happened.
#[derive(Debug, Clone)]
pub enum CartEvent {
    ItemAdded {
        item: CartItem,
        /// The `auto_show_on_add` signal: ask the adapter to reveal the cart
        show_cart: bool,
    },
    ItemRemoved {
        key: String,
    },
    ItemUpdated {
        item: CartItem,
    },
    ItemDatesUpdated {
        item: CartItem,
    },
    Cleared,
    /// In-memory state was replaced by another live instance's broadcast
    Refreshed {
        item_count: usize,
    },
    Error {
        message: String,
    },
}

/// Outcome of an admission attempt. Capacity and availability rejections are
/// expected outcomes, not errors.
#[derive(Debug, Clone)]
pub enum AddOutcome {
    Added(CartItem),
    /// Rejected synchronously, before any availability call
    CapacityExceeded { max_items: usize },
    Unavailable {
        available_quantity: u32,
        conflicts: Vec<BookingConflict>,
    },
}

impl AddOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AddOutcome::Added(_))
    }
}

/// Candidate for admission into the cart.
#[derive(Debug, Clone)]
pub struct AddRequest {
    pub equipment: EquipmentRef,
    pub quantity: u32,
    pub dates: ItemDates,
}

struct CartState {
    project: ProjectContext,
    items: IndexMap<String, CartItem>,
    /// Transient, never persisted, cleared explicitly
    errors: Vec<String>,
}

/// The reservation cart for one scope.
pub struct CartEngine {
    /// Self-handle for the fire-and-forget persistence tasks
    weak_self: Weak<CartEngine>,
    config: CartConfig,
    state: Mutex<CartState>,
    persistence: Arc<EnvelopeManager>,
    availability: Arc<dyn AvailabilityChecker>,
    bookings: Arc<dyn BookingGateway>,
    events: broadcast::Sender<CartEvent>,
    remote_listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CartEngine {
    /// Create an engine bound to `project`, restoring that scope's persisted
    /// state when a valid envelope exists, and start listening for updates
    /// from other live instances when the persistence manager carries an
    /// update channel.
    pub async fn open(
        project: ProjectContext,
        config: CartConfig,
        persistence: Arc<EnvelopeManager>,
        availability: Arc<dyn AvailabilityChecker>,
        bookings: Arc<dyn BookingGateway>,
    ) -> CartResult<Arc<Self>> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let engine = Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            config,
            state: Mutex::new(CartState {
                project,
                items: IndexMap::new(),
                errors: Vec::new(),
            }),
            persistence,
            availability,
            bookings,
            events,
            remote_listener: Mutex::new(None),
        });

        // Storage faults surface as diagnostics; the cart keeps operating in
        // memory
        let weak = engine.weak_self.clone();
        engine.persistence.set_error_hook(Arc::new(move |err| {
            if let Some(engine) = weak.upgrade() {
                engine.push_error(err.to_string());
            }
        }));

        engine.restore_scope().await;
        engine.spawn_remote_listener();
        Ok(engine)
    }

    /// Bind to a different reservation scope: the current in-memory set is
    /// discarded in favor of the target scope's persisted or empty state.
    pub async fn load_scope(&self, project: ProjectContext) {
        let old_key = {
            let mut state = self.lock_state();
            let old_key = self.persistence.storage_key(&state.project.project_id);
            state.project = project;
            state.items.clear();
            state.errors.clear();
            old_key
        };
        registry::unregister(&old_key);
        self.restore_scope().await;
        self.emit(CartEvent::Refreshed {
            item_count: self.item_count(),
        });
    }

    async fn restore_scope(&self) {
        let project_id = {
            let state = self.lock_state();
            state.project.project_id.clone()
        };
        registry::register(&self.persistence.storage_key(&project_id), self.persistence.clone());

        if let Some(snapshot) = self.persistence.load_state::<CartSnapshot>(&project_id).await {
            if snapshot.project_id == project_id {
                tracing::debug!(
                    scope = %project_id,
                    items = snapshot.items.len(),
                    "Restored persisted cart"
                );
                self.lock_state().items = snapshot.items;
            }
        }
        // On-load sweep over the whole namespace
        self.persistence.cleanup().await;
    }

    /// Admit a candidate into the cart.
    ///
    /// Capacity is checked synchronously before any network work; the
    /// availability call is the single suspension point. Re-adding equipment
    /// already in the cart adds to its quantity instead of duplicating the
    /// slot. Transport failures of the checker are returned as `Err`;
    /// capacity and availability rejections are `Ok` outcomes.
    pub async fn add_item(&self, request: AddRequest) -> CartResult<AddOutcome> {
        if request.quantity == 0 {
            return Err(CartError::InvalidArgument(
                "quantity must be at least 1".to_string(),
            ));
        }
        let key = CartItem::key_for(request.equipment.id);

        let range = {
            let state = self.lock_state();
            if state.items.len() >= self.config.max_items {
                tracing::debug!(max_items = self.config.max_items, "Cart at capacity, rejecting add");
                return Ok(AddOutcome::CapacityExceeded {
                    max_items: self.config.max_items,
                });
            }
            request.dates.resolve(&state.project)
        };

        let report = self
            .availability
            .check_availability(request.equipment.id, range, request.quantity)
            .await?;
        if !report.available {
            tracing::debug!(
                equipment = request.equipment.id,
                available = report.available_quantity,
                requested = request.quantity,
                "Admission refused, equipment unavailable"
            );
            return Ok(AddOutcome::Unavailable {
                available_quantity: report.available_quantity,
                conflicts: report.conflicts,
            });
        }

        let item = {
            let mut state = self.lock_state();
            match state.items.get_mut(&key) {
                Some(existing) => {
                    existing.quantity += request.quantity;
                    existing.clone()
                }
                None => {
                    let item = CartItem {
                        key: key.clone(),
                        daily_cost: request.equipment.daily_cost,
                        equipment: request.equipment,
                        quantity: request.quantity,
                        dates: request.dates,
                        added_at: Utc::now(),
                    };
                    state.items.insert(key, item.clone());
                    item
                }
            }
        };

        self.persist_now().await;
        self.emit(CartEvent::ItemAdded {
            item: item.clone(),
            show_cart: self.config.auto_show_on_add,
        });
        Ok(AddOutcome::Added(item))
    }

    /// Remove a cart slot. Absent keys are a no-op, not an error.
    pub fn remove_item(&self, key: &str) {
        let removed = self.lock_state().items.shift_remove(key).is_some();
        if !removed {
            return;
        }
        self.schedule_persist();
        self.emit(CartEvent::ItemRemoved {
            key: key.to_string(),
        });
    }

    /// Replace a slot's quantity. Zero is equivalent to removal. Availability
    /// is re-validated at submission time, not on quantity edits, which keeps
    /// this operation synchronous.
    pub fn update_quantity(&self, key: &str, quantity: u32) {
        if quantity == 0 {
            self.remove_item(key);
            return;
        }
        let item = {
            let mut state = self.lock_state();
            let Some(item) = state.items.get_mut(key) else {
                return;
            };
            item.quantity = quantity;
            item.clone()
        };
        self.schedule_persist();
        self.emit(CartEvent::ItemUpdated { item });
    }

    /// Override a slot's rental dates, or reset it to the project defaults
    /// when both bounds are `None`. Quantity is unaffected.
    pub fn update_item_dates(
        &self,
        key: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) {
        let dates = match (start, end) {
            (None, None) => ItemDates::ProjectDefault,
            (Some(start), Some(end)) if start <= end => ItemDates::Override { start, end },
            _ => {
                self.push_error(format!("Invalid date override for '{}'", key));
                return;
            }
        };
        let item = {
            let mut state = self.lock_state();
            let Some(item) = state.items.get_mut(key) else {
                return;
            };
            item.dates = dates;
            item.clone()
        };
        self.schedule_persist();
        self.emit(CartEvent::ItemDatesUpdated { item });
    }

    /// Empty the cart in a single state transition.
    pub fn clear_cart(&self) {
        self.lock_state().items.clear();
        self.schedule_persist();
        self.emit(CartEvent::Cleared);
    }

    /// Convert the cart into one booking batch.
    ///
    /// The collaborator may report partial success. Any success
    /// (`created_count > 0`) clears the cart, since booked items must not
    /// remain selectable for re-submission; total failure leaves the cart
    /// untouched for retry. The caller receives the full result, failures
    /// included, for per-item diagnostics.
    pub async fn submit(&self) -> CartResult<BatchResult> {
        let (requests, project_id) = {
            let state = self.lock_state();
            let project = state.project.clone();
            let requests: Vec<BookingRequest> = state
                .items
                .values()
                .map(|item| {
                    let range = item.resolved_range(&project);
                    BookingRequest {
                        equipment_id: item.equipment.id,
                        quantity: item.quantity,
                        start_date: range.start,
                        end_date: range.end,
                        computed_cost: item.line_cost(&project),
                        project_id: project.project_id.clone(),
                    }
                })
                .collect();
            (requests, project.project_id)
        };
        if requests.is_empty() {
            return Ok(BatchResult::empty());
        }

        tracing::info!(scope = %project_id, count = requests.len(), "Submitting cart as booking batch");
        let result = self.bookings.submit_batch(requests).await?;

        if result.created_count > 0 {
            self.lock_state().items.clear();
            self.persist_now().await;
            self.emit(CartEvent::Cleared);
        }
        if result.failed_count > 0 {
            tracing::warn!(
                scope = %project_id,
                created = result.created_count,
                failed = result.failed_count,
                "Batch submission reported failures"
            );
        }
        Ok(result)
    }

    /// Await the durable write of the current state instead of leaving it to
    /// the scheduled fire-and-forget task.
    pub async fn flush(&self) {
        self.persist_now().await;
    }

    // Derived read-only values, recomputed on demand.

    /// Number of distinct cart slots (not total units).
    pub fn item_count(&self) -> usize {
        self.lock_state().items.len()
    }

    /// Sum of quantities across all slots.
    pub fn total_quantity(&self) -> u64 {
        self.lock_state()
            .items
            .values()
            .map(|item| u64::from(item.quantity))
            .sum()
    }

    /// Projected cost: quantity x daily cost x resolved rental days, summed.
    pub fn total_cost(&self) -> Decimal {
        let state = self.lock_state();
        state
            .items
            .values()
            .map(|item| item.line_cost(&state.project))
            .sum()
    }

    pub fn is_over_capacity(&self) -> bool {
        self.item_count() > self.config.max_items
    }

    /// All items in insertion order.
    pub fn items(&self) -> Vec<CartItem> {
        self.lock_state().items.values().cloned().collect()
    }

    pub fn project(&self) -> ProjectContext {
        self.lock_state().project.clone()
    }

    pub fn config(&self) -> &CartConfig {
        &self.config
    }

    /// Transient user-facing errors accumulated since the last clear.
    pub fn errors(&self) -> Vec<String> {
        self.lock_state().errors.clone()
    }

    pub fn clear_errors(&self) {
        self.lock_state().errors.clear();
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<CartEvent> {
        self.events.subscribe()
    }

    /// Discard this instance: stop the remote listener, close the update
    /// channel and unregister from the process-wide registry.
    pub fn teardown(&self) {
        if let Ok(mut slot) = self.remote_listener.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        let key = {
            let state = self.lock_state();
            self.persistence.storage_key(&state.project.project_id)
        };
        registry::unregister(&key);
        self.persistence.teardown();
    }

    fn lock_state(&self) -> MutexGuard<'_, CartState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: CartEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn push_error(&self, message: String) {
        tracing::warn!(error = %message, "Cart error");
        self.lock_state().errors.push(message.clone());
        self.emit(CartEvent::Error { message });
    }

    /// The filtered, persistable view of the current state.
    fn snapshot(&self) -> CartSnapshot {
        let state = self.lock_state();
        CartSnapshot {
            project_id: state.project.project_id.clone(),
            items: state.items.clone(),
        }
    }

    async fn persist_now(&self) {
        let snapshot = self.snapshot();
        self.persistence.save_state(&snapshot.project_id, &snapshot).await;
    }

    fn schedule_persist(&self) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(engine) = weak.upgrade() {
                engine.persist_now().await;
            }
        });
    }

    fn spawn_remote_listener(&self) {
        let Some(channel) = self.persistence.channel().cloned() else {
            return;
        };
        let mut updates = channel.subscribe();
        let own_id = channel.sender_id();
        let expected_version = self.persistence.options().version;
        let weak = self.weak_self.clone();

        let task = tokio::spawn(async move {
            loop {
                let update = match updates.recv().await {
                    Ok(update) => update,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Remote update listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(engine) = weak.upgrade() else { break };
                engine.apply_remote(update, own_id, expected_version);
            }
        });
        if let Ok(mut slot) = self.remote_listener.lock() {
            *slot = Some(task);
        }
    }

    /// Another live instance broadcast a state change. Validated like a
    /// storage load, then applied as a replacement: the cart is scoped per
    /// project and one operator at a time is the expected usage, so the last
    /// broadcast wins.
    fn apply_remote(&self, update: RemoteUpdate, own_id: u64, expected_version: u32) {
        if update.sender_id != 0 && update.sender_id == own_id {
            return;
        }
        if update.version != expected_version {
            return;
        }
        if update
            .ttl
            .is_some_and(|deadline| Utc::now().timestamp_millis() > deadline)
        {
            return;
        }
        let snapshot: CartSnapshot = match serde_json::from_value(update.state) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring undecodable remote update");
                return;
            }
        };
        {
            let mut state = self.lock_state();
            if state.project.project_id != update.scope_id {
                return;
            }
            state.items = snapshot.items;
        }
        self.emit(CartEvent::Refreshed {
            item_count: self.item_count(),
        });
    }
}

impl Drop for CartEngine {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.remote_listener.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}
