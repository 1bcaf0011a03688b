//! End-to-end cart flows over real storage backends and update channels

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::time::timeout;

use cartwheel::cart::{AddRequest, CartEngine, CartEvent};
use cartwheel::client::{AvailabilityChecker, BookingGateway};
use cartwheel::config::CartConfig;
use cartwheel::error::CartResult;
use cartwheel::models::{
    AvailabilityReport, BatchResult, BookingRecord, BookingRequest, EquipmentRef, ItemDates,
    ProjectContext, ResolvedRange,
};
use cartwheel::notify::{BroadcastChannel, StorageEventChannel, UpdateChannel};
use cartwheel::persist::{EnvelopeManager, PersistOptions};
use cartwheel::storage::{FileStore, MemoryStore, StorageBackend};

/// Availability stub: everything is free.
struct OpenCalendar;

#[async_trait]
impl AvailabilityChecker for OpenCalendar {
    async fn check_availability(
        &self,
        _equipment_id: i64,
        _range: ResolvedRange,
        quantity: u32,
    ) -> CartResult<AvailabilityReport> {
        Ok(AvailabilityReport {
            available: true,
            available_quantity: quantity,
            conflicts: vec![],
        })
    }
}

/// Booking stub: confirms every request, counting calls.
struct ConfirmAll {
    calls: AtomicUsize,
}

impl ConfirmAll {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BookingGateway for ConfirmAll {
    async fn submit_batch(&self, requests: Vec<BookingRequest>) -> CartResult<BatchResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bookings = requests
            .iter()
            .enumerate()
            .map(|(i, r)| BookingRecord {
                id: i as i64 + 1,
                equipment_id: r.equipment_id,
                quantity: r.quantity,
                start_date: r.start_date,
                end_date: r.end_date,
            })
            .collect::<Vec<_>>();
        Ok(BatchResult {
            success: true,
            created_count: bookings.len() as u32,
            failed_count: 0,
            bookings,
            failures: vec![],
        })
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn project() -> ProjectContext {
    ProjectContext {
        project_id: "summer-fair".to_string(),
        start_date: date(2026, 9, 1),
        end_date: date(2026, 9, 5),
    }
}

fn add_request(id: i64, quantity: u32) -> AddRequest {
    AddRequest {
        equipment: EquipmentRef {
            id,
            name: format!("Equipment {}", id),
            category: Some("stage".to_string()),
            daily_cost: Decimal::new(1250, 2),
            serial_number: Some(format!("SN-{:04}", id)),
        },
        quantity,
        dates: ItemDates::ProjectDefault,
    }
}

async fn open_engine(
    store: Arc<dyn StorageBackend>,
    opts: PersistOptions,
    channel: Option<Arc<dyn UpdateChannel>>,
) -> Arc<CartEngine> {
    let mut manager = EnvelopeManager::new(store, opts).expect("manager");
    if let Some(channel) = channel {
        manager = manager.with_channel(channel);
    }
    CartEngine::open(
        project(),
        CartConfig::default(),
        Arc::new(manager),
        Arc::new(OpenCalendar),
        ConfirmAll::new(),
    )
    .await
    .expect("engine")
}

/// Wait until a `Refreshed` event reporting `expected` items arrives.
async fn wait_for_refresh(events: &mut broadcast::Receiver<CartEvent>, expected: usize) {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(CartEvent::Refreshed { item_count }) if item_count == expected => break,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no refresh observed within timeout");
}

#[tokio::test]
async fn two_instances_stay_in_sync_over_a_broadcast_channel() {
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryStore::new());
    let opts = PersistOptions {
        namespace: "flow-broadcast".to_string(),
        ..Default::default()
    };

    let first = open_engine(
        store.clone(),
        opts.clone(),
        Some(Arc::new(BroadcastChannel::open("flow-broadcast"))),
    )
    .await;
    let second = open_engine(
        store,
        opts,
        Some(Arc::new(BroadcastChannel::open("flow-broadcast"))),
    )
    .await;
    let mut second_events = second.subscribe();

    first.add_item(add_request(1, 2)).await.expect("add");
    wait_for_refresh(&mut second_events, 1).await;
    assert_eq!(second.item_count(), 1);
    assert_eq!(second.total_quantity(), 2);

    // Clearing on one side empties the other
    first.clear_cart();
    first.flush().await;
    wait_for_refresh(&mut second_events, 0).await;
    assert_eq!(second.item_count(), 0);

    first.teardown();
    second.teardown();
}

#[tokio::test]
async fn storage_change_events_are_a_sync_fallback() {
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryStore::new());
    let opts = PersistOptions {
        namespace: "flow-fallback".to_string(),
        ..Default::default()
    };

    // The writer carries no channel at all; the reader decodes the storage
    // medium's own change events
    let writer = open_engine(store.clone(), opts.clone(), None).await;
    let fallback = Arc::new(StorageEventChannel::listen(&store, &opts));
    let reader = open_engine(store, opts, Some(fallback)).await;
    let mut reader_events = reader.subscribe();

    writer.add_item(add_request(4, 3)).await.expect("add");
    wait_for_refresh(&mut reader_events, 1).await;
    assert_eq!(reader.total_quantity(), 3);

    writer.teardown();
    reader.teardown();
}

#[tokio::test]
async fn cart_survives_restart_and_empties_after_submission() {
    let dir = tempfile::tempdir().expect("tempdir");
    let opts = PersistOptions {
        namespace: "flow-file".to_string(),
        ..Default::default()
    };

    {
        let store: Arc<dyn StorageBackend> = Arc::new(FileStore::new(dir.path()));
        let engine = open_engine(store, opts.clone(), None).await;
        engine.add_item(add_request(1, 2)).await.expect("add");
        engine.add_item(add_request(2, 1)).await.expect("add");
        engine.update_item_dates(
            &cartwheel::models::CartItem::key_for(2),
            Some(date(2026, 9, 2)),
            Some(date(2026, 9, 3)),
        );
        engine.flush().await;
        engine.teardown();
    }

    // A new process over the same directory sees the cart
    let store: Arc<dyn StorageBackend> = Arc::new(FileStore::new(dir.path()));
    let engine = open_engine(store, opts.clone(), None).await;
    assert_eq!(engine.item_count(), 2);
    // 2 x 12.50 x 5 days + 1 x 12.50 x 2 override days
    assert_eq!(engine.total_cost(), Decimal::new(15000, 2));

    let result = engine.submit().await.expect("submit");
    assert_eq!(result.created_count, 2);
    assert!(result.success);
    assert_eq!(engine.item_count(), 0);
    engine.teardown();

    // The durable copy is empty too
    let store: Arc<dyn StorageBackend> = Arc::new(FileStore::new(dir.path()));
    let engine = open_engine(store, opts, None).await;
    assert_eq!(engine.item_count(), 0);
    engine.teardown();
}

#[tokio::test]
async fn expired_envelopes_do_not_restore() {
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryStore::new());
    let opts = PersistOptions {
        namespace: "flow-expiry".to_string(),
        ttl: Some(chrono::Duration::milliseconds(50)),
        ..Default::default()
    };

    {
        let engine = open_engine(store.clone(), opts.clone(), None).await;
        engine.add_item(add_request(1, 1)).await.expect("add");
        engine.flush().await;
        engine.teardown();
    }

    tokio::time::sleep(Duration::from_millis(120)).await;

    let manager = EnvelopeManager::new(store.clone(), opts.clone()).expect("manager");
    assert!(!manager.has_valid_data("summer-fair").await);

    let engine = open_engine(store, opts, None).await;
    assert_eq!(engine.item_count(), 0);
    engine.teardown();
}
