//! InMemoryStore - 開発用・テスト用の集計ストア
//!
//! Holds the source orders and inventory snapshots together with the seven
//! analytics tables. Every roll-up is an upsert keyed by the window's storage key
//! (plus a secondary dimension where the table has one), so executing the same
//! window twice over unchanged source data leaves identical rows behind.
//!
//! Money is kept in minor currency units.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::job::{
    DAILY_DESSERT_REVENUE, DAILY_EOD_STOCK, DAILY_ITEM_SALES, DAILY_REVENUE, MONTHLY_DESSERT_REVENUE,
    MONTHLY_REVENUE, WEEKLY_REVENUE,
};
use crate::domain::{ResolvedWindow, RollupError, StorageKey, YearMonth};
use crate::ports::{Aggregation, BackfillSource};

// ---- source data ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Order {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub status: OrderStatus,
    #[serde(default)]
    pub deleted: bool,
    pub total: u64,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

impl Order {
    /// Only completed, non-deleted orders count towards any roll-up.
    fn is_countable(&self) -> bool {
        self.status == OrderStatus::Completed && !self.deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderItem {
    pub dessert_id: u64,
    /// Set when the line was sold as part of a combo.
    #[serde(default)]
    pub combo_id: Option<u64>,
    pub quantity: u64,
    pub unit_price: u64,
    /// Extra desserts attached to the line, priced at the line's unit price.
    #[serde(default)]
    pub modifiers: Vec<ItemModifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemModifier {
    pub dessert_id: u64,
    pub quantity: u64,
}

/// End-of-day stock for one dessert on one business date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventorySnapshot {
    pub day: NaiveDate,
    pub dessert_id: u64,
    pub quantity: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceData {
    pub orders: Vec<Order>,
    pub inventory: Vec<InventorySnapshot>,
}

impl SourceData {
    pub fn from_json_str(s: &str) -> Result<Self, RollupError> {
        serde_json::from_str(s).map_err(|e| RollupError::Config(format!("source data: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self, RollupError> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| RollupError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&s)
    }

    fn countable_orders<'a>(&'a self, window: &'a ResolvedWindow) -> impl Iterator<Item = &'a Order> + 'a {
        self.orders
            .iter()
            .filter(move |o| o.is_countable() && window.contains(o.created_at))
    }
}

// ---- analytics tables ----

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RevenueRow {
    pub gross_revenue: u64,
    pub order_count: u64,
}

impl RevenueRow {
    fn add(&mut self, other: &RevenueRow) -> Result<(), RollupError> {
        add_to(&mut self.gross_revenue, other.gross_revenue, "gross revenue")?;
        add_to(&mut self.order_count, other.order_count, "order count")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DessertRevenueRow {
    pub gross_revenue: u64,
    pub quantity_sold: u64,
    pub order_count: u64,
}

impl DessertRevenueRow {
    fn add(&mut self, other: &DessertRevenueRow) -> Result<(), RollupError> {
        add_to(&mut self.gross_revenue, other.gross_revenue, "gross revenue")?;
        add_to(&mut self.quantity_sold, other.quantity_sold, "quantity sold")?;
        add_to(&mut self.order_count, other.order_count, "order count")
    }

    /// One priced line: `unit_price * quantity` of one dessert.
    fn add_line(&mut self, unit_price: u64, quantity: u64) -> Result<(), RollupError> {
        let revenue = unit_price
            .checked_mul(quantity)
            .ok_or_else(|| overflow("line revenue"))?;
        add_to(&mut self.gross_revenue, revenue, "gross revenue")?;
        add_to(&mut self.quantity_sold, quantity, "quantity sold")
    }
}

/// Source values come from outside, so sums are checked. Overflow is a data
/// error and does not go away on retry.
fn add_to(acc: &mut u64, value: u64, what: &str) -> Result<(), RollupError> {
    *acc = acc.checked_add(value).ok_or_else(|| overflow(what))?;
    Ok(())
}

fn overflow(what: &str) -> RollupError {
    RollupError::InvalidSource(format!("{what} overflows"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Dessert,
    Combo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StockRow {
    pub initial_stock: i64,
    pub remaining_stock: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WeeklyRevenueRow {
    pub week_end: DateTime<Utc>,
    pub gross_revenue: u64,
    pub order_count: u64,
}

/// Destination tables. Keys mirror the upsert conflict targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalyticsTables {
    pub daily_revenue: BTreeMap<DateTime<Utc>, RevenueRow>,
    pub daily_dessert_revenue: BTreeMap<(DateTime<Utc>, u64), DessertRevenueRow>,
    pub daily_item_sales: BTreeMap<(DateTime<Utc>, ItemType, u64), u64>,
    pub daily_eod_stock: BTreeMap<(DateTime<Utc>, u64), StockRow>,
    pub weekly_revenue: BTreeMap<DateTime<Utc>, WeeklyRevenueRow>,
    pub monthly_revenue: BTreeMap<YearMonth, RevenueRow>,
    pub monthly_dessert_revenue: BTreeMap<(YearMonth, u64), DessertRevenueRow>,
}

/// Row count per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableSizes {
    pub daily_revenue: usize,
    pub daily_dessert_revenue: usize,
    pub daily_item_sales: usize,
    pub daily_eod_stock: usize,
    pub weekly_revenue: usize,
    pub monthly_revenue: usize,
    pub monthly_dessert_revenue: usize,
}

impl AnalyticsTables {
    pub fn sizes(&self) -> TableSizes {
        TableSizes {
            daily_revenue: self.daily_revenue.len(),
            daily_dessert_revenue: self.daily_dessert_revenue.len(),
            daily_item_sales: self.daily_item_sales.len(),
            daily_eod_stock: self.daily_eod_stock.len(),
            weekly_revenue: self.weekly_revenue.len(),
            monthly_revenue: self.monthly_revenue.len(),
            monthly_dessert_revenue: self.monthly_dessert_revenue.len(),
        }
    }
}

// ---- store ----

/// Locks are always taken source first, then tables.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    source: RwLock<SourceData>,
    tables: RwLock<AnalyticsTables>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new(source: SourceData) -> Self {
        Self {
            source: RwLock::new(source),
            ..Self::default()
        }
    }

    pub async fn add_order(&self, order: Order) {
        self.source.write().await.orders.push(order);
    }

    pub async fn add_inventory(&self, snapshot: InventorySnapshot) {
        self.source.write().await.inventory.push(snapshot);
    }

    /// Snapshot of every analytics table.
    pub async fn tables(&self) -> AnalyticsTables {
        self.tables.read().await.clone()
    }

    /// While set, every read and write fails with `TransientStorage`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RollupError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RollupError::TransientStorage("analytics store is unavailable".into()));
        }
        Ok(())
    }

    async fn daily_revenue(&self, window: &ResolvedWindow) -> Result<u64, RollupError> {
        let day = day_key(window)?;
        let row = {
            let source = self.source.read().await;
            let mut row = RevenueRow::default();
            for order in source.countable_orders(window) {
                row.add(&RevenueRow {
                    gross_revenue: order.total,
                    order_count: 1,
                })?;
            }
            row
        };
        self.tables.write().await.daily_revenue.insert(day, row);
        Ok(1)
    }

    async fn daily_dessert_revenue(&self, window: &ResolvedWindow) -> Result<u64, RollupError> {
        let day = day_key(window)?;
        let rows = {
            let source = self.source.read().await;
            let mut rows: BTreeMap<u64, (DessertRevenueRow, BTreeSet<u64>)> = BTreeMap::new();
            for order in source.countable_orders(window) {
                for item in &order.items {
                    let (row, orders) = rows.entry(item.dessert_id).or_default();
                    row.add_line(item.unit_price, item.quantity)?;
                    orders.insert(order.id);
                    for modifier in &item.modifiers {
                        let (row, orders) = rows.entry(modifier.dessert_id).or_default();
                        row.add_line(item.unit_price, modifier.quantity)?;
                        orders.insert(order.id);
                    }
                }
            }
            rows
        };

        let mut tables = self.tables.write().await;
        let written = rows.len() as u64;
        for (dessert_id, (mut row, orders)) in rows {
            row.order_count = orders.len() as u64;
            tables.daily_dessert_revenue.insert((day, dessert_id), row);
        }
        Ok(written)
    }

    async fn daily_item_sales(&self, window: &ResolvedWindow) -> Result<u64, RollupError> {
        let day = day_key(window)?;
        let sales = {
            let source = self.source.read().await;
            let mut sales: BTreeMap<(ItemType, u64), u64> = BTreeMap::new();
            for order in source.countable_orders(window) {
                for item in &order.items {
                    // a combo is one unit regardless of the desserts inside it
                    let key = match item.combo_id {
                        Some(combo_id) => (ItemType::Combo, combo_id),
                        None => (ItemType::Dessert, item.dessert_id),
                    };
                    add_to(sales.entry(key).or_default(), item.quantity, "items sold")?;
                }
            }
            sales
        };

        let mut tables = self.tables.write().await;
        let written = sales.len() as u64;
        for ((item_type, item_id), quantity) in sales {
            tables.daily_item_sales.insert((day, item_type, item_id), quantity);
        }
        Ok(written)
    }

    async fn daily_eod_stock(&self, window: &ResolvedWindow) -> Result<u64, RollupError> {
        let day = day_key(window)?;
        let business_date = day.date_naive();
        let rows = {
            let source = self.source.read().await;
            let mut sold: BTreeMap<u64, u64> = BTreeMap::new();
            for order in source.countable_orders(window) {
                for item in &order.items {
                    add_to(sold.entry(item.dessert_id).or_default(), item.quantity, "quantity sold")?;
                }
            }
            source
                .inventory
                .iter()
                .filter(|s| s.day == business_date && s.quantity > 0)
                .map(|s| -> Result<(u64, StockRow), RollupError> {
                    let sold = sold.get(&s.dessert_id).copied().unwrap_or(0);
                    let initial_stock = i64::try_from(sold)
                        .ok()
                        .and_then(|sold| s.quantity.checked_add(sold))
                        .ok_or_else(|| overflow("initial stock"))?;
                    let row = StockRow {
                        initial_stock,
                        remaining_stock: s.quantity,
                    };
                    Ok((s.dessert_id, row))
                })
                .collect::<Result<Vec<_>, RollupError>>()?
        };

        let mut tables = self.tables.write().await;
        let written = rows.len() as u64;
        for (dessert_id, row) in rows {
            tables.daily_eod_stock.insert((day, dessert_id), row);
        }
        Ok(written)
    }

    async fn weekly_revenue(&self, window: &ResolvedWindow) -> Result<u64, RollupError> {
        let StorageKey::Week { start, end } = window.storage_key else {
            return Err(key_mismatch(window, "week"));
        };
        let mut tables = self.tables.write().await;
        let mut total = RevenueRow::default();
        for row in tables.daily_revenue.range(start..=end).map(|(_, row)| row) {
            total.add(row)?;
        }
        tables.weekly_revenue.insert(
            start,
            WeeklyRevenueRow {
                week_end: end,
                gross_revenue: total.gross_revenue,
                order_count: total.order_count,
            },
        );
        Ok(1)
    }

    async fn monthly_revenue(&self, window: &ResolvedWindow) -> Result<u64, RollupError> {
        let month = month_key(window)?;
        let mut tables = self.tables.write().await;
        let mut total = RevenueRow::default();
        for (_, row) in tables.daily_revenue.iter().filter(|(day, _)| window.contains(**day)) {
            total.add(row)?;
        }
        tables.monthly_revenue.insert(month, total);
        Ok(1)
    }

    async fn monthly_dessert_revenue(&self, window: &ResolvedWindow) -> Result<u64, RollupError> {
        let month = month_key(window)?;
        let mut tables = self.tables.write().await;
        let mut totals: BTreeMap<u64, DessertRevenueRow> = BTreeMap::new();
        for ((_, dessert_id), row) in tables
            .daily_dessert_revenue
            .iter()
            .filter(|((day, _), _)| window.contains(*day))
        {
            totals.entry(*dessert_id).or_default().add(row)?;
        }
        let written = totals.len() as u64;
        for (dessert_id, row) in totals {
            tables.monthly_dessert_revenue.insert((month, dessert_id), row);
        }
        Ok(written)
    }
}

fn day_key(window: &ResolvedWindow) -> Result<DateTime<Utc>, RollupError> {
    match window.storage_key {
        StorageKey::Day(day) => Ok(day),
        _ => Err(key_mismatch(window, "day")),
    }
}

fn month_key(window: &ResolvedWindow) -> Result<YearMonth, RollupError> {
    match window.storage_key {
        StorageKey::Month(month) => Ok(month),
        _ => Err(key_mismatch(window, "month")),
    }
}

fn key_mismatch(window: &ResolvedWindow, expected: &str) -> RollupError {
    RollupError::InvalidWindow(format!("{} is not a {expected} window", window.spec))
}

#[async_trait]
impl BackfillSource for InMemoryStore {
    async fn earliest_source_timestamp(&self) -> Result<Option<DateTime<Utc>>, RollupError> {
        self.check_available()?;
        let source = self.source.read().await;
        Ok(source.orders.iter().filter(|o| !o.deleted).map(|o| o.created_at).min())
    }

    async fn existing_day_rows(&self) -> Result<u64, RollupError> {
        self.check_available()?;
        Ok(self.tables.read().await.daily_revenue.len() as u64)
    }
}

// ---- aggregations ----

/// The seven standard roll-ups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupOp {
    DailyRevenue,
    DailyDessertRevenue,
    DailyItemSales,
    DailyEodStock,
    WeeklyRevenue,
    MonthlyRevenue,
    MonthlyDessertRevenue,
}

impl RollupOp {
    pub fn for_kind(kind: &str) -> Option<Self> {
        let op = match kind {
            DAILY_REVENUE => RollupOp::DailyRevenue,
            DAILY_DESSERT_REVENUE => RollupOp::DailyDessertRevenue,
            DAILY_ITEM_SALES => RollupOp::DailyItemSales,
            DAILY_EOD_STOCK => RollupOp::DailyEodStock,
            WEEKLY_REVENUE => RollupOp::WeeklyRevenue,
            MONTHLY_REVENUE => RollupOp::MonthlyRevenue,
            MONTHLY_DESSERT_REVENUE => RollupOp::MonthlyDessertRevenue,
            _ => return None,
        };
        Some(op)
    }
}

pub struct MemoryRollup {
    store: Arc<InMemoryStore>,
    op: RollupOp,
}

impl MemoryRollup {
    pub fn new(store: Arc<InMemoryStore>, op: RollupOp) -> Self {
        Self { store, op }
    }
}

#[async_trait]
impl Aggregation for MemoryRollup {
    async fn execute(&self, window: &ResolvedWindow, cancel: &CancellationToken) -> Result<u64, RollupError> {
        if cancel.is_cancelled() {
            return Err(RollupError::TransientStorage("cancelled before execution".into()));
        }
        self.store.check_available()?;
        let store = &self.store;
        let rows = match self.op {
            RollupOp::DailyRevenue => store.daily_revenue(window).await?,
            RollupOp::DailyDessertRevenue => store.daily_dessert_revenue(window).await?,
            RollupOp::DailyItemSales => store.daily_item_sales(window).await?,
            RollupOp::DailyEodStock => store.daily_eod_stock(window).await?,
            RollupOp::WeeklyRevenue => store.weekly_revenue(window).await?,
            RollupOp::MonthlyRevenue => store.monthly_revenue(window).await?,
            RollupOp::MonthlyDessertRevenue => store.monthly_dessert_revenue(window).await?,
        };
        debug!(op = ?self.op, storage_key = %window.storage_key, rows, "upserted");
        Ok(rows)
    }
}

/// Factory for `AppBuilder::register_standard`.
pub fn aggregation_for(store: &Arc<InMemoryStore>, kind: &str) -> Option<Arc<dyn Aggregation>> {
    RollupOp::for_kind(kind).map(|op| Arc::new(MemoryRollup::new(Arc::clone(store), op)) as Arc<dyn Aggregation>)
}
