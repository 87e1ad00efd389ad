//! Persistent order book for the transit dashboard: in-memory tables
//! behind an async lock, snapshotted to a JSON file with atomic renames,
//! plus YAML seeding, timestamped backups and a purge.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use otd_core::dates;
use otd_core::{Order, User};

pub const CRATE_NAME: &str = "otd-storage";

/// File name of the order book snapshot inside the data directory.
pub const SNAPSHOT_FILE: &str = "orders.json";

/// Rejections produced while validating an order draft. The messages are
/// shown to the operator verbatim, so they stay in plain English.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DraftError {
    #[error("Invalid input format. Check all fields.")]
    MalformedQuantity,
    #[error("Quantity must be a positive number.")]
    NonPositiveQuantity,
    #[error("ETD cannot be later than ETA.")]
    EtdAfterEta,
    #[error("Order Date cannot be later than ETD.")]
    OrderDateAfterEtd,
    #[error("Order must have an Order Number.")]
    MissingOrderNumber,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Placeholder junk some upstream exports use for "no value".
fn clean_str(raw: &str) -> String {
    let trimmed = raw.trim();
    let lowered = trimmed.to_lowercase();
    if matches!(lowered.as_str(), "none" | "—" | "--") {
        return String::new();
    }
    trimmed.to_string()
}

/// Clean a raw date field and bring it into `dd.mm.yy` display form.
/// Values that are not dates at all pass through untouched.
fn normalize_date_field(raw: &str) -> String {
    let cleaned = clean_str(raw);
    if cleaned.is_empty() {
        return String::new();
    }
    dates::to_display(&cleaned)
}

/// Form and seed fields arrive as strings, but YAML seeds are allowed to
/// write quantities as plain numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Num(f64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(s)) => s,
        Some(Raw::Num(n)) => n.to_string(),
        None => String::new(),
    })
}

/// Raw order fields as submitted by a form or a seed file, before any
/// validation has happened.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OrderDraft {
    pub order_date: String,
    pub order_number: String,
    pub product_name: String,
    pub buyer: String,
    pub responsible: String,
    #[serde(deserialize_with = "string_or_number")]
    pub quantity: String,
    pub required_delivery: String,
    pub terms_of_delivery: String,
    pub payment_date: String,
    pub etd: String,
    pub eta: String,
    pub ata: String,
    pub transit_status: String,
    pub transport: String,
}

impl OrderDraft {
    /// Validate the draft and normalize it into an [`Order`] with a
    /// placeholder id. Checks run in a fixed sequence: quantity shape,
    /// quantity sign, ETD against ETA, order date against ETD, and finally
    /// the order number. Date fields come out in `dd.mm.yy` form.
    pub fn normalized(&self) -> Result<Order, DraftError> {
        let quantity_raw = clean_str(&self.quantity);
        let quantity = if quantity_raw.is_empty() {
            0.0
        } else {
            quantity_raw.parse::<f64>().map_err(|_| DraftError::MalformedQuantity)?
        };
        if !(quantity > 0.0) {
            return Err(DraftError::NonPositiveQuantity);
        }

        let order_date = normalize_date_field(&self.order_date);
        let payment_date = normalize_date_field(&self.payment_date);
        let required_delivery = normalize_date_field(&self.required_delivery);
        let etd = normalize_date_field(&self.etd);
        let eta = normalize_date_field(&self.eta);
        let ata = normalize_date_field(&self.ata);

        let order_dt = dates::parse_order_date(&order_date);
        let etd_dt = dates::parse_order_date(&etd);
        let eta_dt = dates::parse_order_date(&eta);

        if let (Some(etd), Some(eta)) = (etd_dt, eta_dt) {
            if etd > eta {
                return Err(DraftError::EtdAfterEta);
            }
        }
        if let (Some(etd), Some(ordered)) = (etd_dt, order_dt) {
            if ordered > etd {
                return Err(DraftError::OrderDateAfterEtd);
            }
        }

        let order_number = clean_str(&self.order_number);
        if order_number.is_empty() {
            return Err(DraftError::MissingOrderNumber);
        }

        Ok(Order {
            id: 0,
            order_number,
            product_name: clean_str(&self.product_name),
            buyer: clean_str(&self.buyer),
            responsible: clean_str(&self.responsible),
            quantity: Some(quantity),
            required_delivery,
            terms_of_delivery: clean_str(&self.terms_of_delivery),
            order_date,
            payment_date,
            etd,
            eta,
            ata,
            transit_status: clean_str(&self.transit_status),
            transport: clean_str(&self.transport),
            delivery_year: None,
        })
    }
}

/// An order together with the account that created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOrder {
    pub user_id: i64,
    pub order: Order,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseItem {
    pub id: i64,
    pub user_id: i64,
    pub order_number: String,
    pub product_name: String,
    pub quantity: Option<f64>,
    /// ISO date the goods reached the warehouse.
    pub arrival_date: String,
    pub transport: String,
    pub source: String,
    pub is_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredItem {
    pub id: i64,
    pub user_id: i64,
    pub order_number: String,
    pub product_name: String,
    pub quantity: Option<f64>,
    pub delivery_source: String,
    /// ISO date of the hand-over.
    pub delivery_date: String,
    pub notes: String,
    pub transport: String,
}

/// A frozen copy of an order row kept when it leaves the active table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedOrder {
    pub original_order_id: i64,
    pub user_id: i64,
    pub source: String,
    pub order: Order,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KpiCounts {
    pub in_transit: u64,
    pub warehoused: u64,
    pub delivered: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub orders: usize,
    pub warehouse: usize,
    pub delivered: usize,
    pub archived: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub file: String,
    pub sha256: String,
    pub bytes: usize,
    pub created_at: String,
    pub orders: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Tables {
    next_id: i64,
    orders: Vec<StoredOrder>,
    warehouse: Vec<WarehouseItem>,
    delivered: Vec<DeliveredItem>,
    archived: Vec<ArchivedOrder>,
    products: BTreeSet<String>,
}

impl Tables {
    fn fresh() -> Self {
        Tables { next_id: 1, ..Tables::default() }
    }

    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn register_product(&mut self, name: &str) {
        if !name.is_empty() {
            self.products.insert(name.to_string());
        }
    }

    /// Snapshots from older runs may carry a stale counter; ids must keep
    /// increasing past everything already on disk.
    fn repair_next_id(&mut self) {
        let max_seen = self
            .orders
            .iter()
            .map(|r| r.order.id)
            .chain(self.warehouse.iter().map(|w| w.id))
            .chain(self.delivered.iter().map(|d| d.id))
            .max()
            .unwrap_or(0);
        self.next_id = self.next_id.max(max_seen + 1).max(1);
    }
}

#[derive(Debug)]
pub struct OrderStore {
    data_dir: PathBuf,
    tables: RwLock<Tables>,
}

async fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating data directory {}", dir.display()))?;
    let final_path = dir.join(file_name);
    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, &final_path).await {
        Ok(()) => Ok(final_path),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), final_path.display())
            })
        }
    }
}

impl OrderStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        OrderStore { data_dir: data_dir.into(), tables: RwLock::new(Tables::fresh()) }
    }

    /// Open the store at `data_dir`, reading the snapshot when one exists.
    /// A missing or unreadable snapshot starts an empty book instead of
    /// failing the boot.
    pub async fn load_or_default(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let path = data_dir.join(SNAPSHOT_FILE);
        let tables = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Tables>(&bytes) {
                Ok(mut tables) => {
                    tables.repair_next_id();
                    tables
                }
                Err(err) => {
                    warn!("snapshot {} is unreadable, starting empty: {err}", path.display());
                    Tables::fresh()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Tables::fresh(),
            Err(err) => {
                warn!("snapshot {} could not be opened, starting empty: {err}", path.display());
                Tables::fresh()
            }
        };
        OrderStore { data_dir, tables: RwLock::new(tables) }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    async fn persist(&self, tables: &Tables) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(tables).context("encoding order snapshot")?;
        write_atomic(&self.data_dir, SNAPSHOT_FILE, &bytes).await?;
        Ok(())
    }

    pub async fn order_count(&self) -> usize {
        self.tables.read().await.orders.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.order_count().await == 0
    }

    /// Orders visible to `user`: everything for the all-seeing roles,
    /// otherwise only the user's own rows.
    pub async fn list_for(&self, user: &User) -> Vec<Order> {
        let tables = self.tables.read().await;
        tables
            .orders
            .iter()
            .filter(|row| user.can_view_all() || row.user_id == user.id)
            .map(|row| row.order.clone())
            .collect()
    }

    pub async fn get(&self, id: i64) -> Option<StoredOrder> {
        let tables = self.tables.read().await;
        tables.orders.iter().find(|row| row.order.id == id).cloned()
    }

    pub async fn counts_for(&self, user: &User) -> KpiCounts {
        let tables = self.tables.read().await;
        let sees_all = user.can_view_all();
        let mine = |owner: i64| sees_all || owner == user.id;
        KpiCounts {
            in_transit: tables.orders.iter().filter(|r| mine(r.user_id)).count() as u64,
            warehoused: tables
                .warehouse
                .iter()
                .filter(|w| mine(w.user_id) && !w.is_archived)
                .count() as u64,
            delivered: tables.delivered.iter().filter(|d| mine(d.user_id)).count() as u64,
        }
    }

    /// Known product names, already sorted.
    pub async fn products(&self) -> Vec<String> {
        self.tables.read().await.products.iter().cloned().collect()
    }

    pub async fn insert(&self, user_id: i64, draft: &OrderDraft) -> Result<Order, StoreError> {
        let mut order = draft.normalized()?;
        let mut tables = self.tables.write().await;
        order.id = tables.allocate_id();
        tables.register_product(&order.product_name);
        tables.orders.push(StoredOrder { user_id, order: order.clone() });
        self.persist(&tables).await?;
        Ok(order)
    }

    pub async fn update(&self, id: i64, draft: &OrderDraft) -> Result<Order, StoreError> {
        let mut order = draft.normalized()?;
        let mut tables = self.tables.write().await;
        let idx = tables
            .orders
            .iter()
            .position(|row| row.order.id == id)
            .ok_or(StoreError::NotFound(id))?;
        order.id = id;
        tables.register_product(&order.product_name);
        tables.orders[idx].order = order.clone();
        self.persist(&tables).await?;
        Ok(order)
    }

    pub async fn remove(&self, id: i64) -> Result<Order, StoreError> {
        let mut tables = self.tables.write().await;
        let idx = tables
            .orders
            .iter()
            .position(|row| row.order.id == id)
            .ok_or(StoreError::NotFound(id))?;
        let row = tables.orders.remove(idx);
        self.persist(&tables).await?;
        Ok(row.order)
    }

    /// Move an arrived order into the warehouse, archiving the original row.
    pub async fn move_to_warehouse(
        &self,
        id: i64,
        stocked_on: NaiveDate,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let idx = tables
            .orders
            .iter()
            .position(|row| row.order.id == id)
            .ok_or(StoreError::NotFound(id))?;
        if tables.orders[idx].order.order_number.is_empty() {
            return Err(DraftError::MissingOrderNumber.into());
        }
        let row = tables.orders.remove(idx);
        let item_id = tables.allocate_id();
        tables.warehouse.push(WarehouseItem {
            id: item_id,
            user_id: row.user_id,
            order_number: row.order.order_number.clone(),
            product_name: row.order.product_name.clone(),
            quantity: row.order.quantity,
            arrival_date: dates::format_iso(stocked_on),
            transport: row.order.transport.clone(),
            source: "dashboard".to_string(),
            is_archived: false,
        });
        tables.archived.push(ArchivedOrder {
            original_order_id: row.order.id,
            user_id: row.user_id,
            source: "dashboard".to_string(),
            order: row.order,
        });
        self.persist(&tables).await?;
        Ok(())
    }

    /// Hand an order straight from transit to the customer: a delivery
    /// record and an archive copy are written, the active row goes away.
    pub async fn deliver_direct(
        &self,
        id: i64,
        delivered_on: NaiveDate,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let idx = tables
            .orders
            .iter()
            .position(|row| row.order.id == id)
            .ok_or(StoreError::NotFound(id))?;
        if tables.orders[idx].order.order_number.is_empty() {
            return Err(DraftError::MissingOrderNumber.into());
        }
        let row = tables.orders.remove(idx);
        let item_id = tables.allocate_id();
        tables.delivered.push(DeliveredItem {
            id: item_id,
            user_id: row.user_id,
            order_number: row.order.order_number.clone(),
            product_name: row.order.product_name.clone(),
            quantity: row.order.quantity,
            delivery_source: "Direct from Transit".to_string(),
            delivery_date: dates::format_iso(delivered_on),
            notes: "Delivered directly from dashboard".to_string(),
            transport: row.order.transport.clone(),
        });
        tables.archived.push(ArchivedOrder {
            original_order_id: row.order.id,
            user_id: row.user_id,
            source: "dashboard".to_string(),
            order: row.order,
        });
        self.persist(&tables).await?;
        Ok(())
    }

    /// Replace the active order table wholesale, e.g. after hydrating from
    /// an external database. Products are re-registered from the new rows.
    pub async fn replace_all(&self, rows: Vec<StoredOrder>) -> anyhow::Result<usize> {
        let mut tables = self.tables.write().await;
        tables.orders = rows;
        let products: Vec<String> =
            tables.orders.iter().map(|r| r.order.product_name.clone()).collect();
        for name in products {
            tables.register_product(&name);
        }
        tables.repair_next_id();
        let count = tables.orders.len();
        self.persist(&tables).await?;
        Ok(count)
    }

    /// Load demo or bootstrap rows from a YAML file. Rows that fail draft
    /// validation are skipped with a warning rather than aborting the seed.
    pub async fn seed_from_yaml(&self, path: &Path) -> anyhow::Result<usize> {
        #[derive(Debug, Deserialize)]
        struct SeedOrder {
            #[serde(default = "default_seed_user")]
            user_id: i64,
            #[serde(flatten)]
            draft: OrderDraft,
        }

        #[derive(Debug, Deserialize)]
        struct SeedFile {
            #[serde(default)]
            orders: Vec<SeedOrder>,
        }

        fn default_seed_user() -> i64 {
            1
        }

        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading seed file {}", path.display()))?;
        let seed: SeedFile = serde_yaml::from_slice(&bytes)
            .with_context(|| format!("parsing seed file {}", path.display()))?;

        let mut tables = self.tables.write().await;
        let mut inserted = 0usize;
        for row in seed.orders {
            match row.draft.normalized() {
                Ok(mut order) => {
                    order.id = tables.allocate_id();
                    tables.register_product(&order.product_name);
                    tables.orders.push(StoredOrder { user_id: row.user_id, order });
                    inserted += 1;
                }
                Err(err) => warn!("seed row skipped: {err}"),
            }
        }
        self.persist(&tables).await?;
        info!("seeded {inserted} orders from {}", path.display());
        Ok(inserted)
    }

    /// Write a timestamped copy of the snapshot plus a checksum manifest
    /// into `dest_dir`.
    pub async fn backup_to(&self, dest_dir: &Path) -> anyhow::Result<BackupManifest> {
        let tables = self.tables.read().await;
        let bytes = serde_json::to_vec_pretty(&*tables).context("encoding order snapshot")?;
        let created_at = Utc::now();
        let file = format!("orders-{}.json", created_at.format("%Y%m%d_%H%M%S"));
        write_atomic(dest_dir, &file, &bytes).await?;

        let manifest = BackupManifest {
            file,
            sha256: sha256_hex(&bytes),
            bytes: bytes.len(),
            created_at: created_at.to_rfc3339(),
            orders: tables.orders.len(),
        };
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).context("encoding backup manifest")?;
        write_atomic(dest_dir, "manifest.json", &manifest_bytes).await?;
        Ok(manifest)
    }

    /// Drop every table and persist the empty book.
    pub async fn purge(&self) -> anyhow::Result<PurgeReport> {
        let mut tables = self.tables.write().await;
        let report = PurgeReport {
            orders: tables.orders.len(),
            warehouse: tables.warehouse.len(),
            delivered: tables.delivered.len(),
            archived: tables.archived.len(),
        };
        *tables = Tables::fresh();
        self.persist(&tables).await?;
        Ok(report)
    }
}
